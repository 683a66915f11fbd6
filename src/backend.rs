// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Interfaces to the hardware side of the encoder.
//!
//! A backend is a provider of GPU picture buffers and of the hardware encode call, most likely
//! a video acceleration API. The reference trackers only see backends through the
//! [`PictureAllocator`] trait and the fences returned by a submission, represented as a
//! [`BackendPromise`].

use std::fmt::Debug;

use thiserror::Error;

use crate::Fourcc;
use crate::Resolution;

pub mod buffer_pool;
pub mod dummy;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("not enough resources to proceed with the operation now")]
    OutOfResources,
    #[error("the hardware reported an encode failure")]
    EncodeFailed,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Usage hints passed to the allocator when creating reconstructed picture buffers.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferUsage {
    /// The buffer may be shared with another device or process.
    pub shared: bool,
    /// The CPU or another engine may read the reconstructed picture back, eg. for a two-pass
    /// downscale blit.
    pub readable_reconstruction: bool,
}

/// GPU buffer allocator used to back the reconstructed picture pools.
pub trait PictureAllocator {
    /// Opaque handle to an allocated GPU picture.
    type Buffer: Clone + Debug;

    /// Allocates a picture buffer of `resolution` in pixel format `fourcc`.
    fn allocate(
        &mut self,
        resolution: Resolution,
        fourcc: Fourcc,
        usage: BufferUsage,
    ) -> BackendResult<Self::Buffer>;

    /// Frees a buffer previously returned by [`PictureAllocator::allocate`].
    fn destroy(&mut self, buffer: Self::Buffer);
}

/// Trait for representing pending hardware work, typically guarded by a GPU fence.
pub trait BackendPromise {
    type Output;

    /// Return the result of the processing. Blocks if processing is not finished yet.
    fn sync(self) -> BackendResult<Self::Output>;

    /// Return true whenever the underlying processing is done.
    fn is_ready(&self) -> bool;
}
