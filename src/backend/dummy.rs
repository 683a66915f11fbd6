// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the reference trackers and
//! the encode session run so we can test them in isolation.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;

use crate::backend::BackendError;
use crate::backend::BackendPromise;
use crate::backend::BackendResult;
use crate::backend::BufferUsage;
use crate::backend::PictureAllocator;
use crate::encoder::reftrack::FrameDescriptor;
use crate::encoder::session::EncodeSubmitter;
use crate::encoder::FrameType;
use crate::Fourcc;
use crate::Resolution;

/// Handle to a buffer that only exists as a number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DummyBuffer {
    pub id: u64,
    pub resolution: Resolution,
    pub fourcc: Fourcc,
}

#[derive(Default)]
struct AllocatorStats {
    next_id: AtomicU64,
    live: AtomicUsize,
}

/// Allocator handing out [`DummyBuffer`]s. Clones share their statistics.
#[derive(Clone, Default)]
pub struct DummyAllocator {
    stats: Arc<AllocatorStats>,
    limit: Option<usize>,
}

impl DummyAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Creates an allocator that fails once `limit` buffers are alive.
    pub fn with_allocation_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    /// Number of buffers allocated and not destroyed yet.
    pub fn num_live_buffers(&self) -> usize {
        self.stats.live.load(Ordering::SeqCst)
    }
}

impl PictureAllocator for DummyAllocator {
    type Buffer = DummyBuffer;

    fn allocate(
        &mut self,
        resolution: Resolution,
        fourcc: Fourcc,
        _usage: BufferUsage,
    ) -> BackendResult<Self::Buffer> {
        if let Some(limit) = self.limit {
            if self.num_live_buffers() >= limit {
                return Err(BackendError::OutOfResources);
            }
        }

        self.stats.live.fetch_add(1, Ordering::SeqCst);

        Ok(DummyBuffer {
            id: self.stats.next_id.fetch_add(1, Ordering::SeqCst),
            resolution,
            fourcc,
        })
    }

    fn destroy(&mut self, _buffer: Self::Buffer) {
        self.stats.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// What the dummy hardware reports for each submitted frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubmittedFrame {
    /// Submission order, starting at 0.
    pub sequence: u64,
    pub frame_type: FrameType,
    pub picture_order_count: u32,
    pub dpb_size: usize,
    pub l0_reference_list: Vec<usize>,
}

/// Fence of a frame submitted to the [`DummySubmitter`].
///
/// The fence signals once the test calls [`DummySubmitter::complete_up_to`] with a sequence
/// number past this frame. Waiting on it with [`BackendPromise::sync`] never blocks, the dummy
/// hardware finishes the work immediately when asked to.
pub struct DummyFence {
    frame: SubmittedFrame,
    completed: Arc<AtomicU64>,
    fail: bool,
}

impl BackendPromise for DummyFence {
    type Output = SubmittedFrame;

    fn sync(self) -> BackendResult<Self::Output> {
        self.completed
            .fetch_max(self.frame.sequence + 1, Ordering::SeqCst);

        if self.fail {
            Err(BackendError::EncodeFailed)
        } else {
            Ok(self.frame)
        }
    }

    fn is_ready(&self) -> bool {
        self.completed.load(Ordering::SeqCst) > self.frame.sequence
    }
}

/// Hardware submission stand-in recording a summary of every descriptor it receives.
#[derive(Default)]
pub struct DummySubmitter {
    next_sequence: u64,
    completed: Arc<AtomicU64>,
    /// Submissions with these sequence numbers are rejected outright.
    pub reject: Vec<u64>,
    /// Fences of submissions with these sequence numbers report an encode failure.
    pub fail: Vec<u64>,
}

impl DummySubmitter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Signals the fences of all frames with a sequence number lower than `sequence`.
    pub fn complete_up_to(&self, sequence: u64) {
        self.completed.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Number of submissions so far, rejected ones included.
    pub fn num_submitted(&self) -> u64 {
        self.next_sequence
    }
}

impl<B> EncodeSubmitter<B> for DummySubmitter {
    type Promise = DummyFence;

    fn submit(&mut self, descriptor: &FrameDescriptor<B>) -> BackendResult<Self::Promise> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if self.reject.contains(&sequence) {
            return Err(BackendError::Other(anyhow!(
                "submission {} rejected by the dummy backend",
                sequence
            )));
        }

        Ok(DummyFence {
            frame: SubmittedFrame {
                sequence,
                frame_type: descriptor.gop.frame_type(),
                picture_order_count: descriptor.gop.picture_order_count(),
                dpb_size: descriptor.dpb_snapshot.len(),
                l0_reference_list: descriptor.l0_reference_list.clone(),
            },
            completed: Arc::clone(&self.completed),
            fail: self.fail.contains(&sequence),
        })
    }
}
