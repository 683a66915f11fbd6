// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::BTreeSet;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::BufferUsage;
use crate::backend::PictureAllocator;
use crate::Fourcc;
use crate::Resolution;

/// Source of unique pool identifiers, so a buffer can be traced back to the pool it came from.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(0);

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("all {0} picture buffers of the pool are in use")]
    Exhausted(usize),
    #[error("buffer {index} of pool {pool_id} does not belong to this pool")]
    UnknownBuffer { pool_id: u32, index: usize },
    #[error("buffer {0} was released while not in use")]
    NotInUse(usize),
    #[error("picture buffer pool cannot be empty")]
    Empty,
    #[error("failed to allocate picture buffer: {0}")]
    Allocation(#[from] BackendError),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// A picture buffer obtained from a [`BufferPool`].
///
/// This is a plain handle: cloning it does not duplicate the GPU memory, and dropping it does not
/// return the buffer. Buffers go back to their pool through [`BufferPool::release_dpb_buffer`].
#[derive(Clone, Debug)]
pub struct PictureBuffer<B> {
    pool_id: u32,
    index: usize,
    native: B,
}

impl<B> PictureBuffer<B> {
    /// Slot of this buffer in its pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the pool this buffer was obtained from.
    pub fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Allocator handle to hand to the hardware.
    pub fn native(&self) -> &B {
        &self.native
    }
}

impl<B> PartialEq for PictureBuffer<B> {
    fn eq(&self, other: &Self) -> bool {
        self.pool_id == other.pool_id && self.index == other.index
    }
}

impl<B> Eq for PictureBuffer<B> {}

struct PoolInner<A: PictureAllocator> {
    id: u32,
    allocator: A,
    slots: Vec<A::Buffer>,
    in_use: Vec<bool>,
    /// Indices of the slots that can be handed out. Lowest index first.
    free: BTreeSet<usize>,
}

impl<A: PictureAllocator> PoolInner<A> {
    fn check_owned<B>(&self, buffer: &PictureBuffer<B>) -> PoolResult<()> {
        if buffer.pool_id != self.id || buffer.index >= self.slots.len() {
            return Err(PoolError::UnknownBuffer {
                pool_id: buffer.pool_id,
                index: buffer.index,
            });
        }

        Ok(())
    }
}

impl<A: PictureAllocator> Drop for PoolInner<A> {
    fn drop(&mut self) {
        let in_use = self.in_use.iter().filter(|used| **used).count();
        if in_use > 0 {
            log::debug!("Destroying pool {} with {} buffers still in use", self.id, in_use);
        }

        for buffer in self.slots.drain(..) {
            self.allocator.destroy(buffer);
        }
    }
}

fn lock<A: PictureAllocator>(inner: &Mutex<PoolInner<A>>) -> MutexGuard<'_, PoolInner<A>> {
    // The pool state is a set of flags that is always left consistent, so a panic in another
    // holder does not make it unusable.
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A fixed-size pool of reconstructed picture buffers.
///
/// All the buffers are allocated when the pool is created and destroyed when the pool and all its
/// [`PoolReleaser`]s are dropped. Buffers are handed out lowest free slot first.
pub struct BufferPool<A: PictureAllocator> {
    inner: Arc<Mutex<PoolInner<A>>>,
    resolution: Resolution,
}

impl<A: PictureAllocator> BufferPool<A> {
    /// Create a new pool and allocate its buffers.
    ///
    /// # Arguments
    ///
    /// * `allocator` - the GPU allocator to create the buffers from.
    /// * `resolution` - resolution of the buffers.
    /// * `fourcc` - pixel format of the buffers.
    /// * `usage` - hint about how the buffers from this pool will be used.
    /// * `size` - number of buffers in the pool.
    pub fn new(
        mut allocator: A,
        resolution: Resolution,
        fourcc: Fourcc,
        usage: BufferUsage,
        size: usize,
    ) -> PoolResult<Self> {
        if size == 0 {
            return Err(PoolError::Empty);
        }

        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            match allocator.allocate(resolution, fourcc, usage) {
                Ok(buffer) => slots.push(buffer),
                Err(e) => {
                    for buffer in slots.drain(..) {
                        allocator.destroy(buffer);
                    }
                    return Err(e.into());
                }
            }
        }

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Created pool {} of {} {:?} buffers at {}x{}",
            id,
            size,
            fourcc,
            resolution.width,
            resolution.height
        );

        Ok(Self {
            inner: Arc::new(Mutex::new(PoolInner {
                id,
                allocator,
                slots,
                in_use: vec![false; size],
                free: (0..size).collect(),
            })),
            resolution,
        })
    }

    /// Returns the first buffer that is not in use and marks it as used.
    pub fn get_fresh_dpb_buffer(&self) -> PoolResult<PictureBuffer<A::Buffer>> {
        let mut inner = lock(&self.inner);

        let index = inner
            .free
            .pop_first()
            .ok_or(PoolError::Exhausted(inner.slots.len()))?;
        inner.in_use[index] = true;

        Ok(PictureBuffer {
            pool_id: inner.id,
            index,
            native: inner.slots[index].clone(),
        })
    }

    /// Returns `buffer` to the pool.
    pub fn release_dpb_buffer(&self, buffer: &PictureBuffer<A::Buffer>) -> PoolResult<()> {
        release(&self.inner, buffer)
    }

    /// Returns a handle that can only release buffers into this pool, and that can be sent to
    /// the thread waiting on GPU completion.
    pub fn releaser(&self) -> PoolReleaser<A> {
        PoolReleaser {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of buffers that can currently be handed out.
    pub fn num_free(&self) -> usize {
        lock(&self.inner).free.len()
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }
}

fn release<A: PictureAllocator>(
    inner: &Mutex<PoolInner<A>>,
    buffer: &PictureBuffer<A::Buffer>,
) -> PoolResult<()> {
    let mut inner = lock(inner);
    inner.check_owned(buffer)?;

    if !inner.in_use[buffer.index] {
        return Err(PoolError::NotInUse(buffer.index));
    }

    inner.in_use[buffer.index] = false;
    inner.free.insert(buffer.index);

    Ok(())
}

/// Release-only handle to a [`BufferPool`].
pub struct PoolReleaser<A: PictureAllocator> {
    inner: Arc<Mutex<PoolInner<A>>>,
}

impl<A: PictureAllocator> Clone for PoolReleaser<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A: PictureAllocator> PoolReleaser<A> {
    /// Returns `buffer` to the pool.
    pub fn release_dpb_buffer(&self, buffer: &PictureBuffer<A::Buffer>) -> PoolResult<()> {
        release(&self.inner, buffer)
    }
}
