// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Bookkeeping shared by the codec trackers: the reconstructed picture pools and the list of
//! pictures live in the DPB.

use std::collections::VecDeque;

use crate::backend::buffer_pool::BufferPool;
use crate::backend::PictureAllocator;
use crate::encoder::reftrack::DpbEntry;
use crate::encoder::reftrack::ReconReleaser;
use crate::encoder::reftrack::ReleaseToken;
use crate::encoder::reftrack::TrackedBuffer;
use crate::encoder::reftrack::TrackerError;
use crate::encoder::reftrack::TrackerResult;
use crate::encoder::Capabilities;
use crate::encoder::TrackerConfig;
use crate::Resolution;

/// The full resolution pool and, for two-pass encoding, the downscaled one.
pub(crate) struct DpbPools<A: PictureAllocator> {
    pool: BufferPool<A>,
    downscaled_pool: Option<BufferPool<A>>,
}

impl<A: PictureAllocator> DpbPools<A> {
    pub(crate) fn new(
        config: &TrackerConfig,
        caps: &Capabilities,
        allocator: A,
    ) -> TrackerResult<Self>
    where
        A: Clone,
    {
        let size = config.pool_size(caps);
        let fourcc = config.bit_depth.recon_fourcc();

        let downscaled_pool = match config.two_pass {
            Some(two_pass) => Some(BufferPool::new(
                allocator.clone(),
                config.resolution.downscale_pow2(two_pass.pow2_downscale_factor),
                fourcc,
                config.buffer_usage,
                size,
            )?),
            None => None,
        };

        let pool = BufferPool::new(
            allocator,
            config.resolution,
            fourcc,
            config.buffer_usage,
            size,
        )?;

        Ok(Self {
            pool,
            downscaled_pool,
        })
    }

    /// Gets the buffers the current picture will be reconstructed into.
    pub(crate) fn acquire(
        &self,
    ) -> TrackerResult<(TrackedBuffer<A>, Option<TrackedBuffer<A>>)> {
        let buffer = self.pool.get_fresh_dpb_buffer()?;

        let downscaled = match &self.downscaled_pool {
            Some(pool) => match pool.get_fresh_dpb_buffer() {
                Ok(downscaled) => Some(downscaled),
                Err(e) => {
                    // Never handed out, can go back right away.
                    self.pool.release_dpb_buffer(&buffer)?;
                    return Err(e.into());
                }
            },
            None => None,
        };

        Ok((buffer, downscaled))
    }

    /// Returns the buffers of a picture that never left the tracker.
    pub(crate) fn release_unused(
        &self,
        buffer: TrackedBuffer<A>,
        downscaled: Option<TrackedBuffer<A>>,
    ) -> TrackerResult<()> {
        let mut token = ReleaseToken::default();
        token.push(buffer, downscaled);
        self.releaser().release(token)
    }

    #[cfg(test)]
    pub(crate) fn num_free(&self) -> usize {
        self.pool.num_free()
    }

    pub(crate) fn releaser(&self) -> ReconReleaser<A> {
        ReconReleaser {
            pool: self.pool.releaser(),
            downscaled_pool: self.downscaled_pool.as_ref().map(BufferPool::releaser),
        }
    }

    pub(crate) fn resolution(&self) -> Resolution {
        self.pool.resolution()
    }
}

/// Bitmap of LTR indices.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct LtrBitmap(u32);

impl LtrBitmap {
    /// Bitmap with the first `count` indices set.
    pub(crate) fn all(count: u32) -> Self {
        match count {
            0 => Self(0),
            n if n >= 32 => Self(u32::MAX),
            n => Self((1 << n) - 1),
        }
    }

    pub(crate) fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub(crate) fn bits(&self) -> u32 {
        self.0
    }

    pub(crate) fn contains(&self, index: u32) -> bool {
        index < 32 && self.0 & (1 << index) != 0
    }

    pub(crate) fn insert(&mut self, index: u32) {
        self.0 |= 1 << index;
    }

    pub(crate) fn remove(&mut self, index: u32) {
        self.0 &= !(1 << index);
    }

    pub(crate) fn count(&self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest index below `limit` not in the bitmap.
    pub(crate) fn first_empty(&self, limit: u32) -> Option<u32> {
        (0..limit.min(32)).find(|&i| !self.contains(i))
    }
}

/// A picture kept as reference.
#[derive(Clone, Debug)]
pub(crate) struct LiveRecord<B> {
    pub(crate) pic_order_cnt: u32,
    pub(crate) frame_num: u32,
    pub(crate) frame_num_no_wrap: u64,
    pub(crate) is_ltr: bool,
    pub(crate) ltr_index: u32,
    pub(crate) temporal_id: u8,
    pub(crate) dirty_rect_frame_num: u32,
    pub(crate) buffer: B,
    pub(crate) downscaled_buffer: Option<B>,
}

impl<B: Clone> LiveRecord<B> {
    pub(crate) fn dpb_entry(&self, frame_idx: u32) -> DpbEntry<B> {
        DpbEntry {
            frame_idx,
            pic_order_cnt: self.pic_order_cnt,
            temporal_id: self.temporal_id,
            is_ltr: self.is_ltr,
            buffer: self.buffer.clone(),
            downscaled_buffer: self.downscaled_buffer.clone(),
        }
    }
}

impl<B> LiveRecord<B> {
    fn release_into(self, token: &mut ReleaseToken<B>) {
        token.push(self.buffer, self.downscaled_buffer);
    }
}

/// The pictures live in the DPB, oldest first, and the LTR indices they hold.
///
/// The active LTR bitmap is only updated along with the list, so both always agree.
#[derive(Debug)]
pub(crate) struct LiveRecords<B> {
    records: VecDeque<LiveRecord<B>>,
    active_ltr: LtrBitmap,
    capacity: usize,
}

impl<B> LiveRecords<B> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            active_ltr: Default::default(),
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LiveRecord<B>> {
        self.records.iter()
    }

    pub(crate) fn get(&self, position: usize) -> Option<&LiveRecord<B>> {
        self.records.get(position)
    }

    pub(crate) fn active_ltr(&self) -> LtrBitmap {
        self.active_ltr
    }

    /// Detaches every picture into `token`.
    pub(crate) fn clear_into(&mut self, token: &mut ReleaseToken<B>) {
        for record in self.records.drain(..) {
            record.release_into(token);
        }
        self.active_ltr = Default::default();
    }

    /// Detaches the oldest short-term reference into `token`.
    pub(crate) fn evict_oldest_short_term(
        &mut self,
        token: &mut ReleaseToken<B>,
    ) -> TrackerResult<()> {
        let position = self
            .records
            .iter()
            .position(|r| !r.is_ltr)
            .ok_or(TrackerError::NoShortTermToEvict)?;

        if let Some(record) = self.records.remove(position) {
            log::trace!("Evicting short-term reference with POC {}", record.pic_order_cnt);
            record.release_into(token);
        }

        Ok(())
    }

    /// Detaches the picture holding LTR `index` into `token`.
    pub(crate) fn remove_ltr(
        &mut self,
        index: u32,
        token: &mut ReleaseToken<B>,
    ) -> TrackerResult<()> {
        let position = self
            .records
            .iter()
            .position(|r| r.is_ltr && r.ltr_index == index)
            .ok_or(TrackerError::LtrBitmapMismatch(index))?;

        if let Some(record) = self.records.remove(position) {
            log::trace!("Replacing LTR {} with POC {}", index, record.pic_order_cnt);
            record.release_into(token);
        }
        self.active_ltr.remove(index);

        Ok(())
    }

    /// Keeps only the pictures for which `keep` returns true, detaching the others into `token`.
    pub(crate) fn retain_into<F>(&mut self, mut keep: F, token: &mut ReleaseToken<B>)
    where
        F: FnMut(&LiveRecord<B>) -> bool,
    {
        let mut kept = VecDeque::with_capacity(self.capacity);
        let mut active_ltr = LtrBitmap::default();

        for record in self.records.drain(..) {
            if keep(&record) {
                if record.is_ltr {
                    active_ltr.insert(record.ltr_index);
                }
                kept.push_back(record);
            } else {
                record.release_into(token);
            }
        }

        self.records = kept;
        self.active_ltr = active_ltr;
    }

    /// Appends the current picture. Room must have been made beforehand.
    pub(crate) fn push(&mut self, record: LiveRecord<B>) {
        debug_assert!(self.records.len() < self.capacity);
        debug_assert!(!record.is_ltr || !self.active_ltr.contains(record.ltr_index));

        if record.is_ltr {
            self.active_ltr.insert(record.ltr_index);
        }
        self.records.push_back(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(poc: u32, ltr: Option<u32>) -> LiveRecord<u32> {
        LiveRecord {
            pic_order_cnt: poc,
            frame_num: poc / 2,
            frame_num_no_wrap: (poc / 2) as u64,
            is_ltr: ltr.is_some(),
            ltr_index: ltr.unwrap_or(0),
            temporal_id: 0,
            dirty_rect_frame_num: 0,
            buffer: poc,
            downscaled_buffer: None,
        }
    }

    #[test]
    fn bitmap() {
        let mut bitmap = LtrBitmap::default();
        assert_eq!(bitmap.first_empty(2), Some(0));
        bitmap.insert(0);
        assert_eq!(bitmap.first_empty(2), Some(1));
        bitmap.insert(1);
        assert_eq!(bitmap.first_empty(2), None);
        assert_eq!(bitmap.count(), 2);
        bitmap.remove(0);
        assert_eq!(bitmap.bits(), 0b10);

        assert_eq!(LtrBitmap::all(0).bits(), 0);
        assert_eq!(LtrBitmap::all(3).bits(), 0b111);
        assert_eq!(LtrBitmap::all(16).bits(), 0xFFFF);
    }

    #[test]
    fn eviction_skips_long_term() {
        let mut records = LiveRecords::new(3);
        records.push(record(0, Some(0)));
        records.push(record(2, None));
        records.push(record(4, None));
        assert!(records.is_full());

        let mut token = ReleaseToken::default();
        records.evict_oldest_short_term(&mut token).unwrap();
        assert_eq!(token.buffers(), &[2]);
        assert_eq!(records.len(), 2);
        assert_eq!(records.active_ltr().bits(), 0b1);
    }

    #[test]
    fn eviction_needs_short_term() {
        let mut records = LiveRecords::new(2);
        records.push(record(0, Some(0)));
        records.push(record(2, Some(1)));

        let mut token = ReleaseToken::default();
        assert!(matches!(
            records.evict_oldest_short_term(&mut token),
            Err(TrackerError::NoShortTermToEvict)
        ));
        assert!(token.is_empty());
    }

    #[test]
    fn ltr_bookkeeping() {
        let mut records = LiveRecords::new(4);
        records.push(record(0, Some(1)));
        records.push(record(2, None));
        records.push(record(4, Some(0)));
        assert_eq!(records.active_ltr().bits(), 0b11);

        let mut token = ReleaseToken::default();
        records.remove_ltr(1, &mut token).unwrap();
        assert_eq!(token.buffers(), &[0]);
        assert_eq!(records.active_ltr().bits(), 0b01);
        assert!(matches!(
            records.remove_ltr(1, &mut token),
            Err(TrackerError::LtrBitmapMismatch(1))
        ));

        records.retain_into(|r| r.is_ltr, &mut token);
        assert_eq!(token.buffers(), &[0, 2]);
        assert_eq!(records.len(), 1);
        assert_eq!(records.active_ltr().bits(), 0b01);

        records.clear_into(&mut token);
        assert_eq!(token.buffers(), &[0, 2, 4]);
        assert_eq!(records.active_ltr().bits(), 0);
    }
}
