// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! HEVC reference tracker.
//!
//! Every frame is kept as a short-term reference and P frames predict from the most recent
//! picture. Long-term references are only created on request. Restricting prediction to a set of
//! long-term references drops every other picture from the DPB.

mod gop;

use crate::backend::PictureAllocator;
use crate::encoder::reftrack::dpb::DpbPools;
use crate::encoder::reftrack::dpb::LiveRecord;
use crate::encoder::reftrack::dpb::LiveRecords;
use crate::encoder::reftrack::dpb::LtrBitmap;
use crate::encoder::reftrack::FrameDescriptor;
use crate::encoder::reftrack::GopInfo;
use crate::encoder::reftrack::ReconReleaser;
use crate::encoder::reftrack::ReferenceTracker;
use crate::encoder::reftrack::ReleaseToken;
use crate::encoder::reftrack::TrackedBuffer;
use crate::encoder::reftrack::TrackerError;
use crate::encoder::reftrack::TrackerResult;
use crate::encoder::Capabilities;
use crate::encoder::FrameControl;
use crate::encoder::FrameType;
use crate::encoder::LongTermReferenceInfo;
use crate::encoder::ReferenceType;
use crate::encoder::TrackerConfig;
use crate::Resolution;

use gop::HevcGop;
pub use gop::HevcGopState;

pub struct HevcTracker<A: PictureAllocator> {
    gop: HevcGop,
    dpb: LiveRecords<TrackedBuffer<A>>,
    pools: DpbPools<A>,
    descriptor: FrameDescriptor<TrackedBuffer<A>>,
    max_long_term_references: u32,
    pending_mark_ltr: Option<u32>,
    deferred: ReleaseToken<TrackedBuffer<A>>,
}

impl<A: PictureAllocator> HevcTracker<A> {
    pub fn new(config: &TrackerConfig, caps: &Capabilities, allocator: A) -> TrackerResult<Self>
    where
        A: Clone,
    {
        config.validate(caps)?;

        if config.effective_layer_count() > 1 {
            log::debug!("HEVC tracker encodes all frames in the base layer");
        }

        let pools = DpbPools::new(config, caps, allocator)?;
        let gop = HevcGop::new(config.gop_length, config.p_picture_period());
        let descriptor = FrameDescriptor::new(GopInfo::Hevc(gop.state().clone()));

        Ok(Self {
            gop,
            dpb: LiveRecords::new(caps.max_references as usize),
            pools,
            descriptor,
            max_long_term_references: config.max_long_term_references,
            pending_mark_ltr: None,
            deferred: Default::default(),
        })
    }

    pub fn releaser(&self) -> ReconReleaser<A> {
        self.pools.releaser()
    }

    pub fn resolution(&self) -> Resolution {
        self.pools.resolution()
    }

    pub fn num_live_references(&self) -> usize {
        self.dpb.len()
    }

    pub fn dpb_capacity(&self) -> usize {
        self.dpb.capacity()
    }

    pub fn active_ltr_bitmap(&self) -> u32 {
        self.dpb.active_ltr().bits()
    }

    fn check_control(&self, control: &FrameControl) -> TrackerResult<()> {
        match control.mark_ltr {
            Some(index) if self.max_long_term_references > 0 => {
                if index >= self.max_long_term_references {
                    return Err(TrackerError::InvalidLtrIndex {
                        index,
                        max: self.max_long_term_references,
                    });
                }
            }
            _ => (),
        }

        Ok(())
    }

    fn queue_mark_ltr(&mut self, index: u32) {
        if self.max_long_term_references == 0 {
            log::debug!("Ignoring LTR mark request {}, LTRs are not enabled", index);
        } else if let Some(pending) = self.pending_mark_ltr {
            log::debug!(
                "Dropping LTR mark request {} while request {} is pending",
                index,
                pending
            );
        } else {
            self.pending_mark_ltr = Some(index);
        }
    }

    /// Picks the most recent picture as L0 reference. Returns the bitmap of the LTRs it uses.
    fn prepare_ref_lists(
        &mut self,
        use_ltr: Option<u32>,
        token: &mut ReleaseToken<TrackedBuffer<A>>,
    ) -> TrackerResult<u32> {
        if let Some(bitmap) = use_ltr {
            let selected = LtrBitmap::from_bits(bitmap);
            self.dpb
                .retain_into(|r| r.is_ltr && selected.contains(r.ltr_index), token);
            log::trace!(
                "Restricted DPB to LTRs {:#x}, {} pictures left",
                bitmap,
                self.dpb.len()
            );
        }

        let (position, record) = self
            .dpb
            .iter()
            .enumerate()
            .max_by_key(|(_, r)| r.pic_order_cnt)
            .ok_or(TrackerError::NoReferenceCandidate)?;

        self.descriptor.l0_reference_list.push(position);

        Ok(if record.is_ltr { 1 << record.ltr_index } else { 0 })
    }

    fn build_frame(
        &mut self,
        control: &FrameControl,
        buffer: &TrackedBuffer<A>,
        downscaled: Option<&TrackedBuffer<A>>,
        token: &mut ReleaseToken<TrackedBuffer<A>>,
    ) -> TrackerResult<()> {
        if let Some(index) = control.mark_ltr {
            self.queue_mark_ltr(index);
        }

        self.gop.begin_frame(control.force_key);
        self.descriptor.reset();

        let frame_type = self.gop.state().frame_type;
        if frame_type == FrameType::Idr {
            self.dpb.clear_into(token);
        }

        if self.max_long_term_references > 0 {
            if let Some(index) = self.pending_mark_ltr.take() {
                let state = self.gop.state_mut();
                state.reference_type = ReferenceType::LongTerm;
                state.ltr_index = index;
            }
        }

        let ltr_used = if frame_type == FrameType::P {
            self.prepare_ref_lists(control.use_ltr, token)?
        } else {
            0
        };

        let state = self.gop.state_mut();
        let is_ltr = state.reference_type == ReferenceType::LongTerm;
        state.long_term_reference_frame_info =
            LongTermReferenceInfo::new(ltr_used as u16, is_ltr.then_some(state.ltr_index as u16));
        let state = self.gop.state().clone();
        let dirty_rect_frame_num = control.dirty_rect_frame_num.unwrap_or(0);

        let descriptor = &mut self.descriptor;
        for record in self.dpb.iter() {
            descriptor.dpb_snapshot.push(record.dpb_entry(0));
            descriptor
                .dirty_rect_frame_nums
                .push(record.dirty_rect_frame_num);
        }

        let record = LiveRecord {
            pic_order_cnt: state.picture_order_count,
            frame_num: 0,
            frame_num_no_wrap: 0,
            is_ltr,
            ltr_index: state.ltr_index,
            temporal_id: state.temporal_id,
            dirty_rect_frame_num,
            buffer: buffer.clone(),
            downscaled_buffer: downscaled.cloned(),
        };
        descriptor.dpb_snapshot.push(record.dpb_entry(0));
        descriptor.dirty_rect_frame_nums.push(dirty_rect_frame_num);

        if self.dpb.is_full() {
            self.dpb.evict_oldest_short_term(token)?;
        }
        if is_ltr && self.dpb.active_ltr().contains(state.ltr_index) {
            self.dpb.remove_ltr(state.ltr_index, token)?;
        }
        self.dpb.push(record);

        descriptor.gop = GopInfo::Hevc(state);

        Ok(())
    }
}

impl<A: PictureAllocator> ReferenceTracker for HevcTracker<A> {
    type Buffer = TrackedBuffer<A>;

    fn begin_frame(&mut self, control: &FrameControl) -> TrackerResult<ReleaseToken<Self::Buffer>> {
        self.check_control(control)?;

        let (buffer, downscaled) = self.pools.acquire()?;
        let mut token = std::mem::take(&mut self.deferred);

        match self.build_frame(control, &buffer, downscaled.as_ref(), &mut token) {
            Ok(()) => Ok(token),
            Err(e) => {
                // The current picture was never exposed, only detached records have to wait for
                // a fence.
                if let Err(release_err) = self.pools.release_unused(buffer, downscaled) {
                    log::warn!("Failed to return unused picture: {}", release_err);
                }
                self.deferred = token;
                Err(e)
            }
        }
    }

    fn advance_frame(&mut self) {
        self.gop.advance_frame();
    }

    fn frame_descriptor(&self) -> &FrameDescriptor<Self::Buffer> {
        &self.descriptor
    }

    fn release_reconpic(&mut self, token: ReleaseToken<Self::Buffer>) -> TrackerResult<()> {
        self.pools.releaser().release(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;

    type TestTracker = HevcTracker<DummyAllocator>;

    fn new_tracker(ltrs: u32) -> TestTracker {
        let config = TrackerConfig {
            max_long_term_references: ltrs,
            ..Default::default()
        };
        HevcTracker::new(&config, &Default::default(), DummyAllocator::new()).unwrap()
    }

    fn encode_and_release(tracker: &mut TestTracker, control: FrameControl) {
        let token = tracker.begin_frame(&control).unwrap();
        tracker.advance_frame();
        tracker.release_reconpic(token).unwrap();
    }

    #[test]
    fn most_recent_picture_is_referenced() {
        let _ = env_logger::try_init();

        let mut tracker = new_tracker(0);
        for i in 0..10u32 {
            let token = tracker.begin_frame(&Default::default()).unwrap();
            let desc = tracker.frame_descriptor();

            assert_eq!(desc.gop.picture_order_count(), i);
            assert!(desc.dpb_snapshot.iter().all(|e| e.frame_idx == 0));
            assert!(desc.ref_list0_modifications.is_empty());
            assert!(desc.mmco_operations.is_empty());
            assert_eq!(desc.current_pic_index(), Some(desc.dpb_snapshot.len() - 1));
            if i > 0 {
                let reference = desc.l0_references().next().unwrap();
                assert_eq!(reference.pic_order_cnt, i - 1);
            }
            assert!(tracker.num_live_references() <= tracker.dpb_capacity());
            assert_eq!(token.buffers().len(), (i >= 4) as usize);

            tracker.advance_frame();
            tracker.release_reconpic(token).unwrap();
        }
    }

    #[test]
    fn no_automatic_ltr() {
        let mut tracker = new_tracker(2);
        for _ in 0..5 {
            encode_and_release(&mut tracker, Default::default());
        }
        assert_eq!(tracker.active_ltr_bitmap(), 0);
    }

    #[test]
    fn use_ltr_drops_other_pictures() {
        let _ = env_logger::try_init();

        let mut tracker = new_tracker(2);
        encode_and_release(&mut tracker, Default::default());
        encode_and_release(
            &mut tracker,
            FrameControl {
                mark_ltr: Some(1),
                ..Default::default()
            },
        );
        let desc = tracker.frame_descriptor();
        assert_eq!(desc.gop.ltr_index(), Some(1));
        assert_eq!(desc.gop.long_term_reference_frame_info().ltr_index(), Some(1));
        assert_eq!(tracker.active_ltr_bitmap(), 0b10);

        encode_and_release(&mut tracker, Default::default());
        encode_and_release(&mut tracker, Default::default());
        assert_eq!(tracker.num_live_references(), 4);

        let token = tracker
            .begin_frame(&FrameControl {
                use_ltr: Some(0b10),
                ..Default::default()
            })
            .unwrap();
        let desc = tracker.frame_descriptor();
        // IDR and the two pictures after the LTR were dropped.
        assert_eq!(token.buffers().len(), 3);
        assert_eq!(desc.dpb_snapshot.len(), 2);
        assert_eq!(desc.l0_reference_list, vec![0]);
        assert!(desc.dpb_snapshot[0].is_ltr);
        assert_eq!(desc.dpb_snapshot[0].pic_order_cnt, 1);
        assert_eq!(desc.gop.long_term_reference_frame_info().used_bitmap(), 0b10);
        assert_eq!(tracker.active_ltr_bitmap(), 0b10);
        tracker.advance_frame();
        tracker.release_reconpic(token).unwrap();
    }

    #[test]
    fn use_ltr_without_match_fails() {
        let mut tracker = new_tracker(1);
        for _ in 0..3 {
            encode_and_release(&mut tracker, Default::default());
        }

        let free = tracker.pools.num_free();

        let res = tracker.begin_frame(&FrameControl {
            use_ltr: Some(0b1),
            ..Default::default()
        });
        assert!(matches!(res, Err(TrackerError::NoReferenceCandidate)));
        // The dropped pictures wait for the next token, the current one went back to the pool.
        assert_eq!(tracker.deferred.buffers().len(), 3);
        assert_eq!(tracker.pools.num_free(), free);
        assert_eq!(tracker.num_live_references(), 0);

        for _ in 0..20 {
            tracker.advance_frame();
            let res = tracker.begin_frame(&Default::default());
            assert!(matches!(res, Err(TrackerError::NoReferenceCandidate)));
            assert_eq!(tracker.pools.num_free(), free);
        }

        let token = tracker
            .begin_frame(&FrameControl {
                force_key: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(token.buffers().len(), 3);
        tracker.release_reconpic(token).unwrap();
    }

    #[test]
    fn replacing_ltr() {
        let mut tracker = new_tracker(1);
        let mark = FrameControl {
            mark_ltr: Some(0),
            ..Default::default()
        };

        encode_and_release(&mut tracker, mark.clone());
        encode_and_release(&mut tracker, Default::default());
        encode_and_release(&mut tracker, mark);

        assert_eq!(tracker.active_ltr_bitmap(), 0b1);
        let ltrs: Vec<u32> = tracker
            .dpb
            .iter()
            .filter(|r| r.is_ltr)
            .map(|r| r.pic_order_cnt)
            .collect();
        assert_eq!(ltrs, vec![2]);
    }

    #[test]
    fn invalid_mark_rejected() {
        let mut tracker = new_tracker(1);
        let res = tracker.begin_frame(&FrameControl {
            mark_ltr: Some(1),
            ..Default::default()
        });
        assert!(matches!(
            res,
            Err(TrackerError::InvalidLtrIndex { index: 1, max: 1 })
        ));
    }
}
