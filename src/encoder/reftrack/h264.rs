// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.264 reference tracker.
//!
//! Base layer frames are kept as short-term references in a sliding window, up to
//! `max_long_term_references` of them are additionally turned into long-term references, either
//! on request or automatically while some LTR slots are empty. P frames reference a single
//! picture, the most recent usable short-term reference unless the application restricted
//! prediction to a set of long-term references.

mod gop;

use crate::backend::PictureAllocator;
use crate::codec::h264::RefPicListModification;
use crate::codec::h264::RefPicMarkingInner;
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
use crate::encoder::MAX_TEMPORAL_LAYERS;
use crate::Resolution;

use gop::H264Gop;
pub use gop::H264GopState;

pub struct H264Tracker<A: PictureAllocator> {
    gop: H264Gop,
    dpb: LiveRecords<TrackedBuffer<A>>,
    pools: DpbPools<A>,
    descriptor: FrameDescriptor<TrackedBuffer<A>>,

    max_long_term_references: u32,
    /// LTRs the next frames may be predicted from.
    valid_ltr: LtrBitmap,
    /// Once prediction was restricted to LTRs, short-term references up to
    /// `valid_str_frame_num_no_wrap` must not be used anymore.
    check_valid_str: bool,
    valid_str_frame_num_no_wrap: u64,
    /// The number of long-term references must be signaled with the next non-IDR frame.
    send_max_long_term_references: bool,
    pending_mark_ltr: Option<u32>,

    /// Highest layer count accepted at runtime.
    max_layer_count: u32,

    /// Records detached by a failed `begin_frame`, handed out with the next token.
    deferred: ReleaseToken<TrackedBuffer<A>>,
}

impl<A: PictureAllocator> H264Tracker<A> {
    pub fn new(config: &TrackerConfig, caps: &Capabilities, allocator: A) -> TrackerResult<Self>
    where
        A: Clone,
    {
        config.validate(caps)?;

        let pools = DpbPools::new(config, caps, allocator)?;
        let gop = H264Gop::new(
            config.gop_length,
            config.p_picture_period(),
            config.layer_count,
            config.unwrapped_poc,
        );
        let descriptor = FrameDescriptor::new(GopInfo::H264(gop.state().clone()));

        log::debug!(
            "H.264 tracker: GOP {}, {} B frames, {} layers, {} LTRs, DPB of {}",
            config.gop_length,
            config.b_frame_count,
            config.effective_layer_count(),
            config.max_long_term_references,
            caps.max_references
        );

        Ok(Self {
            gop,
            dpb: LiveRecords::new(caps.max_references as usize),
            pools,
            descriptor,
            max_long_term_references: config.max_long_term_references,
            valid_ltr: LtrBitmap::all(config.max_long_term_references),
            check_valid_str: false,
            valid_str_frame_num_no_wrap: u64::MAX,
            send_max_long_term_references: false,
            pending_mark_ltr: None,
            max_layer_count: caps.max_temporal_layers.min(MAX_TEMPORAL_LAYERS),
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

    /// Rejects requests that cannot be honored, before any state is touched.
    fn check_control(&self, control: &FrameControl) -> TrackerResult<()> {
        if let Some(index) = control.mark_ltr {
            if self.max_long_term_references > 0 && index >= self.max_long_term_references {
                return Err(TrackerError::InvalidLtrIndex {
                    index,
                    max: self.max_long_term_references,
                });
            }
        }

        if let Some(layers) = control.layer_count {
            if layers == 0 || layers > self.max_layer_count {
                return Err(TrackerError::InvalidLayerCount(layers));
            }
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

    /// Picks the single L0 reference of a P frame. Returns the bitmap of the LTRs it uses.
    fn prepare_ref_lists(&mut self, use_ltr: Option<u32>) -> TrackerResult<u32> {
        let state = self.gop.state();
        let current_frame_num_no_wrap = state.frame_num_no_wrap;

        if let Some(bitmap) = use_ltr {
            self.valid_ltr =
                LtrBitmap::from_bits(bitmap & LtrBitmap::all(self.max_long_term_references).bits());
            self.check_valid_str = true;
            self.valid_str_frame_num_no_wrap = current_frame_num_no_wrap;
        }

        let (mut short_term, mut long_term): (Vec<_>, Vec<_>) =
            self.dpb.iter().enumerate().partition(|(_, r)| !r.is_ltr);
        short_term.sort_by(|(_, a), (_, b)| b.frame_num_no_wrap.cmp(&a.frame_num_no_wrap));

        let descriptor = &mut self.descriptor;

        let mut found = false;
        if use_ltr.is_none() {
            let target_tid = state.temporal_id.saturating_sub(1);
            let candidate = short_term.iter().enumerate().find(|(_, (_, r))| {
                r.temporal_id <= target_tid
                    && !(self.check_valid_str
                        && r.frame_num_no_wrap <= self.valid_str_frame_num_no_wrap)
            });

            if let Some((rank, (position, record))) = candidate {
                descriptor.l0_reference_list.push(*position);
                if rank != 0 {
                    let diff = current_frame_num_no_wrap - record.frame_num_no_wrap - 1;
                    descriptor
                        .ref_list0_modifications
                        .push(RefPicListModification::short_term(diff as u32));
                }
                log::trace!(
                    "L0 is short-term reference frame_num {}",
                    record.frame_num
                );
                found = true;
            }
        }

        if !found {
            long_term.sort_by(|(_, a), (_, b)| b.frame_num_no_wrap.cmp(&a.frame_num_no_wrap));
            let candidate = long_term
                .iter()
                .find(|(_, r)| self.valid_ltr.contains(r.ltr_index));

            if let Some((position, record)) = candidate {
                descriptor.l0_reference_list.push(*position);
                descriptor
                    .ref_list0_modifications
                    .push(RefPicListModification::long_term(record.ltr_index));
                log::trace!("L0 is LTR {}", record.ltr_index);
            }
        }

        if !descriptor.ref_list0_modifications.is_empty() {
            descriptor
                .ref_list0_modifications
                .push(RefPicListModification::end());
        }

        if descriptor.l0_reference_list.is_empty() {
            return Err(TrackerError::NoReferenceCandidate);
        }

        let used = descriptor
            .l0_reference_list
            .iter()
            .filter_map(|&position| self.dpb.get(position))
            .filter(|r| r.is_ltr)
            .fold(0, |bitmap, r| bitmap | (1 << r.ltr_index));

        Ok(used)
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
        let temporal_id = self.gop.state().temporal_id;

        if frame_type == FrameType::Idr {
            self.dpb.clear_into(token);
            self.check_valid_str = false;
            self.valid_str_frame_num_no_wrap = u64::MAX;
            self.valid_ltr = LtrBitmap::all(self.max_long_term_references);
            if self.max_long_term_references > 0 {
                self.send_max_long_term_references = true;
            }
        }

        if self.max_long_term_references > 0 && temporal_id == 0 {
            let active = self.dpb.active_ltr();
            if self.pending_mark_ltr.is_none() && active.count() < self.max_long_term_references {
                self.pending_mark_ltr = active.first_empty(self.max_long_term_references);
            }

            if let Some(index) = self.pending_mark_ltr.take() {
                let state = self.gop.state_mut();
                state.reference_type = ReferenceType::LongTerm;
                state.ltr_index = index;
            }
        }

        if temporal_id == 0 && self.gop.layers_enabled() {
            if let Some(layers) = control.layer_count {
                if layers != self.gop.layer_count() {
                    self.gop.set_layer_count(layers);
                }
            }
        }

        let ltr_used = if frame_type == FrameType::P {
            self.prepare_ref_lists(control.use_ltr)?
        } else {
            0
        };

        let state = self.gop.state_mut();
        let is_ltr = state.reference_type == ReferenceType::LongTerm;
        state.long_term_reference_frame_info =
            LongTermReferenceInfo::new(ltr_used as u16, is_ltr.then_some(state.ltr_index as u16));

        let state = self.gop.state().clone();
        let dirty_rect_frame_num = control.dirty_rect_frame_num.unwrap_or(0);
        let is_reference = state.reference_type != ReferenceType::None;

        let descriptor = &mut self.descriptor;
        for record in self.dpb.iter() {
            let frame_idx = if record.is_ltr {
                record.ltr_index
            } else {
                record.frame_num
            };
            descriptor.dpb_snapshot.push(record.dpb_entry(frame_idx));
            descriptor
                .dirty_rect_frame_nums
                .push(record.dirty_rect_frame_num);
        }

        if !is_reference {
            token.push(buffer.clone(), downscaled.cloned());
            descriptor.gop = GopInfo::H264(state);
            return Ok(());
        }

        let record = LiveRecord {
            pic_order_cnt: state.picture_order_count,
            frame_num: state.frame_num,
            frame_num_no_wrap: state.frame_num_no_wrap,
            is_ltr,
            ltr_index: state.ltr_index,
            temporal_id: state.temporal_id,
            dirty_rect_frame_num,
            buffer: buffer.clone(),
            downscaled_buffer: downscaled.cloned(),
        };
        descriptor
            .dpb_snapshot
            .push(record.dpb_entry(if is_ltr { state.ltr_index } else { state.frame_num }));
        descriptor.dirty_rect_frame_nums.push(dirty_rect_frame_num);

        if self.max_long_term_references > 0 {
            if self.send_max_long_term_references && frame_type != FrameType::Idr {
                descriptor
                    .mmco_operations
                    .push(RefPicMarkingInner::max_long_term_frame_idx(
                        self.max_long_term_references as u8,
                    ));
                self.send_max_long_term_references = false;
            }
            if is_ltr {
                descriptor
                    .mmco_operations
                    .push(RefPicMarkingInner::mark_current_as_long_term(state.ltr_index as u8));
            }
            if !descriptor.mmco_operations.is_empty() {
                descriptor.mmco_operations.push(RefPicMarkingInner::end());
            }
        }

        // Replacing an active LTR frees a slot, so nothing else has to go.
        let replaces_ltr = is_ltr && self.dpb.active_ltr().contains(state.ltr_index);
        if !replaces_ltr && self.dpb.is_full() {
            self.dpb.evict_oldest_short_term(token)?;
        }

        if replaces_ltr {
            self.dpb.remove_ltr(state.ltr_index, token)?;
        }
        if is_ltr {
            self.valid_ltr.insert(state.ltr_index);
        }
        self.dpb.push(record);

        descriptor.gop = GopInfo::H264(state);

        Ok(())
    }
}

impl<A: PictureAllocator> ReferenceTracker for H264Tracker<A> {
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
