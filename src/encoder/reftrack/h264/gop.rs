// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::reftrack::gop::GopPosition;
use crate::encoder::FrameType;
use crate::encoder::LongTermReferenceInfo;
use crate::encoder::ReferenceType;

const LOG2_MAX_FRAME_NUM_MINUS4: u32 = 4;
const LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4: u32 = 5;
/// idr_pic_id is coded on 16 bits.
const MAX_IDR_PIC_ID: u32 = 1 << 16;

/// H.264 GOP state of the frame being encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct H264GopState {
    pub intra_period: u32,
    pub ip_period: u32,
    pub frame_type: FrameType,
    /// frame_num, wrapped at `MaxFrameNum`.
    pub frame_num: u32,
    pub frame_num_no_wrap: u64,
    /// Number of reference frames since the last IDR, including it.
    pub current_reference_frame_count: u64,
    pub picture_order_count: u32,
    pub reference_type: ReferenceType,
    /// Only meaningful for long-term references.
    pub ltr_index: u32,
    pub pic_order_cnt_type: u32,
    pub idr_pic_id: u32,
    pub log2_max_frame_num_minus4: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub temporal_id: u8,
    pub long_term_reference_frame_info: LongTermReferenceInfo,
}

impl H264GopState {
    pub fn max_frame_num(&self) -> u32 {
        1 << (self.log2_max_frame_num_minus4 + 4)
    }
}

/// The H.264 GOP state machine.
#[derive(Debug)]
pub(crate) struct H264Gop {
    position: GopPosition,
    layer_count: u32,
    layers_enabled: bool,
    unwrapped_poc: bool,
    first_idr: bool,
    state: H264GopState,
}

impl H264Gop {
    pub(crate) fn new(
        gop_length: u32,
        p_picture_period: u32,
        layer_count: Option<u32>,
        unwrapped_poc: bool,
    ) -> Self {
        let position = GopPosition::new(gop_length, p_picture_period);

        let state = H264GopState {
            intra_period: position.gop_length(),
            ip_period: position.p_picture_period(),
            frame_type: FrameType::Idr,
            frame_num: 0,
            frame_num_no_wrap: 0,
            current_reference_frame_count: 1,
            picture_order_count: 0,
            reference_type: ReferenceType::ShortTerm,
            ltr_index: 0,
            pic_order_cnt_type: if p_picture_period > 2 { 0 } else { 2 },
            idr_pic_id: 0,
            log2_max_frame_num_minus4: LOG2_MAX_FRAME_NUM_MINUS4,
            log2_max_pic_order_cnt_lsb_minus4: LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4,
            temporal_id: 0,
            long_term_reference_frame_info: Default::default(),
        };

        Self {
            position,
            layer_count: layer_count.unwrap_or(1),
            layers_enabled: layer_count.is_some(),
            unwrapped_poc,
            first_idr: true,
            state,
        }
    }

    pub(crate) fn state(&self) -> &H264GopState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut H264GopState {
        &mut self.state
    }

    pub(crate) fn layers_enabled(&self) -> bool {
        self.layers_enabled
    }

    pub(crate) fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub(crate) fn set_layer_count(&mut self, layer_count: u32) {
        log::debug!(
            "Switching from {} to {} temporal layers",
            self.layer_count,
            layer_count
        );
        self.layer_count = layer_count;
    }

    fn reset_to_idr(&mut self) {
        self.position.reset();

        let state = &mut self.state;
        state.frame_type = FrameType::Idr;
        state.frame_num = 0;
        state.frame_num_no_wrap = 0;
        state.picture_order_count = 0;
        state.current_reference_frame_count = 1;
        state.temporal_id = 0;
        state.reference_type = ReferenceType::ShortTerm;
        state.ltr_index = 0;
    }

    /// Sets up the state of the next frame.
    pub(crate) fn begin_frame(&mut self, force_key: bool) {
        let frame_type = self.position.next_frame_type();
        let temporal_id = if self.layers_enabled {
            self.position.temporal_id(self.layer_count)
        } else {
            0
        };

        self.state.long_term_reference_frame_info = Default::default();

        if force_key || frame_type == FrameType::Idr {
            if self.first_idr {
                self.first_idr = false;
            } else {
                self.state.idr_pic_id = (self.state.idr_pic_id + 1) % MAX_IDR_PIC_ID;
            }
            self.reset_to_idr();
            return;
        }

        let max_frame_num = self.state.max_frame_num();
        let state = &mut self.state;
        state.frame_type = frame_type;
        state.frame_num = (state.current_reference_frame_count % max_frame_num as u64) as u32;
        state.frame_num_no_wrap = state.current_reference_frame_count;
        state.temporal_id = temporal_id;

        // The POC of base layer frames is the double of their frame_num, enhancement layer frames
        // slot right before the next base layer frame.
        let poc_wrap = 2 * max_frame_num as u64;
        let base_poc = if self.unwrapped_poc {
            2 * state.frame_num_no_wrap
        } else {
            2 * state.frame_num as u64
        };

        if temporal_id == 0 {
            state.reference_type = ReferenceType::ShortTerm;
            state.picture_order_count = base_poc as u32;
            state.current_reference_frame_count += 1;
        } else {
            state.reference_type = ReferenceType::None;
            state.picture_order_count = if self.unwrapped_poc {
                (base_poc - 1) as u32
            } else {
                ((base_poc + poc_wrap - 1) % poc_wrap) as u32
            };
        }

        log::trace!(
            "H.264 frame {:?} frame_num {} POC {} tid {}",
            state.frame_type,
            state.frame_num,
            state.picture_order_count,
            state.temporal_id
        );
    }

    pub(crate) fn advance_frame(&mut self) {
        self.position.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(gop: &mut H264Gop, force_key: bool) -> H264GopState {
        gop.begin_frame(force_key);
        let state = gop.state().clone();
        gop.advance_frame();
        state
    }

    #[test]
    fn pocs_reset_at_idr() {
        let mut gop = H264Gop::new(4, 1, None, false);
        let pocs: Vec<(FrameType, u32)> = (0..9)
            .map(|_| {
                let s = step(&mut gop, false);
                (s.frame_type, s.picture_order_count)
            })
            .collect();

        assert_eq!(
            pocs,
            vec![
                (FrameType::Idr, 0),
                (FrameType::P, 2),
                (FrameType::P, 4),
                (FrameType::P, 6),
                (FrameType::Idr, 0),
                (FrameType::P, 2),
                (FrameType::P, 4),
                (FrameType::P, 6),
                (FrameType::Idr, 0),
            ]
        );
        assert_eq!(gop.state().idr_pic_id, 2);
    }

    #[test]
    fn frame_num_wraps() {
        let mut gop = H264Gop::new(0, 1, None, false);
        let max_frame_num = gop.state().max_frame_num();
        assert_eq!(max_frame_num, 256);

        let mut previous_poc = 0;
        for i in 0..1000u64 {
            let s = step(&mut gop, i == 0);
            assert_eq!(s.frame_num_no_wrap, i);
            assert_eq!(s.frame_num as u64, s.frame_num_no_wrap % max_frame_num as u64);
            assert_eq!(s.picture_order_count, 2 * s.frame_num);
            if s.frame_num != 0 {
                assert!(s.picture_order_count > previous_poc);
            }
            previous_poc = s.picture_order_count;
        }
    }

    #[test]
    fn unwrapped_poc() {
        let mut gop = H264Gop::new(0, 1, None, true);
        for i in 0..600u64 {
            let s = step(&mut gop, false);
            assert_eq!(s.picture_order_count as u64, 2 * i);
        }
    }

    #[test]
    fn two_layers() {
        let mut gop = H264Gop::new(0, 1, Some(2), false);
        let frames: Vec<(u8, ReferenceType, u32, u32)> = (0..5)
            .map(|_| {
                let s = step(&mut gop, false);
                (s.temporal_id, s.reference_type, s.frame_num, s.picture_order_count)
            })
            .collect();

        assert_eq!(
            frames,
            vec![
                (0, ReferenceType::ShortTerm, 0, 0),
                (1, ReferenceType::None, 1, 1),
                (0, ReferenceType::ShortTerm, 1, 2),
                (1, ReferenceType::None, 2, 3),
                (0, ReferenceType::ShortTerm, 2, 4),
            ]
        );
    }

    #[test]
    fn enhancement_poc_wraps() {
        let mut gop = H264Gop::new(0, 1, Some(2), false);
        // Base layer frames 0..=255 then an enhancement layer frame with frame_num 0.
        let mut last = None;
        for _ in 0..512 {
            last = Some(step(&mut gop, false));
        }
        let s = last.unwrap();
        assert_eq!(s.temporal_id, 1);
        assert_eq!(s.frame_num, 0);
        assert_eq!(s.picture_order_count, 511);
    }

    #[test]
    fn forced_key_frame() {
        let mut gop = H264Gop::new(30, 1, None, false);
        for _ in 0..5 {
            step(&mut gop, false);
        }

        let s = step(&mut gop, true);
        assert_eq!(s.frame_type, FrameType::Idr);
        assert_eq!(s.idr_pic_id, 1);
        assert_eq!(s.current_reference_frame_count, 1);

        let s = step(&mut gop, false);
        assert_eq!(s.frame_type, FrameType::P);
        assert_eq!(s.frame_num, 1);
    }

    #[test]
    fn poc_type() {
        assert_eq!(H264Gop::new(30, 1, None, false).state().pic_order_cnt_type, 2);
        assert_eq!(H264Gop::new(30, 3, None, false).state().pic_order_cnt_type, 0);
    }
}
