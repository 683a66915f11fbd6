// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::encoder::reftrack::gop::GopPosition;
use crate::encoder::FrameType;
use crate::encoder::LongTermReferenceInfo;
use crate::encoder::ReferenceType;

const LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4: u32 = 4;

/// HEVC GOP state of the frame being encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HevcGopState {
    pub intra_period: u32,
    pub ip_period: u32,
    pub frame_type: FrameType,
    pub is_used_as_future_reference: bool,
    pub picture_order_count: u32,
    pub reference_type: ReferenceType,
    /// Only meaningful for long-term references.
    pub ltr_index: u32,
    pub pic_order_cnt_type: u32,
    pub log2_max_pic_order_cnt_lsb_minus4: u32,
    pub temporal_id: u8,
    pub long_term_reference_frame_info: LongTermReferenceInfo,
}

/// The HEVC GOP state machine. Every frame is a short-term reference of the base layer.
#[derive(Debug)]
pub(crate) struct HevcGop {
    position: GopPosition,
    state: HevcGopState,
}

impl HevcGop {
    pub(crate) fn new(gop_length: u32, p_picture_period: u32) -> Self {
        let position = GopPosition::new(gop_length, p_picture_period);

        let state = HevcGopState {
            intra_period: position.gop_length(),
            ip_period: position.p_picture_period(),
            frame_type: FrameType::Idr,
            is_used_as_future_reference: true,
            picture_order_count: 0,
            reference_type: ReferenceType::ShortTerm,
            ltr_index: 0,
            pic_order_cnt_type: if p_picture_period > 2 { 0 } else { 2 },
            log2_max_pic_order_cnt_lsb_minus4: LOG2_MAX_PIC_ORDER_CNT_LSB_MINUS4,
            temporal_id: 0,
            long_term_reference_frame_info: Default::default(),
        };

        Self { position, state }
    }

    pub(crate) fn state(&self) -> &HevcGopState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut HevcGopState {
        &mut self.state
    }

    /// Sets up the state of the next frame.
    pub(crate) fn begin_frame(&mut self, force_key: bool) {
        let frame_type = self.position.next_frame_type();
        let state = &mut self.state;

        state.long_term_reference_frame_info = Default::default();
        state.reference_type = ReferenceType::ShortTerm;
        state.is_used_as_future_reference = true;
        state.temporal_id = 0;

        if force_key || frame_type == FrameType::Idr {
            self.position.reset();
            state.frame_type = FrameType::Idr;
            state.picture_order_count = 0;
            state.ltr_index = 0;
        } else {
            state.frame_type = frame_type;
            state.picture_order_count = state.picture_order_count.wrapping_add(1);
        }

        log::trace!(
            "HEVC frame {:?} POC {}",
            state.frame_type,
            state.picture_order_count
        );
    }

    pub(crate) fn advance_frame(&mut self) {
        self.position.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pocs() {
        let mut gop = HevcGop::new(5, 1);
        let frames: Vec<(FrameType, u32)> = (0..7)
            .map(|i| {
                gop.begin_frame(i == 6);
                gop.advance_frame();
                (gop.state().frame_type, gop.state().picture_order_count)
            })
            .collect();

        assert_eq!(
            frames,
            vec![
                (FrameType::Idr, 0),
                (FrameType::P, 1),
                (FrameType::P, 2),
                (FrameType::P, 3),
                (FrameType::P, 4),
                (FrameType::Idr, 0),
                (FrameType::Idr, 0),
            ]
        );
        assert!(gop.state().is_used_as_future_reference);
        assert_eq!(gop.state().log2_max_pic_order_cnt_lsb_minus4, 4);
    }
}
