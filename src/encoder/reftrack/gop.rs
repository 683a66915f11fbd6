// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GOP position bookkeeping common to all codecs.

use crate::encoder::FrameType;

/// Position of the frame to encode inside the GOP.
#[derive(Clone, Debug)]
pub(crate) struct GopPosition {
    /// Number of frames in a GOP, 0 for an infinite GOP.
    gop_length: u32,
    /// I to P frame spacing. 0 makes every frame an I frame.
    p_picture_period: u32,
    /// Whether GOP starts are IDR or plain I frames.
    force_idr_on_gop_start: bool,
    position: u64,
}

impl GopPosition {
    pub(crate) fn new(gop_length: u32, p_picture_period: u32) -> Self {
        Self {
            gop_length,
            p_picture_period,
            force_idr_on_gop_start: true,
            position: 0,
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    pub(crate) fn gop_length(&self) -> u32 {
        self.gop_length
    }

    pub(crate) fn p_picture_period(&self) -> u32 {
        self.p_picture_period
    }

    pub(crate) fn reset(&mut self) {
        self.position = 0;
    }

    /// Frame type of the frame at the current position, ignoring key frame requests.
    pub(crate) fn next_frame_type(&self) -> FrameType {
        if self.position == 0 {
            if self.force_idr_on_gop_start {
                FrameType::Idr
            } else {
                FrameType::I
            }
        } else if self.p_picture_period == 0 {
            FrameType::I
        } else if self.position % self.p_picture_period as u64 == 0 {
            FrameType::P
        } else {
            FrameType::B
        }
    }

    /// Temporal id of the frame at the current position for `layer_count` layers.
    pub(crate) fn temporal_id(&self, layer_count: u32) -> u8 {
        (self.position & (layer_count.max(1) as u64 - 1)) as u8
    }

    pub(crate) fn advance(&mut self) {
        self.position += 1;
        if self.gop_length > 0 {
            self.position %= self.gop_length as u64;
        }
    }
}
