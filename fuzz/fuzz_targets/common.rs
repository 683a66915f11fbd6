// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use cros_reftrack::backend::dummy::DummyAllocator;
use cros_reftrack::encoder::reftrack::ReferenceTracker;
use cros_reftrack::encoder::reftrack::Tracker;
use cros_reftrack::encoder::reftrack::TrackerError;
use cros_reftrack::encoder::Capabilities;
use cros_reftrack::encoder::Codec;
use cros_reftrack::encoder::FrameControl;
use cros_reftrack::encoder::FrameType;
use cros_reftrack::encoder::IntraRefreshConfig;
use cros_reftrack::encoder::ReferenceType;
use cros_reftrack::encoder::TrackerConfig;

/// Builds a tracker from the first bytes of `data`, then encodes one frame per remaining 4 bytes
/// and checks the DPB invariants after each of them.
///
/// Configurations the tracker rejects are skipped, any other error is returned.
pub fn run_tracker(codec: Codec, data: &[u8]) -> anyhow::Result<()> {
    match build_and_run(codec, data) {
        Err(TrackerError::Config(e)) => {
            log::debug!("Skipping rejected configuration: {}", e);
            Ok(())
        }
        res => res.map_err(anyhow::Error::from),
    }
}

fn build_and_run(codec: Codec, data: &[u8]) -> Result<(), TrackerError> {
    let Some((header, frames)) = data.split_first_chunk::<4>() else {
        return Ok(());
    };

    let config = TrackerConfig {
        gop_length: header[0] as u32 % 64,
        layer_count: (header[1] & 0x3 != 0).then_some(1 + (header[1] as u32 & 0x1)),
        max_long_term_references: (header[1] as u32 >> 2) % 4,
        low_latency: header[1] & 0x80 != 0,
        unwrapped_poc: header[1] & 0x40 != 0,
        ..Default::default()
    };
    let caps = Capabilities {
        max_references: 4 + (header[2] as u32 % 4),
        max_long_term_references: 3,
        ..Default::default()
    };

    let mut tracker = Tracker::new(codec, &config, &caps, DummyAllocator::new())?;
    if header[3] & 0x1 != 0 {
        let ir = IntraRefreshConfig {
            wave_duration: 1 + (header[3] as u32 >> 1) % 8,
            continuous: header[3] & 0x80 != 0,
            ..Default::default()
        };
        tracker = tracker.with_intra_refresh(&ir, &caps, config.gop_length)?;
    }

    let capacity = tracker.dpb_capacity();
    for frame in frames.chunks_exact(4) {
        let control = FrameControl {
            force_key: frame[0] & 0x1 != 0,
            mark_ltr: (frame[0] & 0x2 != 0).then_some(frame[1] as u32 % 4),
            use_ltr: (frame[0] & 0x4 != 0).then_some(frame[2] as u32 & 0x7),
            layer_count: (frame[0] & 0x8 != 0).then_some(frame[3] as u32 % 3),
            dirty_rect_frame_num: Some(frame[3] as u32),
        };

        let token = match tracker.begin_frame(&control) {
            Ok(token) => token,
            Err(TrackerError::NoReferenceCandidate)
            | Err(TrackerError::InvalidLtrIndex { .. })
            | Err(TrackerError::InvalidLayerCount(_)) => continue,
            Err(e) => return Err(e),
        };

        let desc = tracker.frame_descriptor();
        let is_reference = desc.gop.reference_type() != ReferenceType::None;
        assert!(tracker.num_live_references() <= capacity);
        assert!(desc.dpb_snapshot.len() <= capacity + is_reference as usize);
        assert_eq!(desc.dirty_rect_frame_nums.len(), desc.dpb_snapshot.len());
        if desc.frame_type() == FrameType::P {
            assert_eq!(desc.l0_reference_list.len(), 1);
        }
        if frame[0] & 0x10 != 0 {
            match tracker.start_ir_wave() {
                Ok(())
                | Err(TrackerError::IntraRefreshDisabled)
                | Err(TrackerError::IntraRefreshWaveActive)
                | Err(TrackerError::IntraRefreshNotInterFrame(_)) => (),
                Err(e) => return Err(e),
            }
        }

        tracker.advance_frame();
        tracker.release_reconpic(token)?;
    }

    Ok(())
}
