// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs a reference tracker against the dummy backend and prints its decisions frame by frame.

use std::str::FromStr;

use argh::FromArgs;
use cros_reftrack::backend::dummy::DummyAllocator;
use cros_reftrack::backend::dummy::DummySubmitter;
use cros_reftrack::encoder::reftrack::ReferenceTracker;
use cros_reftrack::encoder::reftrack::Tracker;
use cros_reftrack::encoder::session::EncodeSession;
use cros_reftrack::encoder::Capabilities;
use cros_reftrack::encoder::Codec;
use cros_reftrack::encoder::FrameControl;
use cros_reftrack::encoder::IntraRefreshConfig;
use cros_reftrack::encoder::TrackerConfig;
use cros_reftrack::encoder::TwoPassConfig;
use cros_reftrack::BlockingMode;
use cros_reftrack::Resolution;

#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
enum CodecArg {
    #[default]
    H264,
    H265,
}

impl FromStr for CodecArg {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h264" | "H264" => Ok(Self::H264),
            "h265" | "H265" | "hevc" | "HEVC" => Ok(Self::H265),
            _ => Err("unrecognized codec. Valid values: h264, h265"),
        }
    }
}

/// Reference tracker simulation
#[derive(Debug, FromArgs)]
struct Args {
    /// codec to simulate, h264 or h265
    #[argh(option, default = "CodecArg::default()")]
    codec: CodecArg,

    /// number of frames to encode
    #[argh(option, default = "60")]
    count: usize,

    /// frames width
    #[argh(option, default = "640")]
    width: u32,

    /// frames height
    #[argh(option, default = "480")]
    height: u32,

    /// GOP length, 0 for an infinite GOP
    #[argh(option, default = "30")]
    gop: u32,

    /// number of B frames between anchor frames
    #[argh(option, default = "0")]
    b_frames: u32,

    /// number of temporal layers
    #[argh(option)]
    layers: Option<u32>,

    /// number of long-term references
    #[argh(option, default = "0")]
    ltr: u32,

    /// restrict prediction to long-term references every this many frames
    #[argh(option)]
    use_ltr_every: Option<usize>,

    /// force a key frame at this frame, may be repeated
    #[argh(option)]
    force_key: Vec<usize>,

    /// intra refresh wave duration in frames
    #[argh(option)]
    intra_refresh: Option<u32>,

    /// two-pass power of two downscale factor
    #[argh(option)]
    two_pass: Option<u32>,

    /// number of frames kept in flight
    #[argh(option, default = "8")]
    queue_depth: u32,

    /// complete every frame before the next one
    #[argh(switch)]
    low_latency: bool,
}

fn main() {
    env_logger::init();

    let args: Args = argh::from_env();

    let codec = match args.codec {
        CodecArg::H264 => Codec::H264,
        CodecArg::H265 => Codec::Hevc,
    };

    let config = TrackerConfig {
        resolution: Resolution::from((args.width, args.height)),
        gop_length: args.gop,
        b_frame_count: args.b_frames,
        layer_count: args.layers,
        max_long_term_references: args.ltr,
        low_latency: args.low_latency,
        queue_depth: args.queue_depth,
        two_pass: args.two_pass.map(|pow2_downscale_factor| TwoPassConfig {
            pow2_downscale_factor,
        }),
        ..Default::default()
    };

    let caps = Capabilities {
        max_long_term_references: args.ltr.max(2),
        max_references: (args.ltr + 1).max(4),
        max_l1_references: 1,
        ..Default::default()
    };

    let mut tracker = Tracker::new(codec, &config, &caps, DummyAllocator::new())
        .expect("failed to create tracker");
    if let Some(wave_duration) = args.intra_refresh {
        let ir = IntraRefreshConfig {
            wave_duration,
            ..Default::default()
        };
        tracker = tracker
            .with_intra_refresh(&ir, &caps, config.gop_length)
            .expect("failed to enable intra refresh");
    }

    let mut session = EncodeSession::new(
        tracker,
        DummySubmitter::new(),
        &config,
        BlockingMode::NonBlocking,
    );

    println!("frame type POC tid ref       ltr  L0    DPB IR");
    for i in 0..args.count {
        let control = FrameControl {
            force_key: args.force_key.contains(&i),
            use_ltr: match args.use_ltr_every {
                Some(n) if n > 0 && i > 0 && i % n == 0 => Some(u32::MAX),
                _ => None,
            },
            dirty_rect_frame_num: Some(i as u32),
            ..Default::default()
        };

        if let Err(e) = session.encode(&control) {
            println!("{:5} error: {}", i, e);
            continue;
        }

        let desc = session.tracker().frame_descriptor();
        let l0 = desc
            .l0_references()
            .next()
            .map(|e| format!("{}{}", if e.is_ltr { "L" } else { "S" }, e.pic_order_cnt))
            .unwrap_or_else(|| "-".into());
        let ltr = desc
            .gop
            .ltr_index()
            .map(|i| i.to_string())
            .unwrap_or_else(|| "-".into());
        let ir = if desc.intra_refresh.region_size > 0 {
            format!(
                "{}+{}",
                desc.intra_refresh.offset, desc.intra_refresh.region_size
            )
        } else {
            "-".into()
        };

        println!(
            "{:5} {:4} {:3} {:3} {:9} {:4} {:5} {:3} {}",
            i,
            format!("{:?}", desc.frame_type()),
            desc.gop.picture_order_count(),
            desc.gop.temporal_id(),
            format!("{:?}", desc.gop.reference_type()),
            ltr,
            l0,
            desc.dpb_snapshot.len(),
            ir
        );

        while let Ok(Some(_)) = session.poll() {}
    }

    match session.drain() {
        Ok(frames) => log::debug!("{} frames left in flight at the end", frames.len()),
        Err(e) => println!("error while draining: {}", e),
    }
}
