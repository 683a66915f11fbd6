// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Gradual intra refresh on top of another tracker.
//!
//! A refresh wave spreads the intra coding of a whole picture over `wave_duration` frames: each
//! frame of the wave intra codes the next `total_macroblocks / wave_duration` macroblocks, so a
//! decoder joining the stream or recovering from a loss gets a clean picture without the bitrate
//! spike of an IDR.

use crate::encoder::reftrack::FrameDescriptor;
use crate::encoder::reftrack::ReferenceTracker;
use crate::encoder::reftrack::ReleaseToken;
use crate::encoder::reftrack::TrackerError;
use crate::encoder::reftrack::TrackerResult;
use crate::encoder::ConfigError;
use crate::encoder::FrameControl;
use crate::encoder::FrameType;
use crate::encoder::IntraRefreshMode;
use crate::encoder::IntraRefreshParams;
use crate::encoder::SliceDescriptor;
use crate::encoder::SliceMode;
use crate::encoder::SlicesConfig;

pub struct IntraRefreshTracker<T: ReferenceTracker> {
    inner: T,
    wave_duration: u32,
    continuous: bool,
    non_wave_slices: SlicesConfig,
    total_macroblocks: u32,

    /// Index of the current frame in the active wave.
    wave_frame_index: u32,
    params: IntraRefreshParams,
    slices: SlicesConfig,

    /// Descriptor of the inner tracker with the slice and refresh fields overridden.
    descriptor: FrameDescriptor<T::Buffer>,
}

impl<T: ReferenceTracker> IntraRefreshTracker<T> {
    pub fn new(
        inner: T,
        wave_duration: u32,
        continuous: bool,
        non_wave_slices: SlicesConfig,
        total_macroblocks: u32,
    ) -> TrackerResult<Self> {
        if wave_duration == 0 {
            return Err(ConfigError::EmptyIntraRefreshWave.into());
        }

        let descriptor = inner.frame_descriptor().clone();
        let mut tracker = Self {
            inner,
            wave_duration,
            continuous,
            slices: non_wave_slices.clone(),
            non_wave_slices,
            total_macroblocks,
            wave_frame_index: 0,
            params: Default::default(),
            descriptor,
        };
        tracker.update_descriptor();

        Ok(tracker)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn wave_duration(&self) -> u32 {
        self.wave_duration
    }

    pub fn is_wave_active(&self) -> bool {
        self.params.mode == IntraRefreshMode::UnitRows
    }

    /// Starts a refresh wave with the current frame.
    pub fn start_ir_wave(&mut self) -> TrackerResult<()> {
        let frame_type = self.inner.frame_descriptor().frame_type();
        if !frame_type.is_inter() {
            return Err(TrackerError::IntraRefreshNotInterFrame(frame_type));
        }
        if self.is_wave_active() {
            return Err(TrackerError::IntraRefreshWaveActive);
        }

        self.start_wave();
        self.update_descriptor();

        Ok(())
    }

    fn start_wave(&mut self) {
        let region_size = self.total_macroblocks / self.wave_duration;

        self.wave_frame_index = 0;
        self.params = IntraRefreshParams {
            mode: IntraRefreshMode::UnitRows,
            duration: self.wave_duration,
            need_sequence_header: true,
            offset: 0,
            region_size,
        };
        self.slices = SlicesConfig {
            mode: SliceMode::Blocks,
            slices: (0..self.wave_duration)
                .map(|i| SliceDescriptor {
                    start_macroblock: i * region_size,
                    macroblock_count: region_size,
                })
                .collect(),
        };

        log::trace!(
            "Starting intra refresh wave of {} frames, {} macroblocks each",
            self.wave_duration,
            region_size
        );
    }

    fn reset_wave(&mut self) {
        self.wave_frame_index = 0;
        self.params = Default::default();
        self.slices = self.non_wave_slices.clone();
    }

    /// Moves the active wave to the next frame, ending it after its last frame.
    fn advance_wave(&mut self) {
        if !self.is_wave_active() {
            return;
        }

        self.wave_frame_index += 1;
        if self.wave_frame_index < self.params.duration {
            self.params.need_sequence_header = false;
            self.params.offset += self.params.region_size;
        } else {
            log::trace!("Intra refresh wave complete");
            self.reset_wave();
        }
    }

    fn update_descriptor(&mut self) {
        self.descriptor = self.inner.frame_descriptor().clone();
        self.descriptor.slices = self.slices.clone();
        self.descriptor.intra_refresh = self.params;
    }
}

impl<T: ReferenceTracker> ReferenceTracker for IntraRefreshTracker<T> {
    type Buffer = T::Buffer;

    fn begin_frame(&mut self, control: &FrameControl) -> TrackerResult<ReleaseToken<Self::Buffer>> {
        let token = self.inner.begin_frame(control)?;

        self.advance_wave();

        let frame_type = self.inner.frame_descriptor().frame_type();
        if frame_type == FrameType::Idr {
            if self.is_wave_active() {
                log::trace!("IDR cancels intra refresh wave");
            }
            self.reset_wave();
        } else if frame_type.is_inter() && self.continuous && !self.is_wave_active() {
            self.start_wave();
        }

        self.update_descriptor();

        Ok(token)
    }

    fn advance_frame(&mut self) {
        self.inner.advance_frame();
    }

    fn frame_descriptor(&self) -> &FrameDescriptor<Self::Buffer> {
        &self.descriptor
    }

    fn release_reconpic(&mut self, token: ReleaseToken<Self::Buffer>) -> TrackerResult<()> {
        self.inner.release_reconpic(token)
    }
}
