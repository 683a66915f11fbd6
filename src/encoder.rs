// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod reftrack;
pub mod session;

use thiserror::Error;

use crate::backend::BufferUsage;
use crate::BitDepth;
use crate::Resolution;

/// Largest number of long-term references a tracker can manage, bounded by the width of the
/// LTR bitmaps.
pub const MAX_LONG_TERM_REFERENCES: u32 = 16;

/// Largest supported number of temporal layers.
pub const MAX_TEMPORAL_LAYERS: u32 = 2;

/// Default number of frames that may be in flight in the hardware queue.
pub const DEFAULT_QUEUE_DEPTH: u32 = 8;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

/// Type of a frame, as decided by the GOP state machine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum FrameType {
    #[default]
    Idr,
    I,
    P,
    B,
}

impl FrameType {
    /// Whether the frame is predicted from other pictures.
    pub fn is_inter(&self) -> bool {
        matches!(self, FrameType::P | FrameType::B)
    }
}

/// How the current picture will be kept around for future frames to reference.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ReferenceType {
    None,
    #[default]
    ShortTerm,
    LongTerm,
}

/// Side-channel value reporting LTR usage of a frame to the application.
///
/// The upper 16 bits hold the bitmap of LTR indices referenced by the frame, the lower 16 bits
/// the LTR index the frame is marked with, or `0xFFFF` if it is not a long-term reference.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LongTermReferenceInfo(u32);

impl LongTermReferenceInfo {
    const NO_INDEX: u32 = 0xFFFF;

    pub fn new(used_bitmap: u16, ltr_index: Option<u16>) -> Self {
        let index = ltr_index.map_or(Self::NO_INDEX, u32::from);
        Self(((used_bitmap as u32) << 16) | index)
    }

    /// LTR indices referenced by the frame.
    pub fn used_bitmap(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// LTR index the frame is marked with, if any.
    pub fn ltr_index(&self) -> Option<u16> {
        match self.0 & 0xFFFF {
            Self::NO_INDEX => None,
            index => Some(index as u16),
        }
    }
}

impl Default for LongTermReferenceInfo {
    fn default() -> Self {
        Self(Self::NO_INDEX)
    }
}

impl From<LongTermReferenceInfo> for u32 {
    fn from(info: LongTermReferenceInfo) -> Self {
        info.0
    }
}

/// Per-frame requests from the application.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameControl {
    /// Encode this frame as an IDR and restart the GOP.
    pub force_key: bool,
    /// Mark this frame, or the next base layer frame, as long-term reference with this index.
    pub mark_ltr: Option<u32>,
    /// Predict this frame only from the long-term references in this bitmap.
    pub use_ltr: Option<u32>,
    /// Switch to this number of temporal layers at the next base layer frame.
    pub layer_count: Option<u32>,
    /// Tag of the input frame, passed through to the hardware for dirty rectangle tracking.
    pub dirty_rect_frame_num: Option<u32>,
}

/// Second rate control pass running on downscaled pictures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TwoPassConfig {
    /// The downscaled pictures are `2^pow2_downscale_factor` times smaller in each dimension.
    pub pow2_downscale_factor: u32,
}

/// Static configuration of an encoding session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Coded resolution of the stream.
    pub resolution: Resolution,
    /// Bit depth of the profile, decides the reconstructed picture format.
    pub bit_depth: BitDepth,
    /// Number of frames between IDRs. 0 means only the first frame is an IDR.
    pub gop_length: u32,
    /// Number of B frames between anchor frames.
    pub b_frame_count: u32,
    /// Number of temporal layers, or `None` if layering was not requested.
    pub layer_count: Option<u32>,
    /// Number of long-term reference slots.
    pub max_long_term_references: u32,
    /// Low latency sessions keep no frame in flight past its own encode.
    pub low_latency: bool,
    /// Number of frames that may be queued to the hardware.
    pub queue_depth: u32,
    /// H.264 only: derive POC from the unwrapped frame number.
    pub unwrapped_poc: bool,
    pub two_pass: Option<TwoPassConfig>,
    pub buffer_usage: BufferUsage,
}

impl TrackerConfig {
    /// I to P frame spacing.
    pub fn p_picture_period(&self) -> u32 {
        self.b_frame_count + 1
    }

    /// Number of temporal layers the tracker runs with.
    pub fn effective_layer_count(&self) -> u32 {
        self.layer_count.unwrap_or(1)
    }

    /// Number of submitted frames that may wait for completion.
    pub fn frames_in_flight(&self) -> usize {
        if self.low_latency {
            0
        } else {
            self.queue_depth as usize
        }
    }

    /// Number of buffers the reconstructed picture pools need.
    pub fn pool_size(&self, caps: &Capabilities) -> usize {
        caps.max_references as usize + 1 + self.frames_in_flight()
    }

    /// Checks that a tracker can run this configuration on hardware with `caps`.
    pub fn validate(&self, caps: &Capabilities) -> Result<(), ConfigError> {
        if self.b_frame_count > 0 {
            if caps.max_l1_references == 0 {
                return Err(ConfigError::BFramesWithoutL1);
            }
            if self.effective_layer_count() > 1 {
                return Err(ConfigError::BFramesWithTemporalLayers);
            }
            if self.max_long_term_references > 0 {
                return Err(ConfigError::BFramesWithLongTermReferences);
            }
        }

        if let Some(layers) = self.layer_count {
            let max = caps.max_temporal_layers.min(MAX_TEMPORAL_LAYERS);
            if layers == 0 || layers > max {
                return Err(ConfigError::UnsupportedTemporalLayers {
                    requested: layers,
                    max,
                });
            }
        }

        let max_ltr = caps.max_long_term_references.min(MAX_LONG_TERM_REFERENCES);
        if self.max_long_term_references > max_ltr {
            return Err(ConfigError::TooManyLongTermReferences {
                requested: self.max_long_term_references,
                max: max_ltr,
            });
        }

        if caps.max_references == 0 {
            return Err(ConfigError::EmptyDpb);
        }

        if self.max_long_term_references + 1 > caps.max_references {
            return Err(ConfigError::NoShortTermRoom {
                long_term: self.max_long_term_references,
                capacity: caps.max_references,
            });
        }

        if caps.max_l0_references == 0 {
            return Err(ConfigError::NoL0References);
        }

        if let Some(two_pass) = self.two_pass {
            if two_pass.pow2_downscale_factor == 0 || two_pass.pow2_downscale_factor > 4 {
                return Err(ConfigError::UnsupportedDownscale(
                    two_pass.pow2_downscale_factor,
                ));
            }
        }

        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution {
                width: 320,
                height: 240,
            },
            bit_depth: Default::default(),
            gop_length: 30,
            b_frame_count: 0,
            layer_count: None,
            max_long_term_references: 0,
            low_latency: false,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            unwrapped_poc: false,
            two_pass: None,
            buffer_usage: Default::default(),
        }
    }
}

/// Limits reported by the hardware encoder.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Number of pictures the DPB can hold, not counting the current one.
    pub max_references: u32,
    pub max_long_term_references: u32,
    pub max_l0_references: u32,
    pub max_l1_references: u32,
    pub max_temporal_layers: u32,
    /// Longest intra refresh wave, in frames.
    pub max_intra_refresh_size: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_references: 4,
            max_long_term_references: 2,
            max_l0_references: 1,
            max_l1_references: 0,
            max_temporal_layers: 2,
            max_intra_refresh_size: 64,
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("B frames need at least one L1 reference")]
    BFramesWithoutL1,
    #[error("B frames cannot be combined with temporal layers")]
    BFramesWithTemporalLayers,
    #[error("B frames cannot be combined with long-term references")]
    BFramesWithLongTermReferences,
    #[error("{requested} temporal layers requested, 1 to {max} supported")]
    UnsupportedTemporalLayers { requested: u32, max: u32 },
    #[error("{requested} long-term references requested, at most {max} supported")]
    TooManyLongTermReferences { requested: u32, max: u32 },
    #[error("{long_term} long-term references leave no short-term room in a DPB of {capacity}")]
    NoShortTermRoom { long_term: u32, capacity: u32 },
    #[error("hardware supports no L0 reference")]
    NoL0References,
    #[error("hardware DPB has no capacity")]
    EmptyDpb,
    #[error("unsupported two-pass downscale factor {0}")]
    UnsupportedDownscale(u32),
    #[error("intra refresh wave cannot be empty")]
    EmptyIntraRefreshWave,
    #[error("intra refresh wave of {requested} frames exceeds hardware maximum of {max}")]
    IntraRefreshWaveTooLong { requested: u32, max: u32 },
}

/// How the slices of a frame are laid out.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum SliceMode {
    /// One slice for the whole frame.
    #[default]
    Full,
    /// Slices are explicit runs of macroblocks.
    Blocks,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SliceDescriptor {
    /// First macroblock of the slice, in raster order.
    pub start_macroblock: u32,
    pub macroblock_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SlicesConfig {
    pub mode: SliceMode,
    pub slices: Vec<SliceDescriptor>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IntraRefreshMode {
    #[default]
    None,
    /// Successive frames intra code successive runs of macroblock rows.
    UnitRows,
}

/// Per-frame intra refresh state handed to the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct IntraRefreshParams {
    pub mode: IntraRefreshMode,
    /// Number of frames of a wave.
    pub duration: u32,
    /// Emit sequence headers with this frame.
    pub need_sequence_header: bool,
    /// First macroblock refreshed by this frame.
    pub offset: u32,
    /// Number of macroblocks refreshed by this frame.
    pub region_size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntraRefreshConfig {
    /// Number of frames a refresh wave spreads over.
    pub wave_duration: u32,
    /// Start a new wave on the next inter frame once one completes.
    pub continuous: bool,
    /// Slice layout reported outside of waves.
    pub non_wave_slices: SlicesConfig,
}

impl Default for IntraRefreshConfig {
    fn default() -> Self {
        Self {
            wave_duration: 4,
            continuous: true,
            non_wave_slices: Default::default(),
        }
    }
}
