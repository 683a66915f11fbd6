// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference picture trackers.
//!
//! A tracker decides, frame after frame, the GOP position of the frame to encode, the pictures it
//! references and how long the reconstructed pictures have to be kept. Its decisions are exposed
//! as a [`FrameDescriptor`] to hand to the hardware.
//!
//! Reconstructed picture buffers may still be read by the GPU after the tracker stopped using
//! them, so they are never returned to their pool directly. Instead
//! [`ReferenceTracker::begin_frame`] returns a [`ReleaseToken`] holding the buffers that became
//! unused with this frame, which must be handed back through
//! [`ReferenceTracker::release_reconpic`] or a [`ReconReleaser`] once the frame's fence signaled.

mod dpb;
mod gop;
pub mod h264;
pub mod hevc;
pub mod intra_refresh;

use thiserror::Error;

use crate::backend::buffer_pool::PictureBuffer;
use crate::backend::buffer_pool::PoolError;
use crate::backend::buffer_pool::PoolReleaser;
use crate::backend::PictureAllocator;
use crate::codec::h264::RefPicListModification;
use crate::codec::h264::RefPicMarkingInner;
use crate::encoder::Capabilities;
use crate::encoder::Codec;
use crate::encoder::ConfigError;
use crate::encoder::FrameControl;
use crate::encoder::FrameType;
use crate::encoder::IntraRefreshConfig;
use crate::encoder::IntraRefreshParams;
use crate::encoder::LongTermReferenceInfo;
use crate::encoder::ReferenceType;
use crate::encoder::SlicesConfig;
use crate::encoder::TrackerConfig;

pub use h264::H264GopState;
pub use h264::H264Tracker;
pub use hevc::HevcGopState;
pub use hevc::HevcTracker;
pub use intra_refresh::IntraRefreshTracker;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("LTR index {index} out of range, {max} long-term references configured")]
    InvalidLtrIndex { index: u32, max: u32 },
    #[error("unsupported temporal layer count {0}")]
    InvalidLayerCount(u32),
    #[error("DPB is full and holds no short-term reference to evict")]
    NoShortTermToEvict,
    #[error("LTR index {0} is active but no DPB entry holds it")]
    LtrBitmapMismatch(u32),
    #[error("no valid reference picture for frame")]
    NoReferenceCandidate,
    #[error("intra refresh wave can only start on P or B frames, current frame is {0:?}")]
    IntraRefreshNotInterFrame(FrameType),
    #[error("an intra refresh wave is already active")]
    IntraRefreshWaveActive,
    #[error("intra refresh is not enabled on this tracker")]
    IntraRefreshDisabled,
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Buffer type handed out by the trackers for an allocator `A`.
pub type TrackedBuffer<A> = PictureBuffer<<A as PictureAllocator>::Buffer>;

/// Buffers that can be returned to their pool once the GPU is done with the frame that produced
/// this token.
///
/// Tokens are only created by trackers and consumed by [`ReferenceTracker::release_reconpic`] or
/// [`ReconReleaser::release`].
#[must_use = "dropping a release token leaks its picture buffers"]
#[derive(Debug)]
pub struct ReleaseToken<B> {
    buffers: Vec<B>,
    downscaled_buffers: Vec<B>,
}

impl<B> Default for ReleaseToken<B> {
    fn default() -> Self {
        Self {
            buffers: Vec::new(),
            downscaled_buffers: Vec::new(),
        }
    }
}

impl<B> ReleaseToken<B> {
    pub(crate) fn push(&mut self, buffer: B, downscaled: Option<B>) {
        self.buffers.push(buffer);
        self.downscaled_buffers.extend(downscaled);
    }

    pub(crate) fn append(&mut self, mut other: Self) {
        self.buffers.append(&mut other.buffers);
        self.downscaled_buffers.append(&mut other.downscaled_buffers);
    }

    /// Full resolution buffers to release, in the order they were detached.
    pub fn buffers(&self) -> &[B] {
        &self.buffers
    }

    /// Downscaled buffers to release, in the order they were detached.
    pub fn downscaled_buffers(&self) -> &[B] {
        &self.downscaled_buffers
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.downscaled_buffers.is_empty()
    }
}

/// Thread-safe handle releasing tokens into the pools of a tracker.
///
/// This lets the thread waiting on GPU fences release tokens without access to the tracker.
pub struct ReconReleaser<A: PictureAllocator> {
    pool: PoolReleaser<A>,
    downscaled_pool: Option<PoolReleaser<A>>,
}

impl<A: PictureAllocator> Clone for ReconReleaser<A> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            downscaled_pool: self.downscaled_pool.clone(),
        }
    }
}

impl<A: PictureAllocator> ReconReleaser<A> {
    /// Returns all the buffers of `token` to their pools.
    ///
    /// Every buffer is released even if some of them fail, the first failure is reported.
    pub fn release(&self, token: ReleaseToken<TrackedBuffer<A>>) -> TrackerResult<()> {
        let mut result = Ok(());

        let downscaled = token
            .downscaled_buffers
            .iter()
            .map(|b| (self.downscaled_pool.as_ref(), b));
        let full = token.buffers.iter().map(|b| (Some(&self.pool), b));

        for (pool, buffer) in full.chain(downscaled) {
            let released = match pool {
                Some(pool) => pool.release_dpb_buffer(buffer),
                None => Err(PoolError::UnknownBuffer {
                    pool_id: buffer.pool_id(),
                    index: buffer.index(),
                }),
            };

            if let Err(e) = released {
                log::warn!("Failed to release reconstructed picture: {}", e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }

        result
    }
}

/// A picture of the DPB as the hardware sees it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpbEntry<B> {
    /// H.264: LTR index of long-term references, frame_num otherwise. HEVC: always 0.
    pub frame_idx: u32,
    pub pic_order_cnt: u32,
    pub temporal_id: u8,
    pub is_ltr: bool,
    pub buffer: B,
    pub downscaled_buffer: Option<B>,
}

/// GOP state of the frame being encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GopInfo {
    H264(H264GopState),
    Hevc(HevcGopState),
}

impl GopInfo {
    pub fn frame_type(&self) -> FrameType {
        match self {
            GopInfo::H264(s) => s.frame_type,
            GopInfo::Hevc(s) => s.frame_type,
        }
    }

    pub fn picture_order_count(&self) -> u32 {
        match self {
            GopInfo::H264(s) => s.picture_order_count,
            GopInfo::Hevc(s) => s.picture_order_count,
        }
    }

    pub fn temporal_id(&self) -> u8 {
        match self {
            GopInfo::H264(s) => s.temporal_id,
            GopInfo::Hevc(s) => s.temporal_id,
        }
    }

    pub fn reference_type(&self) -> ReferenceType {
        match self {
            GopInfo::H264(s) => s.reference_type,
            GopInfo::Hevc(s) => s.reference_type,
        }
    }

    /// LTR index of the current frame, if it is a long-term reference.
    pub fn ltr_index(&self) -> Option<u32> {
        let (reference_type, index) = match self {
            GopInfo::H264(s) => (s.reference_type, s.ltr_index),
            GopInfo::Hevc(s) => (s.reference_type, s.ltr_index),
        };

        (reference_type == ReferenceType::LongTerm).then_some(index)
    }

    pub fn long_term_reference_frame_info(&self) -> LongTermReferenceInfo {
        match self {
            GopInfo::H264(s) => s.long_term_reference_frame_info,
            GopInfo::Hevc(s) => s.long_term_reference_frame_info,
        }
    }

    pub fn as_h264(&self) -> Option<&H264GopState> {
        match self {
            GopInfo::H264(s) => Some(s),
            GopInfo::Hevc(_) => None,
        }
    }
}

/// Everything the hardware needs to know about the references of the frame being encoded.
///
/// Descriptors are rebuilt by every [`ReferenceTracker::begin_frame`] call. If that call fails,
/// the descriptor is left in an unspecified state and must not be submitted.
#[derive(Clone, Debug)]
pub struct FrameDescriptor<B> {
    pub gop: GopInfo,
    /// Positions in [`FrameDescriptor::dpb_snapshot`] of the L0 references. Empty for non-P
    /// frames, a single entry otherwise.
    pub l0_reference_list: Vec<usize>,
    /// H.264 reordering of L0, terminated by an end marker when not empty.
    pub ref_list0_modifications: Vec<RefPicListModification>,
    /// H.264 reference picture marking operations, terminated by an end marker when not empty.
    pub mmco_operations: Vec<RefPicMarkingInner>,
    /// Live pictures in insertion order, followed by the current picture if it is a reference.
    pub dpb_snapshot: Vec<DpbEntry<B>>,
    /// Dirty rectangle tags of the [`FrameDescriptor::dpb_snapshot`] entries.
    pub dirty_rect_frame_nums: Vec<u32>,
    pub slices: SlicesConfig,
    pub intra_refresh: IntraRefreshParams,
}

impl<B> FrameDescriptor<B> {
    pub(crate) fn new(gop: GopInfo) -> Self {
        Self {
            gop,
            l0_reference_list: Vec::new(),
            ref_list0_modifications: Vec::new(),
            mmco_operations: Vec::new(),
            dpb_snapshot: Vec::new(),
            dirty_rect_frame_nums: Vec::new(),
            slices: Default::default(),
            intra_refresh: Default::default(),
        }
    }

    /// Clears the per-frame lists before a new frame is described.
    pub(crate) fn reset(&mut self) {
        self.l0_reference_list.clear();
        self.ref_list0_modifications.clear();
        self.mmco_operations.clear();
        self.dpb_snapshot.clear();
        self.dirty_rect_frame_nums.clear();
    }

    pub fn frame_type(&self) -> FrameType {
        self.gop.frame_type()
    }

    /// Position of the current picture in the DPB snapshot, if it is kept as a reference.
    pub fn current_pic_index(&self) -> Option<usize> {
        match self.gop.reference_type() {
            ReferenceType::None => None,
            _ => self.dpb_snapshot.len().checked_sub(1),
        }
    }

    /// The DPB entries referenced by L0.
    pub fn l0_references(&self) -> impl Iterator<Item = &DpbEntry<B>> {
        self.l0_reference_list
            .iter()
            .filter_map(|&i| self.dpb_snapshot.get(i))
    }
}

/// Common interface of the reference trackers.
pub trait ReferenceTracker {
    type Buffer: Clone;

    /// Decides the references of the next frame and describes it in
    /// [`ReferenceTracker::frame_descriptor`].
    ///
    /// Returns the buffers that no frame submitted after this one will use. They must be
    /// released once this frame completed on the GPU.
    fn begin_frame(&mut self, control: &FrameControl) -> TrackerResult<ReleaseToken<Self::Buffer>>;

    /// Moves the GOP position to the next frame. Called once the frame described by the last
    /// [`ReferenceTracker::begin_frame`] was submitted.
    fn advance_frame(&mut self);

    /// Description of the frame set up by the last [`ReferenceTracker::begin_frame`] call.
    fn frame_descriptor(&self) -> &FrameDescriptor<Self::Buffer>;

    /// Returns the buffers of `token` to their pools.
    fn release_reconpic(&mut self, token: ReleaseToken<Self::Buffer>) -> TrackerResult<()>;
}

/// The reference trackers supported by this crate.
pub enum Tracker<A: PictureAllocator> {
    H264(H264Tracker<A>),
    Hevc(HevcTracker<A>),
    IntraRefresh(Box<IntraRefreshTracker<Tracker<A>>>),
}

impl<A: PictureAllocator + Clone> Tracker<A> {
    /// Creates the tracker for `codec`, allocating its reconstructed picture pools from
    /// `allocator`.
    pub fn new(
        codec: Codec,
        config: &TrackerConfig,
        caps: &Capabilities,
        allocator: A,
    ) -> TrackerResult<Self> {
        Ok(match codec {
            Codec::H264 => Tracker::H264(H264Tracker::new(config, caps, allocator)?),
            Codec::Hevc => Tracker::Hevc(HevcTracker::new(config, caps, allocator)?),
        })
    }
}

impl<A: PictureAllocator> Tracker<A> {
    /// Wraps this tracker to add gradual intra refresh waves of `config.wave_duration` frames.
    ///
    /// `gop_length` is the GOP length the tracker was configured with, waves longer than a
    /// finite GOP are shortened to the GOP length.
    pub fn with_intra_refresh(
        self,
        config: &IntraRefreshConfig,
        caps: &Capabilities,
        gop_length: u32,
    ) -> TrackerResult<Self> {
        if let Tracker::IntraRefresh(_) = self {
            log::debug!("Tracker already does intra refresh, keeping existing configuration");
            return Ok(self);
        }

        if config.wave_duration == 0 {
            return Err(ConfigError::EmptyIntraRefreshWave.into());
        }
        if config.wave_duration > caps.max_intra_refresh_size {
            return Err(ConfigError::IntraRefreshWaveTooLong {
                requested: config.wave_duration,
                max: caps.max_intra_refresh_size,
            }
            .into());
        }

        let mut duration = config.wave_duration;
        if gop_length > 0 && duration > gop_length {
            log::debug!(
                "Shortening intra refresh wave from {} to GOP length {}",
                duration,
                gop_length
            );
            duration = gop_length;
        }

        let total_macroblocks = self.resolution().macroblock_count();

        Ok(Tracker::IntraRefresh(Box::new(IntraRefreshTracker::new(
            self,
            duration,
            config.continuous,
            config.non_wave_slices.clone(),
            total_macroblocks,
        )?)))
    }

    /// Starts an intra refresh wave with the frame set up by the last `begin_frame`.
    pub fn start_ir_wave(&mut self) -> TrackerResult<()> {
        match self {
            Tracker::IntraRefresh(t) => t.start_ir_wave(),
            _ => Err(TrackerError::IntraRefreshDisabled),
        }
    }

    /// Handle to release tokens of this tracker from another thread.
    pub fn releaser(&self) -> ReconReleaser<A> {
        match self {
            Tracker::H264(t) => t.releaser(),
            Tracker::Hevc(t) => t.releaser(),
            Tracker::IntraRefresh(t) => t.inner().releaser(),
        }
    }

    pub fn codec(&self) -> Codec {
        match self {
            Tracker::H264(_) => Codec::H264,
            Tracker::Hevc(_) => Codec::Hevc,
            Tracker::IntraRefresh(t) => t.inner().codec(),
        }
    }

    fn resolution(&self) -> crate::Resolution {
        match self {
            Tracker::H264(t) => t.resolution(),
            Tracker::Hevc(t) => t.resolution(),
            Tracker::IntraRefresh(t) => t.inner().resolution(),
        }
    }

    /// Number of pictures currently kept as references.
    pub fn num_live_references(&self) -> usize {
        match self {
            Tracker::H264(t) => t.num_live_references(),
            Tracker::Hevc(t) => t.num_live_references(),
            Tracker::IntraRefresh(t) => t.inner().num_live_references(),
        }
    }

    /// Bitmap of the LTR indices held by live references.
    pub fn active_ltr_bitmap(&self) -> u32 {
        match self {
            Tracker::H264(t) => t.active_ltr_bitmap(),
            Tracker::Hevc(t) => t.active_ltr_bitmap(),
            Tracker::IntraRefresh(t) => t.inner().active_ltr_bitmap(),
        }
    }

    /// Number of pictures the DPB can hold besides the current one.
    pub fn dpb_capacity(&self) -> usize {
        match self {
            Tracker::H264(t) => t.dpb_capacity(),
            Tracker::Hevc(t) => t.dpb_capacity(),
            Tracker::IntraRefresh(t) => t.inner().dpb_capacity(),
        }
    }
}

impl<A: PictureAllocator> ReferenceTracker for Tracker<A> {
    type Buffer = TrackedBuffer<A>;

    fn begin_frame(&mut self, control: &FrameControl) -> TrackerResult<ReleaseToken<Self::Buffer>> {
        match self {
            Tracker::H264(t) => t.begin_frame(control),
            Tracker::Hevc(t) => t.begin_frame(control),
            Tracker::IntraRefresh(t) => t.begin_frame(control),
        }
    }

    fn advance_frame(&mut self) {
        match self {
            Tracker::H264(t) => t.advance_frame(),
            Tracker::Hevc(t) => t.advance_frame(),
            Tracker::IntraRefresh(t) => t.advance_frame(),
        }
    }

    fn frame_descriptor(&self) -> &FrameDescriptor<Self::Buffer> {
        match self {
            Tracker::H264(t) => t.frame_descriptor(),
            Tracker::Hevc(t) => t.frame_descriptor(),
            Tracker::IntraRefresh(t) => t.frame_descriptor(),
        }
    }

    fn release_reconpic(&mut self, token: ReleaseToken<Self::Buffer>) -> TrackerResult<()> {
        match self {
            Tracker::H264(t) => t.release_reconpic(token),
            Tracker::Hevc(t) => t.release_reconpic(token),
            Tracker::IntraRefresh(t) => t.release_reconpic(token),
        }
    }
}
