// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Submission side of the encoder.
//!
//! [`EncodeSession`] runs the per-frame loop against a hardware [`EncodeSubmitter`]: it asks the
//! tracker to describe the frame, submits the description, and returns the frame's
//! [`ReleaseToken`] to the tracker once the hardware signaled completion. At most
//! [`TrackerConfig::frames_in_flight`] frames are kept in flight, which the tracker's pools are
//! sized for.

use std::collections::VecDeque;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::BackendPromise;
use crate::backend::BackendResult;
use crate::encoder::reftrack::FrameDescriptor;
use crate::encoder::reftrack::ReferenceTracker;
use crate::encoder::reftrack::ReleaseToken;
use crate::encoder::reftrack::TrackerError;
use crate::encoder::FrameControl;
use crate::encoder::TrackerConfig;
use crate::BlockingMode;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Hardware encode call.
pub trait EncodeSubmitter<B> {
    /// Completion fence of a submitted frame.
    type Promise: BackendPromise;

    /// Queues the encode of the frame described by `descriptor`.
    fn submit(&mut self, descriptor: &FrameDescriptor<B>) -> BackendResult<Self::Promise>;
}

struct InFlightFrame<P, B> {
    promise: P,
    /// Released once `promise` signals.
    token: ReleaseToken<B>,
}

type Output<T, S> =
    <<S as EncodeSubmitter<<T as ReferenceTracker>::Buffer>>::Promise as BackendPromise>::Output;

pub struct EncodeSession<T, S>
where
    T: ReferenceTracker,
    S: EncodeSubmitter<T::Buffer>,
{
    tracker: T,
    submitter: S,
    blocking: BlockingMode,
    /// Number of frames that may stay in flight once `encode` returns.
    queue_depth: usize,
    in_flight: VecDeque<InFlightFrame<S::Promise, T::Buffer>>,
    completed: VecDeque<Output<T, S>>,
    /// Set when a frame failed, so the next one does not reference a broken picture.
    force_key_next: bool,
}

impl<T, S> EncodeSession<T, S>
where
    T: ReferenceTracker,
    S: EncodeSubmitter<T::Buffer>,
{
    /// Creates a session for a tracker built from `config`.
    pub fn new(tracker: T, submitter: S, config: &TrackerConfig, blocking: BlockingMode) -> Self {
        Self {
            tracker,
            submitter,
            blocking,
            queue_depth: config.frames_in_flight(),
            in_flight: Default::default(),
            completed: Default::default(),
            force_key_next: false,
        }
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn submitter(&self) -> &S {
        &self.submitter
    }

    pub fn submitter_mut(&mut self) -> &mut S {
        &mut self.submitter
    }

    /// Number of frames submitted and not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Encodes one frame.
    pub fn encode(&mut self, control: &FrameControl) -> SessionResult<()> {
        let token = if self.force_key_next {
            let forced = FrameControl {
                force_key: true,
                ..control.clone()
            };
            let token = self.tracker.begin_frame(&forced)?;
            self.force_key_next = false;
            token
        } else {
            self.tracker.begin_frame(control)?
        };

        let promise = match self.submitter.submit(self.tracker.frame_descriptor()) {
            Ok(promise) => promise,
            Err(e) => {
                log::debug!("Frame submission failed: {}", e);
                self.tracker.advance_frame();
                self.force_key_next = true;

                // Frames in flight may still read the pictures this frame detached.
                let drained = self.complete_all();
                self.tracker.release_reconpic(token)?;
                drained?;

                return Err(e.into());
            }
        };

        self.in_flight.push_back(InFlightFrame { promise, token });
        self.tracker.advance_frame();

        while self.in_flight.len() > self.queue_depth {
            self.complete_oldest()?;
        }

        Ok(())
    }

    /// Returns the output of the oldest completed frame, if any.
    ///
    /// In blocking mode this waits for the oldest frame in flight when nothing completed yet.
    pub fn poll(&mut self) -> SessionResult<Option<Output<T, S>>> {
        while let Some(frame) = self.in_flight.front() {
            let block = self.blocking == BlockingMode::Blocking && self.completed.is_empty();
            if !block && !frame.promise.is_ready() {
                break;
            }
            self.complete_oldest()?;
        }

        Ok(self.completed.pop_front())
    }

    /// Waits for every frame in flight and returns the outputs not polled yet.
    pub fn drain(&mut self) -> SessionResult<Vec<Output<T, S>>> {
        self.complete_all()?;

        Ok(self.completed.drain(..).collect())
    }

    fn complete_all(&mut self) -> SessionResult<()> {
        let mut result = Ok(());
        while !self.in_flight.is_empty() {
            if let Err(e) = self.complete_oldest() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Waits for the oldest frame in flight and releases its token.
    fn complete_oldest(&mut self) -> SessionResult<()> {
        let Some(InFlightFrame { promise, token }) = self.in_flight.pop_front() else {
            return Ok(());
        };

        let output = promise.sync();
        // The hardware is done with the frame whether it succeeded or not.
        self.tracker.release_reconpic(token)?;

        match output {
            Ok(output) => {
                self.completed.push_back(output);
                Ok(())
            }
            Err(e) => {
                log::debug!("Frame encode failed: {}", e);
                self.force_key_next = true;
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::DummyAllocator;
    use crate::backend::dummy::DummySubmitter;
    use crate::encoder::reftrack::Tracker;
    use crate::encoder::Capabilities;
    use crate::encoder::Codec;
    use crate::encoder::FrameType;
    use crate::encoder::TrackerConfig;

    fn new_session(
        config: &TrackerConfig,
        blocking: BlockingMode,
    ) -> EncodeSession<Tracker<DummyAllocator>, DummySubmitter> {
        let tracker = Tracker::new(
            Codec::H264,
            config,
            &Capabilities::default(),
            DummyAllocator::new(),
        )
        .unwrap();

        EncodeSession::new(tracker, DummySubmitter::new(), config, blocking)
    }

    #[test]
    fn low_latency_overrides_queue_depth() {
        let config = TrackerConfig {
            low_latency: true,
            queue_depth: 3,
            ..Default::default()
        };
        let mut session = new_session(&config, BlockingMode::NonBlocking);

        // The pools have no room for frames in flight, so none may be left pending.
        for _ in 0..40 {
            session.encode(&Default::default()).unwrap();
            assert_eq!(session.in_flight(), 0);
        }
        assert_eq!(session.drain().unwrap().len(), 40);
    }

    #[test]
    fn queue_depth_is_bounded() {
        let _ = env_logger::try_init();

        let config = TrackerConfig {
            queue_depth: 3,
            ..Default::default()
        };
        let mut session = new_session(&config, BlockingMode::NonBlocking);

        for _ in 0..10 {
            session.encode(&Default::default()).unwrap();
            assert!(session.in_flight() <= 3);
        }

        // Frames completed to make room come out in order.
        let first = session.poll().unwrap().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.frame_type, FrameType::Idr);

        let rest = session.drain().unwrap();
        assert_eq!(rest.len(), 9);
        assert!(rest.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
        assert_eq!(session.in_flight(), 0);
    }

    #[test]
    fn low_latency_completes_every_frame() {
        let config = TrackerConfig {
            low_latency: true,
            ..Default::default()
        };
        let mut session = new_session(&config, BlockingMode::NonBlocking);

        for i in 0..40u64 {
            session.encode(&Default::default()).unwrap();
            assert_eq!(session.in_flight(), 0);
            assert_eq!(session.poll().unwrap().unwrap().sequence, i);
        }
    }

    #[test]
    fn non_blocking_poll_waits_for_fences() {
        let mut session = new_session(&Default::default(), BlockingMode::NonBlocking);

        for _ in 0..4 {
            session.encode(&Default::default()).unwrap();
        }
        assert!(session.poll().unwrap().is_none());

        session.submitter().complete_up_to(2);
        assert_eq!(session.poll().unwrap().unwrap().sequence, 0);
        assert_eq!(session.poll().unwrap().unwrap().sequence, 1);
        assert!(session.poll().unwrap().is_none());
        assert_eq!(session.in_flight(), 2);
    }

    #[test]
    fn blocking_poll_waits_for_oldest() {
        let mut session = new_session(&Default::default(), BlockingMode::Blocking);

        for _ in 0..4 {
            session.encode(&Default::default()).unwrap();
        }
        assert_eq!(session.poll().unwrap().unwrap().sequence, 0);
        assert_eq!(session.in_flight(), 3);
    }

    #[test]
    fn failed_submission_forces_key_frame() {
        let _ = env_logger::try_init();

        let mut session = new_session(&Default::default(), BlockingMode::NonBlocking);
        session.submitter_mut().reject = vec![3];

        for _ in 0..3 {
            session.encode(&Default::default()).unwrap();
        }
        assert!(matches!(
            session.encode(&Default::default()),
            Err(SessionError::Backend(_))
        ));
        // Frames in flight were completed before the failed frame's pictures were released.
        assert_eq!(session.in_flight(), 0);

        session.encode(&Default::default()).unwrap();
        let frames = session.drain().unwrap();
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3].frame_type, FrameType::Idr);
    }

    #[test]
    fn failed_encode_forces_key_frame() {
        let config = TrackerConfig {
            queue_depth: 0,
            ..Default::default()
        };
        let mut session = new_session(&config, BlockingMode::NonBlocking);
        session.submitter_mut().fail = vec![2];

        session.encode(&Default::default()).unwrap();
        session.encode(&Default::default()).unwrap();
        assert!(matches!(
            session.encode(&Default::default()),
            Err(SessionError::Backend(BackendError::EncodeFailed))
        ));

        session.encode(&Default::default()).unwrap();
        let frames = session.drain().unwrap();
        let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
        assert_eq!(types, vec![FrameType::Idr, FrameType::P, FrameType::Idr]);
    }
}
