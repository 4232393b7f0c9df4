// SPDX-License-Identifier: MPL-2.0

//! Frame-accurate playback of one source.
//!
//! [`Player`] owns one [`FrameSource`] and converts wall-clock time into
//! frame steps with a fractional accumulator, so no time is lost or gained
//! between ticks. When decoding falls behind, several frames are decoded in
//! one tick and only the last is kept.
//!
//! End of stream is handled according to [`LoopMode`]:
//!
//! | Mode   | At end of stream |
//! |--------|------------------|
//! | None   | playback ends    |
//! | Loop   | the decoder is reopened from the start |
//! | Bounce | cached frames replay in reverse, then the decoder is reopened |
//!
//! Restarts always reopen the decoder rather than seeking.

use std::{
    path::{Path, PathBuf},
    rc::Rc,
    time::Instant,
};

use loopframe_config::LoopStyle;
use tracing::{debug, info, warn};

use crate::{
    decoder::{DecodeError, DecodedFrame, DecoderFactory, FrameSource},
    surface::{Rect, Surface, letterbox},
};

/// Absorbs rounding in `Duration` to `f64` conversion, so a tick of exactly
/// one frame period always yields one step.
const STEP_EPSILON: f64 = 1e-6;

/// Looping behaviour and the state only that behaviour needs.
#[derive(Debug, Clone, Default)]
pub enum LoopMode {
    #[default]
    None,
    Loop,
    Bounce {
        /// Every frame decoded in the current forward pass.
        cache: Vec<DecodedFrame>,
        /// Cache index being presented while replaying in reverse.
        reverse: Option<usize>,
    },
}

impl LoopMode {
    #[must_use]
    pub fn bounce() -> Self {
        Self::Bounce {
            cache: Vec::new(),
            reverse: None,
        }
    }

    #[must_use]
    pub fn is_reversing(&self) -> bool {
        matches!(self, Self::Bounce { reverse: Some(_), .. })
    }

    /// Frames held for reverse replay.
    #[must_use]
    pub fn cached_frames(&self) -> usize {
        match self {
            Self::Bounce { cache, .. } => cache.len(),
            _ => 0,
        }
    }
}

impl From<LoopStyle> for LoopMode {
    fn from(style: LoopStyle) -> Self {
        match style {
            LoopStyle::Once => Self::None,
            LoopStyle::Loop => Self::Loop,
            LoopStyle::Bounce => Self::bounce(),
        }
    }
}

/// What one [`Player::advance`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// No frame was due yet.
    Idle,
    /// A new frame is current after moving `steps` frames.
    Presented { steps: usize },
    /// The decoder was reopened; the next due frame is the first one.
    Restarted,
    /// Playback stopped at end of stream.
    Ended,
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{} contains no frames", path.display())]
    EmptySource { path: PathBuf },
}

pub struct Player {
    path: PathBuf,
    factory: Rc<dyn DecoderFactory>,
    source: Option<Box<dyn FrameSource>>,
    mode: LoopMode,
    rate: f64,
    fps: f64,
    /// Fractional frames owed.
    acc: f64,
    last_tick: Instant,
    current: Option<DecodedFrame>,
    /// Frames consumed in the current forward pass, including the current one.
    position: usize,
    steps_taken: u64,
    restarts: u32,
    ended: bool,
    last_error: Option<DecodeError>,
}

impl Player {
    /// Open `path` and present its first frame. `now` is the reference time
    /// for the first [`Player::advance`].
    pub fn open(
        path: &Path,
        factory: Rc<dyn DecoderFactory>,
        mode: LoopMode,
        rate: f64,
        now: Instant,
    ) -> Result<Self, PlayerError> {
        let source = factory.open(path)?;

        info!(
            path = %path.display(),
            decoder = source.decoder_name(),
            fps = source.fps(),
            dimensions = ?source.dimensions(),
            "Starting playback"
        );

        let mut player = Self {
            path: path.to_path_buf(),
            fps: source.fps(),
            factory,
            source: Some(source),
            mode,
            rate: 1.0,
            acc: 0.0,
            last_tick: now,
            current: None,
            position: 0,
            steps_taken: 0,
            restarts: 0,
            ended: false,
            last_error: None,
        };
        player.set_rate(rate);

        match player.decode_next()? {
            Some(frame) => {
                player.accept(frame);
                Ok(player)
            }
            None => Err(PlayerError::EmptySource {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Move playback to `now`, decoding or replaying however many frames
    /// are due.
    pub fn advance(&mut self, now: Instant) -> Result<Advance, PlayerError> {
        if self.ended {
            return Ok(Advance::Ended);
        }

        let dt = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.acc += dt.as_secs_f64() * self.rate * self.fps;

        let steps = (self.acc + STEP_EPSILON).floor();
        if steps < 1.0 {
            return Ok(Advance::Idle);
        }
        self.acc -= steps;

        let steps = steps as usize;
        self.steps_taken += steps as u64;

        if self.mode.is_reversing() {
            self.step_back(steps)
        } else {
            self.step_forward(steps)
        }
    }

    fn step_forward(&mut self, steps: usize) -> Result<Advance, PlayerError> {
        for done in 0..steps {
            match self.decode_next() {
                Ok(Some(frame)) => self.accept(frame),
                Ok(None) => return self.end_of_stream(steps - done),
                Err(why) => {
                    warn!(path = %self.path.display(), %why, "Decode failed, restarting");
                    self.last_error = Some(why);
                    self.restart()?;
                    return Ok(Advance::Restarted);
                }
            }
        }

        Ok(Advance::Presented { steps })
    }

    fn step_back(&mut self, steps: usize) -> Result<Advance, PlayerError> {
        let LoopMode::Bounce {
            cache,
            reverse: Some(cursor),
        } = &mut self.mode
        else {
            return Ok(Advance::Idle);
        };

        if steps > *cursor {
            debug!(path = %self.path.display(), "Bounce cycle complete");
            self.restart()?;
            return Ok(Advance::Restarted);
        }

        *cursor -= steps;
        self.current = Some(cache[*cursor].clone());
        Ok(Advance::Presented { steps })
    }

    /// Handle end of stream with `remaining` steps still owed this tick.
    fn end_of_stream(&mut self, remaining: usize) -> Result<Advance, PlayerError> {
        debug!(path = %self.path.display(), frames = self.position, "End of stream");

        match &mut self.mode {
            LoopMode::None => {
                self.stop();
                Ok(Advance::Ended)
            }
            LoopMode::Loop => {
                self.restart()?;
                Ok(Advance::Restarted)
            }
            LoopMode::Bounce { cache, .. } if cache.is_empty() => {
                self.restart()?;
                Ok(Advance::Restarted)
            }
            LoopMode::Bounce { cache, reverse } => {
                *reverse = Some(cache.len() - 1);
                // Reverse replay needs no decoder until the next forward pass.
                self.close_source();
                self.step_back(remaining)
            }
        }
    }

    fn decode_next(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        match self.source.as_mut() {
            Some(source) => source.next_frame(),
            None => Ok(None),
        }
    }

    fn accept(&mut self, frame: DecodedFrame) {
        if let LoopMode::Bounce { cache, .. } = &mut self.mode {
            cache.push(frame.clone());
        }
        self.current = Some(frame);
        self.position += 1;
    }

    /// Reopen the decoder at the start. The first frame of the new pass is
    /// presented by the next advance that owes a step.
    fn restart(&mut self) -> Result<(), PlayerError> {
        self.close_source();
        self.position = 0;
        if let LoopMode::Bounce { cache, reverse } = &mut self.mode {
            cache.clear();
            *reverse = None;
        }

        let source = match self.factory.open(&self.path) {
            Ok(source) => source,
            Err(why) => {
                self.ended = true;
                self.last_error = Some(why.clone());
                return Err(why.into());
            }
        };

        self.fps = source.fps();
        self.source = Some(source);
        self.restarts += 1;
        debug!(path = %self.path.display(), restarts = self.restarts, "Decoder reopened");
        Ok(())
    }

    fn close_source(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.close();
        }
    }

    /// Stop playback and release the decoder.
    pub fn stop(&mut self) {
        self.close_source();
        self.ended = true;
    }

    /// Letterbox the current frame onto `surface`. Returns the region drawn.
    pub fn draw(&self, surface: &mut dyn Surface) -> eyre::Result<Option<Rect>> {
        let Some(frame) = &self.current else {
            return Ok(None);
        };

        let (width, height) = surface.size();
        let Some(region) = letterbox(frame.dimensions(), Rect::full(width, height)) else {
            return Ok(None);
        };

        surface.present(&frame.image, region)?;
        Ok(Some(region))
    }

    /// Set the playback speed. Non-positive or non-finite rates are ignored.
    pub fn set_rate(&mut self, rate: f64) {
        if rate.is_finite() && rate > 0.0 {
            self.rate = rate;
        } else {
            warn!(rate, current = self.rate, "Ignoring invalid playback rate");
        }
    }

    #[must_use]
    pub fn rate(&self) -> f64 {
        self.rate
    }

    #[must_use]
    pub fn fps(&self) -> f64 {
        self.fps
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn loop_mode(&self) -> &LoopMode {
        &self.mode
    }

    #[must_use]
    pub fn current_frame(&self) -> Option<&DecodedFrame> {
        self.current.as_ref()
    }

    /// Fractional frames carried into the next tick.
    #[must_use]
    pub fn accumulator(&self) -> f64 {
        self.acc
    }

    /// Whole frame steps taken across all ticks.
    #[must_use]
    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    #[must_use]
    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&DecodeError> {
        self.last_error.as_ref()
    }

    pub fn take_last_error(&mut self) -> Option<DecodeError> {
        self.last_error.take()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.close_source();
    }
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player")
            .field("path", &self.path)
            .field("rate", &self.rate)
            .field("fps", &self.fps)
            .field("position", &self.position)
            .field("cached", &self.mode.cached_frames())
            .field("reversing", &self.mode.is_reversing())
            .field("ended", &self.ended)
            .finish_non_exhaustive()
    }
}
