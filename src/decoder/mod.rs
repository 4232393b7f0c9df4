// SPDX-License-Identifier: MPL-2.0

//! Video decoding with a hardware-first decoder ladder.
//!
//! # Module Structure
//!
//! - [`ladder`]: codec identification and per-codec decoder priority ladders
//! - [`detection`]: file type filters and decoder enumeration logging
//! - `gst`: GStreamer-backed [`FrameSource`] (feature `gst`)
//!
//! Hardware decoders on embedded boards are often registered but unusable
//! (missing firmware, driver bugs). A candidate only counts as working once a
//! real pipeline for the file reaches PAUSED with it.

use std::{path::Path, path::PathBuf, sync::Arc};

use image::RgbaImage;

pub mod detection;
#[cfg(feature = "gst")]
mod gst;
pub mod ladder;

#[cfg(feature = "gst")]
pub use gst::GstDecoderFactory;
pub use ladder::{CodecId, DecoderOptions};

/// Frame rate assumed when the stream does not declare one.
pub const DEFAULT_FPS: f64 = 30.0;

/// A decoded frame in RGBA layout.
#[derive(Clone)]
pub struct DecodedFrame {
    pub image: Arc<RgbaImage>,
    /// Presentation timestamp (nanoseconds).
    pub pts: Option<u64>,
}

impl DecodedFrame {
    pub fn new(image: RgbaImage, pts: Option<u64>) -> Self {
        Self {
            image: Arc::new(image),
            pts,
        }
    }

    #[must_use]
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("pts", &self.pts)
            .finish()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DecodeError {
    /// The container or its stream table could not be read.
    #[error("failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("no video stream in {path}")]
    NoVideoStream { path: PathBuf },
    #[error("no working decoder for {codec} in {path}")]
    NoWorkingDecoder { path: PathBuf, codec: CodecId },
    /// Demuxing/parsing failed while feeding the decoder.
    #[error("packet error: {0}")]
    Packet(String),
    /// The decoder failed to produce a frame.
    #[error("frame error: {0}")]
    Frame(String),
}

impl DecodeError {
    /// Errors that make the file unplayable; the caller should move on to another source.
    #[must_use]
    pub fn is_source_fatal(&self) -> bool {
        matches!(
            self,
            Self::Open { .. } | Self::NoVideoStream { .. } | Self::NoWorkingDecoder { .. }
        )
    }
}

/// An opened video stream yielding RGBA frames.
///
/// Implementations are not thread-safe and are only touched from the tick loop.
pub trait FrameSource {
    /// Decode the next frame. `Ok(None)` signals end of stream.
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError>;

    /// Frame rate determined when the stream was opened.
    fn fps(&self) -> f64;

    fn dimensions(&self) -> (u32, u32);

    /// Name of the decoder that was committed for this stream.
    fn decoder_name(&self) -> &str;

    /// Release native resources. Safe to call more than once.
    fn close(&mut self);
}

/// Opens [`FrameSource`]s; used for the first open and every loop restart.
pub trait DecoderFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError>;
}
