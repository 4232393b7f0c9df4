// SPDX-License-Identifier: MPL-2.0

//! GStreamer-backed [`FrameSource`].
//!
//! Opening happens in two stages. A probe pipeline (`filesrc ! parsebin`)
//! reads the container and records the caps of the first video stream. Then
//! each ladder candidate gets a full trial pipeline with the decoder pinned
//! by name:
//!
//! ```text
//! filesrc ! parsebin ! <decoder> ! videoconvert ! RGBA ! appsink
//! ```
//!
//! The first trial that prerolls (reaches PAUSED) is kept and set PLAYING.
//! Frames are pulled synchronously from the appsink, so the pipeline never
//! runs further ahead than the appsink's small queue.

use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use gstreamer::prelude::*;
use image::RgbaImage;
use tracing::{debug, error, warn};

use super::{
    DEFAULT_FPS, DecodeError, DecodedFrame, DecoderFactory, FrameSource, detection,
    ladder::{CodecId, DecoderBackend, DecoderOptions, select_decoder},
};

/// How long a probe or trial pipeline may take to preroll.
const PREROLL_TIMEOUT_MS: u64 = 2000;
/// How long a frame pull may block before it counts as a decode failure.
const PULL_TIMEOUT_MS: u64 = 500;

/// Opens files with GStreamer and the decoder ladder.
#[derive(Debug, Clone)]
pub struct GstDecoderFactory {
    options: DecoderOptions,
}

impl GstDecoderFactory {
    pub fn new(options: DecoderOptions) -> eyre::Result<Self> {
        gstreamer::init()?;

        if options.debug_list {
            detection::log_available_decoders();
        }

        Ok(Self { options })
    }
}

impl DecoderFactory for GstDecoderFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>, DecodeError> {
        let stream = probe(path)?;
        debug!(
            path = %path.display(),
            codec = %stream.codec,
            width = stream.width,
            height = stream.height,
            fps = stream.fps,
            "Probed video stream"
        );

        let mut backend = GstBackend {
            location: escape_location(path)?,
            stream: &stream,
        };

        let selected = select_decoder(&mut backend, &stream.codec, &self.options).ok_or_else(
            || DecodeError::NoWorkingDecoder {
                path: path.to_path_buf(),
                codec: stream.codec.clone(),
            },
        )?;

        let decoder = GstDecoder::start(selected.context, selected.name, &stream).map_err(
            |reason| DecodeError::Open {
                path: path.to_path_buf(),
                reason,
            },
        )?;

        Ok(Box::new(decoder))
    }
}

/// What the probe learned about the first video stream.
#[derive(Debug)]
struct StreamInfo {
    codec: CodecId,
    caps: gstreamer::Caps,
    width: u32,
    height: u32,
    fps: f64,
}

fn escape_location(path: &Path) -> Result<String, DecodeError> {
    let path_str = path.to_str().ok_or_else(|| DecodeError::Open {
        path: path.to_path_buf(),
        reason: "path is not valid UTF-8".into(),
    })?;
    Ok(path_str.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Read the container and return the first video stream's parameters.
fn probe(path: &Path) -> Result<StreamInfo, DecodeError> {
    let open_error = |reason: String| DecodeError::Open {
        path: path.to_path_buf(),
        reason,
    };

    let pipeline = gstreamer::Pipeline::new();
    let src = gstreamer::ElementFactory::make("filesrc")
        .property("location", &*path.to_string_lossy())
        .build()
        .map_err(|why| open_error(why.to_string()))?;
    let parse = gstreamer::ElementFactory::make("parsebin")
        .build()
        .map_err(|why| open_error(why.to_string()))?;

    pipeline
        .add_many([&src, &parse])
        .map_err(|why| open_error(why.to_string()))?;
    src.link(&parse)
        .map_err(|why| open_error(why.to_string()))?;

    let video_caps: Arc<Mutex<Option<gstreamer::Caps>>> = Arc::default();
    let pipeline_weak = pipeline.downgrade();
    let found = Arc::clone(&video_caps);

    // Every exposed stream gets a fakesink so the pipeline can preroll.
    parse.connect_pad_added(move |_, pad| {
        let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
        let is_video = caps
            .structure(0)
            .is_some_and(|s| s.name().as_str().starts_with("video/"));
        if is_video {
            if let Ok(mut slot) = found.lock() {
                slot.get_or_insert(caps);
            }
        }

        let Some(pipeline) = pipeline_weak.upgrade() else {
            return;
        };
        let Ok(sink) = gstreamer::ElementFactory::make("fakesink").build() else {
            return;
        };
        if pipeline.add(&sink).is_err() {
            return;
        }
        let _ = sink.sync_state_with_parent();
        if let Some(sink_pad) = sink.static_pad("sink") {
            let _ = pad.link(&sink_pad);
        }
    });

    let prerolled = preroll(&pipeline);
    let _ = pipeline.set_state(gstreamer::State::Null);
    prerolled.map_err(open_error)?;

    let caps = video_caps
        .lock()
        .ok()
        .and_then(|mut slot| slot.take())
        .ok_or_else(|| DecodeError::NoVideoStream {
            path: path.to_path_buf(),
        })?;

    stream_info(caps).ok_or_else(|| DecodeError::NoVideoStream {
        path: path.to_path_buf(),
    })
}

fn stream_info(caps: gstreamer::Caps) -> Option<StreamInfo> {
    let structure = caps.structure(0)?;
    let codec = CodecId::from_caps_name(
        structure.name().as_str(),
        structure.get::<i32>("mpegversion").ok(),
    )?;

    let width = structure.get::<i32>("width").unwrap_or(0).max(0) as u32;
    let height = structure.get::<i32>("height").unwrap_or(0).max(0) as u32;

    // 0/1 means variable frame rate.
    let fps = match structure.get::<gstreamer::Fraction>("framerate") {
        Ok(rate) if rate.numer() > 0 && rate.denom() > 0 => {
            f64::from(rate.numer()) / f64::from(rate.denom())
        }
        _ => DEFAULT_FPS,
    };

    Some(StreamInfo {
        codec,
        caps,
        width,
        height,
        fps,
    })
}

/// Bring a pipeline to PAUSED and wait for it to get there.
fn preroll(pipeline: &gstreamer::Pipeline) -> Result<(), String> {
    pipeline
        .set_state(gstreamer::State::Paused)
        .map_err(|why| format!("failed to pause: {why}"))?;

    let (result, state, _) = pipeline.state(gstreamer::ClockTime::from_mseconds(PREROLL_TIMEOUT_MS));
    match result {
        Ok(_) if state == gstreamer::State::Paused => Ok(()),
        Ok(_) => Err(format!("stuck in {state:?}")),
        Err(_) => Err(bus_error(pipeline).unwrap_or_else(|| "state change failed".into())),
    }
}

fn bus_error(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
    match msg.view() {
        gstreamer::MessageView::Error(err) => Some(err.error().to_string()),
        _ => None,
    }
}

struct GstBackend<'a> {
    location: String,
    stream: &'a StreamInfo,
}

impl DecoderBackend for GstBackend<'_> {
    type Context = gstreamer::Pipeline;

    fn codec_of(&self, name: &str) -> Option<CodecId> {
        let factory = gstreamer::ElementFactory::find(name)?;

        if factory.can_sink_any_caps(&self.stream.caps) {
            return Some(self.stream.codec.clone());
        }

        // Report what the decoder does take so the mismatch shows in logs.
        factory
            .static_pad_templates()
            .into_iter()
            .filter(|template| template.direction() == gstreamer::PadDirection::Sink)
            .find_map(|template| {
                template.caps().iter().find_map(|s| {
                    CodecId::from_caps_name(s.name().as_str(), s.get::<i32>("mpegversion").ok())
                })
            })
    }

    fn try_open(&mut self, name: &str) -> Result<gstreamer::Pipeline, String> {
        let description = format!(
            concat!(
                "filesrc location=\"{location}\" ! ",
                "parsebin ! ",
                "{decoder} name=dec ! ",
                "videoconvert ! video/x-raw,format=RGBA ! ",
                "appsink name=sink sync=false max-buffers=2"
            ),
            location = self.location,
            decoder = name,
        );

        debug!(pipeline = %description, "Trying decoder pipeline");

        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|why| why.to_string())?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| "not a pipeline".to_string())?;

        match preroll(&pipeline) {
            Ok(()) => Ok(pipeline),
            Err(why) => {
                let _ = pipeline.set_state(gstreamer::State::Null);
                Err(why)
            }
        }
    }

    fn default_decoder(&self) -> Option<String> {
        let mut factories: Vec<_> = gstreamer::ElementFactory::factories_with_type(
            gstreamer::ElementFactoryType::DECODER | gstreamer::ElementFactoryType::MEDIA_VIDEO,
            gstreamer::Rank::MARGINAL,
        )
        .into_iter()
        .filter(|factory| factory.can_sink_any_caps(&self.stream.caps))
        .collect();

        factories.sort_by_key(|factory| std::cmp::Reverse(factory.rank()));
        factories.first().map(|factory| factory.name().to_string())
    }
}

/// A committed decoding pipeline.
struct GstDecoder {
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    decoder: String,
    fps: f64,
    dimensions: (u32, u32),
    eos: bool,
    closed: bool,
}

impl GstDecoder {
    fn start(
        pipeline: gstreamer::Pipeline,
        decoder: String,
        stream: &StreamInfo,
    ) -> Result<Self, String> {
        let appsink = pipeline
            .by_name("sink")
            .ok_or("pipeline has no appsink")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| "element 'sink' is not an AppSink".to_string())?;

        if let Err(why) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(format!("failed to start pipeline: {why}"));
        }

        Ok(Self {
            pipeline,
            appsink,
            decoder,
            fps: stream.fps,
            dimensions: (stream.width, stream.height),
            eos: false,
            closed: false,
        })
    }

    /// Turn a pending bus error into the matching [`DecodeError`].
    fn pending_error(&self) -> Option<DecodeError> {
        let bus = self.pipeline.bus()?;
        let msg = bus.pop_filtered(&[gstreamer::MessageType::Error])?;
        let gstreamer::MessageView::Error(err) = msg.view() else {
            return None;
        };

        let source = err.src().map(|s| s.name().to_string());
        error!(
            src = ?source,
            error = %err.error(),
            debug = ?err.debug(),
            "GStreamer pipeline error"
        );

        let reason = err.error().to_string();
        Some(if source.as_deref() == Some("dec") {
            DecodeError::Frame(reason)
        } else {
            DecodeError::Packet(reason)
        })
    }

    fn convert(&mut self, sample: &gstreamer::Sample) -> Result<DecodedFrame, DecodeError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| DecodeError::Frame("sample without buffer".into()))?;
        let caps = sample
            .caps()
            .ok_or_else(|| DecodeError::Frame("sample without caps".into()))?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .map_err(|why| DecodeError::Frame(why.to_string()))?;

        let frame = gstreamer_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
            .map_err(|why| DecodeError::Frame(why.to_string()))?;
        let data = frame
            .plane_data(0)
            .map_err(|why| DecodeError::Frame(why.to_string()))?;

        let (width, height) = (info.width(), info.height());
        let row = width as usize * 4;
        let stride = frame.plane_stride()[0].max(0) as usize;

        if height == 0 || stride < row || data.len() < stride * (height as usize - 1) + row {
            return Err(DecodeError::Frame(format!(
                "buffer too small: {} bytes for {width}x{height} stride {stride}",
                data.len()
            )));
        }

        let mut pixels = Vec::with_capacity(row * height as usize);
        for line in data.chunks(stride).take(height as usize) {
            pixels.extend_from_slice(&line[..row]);
        }

        let image = RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| DecodeError::Frame("pixel buffer size mismatch".into()))?;

        self.dimensions = (width, height);
        Ok(DecodedFrame::new(image, buffer.pts().map(|pts| pts.nseconds())))
    }
}

impl FrameSource for GstDecoder {
    fn next_frame(&mut self) -> Result<Option<DecodedFrame>, DecodeError> {
        if self.closed || self.eos {
            return Ok(None);
        }

        if let Some(err) = self.pending_error() {
            return Err(err);
        }

        match self
            .appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
        {
            Some(sample) => self.convert(&sample).map(Some),
            None if self.appsink.is_eos() => {
                debug!(decoder = %self.decoder, "End of stream");
                self.eos = true;
                Ok(None)
            }
            None => Err(self.pending_error().unwrap_or_else(|| {
                warn!(decoder = %self.decoder, "Decoder produced no frame in time");
                DecodeError::Frame("timed out waiting for a frame".into())
            })),
        }
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }

    fn decoder_name(&self) -> &str {
        &self.decoder
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(why) = self.pipeline.set_state(gstreamer::State::Null) {
            error!(?why, "Failed to stop decoder pipeline");
        }
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        self.close();
    }
}
