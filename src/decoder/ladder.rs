// SPDX-License-Identifier: MPL-2.0

//! Decoder priority ladders.
//!
//! Each codec maps to an ordered list of decoder elements: stateless and
//! stateful V4L2 (ARM SoCs) first, then VA-API (AMD/Intel) and NVDEC, with the
//! software decoders last. Selection walks the ladder, trial-opening each
//! candidate against the real stream, and falls back once to the platform's
//! default decoder for the codec before giving up.

use std::fmt;

use tracing::{debug, info, warn};

/// Codec of a video stream, as identified from its parsed caps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Mpeg2,
    Mpeg4,
    Theora,
    /// Any other video media type, by caps name.
    Other(String),
}

impl CodecId {
    /// Identify a codec from a caps structure name such as `video/x-h264`.
    ///
    /// `mpeg_version` is the `mpegversion` field of `video/mpeg` caps.
    /// Returns `None` for non-video media types.
    #[must_use]
    pub fn from_caps_name(name: &str, mpeg_version: Option<i32>) -> Option<Self> {
        if !name.starts_with("video/") {
            return None;
        }

        Some(match name {
            "video/x-h264" => CodecId::H264,
            "video/x-h265" => CodecId::H265,
            "video/x-vp8" => CodecId::Vp8,
            "video/x-vp9" => CodecId::Vp9,
            "video/x-av1" => CodecId::Av1,
            "video/x-theora" => CodecId::Theora,
            "video/mpeg" => match mpeg_version {
                Some(1 | 2) => CodecId::Mpeg2,
                Some(4) => CodecId::Mpeg4,
                _ => CodecId::Other(name.to_string()),
            },
            other => CodecId::Other(other.to_string()),
        })
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecId::H264 => f.write_str("H.264"),
            CodecId::H265 => f.write_str("H.265"),
            CodecId::Vp8 => f.write_str("VP8"),
            CodecId::Vp9 => f.write_str("VP9"),
            CodecId::Av1 => f.write_str("AV1"),
            CodecId::Mpeg2 => f.write_str("MPEG-2"),
            CodecId::Mpeg4 => f.write_str("MPEG-4"),
            CodecId::Theora => f.write_str("Theora"),
            CodecId::Other(name) => f.write_str(name),
        }
    }
}

/// Decoder selection inputs from the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderOptions {
    /// Decoder tried before the ladder.
    pub decoder_override: Option<String>,
    /// Skip hardware candidates in the ladder.
    pub force_software: bool,
    /// Log every enumerable decoder at open time.
    pub debug_list: bool,
}

impl From<&loopframe_config::DecoderSettings> for DecoderOptions {
    fn from(settings: &loopframe_config::DecoderSettings) -> Self {
        Self {
            decoder_override: settings.decoder_override.clone(),
            force_software: settings.force_software,
            debug_list: settings.debug_list,
        }
    }
}

/// One rung of a ladder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub hardware: bool,
    /// Pinned by configuration rather than taken from the table.
    pub pinned: bool,
}

const HW: bool = true;
const SW: bool = false;

fn table(codec: &CodecId) -> &'static [(&'static str, bool)] {
    match codec {
        CodecId::H264 => &[
            ("v4l2slh264dec", HW),
            ("v4l2h264dec", HW),
            ("vah264dec", HW),
            ("vaapih264dec", HW),
            ("nvh264dec", HW),
            ("avdec_h264", SW),
            ("openh264dec", SW),
        ],
        CodecId::H265 => &[
            ("v4l2slh265dec", HW),
            ("v4l2h265dec", HW),
            ("vah265dec", HW),
            ("vaapih265dec", HW),
            ("nvh265dec", HW),
            ("avdec_h265", SW),
            ("libde265dec", SW),
        ],
        CodecId::Vp8 => &[
            ("v4l2slvp8dec", HW),
            ("v4l2vp8dec", HW),
            ("vavp8dec", HW),
            ("vaapivp8dec", HW),
            ("nvvp8dec", HW),
            ("vp8dec", SW),
            ("avdec_vp8", SW),
        ],
        CodecId::Vp9 => &[
            ("v4l2slvp9dec", HW),
            ("v4l2vp9dec", HW),
            ("vavp9dec", HW),
            ("vaapivp9dec", HW),
            ("nvvp9dec", HW),
            ("vp9dec", SW),
            ("avdec_vp9", SW),
        ],
        CodecId::Av1 => &[
            ("v4l2slav1dec", HW),
            ("vaav1dec", HW),
            ("vaapiav1dec", HW),
            ("nvav1dec", HW),
            ("dav1ddec", SW),
            ("av1dec", SW),
        ],
        CodecId::Mpeg2 => &[
            ("v4l2slmpeg2dec", HW),
            ("v4l2mpeg2dec", HW),
            ("vampeg2dec", HW),
            ("vaapimpeg2dec", HW),
            ("nvmpegvideodec", HW),
            ("avdec_mpeg2video", SW),
            ("mpeg2dec", SW),
        ],
        CodecId::Mpeg4 => &[
            ("v4l2mpeg4dec", HW),
            ("nvmpeg4videodec", HW),
            ("avdec_mpeg4", SW),
        ],
        CodecId::Theora => &[("theoradec", SW)],
        CodecId::Other(_) => &[],
    }
}

/// Build the ordered candidate list for a codec.
#[must_use]
pub fn build_ladder(codec: &CodecId, options: &DecoderOptions) -> Vec<Candidate> {
    let mut ladder = Vec::new();

    if let Some(name) = options.decoder_override.as_deref() {
        let hardware = table(codec)
            .iter()
            .any(|&(known, hardware)| known == name && hardware);
        if hardware && options.force_software {
            info!(decoder = name, "Pinned hardware decoder overrides force_software");
        }
        ladder.push(Candidate {
            name: name.to_string(),
            hardware,
            pinned: true,
        });
    }

    ladder.extend(
        table(codec)
            .iter()
            .filter(|(_, hardware)| !(options.force_software && *hardware))
            .filter(|(name, _)| Some(*name) != options.decoder_override.as_deref())
            .map(|&(name, hardware)| Candidate {
                name: name.to_string(),
                hardware,
                pinned: false,
            }),
    );

    ladder
}

/// Access to the decoding library during selection.
pub trait DecoderBackend {
    /// A committed, opened decoding context.
    type Context;

    /// Codec the named decoder would decode this stream as, or `None` if the
    /// decoder is not installed or cannot take the stream.
    fn codec_of(&self, name: &str) -> Option<CodecId>;

    /// Open a trial context for the stream with the named decoder.
    fn try_open(&mut self, name: &str) -> Result<Self::Context, String>;

    /// The library's own choice of decoder for the stream's codec.
    fn default_decoder(&self) -> Option<String>;
}

/// Outcome of a successful selection.
#[derive(Debug)]
pub struct Selected<C> {
    pub name: String,
    pub hardware: bool,
    pub context: C,
    /// Decoders whose trial open was attempted, in order.
    pub tried: Vec<String>,
}

/// Walk the ladder for `codec`, then the default decoder, committing the
/// first candidate that opens. Returns `None` when nothing works.
pub fn select_decoder<B: DecoderBackend>(
    backend: &mut B,
    codec: &CodecId,
    options: &DecoderOptions,
) -> Option<Selected<B::Context>> {
    let mut tried = Vec::new();

    for candidate in build_ladder(codec, options) {
        match backend.codec_of(&candidate.name) {
            None => {
                if candidate.pinned {
                    warn!(decoder = %candidate.name, %codec, "Pinned decoder unavailable for this stream");
                }
                continue;
            }
            Some(ref found) if found != codec => {
                debug!(decoder = %candidate.name, decoder_codec = %found, %codec, "Skipping decoder for other codec");
                continue;
            }
            Some(_) => {}
        }

        tried.push(candidate.name.clone());
        match backend.try_open(&candidate.name) {
            Ok(context) => {
                info!(
                    decoder = %candidate.name,
                    hardware = candidate.hardware,
                    pinned = candidate.pinned,
                    %codec,
                    "Decoder selected"
                );
                return Some(Selected {
                    name: candidate.name,
                    hardware: candidate.hardware,
                    context,
                    tried,
                });
            }
            Err(why) => {
                debug!(decoder = %candidate.name, %why, "Decoder trial open failed");
            }
        }
    }

    let Some(name) = backend.default_decoder() else {
        warn!(%codec, tried = ?tried, "No default decoder for codec");
        return None;
    };

    if backend.codec_of(&name).as_ref() != Some(codec) {
        warn!(decoder = %name, %codec, "Default decoder does not match stream codec");
        return None;
    }

    tried.push(name.clone());
    match backend.try_open(&name) {
        Ok(context) => {
            info!(decoder = %name, %codec, "Ladder exhausted, using default decoder");
            Some(Selected {
                name,
                hardware: false,
                context,
                tried,
            })
        }
        Err(why) => {
            warn!(decoder = %name, %why, %codec, tried = ?tried, "Default decoder failed to open");
            None
        }
    }
}
