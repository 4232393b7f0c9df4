// SPDX-License-Identifier: MPL-2.0

//! Media file filtering and decoder enumeration.

use std::path::Path;

/// Container extensions that may hold a playable video stream.
/// Compared case-insensitively.
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4",  // MPEG-4 (H.264/H.265)
    "webm", // VP8/VP9/AV1
    "mkv",  // Matroska, any codec
    "avi",
    "mov",
    "m4v",
    "ogv", // Theora
];

/// Check if a path has a video container extension.
#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            VIDEO_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Log every video decoder the library can enumerate, with its rank.
///
/// Runs once per process no matter how often it is called.
#[cfg(feature = "gst")]
pub fn log_available_decoders() {
    use gstreamer::prelude::*;
    use tracing::info;

    static LISTED: std::sync::Once = std::sync::Once::new();

    LISTED.call_once(|| {
        let mut factories: Vec<_> = gstreamer::ElementFactory::factories_with_type(
            gstreamer::ElementFactoryType::DECODER | gstreamer::ElementFactoryType::MEDIA_VIDEO,
            gstreamer::Rank::NONE,
        )
        .into_iter()
        .collect();
        factories.sort_by_key(|factory| std::cmp::Reverse(factory.rank()));

        info!(count = factories.len(), "Enumerable video decoders");
        for factory in factories {
            let hardware = factory
                .metadata("klass")
                .is_some_and(|klass| klass.contains("Hardware"));
            info!(
                decoder = %factory.name(),
                rank = ?factory.rank(),
                hardware,
                "  decoder"
            );
        }
    });
}
