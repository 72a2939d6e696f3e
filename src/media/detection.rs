// SPDX-License-Identifier: MPL-2.0

//! Video source validation.
//!
//! Local sources are checked before a media engine is created for them:
//! the file must exist and carry a known video container extension. URIs
//! with any other scheme are handed to the media engine untouched.

use std::path::{Path, PathBuf};

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use tracing::debug;

/// Video container extensions, matched case-insensitively.
const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4",  // MPEG-4 container (typically H.264/H.265 codec)
    "webm", // WebM container (VP8/VP9/AV1)
    "mkv",  // Matroska container (any codec)
    "avi",  // AVI container (legacy format)
    "mov",  // QuickTime container (typically H.264)
    "m4v",  // MPEG-4 Video (Apple variant of MP4)
    "ogv",  // Ogg Video container (Theora codec)
    "3gp",  // 3GPP container, common on phones
];

/// Characters escaped in the path component of a `file://` URI.
const PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Check if a path points to a video file by extension.
#[must_use]
pub fn is_video_file(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };

    let ext_lower = ext.to_lowercase();
    VIDEO_EXTENSIONS.contains(&ext_lower.as_str())
}

fn has_foreign_scheme(source: &str) -> bool {
    match source.split_once("://") {
        Some((scheme, _)) => {
            !scheme.eq_ignore_ascii_case("file")
                && !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn local_path(source: &str) -> Option<PathBuf> {
    match source.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("file://") => {
            let decoded = percent_decode_str(&source[7..]).decode_utf8().ok()?;
            Some(PathBuf::from(decoded.as_ref()))
        }
        _ => Some(PathBuf::from(source)),
    }
}

/// Turn a configured source into a URI the media engine can open.
///
/// Returns `None` for empty sources and for local files that are missing or
/// not videos.
#[must_use]
pub fn resolve_source(source: &str) -> Option<String> {
    let source = source.trim();
    if source.is_empty() {
        return None;
    }

    if has_foreign_scheme(source) {
        return Some(source.to_string());
    }

    let path = local_path(source)?;

    if !is_video_file(&path) {
        debug!(path = %path.display(), "source is not a recognised video file");
        return None;
    }

    let path = match std::fs::canonicalize(&path) {
        Ok(path) if path.is_file() => path,
        Ok(_) | Err(_) => {
            debug!(path = %path.display(), "video source does not exist");
            return None;
        }
    };

    let path = path.to_str()?;
    Some(format!("file://{}", utf8_percent_encode(path, PATH_SET)))
}
