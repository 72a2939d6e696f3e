// SPDX-License-Identifier: MPL-2.0

//! Playback engine interface.
//!
//! The wallpaper engine drives a [`MediaEngine`] from the coordination thread.
//! The media engine decodes into the [`DecodeTarget`] it was created with and
//! reports back through a [`MediaEventSink`], which may be called from any
//! thread.

mod detection;
#[cfg(test)]
pub mod fake;
#[cfg(feature = "animated")]
mod gst;

pub use detection::resolve_source;
#[cfg(feature = "animated")]
pub use gst::GstBackend;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::decode_target::DecodeTarget;

/// Playback state stream of a media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Buffering,
    /// Prerolled and able to play.
    Ready,
    /// Reached the end without repeating.
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaErrorKind {
    /// The decoder could not be created or configured.
    DecoderInit,
    /// Querying decoder capabilities failed.
    DecoderQuery,
    /// The platform took decoding resources away from us.
    ResourcesReclaimed,
    OutOfMemory,
    SourceNotFound,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct MediaError {
    pub kind: MediaErrorKind,
    pub message: String,
}

impl MediaError {
    pub fn new(kind: MediaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What the lifecycle coordinator should do about a [`MediaError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with backoff while the budget lasts.
    Transient,
    /// Resource exhaustion: give up on this video for good.
    Exhausted,
    /// The source is gone; abort quietly.
    MissingSource,
    /// Notify the user and leave playback alone.
    Other,
}

const OUT_OF_MEMORY_SIGNATURES: &[&str] = &["out of memory", "OutOfMemory", "ENOMEM", "NO_MEMORY"];

/// Map an error onto the recovery policy. A memory signature in the message
/// wins over the reported kind.
#[must_use]
pub fn classify(error: &MediaError) -> ErrorClass {
    if OUT_OF_MEMORY_SIGNATURES
        .iter()
        .any(|signature| error.message.contains(signature))
    {
        return ErrorClass::Exhausted;
    }

    match error.kind {
        MediaErrorKind::DecoderInit
        | MediaErrorKind::DecoderQuery
        | MediaErrorKind::ResourcesReclaimed => ErrorClass::Transient,
        MediaErrorKind::OutOfMemory => ErrorClass::Exhausted,
        MediaErrorKind::SourceNotFound => ErrorClass::MissingSource,
        MediaErrorKind::Other => ErrorClass::Other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    State(PlaybackState),
    VideoSize { width: u32, height: u32 },
    Error(MediaError),
}

/// Thread-safe callback for media events, bound to one engine generation.
#[derive(Clone)]
pub struct MediaEventSink {
    send: Arc<dyn Fn(MediaEvent) + Send + Sync>,
}

impl MediaEventSink {
    pub fn new(send: impl Fn(MediaEvent) + Send + Sync + 'static) -> Self {
        Self {
            send: Arc::new(send),
        }
    }

    pub fn send(&self, event: MediaEvent) {
        (self.send)(event);
    }
}

impl fmt::Debug for MediaEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MediaEventSink")
    }
}

/// One playback engine instance. Lives on the coordination thread.
pub trait MediaEngine {
    /// Open `uri` and start prerolling. Readiness is reported as [`PlaybackState::Ready`].
    fn load(&mut self, uri: &str) -> Result<(), MediaError>;
    fn play(&mut self) -> Result<(), MediaError>;
    fn pause(&mut self);
    fn seek(&mut self, position: Duration);
    fn position(&self) -> Option<Duration>;
    fn duration(&self) -> Option<Duration>;
    fn is_playing(&self) -> bool;
    /// 0.0 mutes, 1.0 is full volume.
    fn set_volume(&mut self, volume: f64);
    /// Restart from the beginning at the end instead of reporting [`PlaybackState::Ended`].
    fn set_repeat(&mut self, repeat: bool);
    /// Stop decoding and drop the decode target. Idempotent.
    fn release(&mut self);
}

/// Creates media engines wired to a decode target and an event sink.
pub trait MediaBackend {
    fn create(
        &self,
        target: DecodeTarget,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaEngine>, MediaError>;
}
