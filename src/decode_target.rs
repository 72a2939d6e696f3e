// SPDX-License-Identifier: MPL-2.0

//! Single-slot hand-off between the media engine and the render thread.
//!
//! ```text
//! ┌─────────────┐
//! │ Media       │
//! │ decode      │
//! └─────┬───────┘
//!       │ push() - replaces any frame not yet latched
//!       ▼
//! ┌─────────────┐
//! │ Decode      │  ← one slot, latest frame wins
//! │ target      │──── frame-available listener wakes the renderer
//! └─────┬───────┘
//!       │ latch() - takes the newest frame
//!       ▼
//! ┌─────────────┐
//! │ Render      │
//! │ thread      │
//! └─────────────┘
//! ```
//!
//! The render thread owns the target and lends clones of it to exactly one
//! media engine at a time. Once [`DecodeTarget::release`] is called every
//! further push is rejected, so a superseded engine can no longer put frames
//! on screen.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Pixel layout of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit RGBA, the alpha channel is ignored.
    Rgba,
    /// 8-bit BGRx as produced by most hardware decoders.
    Bgrx,
}

/// A decoded video frame waiting to be uploaded.
#[derive(Clone)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: u32,
    pub format: PixelFormat,
    /// Presentation timestamp from the start of the video.
    pub pts: Option<Duration>,
    /// When the frame was pushed (for debugging/metrics).
    pub queued_at: Instant,
}

impl DecodedFrame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, stride: u32, format: PixelFormat) -> Self {
        Self {
            data,
            width,
            height,
            stride,
            format,
            pts: None,
            queued_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_pts(mut self, pts: Option<Duration>) -> Self {
        self.pts = pts;
        self
    }

    /// Whether the buffer actually holds `height` rows of `stride` bytes.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && u64::from(self.stride) >= u64::from(self.width) * 4
            && self.data.len() as u64 >= u64::from(self.stride) * u64::from(self.height)
    }
}

impl std::fmt::Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("bytes", &self.data.len())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("pts", &self.pts)
            .finish()
    }
}

/// Statistics about decode target traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetStats {
    /// Total frames pushed by the media engine.
    pub frames_pushed: u64,
    /// Frames replaced by a newer one before the renderer latched them.
    pub frames_superseded: u64,
    /// Frames taken by the renderer.
    pub frames_latched: u64,
}

type FrameListener = Box<dyn Fn() + Send + Sync>;

struct Inner {
    slot: Mutex<Option<DecodedFrame>>,
    released: AtomicBool,
    listener: FrameListener,
    stats_pushed: AtomicU64,
    stats_superseded: AtomicU64,
    stats_latched: AtomicU64,
}

/// Shared handle to the decode target. Cloning shares the same slot.
#[derive(Clone)]
pub struct DecodeTarget {
    inner: Arc<Inner>,
}

impl DecodeTarget {
    /// Create a target that calls `on_frame_available` after every accepted push.
    ///
    /// The listener runs on the pushing thread and must not block.
    pub fn new(on_frame_available: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                released: AtomicBool::new(false),
                listener: Box::new(on_frame_available),
                stats_pushed: AtomicU64::new(0),
                stats_superseded: AtomicU64::new(0),
                stats_latched: AtomicU64::new(0),
            }),
        }
    }

    /// Store a frame (producer side), replacing one the renderer has not taken yet.
    ///
    /// Returns `false` once the target has been released.
    pub fn push(&self, frame: DecodedFrame) -> bool {
        if self.inner.released.load(Ordering::Acquire) {
            return false;
        }

        {
            let Ok(mut slot) = self.inner.slot.lock() else {
                return false;
            };

            if slot.replace(frame).is_some() {
                self.inner.stats_superseded.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("decode target frame superseded before latch");
            }
        }

        self.inner.stats_pushed.fetch_add(1, Ordering::Relaxed);
        (self.inner.listener)();
        true
    }

    /// Take the newest frame (consumer side). Never blocks on the producer.
    pub fn latch(&self) -> Option<DecodedFrame> {
        let frame = self.inner.slot.try_lock().ok()?.take();
        if frame.is_some() {
            self.inner.stats_latched.fetch_add(1, Ordering::Relaxed);
        }
        frame
    }

    /// Reject all further pushes and drop any pending frame.
    pub fn release(&self) {
        self.inner.released.store(true, Ordering::Release);
        if let Ok(mut slot) = self.inner.slot.lock() {
            slot.take();
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> TargetStats {
        TargetStats {
            frames_pushed: self.inner.stats_pushed.load(Ordering::Relaxed),
            frames_superseded: self.inner.stats_superseded.load(Ordering::Relaxed),
            frames_latched: self.inner.stats_latched.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for DecodeTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeTarget")
            .field("released", &self.is_released())
            .field("stats", &self.stats())
            .finish()
    }
}
