// SPDX-License-Identifier: MPL-2.0

//! Render coordinator: owns the render thread and everything it draws with.
//!
//! Parameter setters and frame notifications may be called from any thread.
//! They only update shared state and post a conflated render request, so the
//! GPU context itself is touched exclusively by the render thread.

mod signal;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use glam::Mat4;
use tracing::{debug, error, info, warn};
use vidpaper_config::{ScalingMode, Transform};

use crate::decode_target::DecodeTarget;
use crate::gpu::{GpuBackend, GpuBackendFactory, GpuError, PlatformSurface};
use crate::transform::{Placement, compute_mvp};
use signal::{RenderRequester, RenderSignal, render_signal};

/// How often the GPU context may be rebuilt after losing it, per surface.
pub const MAX_REINIT_ATTEMPTS: u32 = 3;

/// Decode target statistics are logged every this many draws.
const STATS_INTERVAL: u64 = 300;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RenderParams {
    scaling: ScalingMode,
    transform: Transform,
    video: (u32, u32),
    viewport: (u32, u32),
    dirty: bool,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            scaling: ScalingMode::default(),
            transform: Transform::default(),
            video: (0, 0),
            viewport: (0, 0),
            dirty: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    /// Render thread not started or still initializing.
    Pending,
    /// The GPU context exists and decode targets can be lent out.
    Ready,
    /// Initialization failed; nothing will be drawn.
    Failed,
    /// Torn down.
    Stopped,
}

struct Shared {
    params: Mutex<RenderParams>,
    readiness: Mutex<Readiness>,
    readiness_changed: Condvar,
    /// The decode target currently lent to a media engine.
    lent: Mutex<Option<DecodeTarget>>,
    stop: AtomicBool,
}

impl Shared {
    fn set_readiness(&self, readiness: Readiness) {
        let mut current = lock(&self.readiness);
        // Stopped is terminal.
        if *current != Readiness::Stopped {
            *current = readiness;
        }
        self.readiness_changed.notify_all();
    }

    fn readiness(&self) -> Readiness {
        *lock(&self.readiness)
    }

    fn revoke_lent(&self) {
        if let Some(target) = lock(&self.lent).take() {
            target.release();
        }
    }
}

/// Lets another thread wait for the render surface without owning the renderer.
#[derive(Clone)]
pub struct SurfaceWaiter {
    shared: Arc<Shared>,
}

impl SurfaceWaiter {
    /// Block until the decode target can be lent out, at most `timeout`.
    ///
    /// Returns `false` on timeout, on initialization failure, and immediately
    /// once the renderer is torn down.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let guard = lock(&self.shared.readiness);
        let (guard, _) = self
            .shared
            .readiness_changed
            .wait_timeout_while(guard, timeout, |r| *r == Readiness::Pending)
            .unwrap_or_else(PoisonError::into_inner);
        *guard == Readiness::Ready
    }
}

pub struct Renderer {
    shared: Arc<Shared>,
    requester: RenderRequester,
    signal: Option<RenderSignal>,
    factory: Arc<dyn GpuBackendFactory>,
    thread: Option<JoinHandle<()>>,
}

impl Renderer {
    pub fn new(factory: Arc<dyn GpuBackendFactory>) -> Self {
        let (requester, signal) = render_signal();
        Self {
            shared: Arc::new(Shared {
                params: Mutex::new(RenderParams::default()),
                readiness: Mutex::new(Readiness::Pending),
                readiness_changed: Condvar::new(),
                lent: Mutex::new(None),
                stop: AtomicBool::new(false),
            }),
            requester,
            signal: Some(signal),
            factory,
            thread: None,
        }
    }

    /// Start the render thread and initialize the GPU context on it.
    pub fn on_surface_ready(&mut self, surface: PlatformSurface) {
        let Some(signal) = self.signal.take() else {
            warn!("render thread already started for this surface");
            return;
        };

        if surface.width > 0 && surface.height > 0 {
            let mut params = lock(&self.shared.params);
            params.viewport = (surface.width, surface.height);
            params.dirty = true;
        }

        let shared = Arc::clone(&self.shared);
        let factory = Arc::clone(&self.factory);

        let spawned = std::thread::Builder::new()
            .name("vidpaper-render".to_string())
            .spawn(move || render_loop(shared, signal, factory, surface));

        match spawned {
            Ok(thread) => {
                self.thread = Some(thread);
                // First draw clears the surface even before any frame arrives.
                self.requester.request();
            }
            Err(why) => {
                error!(?why, "failed to spawn render thread");
                self.shared.set_readiness(Readiness::Failed);
            }
        }
    }

    pub fn on_viewport_changed(&self, width: u32, height: u32) {
        self.update(|params| params.viewport = (width, height));
    }

    /// Zero sized reports are ignored and keep the previous dimensions.
    pub fn on_video_dimensions_changed(&self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            debug!(width, height, "ignoring invalid video dimensions");
            return;
        }
        self.update(|params| params.video = (width, height));
    }

    pub fn set_scaling_mode(&self, scaling: ScalingMode) {
        self.update(|params| params.scaling = scaling);
    }

    /// Apply pan, zoom and rotation. Brightness is set separately.
    pub fn set_transform(&self, transform: &Transform) {
        self.update(|params| {
            params.transform = Transform {
                brightness: params.transform.brightness,
                ..*transform
            };
        });
    }

    pub fn set_brightness(&self, brightness: f32) {
        self.update(|params| params.transform.brightness = brightness);
    }

    /// Request a redraw as if a decoded frame had arrived. Never blocks.
    ///
    /// Decoders take the same path through the listener of the [`DecodeTarget`]
    /// they were lent.
    #[cfg(test)]
    pub fn notify_frame_available(&self) {
        self.requester.request();
    }

    pub fn waiter(&self) -> SurfaceWaiter {
        SurfaceWaiter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Lend a fresh decode target, revoking the one lent before.
    ///
    /// `None` until the render thread has a working GPU context. Use
    /// [`SurfaceWaiter::wait_ready`] to wait for that off the calling thread.
    pub fn decode_target(&self) -> Option<DecodeTarget> {
        if self.shared.readiness() != Readiness::Ready {
            return None;
        }

        let requester = self.requester.clone();
        let target = DecodeTarget::new(move || {
            requester.request();
        });

        if let Some(previous) = lock(&self.shared.lent).replace(target.clone()) {
            previous.release();
        }

        Some(target)
    }

    /// Take back the lent decode target. Later pushes into it are rejected.
    pub fn revoke_decode_target(&self) {
        self.shared.revoke_lent();
    }

    #[cfg(test)]
    pub fn video_dimensions(&self) -> (u32, u32) {
        lock(&self.shared.params).video
    }

    /// Stop the render loop and destroy the GPU context on its own thread.
    ///
    /// Idempotent. Blocks until an in-flight frame is finished.
    pub fn teardown(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        self.shared.set_readiness(Readiness::Stopped);
        self.shared.revoke_lent();
        self.requester.request();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("render thread panicked");
            }
            debug!("render thread joined");
        }
    }

    fn update(&self, apply: impl FnOnce(&mut RenderParams)) {
        {
            let mut params = lock(&self.shared.params);
            apply(&mut params);
            params.dirty = true;
        }
        self.requester.request();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// State private to the render thread.
struct RenderThread {
    gpu: Box<dyn GpuBackend>,
    surface: PlatformSurface,
    valid: bool,
    reinit_attempts: u32,
    viewport: (u32, u32),
    mvp: Mat4,
    brightness: f32,
    draws: u64,
}

fn render_loop(
    shared: Arc<Shared>,
    signal: RenderSignal,
    factory: Arc<dyn GpuBackendFactory>,
    surface: PlatformSurface,
) {
    let mut thread = RenderThread {
        gpu: factory.create(),
        surface,
        valid: false,
        reinit_attempts: 0,
        viewport: (surface.width, surface.height),
        mvp: Mat4::IDENTITY,
        brightness: 1.0,
        draws: 0,
    };

    match thread.gpu.initialize(&surface) {
        Ok(()) => {
            thread.valid = true;
            shared.set_readiness(Readiness::Ready);
            info!(
                width = surface.width,
                height = surface.height,
                "render thread started"
            );
        }
        Err(why) => {
            error!(%why, "GPU initialization failed, nothing will be drawn");
            thread.gpu.teardown();
            shared.set_readiness(Readiness::Failed);
        }
    }

    while signal.wait() {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        thread.render_once(&shared);
    }

    thread.gpu.teardown();
    shared.revoke_lent();
    debug!(draws = thread.draws, "render thread exiting");
}

impl RenderThread {
    fn render_once(&mut self, shared: &Shared) {
        if !self.valid && !self.reinitialize(shared) {
            return;
        }

        let viewport = {
            let mut params = lock(&shared.params);
            if params.dirty {
                params.dirty = false;
                self.mvp = compute_mvp(&Placement::new(
                    params.viewport,
                    params.video,
                    params.scaling,
                    &params.transform,
                ));
                self.brightness = params.transform.brightness;
            }
            params.viewport
        };

        if viewport != self.viewport && viewport.0 > 0 && viewport.1 > 0 {
            self.gpu.resize(viewport.0, viewport.1);
            self.viewport = viewport;
        }

        let frame = lock(&shared.lent).as_ref().and_then(DecodeTarget::latch);
        if let Some(frame) = frame {
            if let Err(why) = self.gpu.update_texture(&frame) {
                self.on_gpu_error(why);
                return;
            }
        }

        let result = self
            .gpu
            .draw_frame(&self.mvp, self.brightness)
            .and_then(|()| self.gpu.present());

        match result {
            Ok(()) => {
                self.draws += 1;
                if self.draws % STATS_INTERVAL == 0 {
                    if let Some(target) = lock(&shared.lent).as_ref() {
                        let stats = target.stats();
                        debug!(
                            draws = self.draws,
                            pushed = stats.frames_pushed,
                            superseded = stats.frames_superseded,
                            latched = stats.frames_latched,
                            "decode target statistics"
                        );
                    }
                }
            }
            Err(why) => self.on_gpu_error(why),
        }
    }

    fn on_gpu_error(&mut self, why: GpuError) {
        match why {
            GpuError::ContextLost => {
                warn!("GPU context lost, drawing suspended until re-initialized");
                self.valid = false;
                self.gpu.teardown();
            }
            GpuError::Surface(ref reason) => {
                debug!(%reason, "skipped frame");
            }
            other => {
                warn!(why = %other, "frame failed");
            }
        }
    }

    fn reinitialize(&mut self, shared: &Shared) -> bool {
        if self.reinit_attempts >= MAX_REINIT_ATTEMPTS {
            return false;
        }
        self.reinit_attempts += 1;

        let mut surface = self.surface;
        {
            let mut params = lock(&shared.params);
            if params.viewport.0 > 0 && params.viewport.1 > 0 {
                (surface.width, surface.height) = params.viewport;
            }
            params.dirty = true;
        }

        match self.gpu.initialize(&surface) {
            Ok(()) => {
                info!(attempt = self.reinit_attempts, "GPU context re-initialized");
                self.valid = true;
                self.viewport = (surface.width, surface.height);
                shared.set_readiness(Readiness::Ready);
                true
            }
            Err(why) => {
                warn!(attempt = self.reinit_attempts, %why, "GPU re-initialization failed");
                self.gpu.teardown();
                if self.reinit_attempts == MAX_REINIT_ATTEMPTS {
                    error!("giving up on the GPU context for this surface");
                }
                false
            }
        }
    }
}
