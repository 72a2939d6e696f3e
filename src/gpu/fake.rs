// SPDX-License-Identifier: MPL-2.0

//! Counting GPU backend for tests. Draws nothing, records everything.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender};
use glam::Mat4;
use raw_window_handle::{
    RawDisplayHandle, RawWindowHandle, WaylandDisplayHandle, WaylandWindowHandle,
};

use super::{GpuBackend, GpuBackendFactory, GpuError, PlatformSurface};
use crate::decode_target::DecodedFrame;

/// Surface with dangling handles. Only valid for backends that never touch them.
pub fn test_surface(width: u32, height: u32) -> PlatformSurface {
    PlatformSurface {
        display: RawDisplayHandle::Wayland(WaylandDisplayHandle::new(NonNull::<c_void>::dangling())),
        window: RawWindowHandle::Wayland(WaylandWindowHandle::new(NonNull::<c_void>::dangling())),
        width,
        height,
    }
}

/// Blocks draws until the test lets them through.
pub struct DrawGate {
    entered: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
pub struct GpuCounters {
    pub inits: AtomicUsize,
    pub teardowns: AtomicUsize,
    pub uploads: AtomicUsize,
    pub draws: AtomicUsize,
    pub presents: AtomicUsize,
    pub resizes: AtomicUsize,
    pub fail_init: AtomicBool,
    pub lose_context_on_present: AtomicBool,
    pub last_viewport: Mutex<(u32, u32)>,
    pub last_mvp: Mutex<Option<Mat4>>,
    pub last_brightness: Mutex<Option<f32>>,
    gate: Mutex<Option<DrawGate>>,
}

impl GpuCounters {
    pub fn draws(&self) -> usize {
        self.draws.load(Ordering::SeqCst)
    }

    /// Make the next draw block. Returns (entered, release): the draw signals
    /// `entered` and waits for one message on `release`.
    pub fn install_gate(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        *self.gate.lock().unwrap() = Some(DrawGate {
            entered: entered_tx,
            release: release_rx,
        });
        (entered_rx, release_tx)
    }
}

pub struct FakeGpuFactory {
    pub counters: Arc<GpuCounters>,
}

impl FakeGpuFactory {
    pub fn new() -> (Arc<Self>, Arc<GpuCounters>) {
        let counters = Arc::new(GpuCounters::default());
        (
            Arc::new(Self {
                counters: Arc::clone(&counters),
            }),
            counters,
        )
    }
}

impl GpuBackendFactory for FakeGpuFactory {
    fn create(&self) -> Box<dyn GpuBackend> {
        Box::new(FakeGpu {
            counters: Arc::clone(&self.counters),
            initialized: false,
        })
    }
}

struct FakeGpu {
    counters: Arc<GpuCounters>,
    initialized: bool,
}

impl GpuBackend for FakeGpu {
    fn initialize(&mut self, surface: &PlatformSurface) -> Result<(), GpuError> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_init.load(Ordering::SeqCst) {
            return Err(GpuError::Shader("scripted failure".to_string()));
        }
        *self.counters.last_viewport.lock().unwrap() = (surface.width, surface.height);
        self.initialized = true;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.counters.resizes.fetch_add(1, Ordering::SeqCst);
        *self.counters.last_viewport.lock().unwrap() = (width, height);
    }

    fn update_texture(&mut self, _frame: &DecodedFrame) -> Result<(), GpuError> {
        self.counters.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn draw_frame(&mut self, mvp: &Mat4, brightness: f32) -> Result<(), GpuError> {
        if !self.initialized {
            return Err(GpuError::NotInitialized);
        }

        let gate = self.counters.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.recv();
        }

        *self.counters.last_mvp.lock().unwrap() = Some(*mvp);
        *self.counters.last_brightness.lock().unwrap() = Some(brightness);
        self.counters.draws.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn present(&mut self) -> Result<(), GpuError> {
        if self.counters.lose_context_on_present.swap(false, Ordering::SeqCst) {
            return Err(GpuError::ContextLost);
        }
        self.counters.presents.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn teardown(&mut self) {
        if self.initialized {
            self.counters.teardowns.fetch_add(1, Ordering::SeqCst);
        }
        self.initialized = false;
    }
}
