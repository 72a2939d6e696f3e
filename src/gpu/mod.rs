// SPDX-License-Identifier: MPL-2.0

//! GPU render context: one textured quad per frame.
//!
//! A [`GpuBackend`] is created by its [`GpuBackendFactory`] on the render
//! thread and never leaves it. The trait has no `Send` bound, so a live context
//! cannot be moved to another thread.

#[cfg(test)]
pub mod fake;
mod wgpu_backend;

pub use wgpu_backend::WgpuFactory;

use glam::Mat4;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::decode_target::DecodedFrame;

#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    /// The context or its surface is gone; nothing may be drawn until re-initialized.
    #[error("GPU context lost")]
    ContextLost,
    #[error("render surface error: {0}")]
    Surface(String),
    #[error("GPU initialization failed: {0}")]
    Init(String),
    #[error("shader compilation failed: {0}")]
    Shader(String),
    #[error("GPU context used before initialization")]
    NotInitialized,
}

/// Raw handles of the platform surface the wallpaper is drawn onto.
#[derive(Debug, Clone, Copy)]
pub struct PlatformSurface {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
    pub width: u32,
    pub height: u32,
}

// SAFETY: the handles are plain pointers to objects owned by the platform
// connection. The render thread is joined before the surface is destroyed,
// so the pointers never outlive what they point to.
unsafe impl Send for PlatformSurface {}

/// Low level graphics context owned by the render thread.
pub trait GpuBackend {
    /// Create the context, the video texture and the shader program for `surface`.
    fn initialize(&mut self, surface: &PlatformSurface) -> Result<(), GpuError>;

    /// Reconfigure the swap chain for a new surface size.
    fn resize(&mut self, width: u32, height: u32);

    /// Copy the newest decoded frame into the video texture.
    fn update_texture(&mut self, frame: &DecodedFrame) -> Result<(), GpuError>;

    /// Draw the textured quad with `mvp` applied and colors scaled by `brightness`.
    fn draw_frame(&mut self, mvp: &Mat4, brightness: f32) -> Result<(), GpuError>;

    /// Show the frame drawn by [`GpuBackend::draw_frame`].
    fn present(&mut self) -> Result<(), GpuError>;

    /// Release everything. Safe to call repeatedly and after a failed initialize.
    fn teardown(&mut self);
}

/// Builds a [`GpuBackend`] on the thread that will own it.
pub trait GpuBackendFactory: Send + Sync {
    fn create(&self) -> Box<dyn GpuBackend>;
}
