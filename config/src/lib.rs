// SPDX-License-Identifier: MPL-2.0-only

//! Persistent settings for the video wallpaper.
//!
//! The daemon only ever reads these values, except for clearing the source
//! after a fatal playback failure. Everything else is written by whatever
//! front end the user edits settings with.

use derive_setters::Setters;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};

pub const NAME: &str = "vidpaper";
pub const CONFIG_FILE: &str = "config.ron";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration directory available")]
    NoConfigDir,
    #[error("config I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("config file {path} is invalid: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("config could not be serialized: {0}")]
    Serialize(#[from] ron::Error),
}

/// Video scaling mode
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScalingMode {
    /// Scale uniformly until the whole video is visible, letterboxing the rest.
    Fit,
    /// Scale uniformly until the whole screen is covered, cropping the overflow.
    #[default]
    Fill,
    /// Stretch each axis independently, ignoring the aspect ratio.
    Stretch,
}

/// What happens when the video reaches its end.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlaybackMode {
    #[default]
    Loop,
    /// Play through once and hold the last frame.
    OneShot,
}

/// Contrast hint for system UI drawn on top of the wallpaper.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusBarColor {
    /// Let the compositor sample the wallpaper itself.
    #[default]
    Auto,
    Dark,
    Light,
}

/// User adjustments applied on top of the scaling mode.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Setters)]
#[serde(default)]
#[must_use]
pub struct Transform {
    /// Horizontal offset, -1.0 moves the center to the left edge.
    pub pan_x: f32,
    /// Vertical offset, -1.0 moves the center to the bottom edge.
    pub pan_y: f32,
    /// Multiplier applied after auto-fit, 1.0 = unchanged.
    pub zoom: f32,
    /// Clockwise rotation in degrees.
    pub rotation: f32,
    /// Color multiplier, 1.0 = unchanged.
    pub brightness: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            pan_x: 0.0,
            pan_y: 0.0,
            zoom: 1.0,
            rotation: 0.0,
            brightness: 1.0,
        }
    }
}

impl Transform {
    /// Replace values that would produce a degenerate matrix with defaults.
    pub fn sanitized(self) -> Self {
        let finite_or = |value: f32, fallback: f32| {
            if value.is_finite() {
                value
            } else {
                fallback
            }
        };

        Self {
            pan_x: finite_or(self.pan_x, 0.0),
            pan_y: finite_or(self.pan_y, 0.0),
            zoom: if self.zoom.is_finite() && self.zoom > 0.0 {
                self.zoom
            } else {
                1.0
            },
            rotation: finite_or(self.rotation, 0.0),
            brightness: if self.brightness.is_finite() && self.brightness >= 0.0 {
                self.brightness
            } else {
                1.0
            },
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, PartialEq, Setters)]
#[serde(default)]
#[must_use]
pub struct Entry {
    /// URI or path of the video to play
    #[setters(strip_option)]
    pub source: Option<String>,
    /// whether the audio track should be audible
    pub audio: bool,
    pub playback_mode: PlaybackMode,
    pub scaling_mode: ScalingMode,
    pub transform: Transform,
    pub status_bar_color: StatusBarColor,
    /// set while a settings front end previews the wallpaper
    pub preview: bool,
}

impl Entry {
    /// The configured source, treating an empty string as unset.
    #[must_use]
    pub fn source_uri(&self) -> Option<&str> {
        self.source
            .as_deref()
            .map(str::trim)
            .filter(|source| !source.is_empty())
    }

    pub fn sanitized(mut self) -> Self {
        self.transform = self.transform.sanitized();
        self
    }
}

/// File-backed configuration store.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    /// `$XDG_CONFIG_HOME/vidpaper/config.ron`
    ///
    /// # Errors
    ///
    /// Fails if the platform has no configuration directory.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::config_dir()
            .map(|dir| dir.join(NAME).join(CONFIG_FILE))
            .ok_or(ConfigError::NoConfigDir)
    }

    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored entry. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read or parsed.
    pub fn try_load(&self) -> Result<Entry, ConfigError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(why) if why.kind() == io::ErrorKind::NotFound => return Ok(Entry::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        ron::from_str::<Entry>(&text)
            .map(Entry::sanitized)
            .map_err(|source| ConfigError::Parse {
                path: self.path.clone(),
                source,
            })
    }

    /// Read the stored entry, falling back to defaults on any error.
    pub fn load(&self) -> Entry {
        self.try_load().unwrap_or_else(|why| {
            tracing::error!(%why, "config unreadable, falling back to defaults");
            Entry::default()
        })
    }

    /// Write the entry, replacing the file atomically.
    ///
    /// # Errors
    ///
    /// Fails if the entry cannot be serialized or the file cannot be written.
    pub fn save(&self, entry: &Entry) -> Result<(), ConfigError> {
        let text = ron::ser::to_string_pretty(entry, ron::ser::PrettyConfig::default())?;

        let io_err = |source| ConfigError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let tmp = self.path.with_extension("ron.tmp");
        fs::write(&tmp, text).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }

    /// Forget the configured video so a broken source is not retried forever.
    ///
    /// # Errors
    ///
    /// Fails if the current file cannot be read or parsed, in which case
    /// nothing is written, or if the updated entry cannot be written.
    pub fn clear_source(&self) -> Result<(), ConfigError> {
        let mut entry = self.try_load()?;
        if entry.source.is_none() {
            return Ok(());
        }
        entry.source = None;
        self.save(&entry)
    }

    /// Point the wallpaper at a new video, e.g. the output of a trim job.
    ///
    /// # Errors
    ///
    /// Fails if the current file cannot be read or parsed, in which case
    /// nothing is written, or if the updated entry cannot be written.
    pub fn set_source(&self, source: impl Into<String>) -> Result<(), ConfigError> {
        let entry = self.try_load()?.source(source.into());
        self.save(&entry)
    }
}
