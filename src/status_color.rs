// SPDX-License-Identifier: MPL-2.0

//! Color hint for system UI drawn over the wallpaper.

use vidpaper_config::StatusBarColor;

/// Colors advertised to the system so its text stays legible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorHint {
    pub primary: [u8; 3],
    pub secondary: [u8; 3],
    /// The wallpaper is light enough for dark text on top.
    pub supports_dark_text: bool,
}

const DARK: ColorHint = ColorHint {
    primary: [0x00, 0x00, 0x00],
    secondary: [0x20, 0x20, 0x20],
    supports_dark_text: false,
};

const LIGHT: ColorHint = ColorHint {
    primary: [0xff, 0xff, 0xff],
    secondary: [0xe0, 0xe0, 0xe0],
    supports_dark_text: true,
};

/// `None` leaves sampling the wallpaper to the platform.
#[must_use]
pub fn color_hint(preference: StatusBarColor) -> Option<ColorHint> {
    match preference {
        StatusBarColor::Auto => None,
        StatusBarColor::Dark => Some(DARK),
        StatusBarColor::Light => Some(LIGHT),
    }
}
