//! Host window system services
//!
//! The presentation engine runs inside a process that owns a Win32-style
//! window manager layer: display modes, window styles, cursor and gamma all
//! live there. [`WindowHost`] is the seam to that layer.

use crate::drawable::DrawableInfo;
use crate::error::Result;
use crate::protocol::Rect;
use bitflags::bitflags;

/// Opaque host window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowHandle(pub u64);

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A display mode; refresh 0 means "driver default".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

impl DisplayMode {
    pub fn new(width: u32, height: u32, refresh_rate: u32) -> Self {
        Self {
            width,
            height,
            refresh_rate,
        }
    }

    /// Same mode with an unspecified refresh rate.
    pub fn without_refresh(self) -> Self {
        Self {
            refresh_rate: 0,
            ..self
        }
    }
}

bitflags! {
    /// Window style bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Style: u32 {
        const POPUP = 0x8000_0000;
        const VISIBLE = 0x1000_0000;
        const CAPTION = 0x00C0_0000;
        const BORDER = 0x0080_0000;
        const DLGFRAME = 0x0040_0000;
        const SYSMENU = 0x0008_0000;
        const THICKFRAME = 0x0004_0000;
    }
}

bitflags! {
    /// Extended window style bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExStyle: u32 {
        const TOPMOST = 0x0000_0008;
        const WINDOWEDGE = 0x0000_0100;
        const CLIENTEDGE = 0x0000_0200;
    }
}

/// Style and extended style of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WindowStyle {
    pub style: Style,
    pub ex_style: ExStyle,
}

impl WindowStyle {
    pub fn new(style: Style, ex_style: ExStyle) -> Self {
        Self { style, ex_style }
    }

    /// Build from raw bits, keeping bits we have no name for.
    pub fn from_bits(style: u32, ex_style: u32) -> Self {
        Self {
            style: Style::from_bits_retain(style),
            ex_style: ExStyle::from_bits_retain(ex_style),
        }
    }

    /// Borderless, always-on-top popup version of this style.
    pub fn fullscreen(self) -> Self {
        Self {
            style: (self.style | Style::POPUP | Style::SYSMENU) - (Style::CAPTION | Style::THICKFRAME),
            ex_style: (self.ex_style | ExStyle::TOPMOST)
                - (ExStyle::WINDOWEDGE | ExStyle::CLIENTEDGE),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowCommand {
    Minimize,
    Restore,
    ShowNoActivate,
}

/// A hardware cursor image, 32-bit ARGB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hotspot: (u32, u32),
    pub pixels: Vec<u32>,
}

/// Per-channel gamma lookup table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GammaRamp {
    pub red: [u16; 256],
    pub green: [u16; 256],
    pub blue: [u16; 256],
}

impl GammaRamp {
    pub fn identity() -> Self {
        let mut channel = [0u16; 256];
        for (i, value) in channel.iter_mut().enumerate() {
            *value = (i as u16) * 257;
        }
        Self {
            red: channel,
            green: channel,
            blue: channel,
        }
    }
}

impl Default for GammaRamp {
    fn default() -> Self {
        Self::identity()
    }
}

/// Services provided by the host window system.
#[cfg_attr(test, mockall::automock)]
pub trait WindowHost: Send + Sync {
    /// Resolve a host window to the X drawable behind it.
    fn drawable_info(&self, window: WindowHandle) -> Option<DrawableInfo>;

    fn current_display_mode(&self) -> DisplayMode;

    /// Mode stored in the registry as the user's desktop mode.
    fn registry_display_mode(&self) -> DisplayMode;

    fn change_display_mode(&self, mode: DisplayMode) -> Result<()>;

    fn window_style(&self, window: WindowHandle) -> WindowStyle;

    fn set_window_style(&self, window: WindowHandle, style: WindowStyle);

    fn set_window_pos(&self, window: WindowHandle, rect: Rect, topmost: bool);

    fn show_window(&self, window: WindowHandle, command: ShowCommand);

    fn cursor_pos(&self) -> (i32, i32);

    fn set_cursor_pos(&self, x: i32, y: i32) -> bool;

    /// Install `image` as the cursor (or keep the current one) and show or hide it.
    fn set_cursor(&self, image: Option<CursorImage>, show: bool) -> bool;

    fn set_gamma_ramp(&self, window: WindowHandle, ramp: &GammaRamp) -> bool;
}
