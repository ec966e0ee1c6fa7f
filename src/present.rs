//! Downstream presenter API
//!
//! [`Presenter`] is what a device layer talks to: one per swap chain. It
//! resolves host windows to X drawables, applies the present parameters
//! (interval, swap effect, fullscreen mode) and forwards to the
//! [`PresentationSession`] underneath.
//!
//! Entry points added after the first API revision are gated by
//! [`ApiVersion`]; calling one above the configured level is an
//! [`PresentError::InvalidCall`].

use crate::buffer::{BufferDescriptor, BufferId};
use crate::config::{PresentConfig, VblankMode};
use crate::drawable::{DrawableCache, DrawableInfo};
use crate::error::{PresentError, Result};
use crate::fullscreen::{FullscreenController, FullscreenSettings, WindowProcRegistry};
use crate::host::{CursorImage, DisplayMode, GammaRamp, WindowHandle, WindowHost};
use crate::protocol::{PresentConnection, PresentRegions, Rect};
use crate::scheduler::SubmitParams;
use crate::session::{DrainSettings, PresentationSession, SessionStats};
use bitflags::bitflags;
use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blanking lines assumed below the visible area.
const VBLANK_LINES: u64 = 20;

/// How often to present, in display refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PresentInterval {
    #[default]
    Default,
    Immediate,
    One,
    Two,
    Three,
    Four,
}

impl PresentInterval {
    pub fn frames(self) -> u32 {
        match self {
            Self::Immediate => 0,
            Self::Default | Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SwapEffect {
    #[default]
    Discard,
    Flip,
    /// Back buffer contents must survive the present; never page-flip.
    Copy,
}

/// Swap chain parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentParameters {
    pub backbuffer_width: u32,
    pub backbuffer_height: u32,
    pub windowed: bool,
    pub device_window: Option<WindowHandle>,
    /// Fullscreen only; 0 lets the driver pick.
    pub fullscreen_refresh_rate: u32,
    pub interval: PresentInterval,
    pub swap_effect: SwapEffect,
    /// Leave the device window alone (no minimize on focus loss).
    pub no_window_changes: bool,
}

impl Default for PresentParameters {
    fn default() -> Self {
        Self {
            backbuffer_width: 0,
            backbuffer_height: 0,
            windowed: true,
            device_window: None,
            fullscreen_refresh_rate: 0,
            interval: PresentInterval::Default,
            swap_effect: SwapEffect::Discard,
            no_window_changes: false,
        }
    }
}

bitflags! {
    /// Per-present flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentFlags: u32 {
        /// Fail with `WasStillDrawing` instead of erroring on a busy buffer.
        const DONOTWAIT = 0x0000_0001;
        /// Present right away, ignoring the interval.
        const FORCEIMMEDIATE = 0x0000_0100;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    /// `is_buffer_released`, `wait_buffer_release_event`
    pub const RELEASE_QUERIES: u32 = 1;
    /// `get_window_occluded`, `resolution_mismatch`
    pub const OCCLUSION: u32 = 2;
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RasterStatus {
    pub in_vblank: bool,
    pub scanline: u32,
}

/// Estimate the beam position `elapsed` into the display's life.
pub fn raster_status(elapsed: Duration, mode: DisplayMode) -> RasterStatus {
    let refresh = if mode.refresh_rate == 0 {
        60
    } else {
        u64::from(mode.refresh_rate)
    };
    let height = u64::from(mode.height);
    let frame_ns = 1_000_000_000u64 / refresh;
    let line_ns = (frame_ns / (height + VBLANK_LINES)).max(1);

    let into_frame = (elapsed.as_nanos() % u128::from(frame_ns)) as u64;
    let line = into_frame / line_ns;
    if line >= height {
        RasterStatus {
            in_vblank: true,
            scanline: 0,
        }
    } else {
        RasterStatus {
            in_vblank: false,
            scanline: line as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowInfo {
    pub width: u32,
    pub height: u32,
    pub depth: u8,
}

/// Host-side services shared by every presenter in the process.
#[derive(Clone)]
pub struct HostContext {
    pub host: Arc<dyn WindowHost>,
    pub registry: Arc<WindowProcRegistry>,
    pub drawables: Arc<DrawableCache>,
}

impl HostContext {
    pub fn new(host: Arc<dyn WindowHost>) -> Self {
        Self {
            host,
            registry: Arc::new(WindowProcRegistry::new()),
            drawables: Arc::new(DrawableCache::new()),
        }
    }
}

pub struct Presenter {
    session: PresentationSession,
    context: HostContext,
    fullscreen: FullscreenController,
    params: Mutex<PresentParameters>,
    vblank_mode: VblankMode,
    api_minor: u32,
    epoch: Instant,
}

impl Presenter {
    /// Create a presenter on its own connection and apply `params`.
    pub fn new(
        conn: Box<dyn PresentConnection>,
        context: HostContext,
        config: &PresentConfig,
        params: PresentParameters,
        ex: bool,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PresentError::invalid_call(format!("configuration: {:#}", e)))?;

        let fullscreen = FullscreenController::new(
            Arc::clone(&context.host),
            Arc::clone(&context.registry),
            Arc::clone(&context.drawables),
            FullscreenSettings::from(&config.fullscreen),
            ex,
        );
        let presenter = Self {
            session: PresentationSession::new(conn, DrainSettings::from(&config.present)),
            context,
            fullscreen,
            params: Mutex::new(PresentParameters::default()),
            vblank_mode: config.present.vblank_mode,
            api_minor: config.present.api_minor,
            epoch: Instant::now(),
        };
        presenter.set_present_parameters(params)?;
        info!("✅ Presenter ready (API {})", presenter.api_version());
        Ok(presenter)
    }

    pub fn api_version(&self) -> ApiVersion {
        ApiVersion {
            major: 1,
            minor: self.api_minor,
        }
    }

    fn require(&self, minor: u32, call: &str) -> Result<()> {
        if self.api_minor < minor {
            error!("{} needs API 1.{}, presenter is {}", call, minor, self.api_version());
            return Err(PresentError::invalid_call(format!("{} not available", call)));
        }
        Ok(())
    }

    /// Apply new swap chain parameters, switching display mode if needed.
    pub fn set_present_parameters(&self, params: PresentParameters) -> Result<()> {
        if params.windowed {
            if params.fullscreen_refresh_rate != 0 {
                error!("Refresh rate {} requested in windowed mode", params.fullscreen_refresh_rate);
                return Err(PresentError::invalid_call("refresh rate in windowed mode"));
            }
            if self.fullscreen.is_fullscreen() {
                self.fullscreen.leave_fullscreen();
            }
        } else {
            let window = params
                .device_window
                .ok_or_else(|| PresentError::invalid_call("fullscreen without a device window"))?;
            let mode = DisplayMode::new(
                params.backbuffer_width,
                params.backbuffer_height,
                params.fullscreen_refresh_rate,
            );
            self.fullscreen
                .enter_fullscreen(window, mode, params.no_window_changes)?;
            // The window may have been resized or restyled.
            self.context.drawables.refresh(self.context.host.as_ref(), window);
        }

        debug!(
            "Present parameters: {}x{} windowed={} interval={:?} swap={:?}",
            params.backbuffer_width,
            params.backbuffer_height,
            params.windowed,
            params.interval,
            params.swap_effect
        );
        *self.params.lock() = params;
        Ok(())
    }

    pub fn present_parameters(&self) -> PresentParameters {
        self.params.lock().clone()
    }

    pub fn buffer_from_descriptor(&self, descriptor: BufferDescriptor) -> Result<BufferId> {
        self.session.create_buffer(descriptor)
    }

    /// Returns `true` if the buffer was freed right away, `false` if deferred.
    pub fn destroy_buffer(&self, id: BufferId) -> Result<bool> {
        self.session.try_release(id)
    }

    pub fn wait_buffer_released(&self, id: BufferId) -> Result<()> {
        self.session.wait_released(id)
    }

    fn resolve(&self, window: Option<WindowHandle>) -> Result<Arc<DrawableInfo>> {
        let window = window
            .or(self.params.lock().device_window)
            .ok_or_else(|| PresentError::invalid_call("no target window"))?;
        self.context
            .drawables
            .get(self.context.host.as_ref(), window)
            .ok_or_else(|| {
                error!("Window {} has no X drawable", window);
                PresentError::invalid_call(format!("window {} has no drawable", window))
            })
    }

    /// Copy the device window's on-screen contents into `id`.
    pub fn front_buffer_copy(&self, id: BufferId) -> Result<()> {
        let info = self.resolve(None)?;
        self.session.copy_window_to_buffer(info.drawable, id)
    }

    /// Show `id` on `window` (or the device window).
    pub fn present_buffer(
        &self,
        id: BufferId,
        window: Option<WindowHandle>,
        src: Option<Rect>,
        dst: Option<Rect>,
        dirty: Option<&[Rect]>,
        flags: PresentFlags,
    ) -> Result<()> {
        let info = self.resolve(window)?;
        let (interval, swap_effect) = {
            let params = self.params.lock();
            (params.interval, params.swap_effect)
        };

        if flags.contains(PresentFlags::DONOTWAIT) && !self.session.is_released(id)? {
            return Err(PresentError::WasStillDrawing);
        }

        let immediate =
            flags.contains(PresentFlags::FORCEIMMEDIATE) || interval == PresentInterval::Immediate;
        let frames = if immediate {
            0
        } else {
            self.vblank_mode.apply(interval.frames())
        };
        let submit = SubmitParams {
            interval: frames,
            async_present: immediate,
            force_copy: swap_effect == SwapEffect::Copy,
            regions: PresentRegions::from_rects(src, dst, dirty),
        };

        self.session.prepare(info.drawable, id)?;
        self.session.submit(info.drawable, id, &submit)
    }

    pub fn get_raster_status(&self) -> RasterStatus {
        raster_status(self.epoch.elapsed(), self.context.host.current_display_mode())
    }

    pub fn get_display_mode(&self) -> DisplayMode {
        self.context.host.current_display_mode()
    }

    pub fn get_cursor_pos(&self) -> (i32, i32) {
        self.context.host.cursor_pos()
    }

    pub fn set_cursor_pos(&self, x: i32, y: i32) -> Result<()> {
        if self.context.host.set_cursor_pos(x, y) {
            Ok(())
        } else {
            Err(PresentError::internal("cursor position rejected"))
        }
    }

    /// Install a new cursor image (or keep the current one) and set visibility.
    pub fn set_cursor(&self, image: Option<CursorImage>, show: bool) -> Result<()> {
        if let Some(image) = &image {
            let expected = image.width as usize * image.height as usize;
            if image.pixels.len() != expected {
                return Err(PresentError::invalid_call(format!(
                    "cursor has {} pixels, expected {}",
                    image.pixels.len(),
                    expected
                )));
            }
        }
        if self.context.host.set_cursor(image, show) {
            Ok(())
        } else {
            Err(PresentError::internal("cursor rejected"))
        }
    }

    pub fn set_gamma_ramp(&self, ramp: &GammaRamp, window: Option<WindowHandle>) -> Result<()> {
        let window = window
            .or(self.params.lock().device_window)
            .ok_or_else(|| PresentError::invalid_call("no target window"))?;
        if self.context.host.set_gamma_ramp(window, ramp) {
            Ok(())
        } else {
            Err(PresentError::internal("gamma ramp rejected"))
        }
    }

    /// Size and depth of `window` (or the device window).
    pub fn get_window_info(&self, window: Option<WindowHandle>) -> Result<WindowInfo> {
        let info = self.resolve(window)?;
        if self.session.window() == Some(info.drawable) {
            let geometry = self.session.geometry();
            return Ok(WindowInfo {
                width: geometry.width,
                height: geometry.height,
                depth: geometry.depth,
            });
        }
        Ok(WindowInfo {
            width: info.width,
            height: info.height,
            depth: info.depth,
        })
    }

    pub fn is_buffer_released(&self, id: BufferId) -> Result<bool> {
        self.require(ApiVersion::RELEASE_QUERIES, "is_buffer_released")?;
        self.session.is_released(id)
    }

    pub fn wait_buffer_release_event(&self) -> Result<()> {
        self.require(ApiVersion::RELEASE_QUERIES, "wait_buffer_release_event")?;
        self.session.wait_any_idle_event()
    }

    pub fn get_window_occluded(&self) -> Result<bool> {
        self.require(ApiVersion::OCCLUSION, "get_window_occluded")?;
        Ok(self.fullscreen.is_occluded())
    }

    pub fn resolution_mismatch(&self) -> Result<bool> {
        self.require(ApiVersion::OCCLUSION, "resolution_mismatch")?;
        Ok(self.fullscreen.resolution_mismatch())
    }

    pub fn stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn session(&self) -> &PresentationSession {
        &self.session
    }
}

impl Drop for Presenter {
    fn drop(&mut self) {
        self.session.destroy();
        self.fullscreen.teardown();
        if let Some(window) = self.params.get_mut().device_window {
            self.context.drawables.invalidate(window);
        }
        debug!("Presenter dropped");
    }
}
