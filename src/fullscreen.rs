//! Fullscreen and display-mode control
//!
//! Going fullscreen means three things on the host side: switching the
//! display mode, turning the device window into a borderless topmost popup,
//! and reacting to focus and display changes while fullscreen. Window
//! messages reach the controller through a [`WindowProcRegistry`] shared by
//! every device in the process.
//!
//! Host calls are never made with the controller lock held: the host may
//! deliver window messages synchronously from inside them.

use crate::config::FullscreenSection;
use crate::drawable::DrawableCache;
use crate::error::{PresentError, Result};
use crate::host::{DisplayMode, ExStyle, ShowCommand, Style, WindowHandle, WindowHost, WindowStyle};
use crate::protocol::Rect;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Window messages the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMessage {
    Activate { active: bool },
    DisplayChange { width: u32, height: u32 },
    Destroy,
}

/// Receiver of window messages for registered windows.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, window: WindowHandle, message: WindowMessage);
}

/// Process-wide window → handler table.
///
/// Handlers are held weakly; a device going away without unregistering only
/// leaves a dead entry behind.
#[derive(Default)]
pub struct WindowProcRegistry {
    handlers: Mutex<HashMap<WindowHandle, Weak<dyn MessageHandler>>>,
}

impl WindowProcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `window` to `handler`.
    ///
    /// Returns `false` if a live handler already owns the window.
    pub fn register(&self, window: WindowHandle, handler: Weak<dyn MessageHandler>) -> bool {
        let mut handlers = self.handlers.lock();
        if let Some(existing) = handlers.get(&window) {
            if existing.strong_count() > 0 && !Weak::ptr_eq(existing, &handler) {
                warn!("Window {} already has a registered handler", window);
                return false;
            }
        }
        handlers.insert(window, handler);
        debug!("Registered window {}", window);
        true
    }

    pub fn unregister(&self, window: WindowHandle) -> bool {
        self.handlers.lock().remove(&window).is_some()
    }

    pub fn is_registered(&self, window: WindowHandle) -> bool {
        self.handlers.lock().contains_key(&window)
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }

    /// Deliver `message` for `window`; returns whether a handler saw it.
    pub fn dispatch(&self, window: WindowHandle, message: WindowMessage) -> bool {
        let handler = {
            let mut handlers = self.handlers.lock();
            let handler = handlers.get(&window).and_then(Weak::upgrade);
            if message == WindowMessage::Destroy || handler.is_none() {
                handlers.remove(&window);
            }
            handler
        };

        match handler {
            Some(handler) => {
                handler.handle_message(window, message);
                true
            }
            None => false,
        }
    }
}

impl Drop for WindowProcRegistry {
    fn drop(&mut self) {
        let handlers = self.handlers.get_mut();
        if !handlers.is_empty() {
            warn!(
                "Window registry dropped with {} windows still registered",
                handlers.len()
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullscreenSettings {
    /// Refresh rates above this are treated as unspecified.
    pub max_refresh_rate: u32,
    pub minimize_on_focus_loss: bool,
}

impl Default for FullscreenSettings {
    fn default() -> Self {
        Self {
            max_refresh_rate: 1000,
            minimize_on_focus_loss: true,
        }
    }
}

impl From<&FullscreenSection> for FullscreenSettings {
    fn from(section: &FullscreenSection) -> Self {
        Self {
            max_refresh_rate: section.max_refresh_rate,
            minimize_on_focus_loss: section.minimize_on_focus_loss,
        }
    }
}

#[derive(Debug, Default)]
struct FullscreenState {
    window: Option<WindowHandle>,
    fullscreen: bool,
    requested_mode: DisplayMode,
    /// Desktop mode before the first mode change; captured once.
    initial_mode: Option<DisplayMode>,
    saved_style: WindowStyle,
    applied_style: WindowStyle,
    no_window_changes: bool,
    occluded: bool,
    resolution_mismatch: bool,
}

struct FullscreenShared {
    host: Arc<dyn WindowHost>,
    settings: FullscreenSettings,
    /// Ex devices restore their own mode after a foreign display change.
    ex: bool,
    state: Mutex<FullscreenState>,
    /// Entries for destroyed windows are dropped here.
    drawables: Arc<DrawableCache>,
}

impl FullscreenShared {
    fn sanitize(&self, mode: DisplayMode) -> DisplayMode {
        if mode.refresh_rate > self.settings.max_refresh_rate {
            debug!(
                "Ignoring refresh rate {} above {}",
                mode.refresh_rate, self.settings.max_refresh_rate
            );
            mode.without_refresh()
        } else {
            mode
        }
    }

    /// Switch modes, retrying once without a refresh rate.
    fn apply_mode(&self, mode: DisplayMode) -> Result<()> {
        match self.host.change_display_mode(mode) {
            Ok(()) => Ok(()),
            Err(err) if mode.refresh_rate != 0 => {
                warn!(
                    "Mode {}x{}@{} rejected ({}), retrying without refresh rate",
                    mode.width, mode.height, mode.refresh_rate, err
                );
                self.host.change_display_mode(mode.without_refresh())
            }
            Err(err) => Err(err),
        }
    }

    fn restore_style(&self, window: WindowHandle, saved: WindowStyle, applied: WindowStyle) {
        let live = self.host.window_style(window);
        let ignore_style = Style::VISIBLE;
        let ignore_ex = ExStyle::TOPMOST;

        // Leave the style alone if the application changed it meanwhile.
        if live.style - ignore_style != applied.style - ignore_style
            || live.ex_style - ignore_ex != applied.ex_style - ignore_ex
        {
            debug!("Window {} style changed while fullscreen, not restoring", window);
            return;
        }

        let mut restored = saved;
        restored.style.set(Style::VISIBLE, live.style.contains(Style::VISIBLE));
        restored
            .ex_style
            .set(ExStyle::TOPMOST, live.ex_style.contains(ExStyle::TOPMOST));
        self.host.set_window_style(window, restored);
    }

    fn on_activate(&self, window: WindowHandle, active: bool) {
        let (requested, no_window_changes) = {
            let state = self.state.lock();
            if !state.fullscreen || state.window != Some(window) || state.occluded != active {
                return;
            }
            (state.requested_mode, state.no_window_changes)
        };

        if active {
            if let Err(err) = self.apply_mode(requested) {
                warn!("Failed to reapply fullscreen mode on activation: {}", err);
            }
            self.host.set_window_pos(
                window,
                Rect::new(0, 0, requested.width, requested.height),
                true,
            );
            self.host.show_window(window, ShowCommand::Restore);
            self.state.lock().occluded = false;
            debug!("Fullscreen window {} regained focus", window);
        } else {
            let desktop = self.host.registry_display_mode();
            if let Err(err) = self.host.change_display_mode(desktop) {
                warn!("Failed to restore desktop mode on focus loss: {}", err);
            }
            if self.settings.minimize_on_focus_loss && !no_window_changes {
                self.host.show_window(window, ShowCommand::Minimize);
            }
            self.state.lock().occluded = true;
            debug!("Fullscreen window {} lost focus", window);
        }
    }

    fn on_display_change(&self, width: u32, height: u32) {
        let reapply = {
            let mut state = self.state.lock();
            let differs = (width, height) != (state.requested_mode.width, state.requested_mode.height);
            if self.ex {
                state.resolution_mismatch = false;
                (state.fullscreen && !state.occluded && differs).then_some(state.requested_mode)
            } else {
                state.resolution_mismatch = state.fullscreen && differs;
                None
            }
        };

        if let Some(mode) = reapply {
            debug!("Display changed to {}x{}, restoring {}x{}", width, height, mode.width, mode.height);
            if let Err(err) = self.apply_mode(mode) {
                warn!("Failed to restore fullscreen mode: {}", err);
            }
        }
    }
}

impl MessageHandler for FullscreenShared {
    fn handle_message(&self, window: WindowHandle, message: WindowMessage) {
        match message {
            WindowMessage::Activate { active } => self.on_activate(window, active),
            WindowMessage::DisplayChange { width, height } => self.on_display_change(width, height),
            WindowMessage::Destroy => {
                self.drawables.invalidate(window);
                let mut state = self.state.lock();
                if state.window == Some(window) {
                    debug!("Device window {} destroyed", window);
                    state.window = None;
                    state.fullscreen = false;
                    state.occluded = false;
                }
            }
        }
    }
}

/// Per-device fullscreen state machine.
pub struct FullscreenController {
    shared: Arc<FullscreenShared>,
    registry: Arc<WindowProcRegistry>,
}

impl FullscreenController {
    pub fn new(
        host: Arc<dyn WindowHost>,
        registry: Arc<WindowProcRegistry>,
        drawables: Arc<DrawableCache>,
        settings: FullscreenSettings,
        ex: bool,
    ) -> Self {
        Self {
            shared: Arc::new(FullscreenShared {
                host,
                settings,
                ex,
                state: Mutex::new(FullscreenState::default()),
                drawables,
            }),
            registry,
        }
    }

    /// Take over `window` at `mode`.
    pub fn enter_fullscreen(
        &self,
        window: WindowHandle,
        mode: DisplayMode,
        no_window_changes: bool,
    ) -> Result<()> {
        if mode.width == 0 || mode.height == 0 {
            return Err(PresentError::invalid_call(format!(
                "fullscreen resolution {}x{}",
                mode.width, mode.height
            )));
        }
        let mode = self.shared.sanitize(mode);
        let host = &self.shared.host;

        let handler: Arc<dyn MessageHandler> = self.shared.clone();
        if !self.registry.register(window, Arc::downgrade(&handler)) {
            return Err(PresentError::invalid_call(format!(
                "window {} is owned by another device",
                window
            )));
        }

        let (previous, capture) = {
            let state = self.shared.state.lock();
            let previous = state.fullscreen.then_some(state.window).flatten();
            (previous, state.initial_mode.is_none())
        };
        if let Some(previous) = previous.filter(|w| *w != window) {
            self.leave_window(previous, false);
        }
        if capture {
            let initial = host.current_display_mode();
            debug!(
                "Desktop mode {}x{}@{} saved",
                initial.width, initial.height, initial.refresh_rate
            );
            self.shared.state.lock().initial_mode = Some(initial);
        }

        if let Err(err) = self.shared.apply_mode(mode) {
            if previous != Some(window) {
                self.registry.unregister(window);
            }
            return Err(err);
        }

        if previous != Some(window) {
            let saved = host.window_style(window);
            let applied = saved.fullscreen();
            host.set_window_style(window, applied);
            host.set_window_pos(window, Rect::new(0, 0, mode.width, mode.height), true);

            let mut state = self.shared.state.lock();
            state.saved_style = saved;
            state.applied_style = applied;
        }

        let mut state = self.shared.state.lock();
        state.window = Some(window);
        state.fullscreen = true;
        state.requested_mode = mode;
        state.no_window_changes = no_window_changes;
        state.occluded = false;
        state.resolution_mismatch = false;
        info!(
            "🖥️ Fullscreen on window {} at {}x{}@{}",
            window, mode.width, mode.height, mode.refresh_rate
        );
        Ok(())
    }

    /// Give the window back and restore the desktop mode.
    pub fn leave_fullscreen(&self) {
        let window = {
            let state = self.shared.state.lock();
            state.fullscreen.then_some(state.window).flatten()
        };
        if let Some(window) = window {
            self.leave_window(window, true);
        }
    }

    fn leave_window(&self, window: WindowHandle, restore_mode: bool) {
        let (saved, applied, initial) = {
            let mut state = self.shared.state.lock();
            state.fullscreen = false;
            state.occluded = false;
            state.resolution_mismatch = false;
            state.window = None;
            (state.saved_style, state.applied_style, state.initial_mode)
        };

        self.shared.restore_style(window, saved, applied);
        self.registry.unregister(window);

        if restore_mode {
            if let Some(initial) = initial {
                if let Err(err) = self.shared.host.change_display_mode(initial) {
                    warn!("Failed to restore desktop mode: {}", err);
                }
            }
        }
        debug!("Left fullscreen on window {}", window);
    }

    /// Final cleanup: restore the desktop mode no matter what happened.
    pub fn teardown(&self) {
        let (window, fullscreen, initial) = {
            let state = self.shared.state.lock();
            (state.window, state.fullscreen, state.initial_mode)
        };

        if let (true, Some(window)) = (fullscreen, window) {
            self.leave_window(window, true);
        } else {
            if let Some(window) = window {
                self.registry.unregister(window);
            }
            if let Some(initial) = initial {
                if let Err(err) = self.shared.host.change_display_mode(initial) {
                    warn!("Failed to restore desktop mode at teardown: {}", err);
                }
            }
        }
    }

    pub fn is_fullscreen(&self) -> bool {
        self.shared.state.lock().fullscreen
    }

    pub fn is_occluded(&self) -> bool {
        self.shared.state.lock().occluded
    }

    pub fn resolution_mismatch(&self) -> bool {
        self.shared.state.lock().resolution_mismatch
    }

    pub fn initial_mode(&self) -> Option<DisplayMode> {
        self.shared.state.lock().initial_mode
    }

    pub fn requested_mode(&self) -> Option<DisplayMode> {
        let state = self.shared.state.lock();
        state.fullscreen.then_some(state.requested_mode)
    }

    pub fn window(&self) -> Option<WindowHandle> {
        self.shared.state.lock().window
    }
}
