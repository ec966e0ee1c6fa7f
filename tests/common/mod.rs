//! Simulated X server and host window system for integration tests.
//!
//! `SimServer` answers presents synchronously: in flip mode a present
//! completes as a flip and idles whatever was on screen before, in copy mode
//! it completes and idles right away. With `hold_presents` presents stay
//! unanswered until a `NotifyMSC` at or past their target arrives.

#![allow(dead_code)]

use ninepresent::{
    CompleteKind, CompleteMode, CursorImage, DisplayMode, DrawableInfo, GammaRamp, Geometry,
    PresentConnection, PresentEvent, PresentOptions, PresentRequest, ProtocolError, Rect,
    ShowCommand, WindowHandle, WindowHost, WindowStyle, Xid,
};
use ninepresent::{BufferDescriptor, Style};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// A dma-buf stand-in backed by /dev/null.
pub fn descriptor(width: u16, height: u16, depth: u8) -> BufferDescriptor {
    let file = File::open("/dev/null").expect("open /dev/null");
    BufferDescriptor {
        fd: OwnedFd::from(file),
        width,
        height,
        stride: width * 4,
        depth,
        bpp: 32,
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    window: Xid,
    serial: u32,
    pixmap: Xid,
    target_msc: u64,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: Xid,
    windows: HashMap<Xid, Geometry>,
    pixmaps: HashMap<Xid, Geometry>,
    /// event id -> window
    contexts: HashMap<Xid, Xid>,
    queue: VecDeque<PresentEvent>,
    flip: bool,
    hold: bool,
    msc: u64,
    /// Flipped pixmap currently scanned out, per window.
    on_screen: HashMap<Xid, (u32, Xid)>,
    pending: Vec<Pending>,
    presents: Vec<PresentRequest>,
    notifies: usize,
}

impl SimState {
    fn alloc(&mut self) -> Xid {
        self.next_id += 1;
        0x0040_0000 + self.next_id
    }

    fn emit(&mut self, window: Xid, make: impl Fn(Xid) -> PresentEvent) {
        let mut ids: Vec<Xid> = self
            .contexts
            .iter()
            .filter(|(_, w)| **w == window)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        for id in ids {
            self.queue.push_back(make(id));
        }
    }

    fn complete(&mut self, window: Xid, serial: u32, kind: CompleteKind, mode: CompleteMode) {
        let msc = self.msc;
        self.emit(window, |event_id| PresentEvent::Complete {
            event_id,
            window,
            serial,
            kind,
            mode,
            ust: msc * 16_667,
            msc,
        });
    }

    fn idle(&mut self, window: Xid, serial: u32, pixmap: Xid) {
        self.emit(window, |event_id| PresentEvent::Idle {
            event_id,
            window,
            serial,
            pixmap,
        });
    }

    fn answer(&mut self, present: Pending, copy: bool) {
        self.msc = self.msc.max(present.target_msc).max(1);
        if self.flip && !copy {
            self.complete(present.window, present.serial, CompleteKind::Pixmap, CompleteMode::Flip);
            if let Some((serial, pixmap)) = self
                .on_screen
                .insert(present.window, (present.serial, present.pixmap))
            {
                if pixmap != present.pixmap {
                    self.idle(present.window, serial, pixmap);
                }
            }
        } else {
            self.complete(present.window, present.serial, CompleteKind::Pixmap, CompleteMode::Copy);
            self.idle(present.window, present.serial, present.pixmap);
            if let Some((serial, pixmap)) = self.on_screen.remove(&present.window) {
                if pixmap != present.pixmap {
                    self.idle(present.window, serial, pixmap);
                }
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct SimServer {
    state: Arc<Mutex<SimState>>,
}

impl SimServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete non-copy presents as page flips.
    pub fn flipping() -> Self {
        let server = Self::default();
        server.state.lock().flip = true;
        server
    }

    pub fn hold_presents(&self, hold: bool) {
        self.state.lock().hold = hold;
    }

    pub fn create_window(&self, width: u32, height: u32) -> Xid {
        let mut state = self.state.lock();
        let window = state.alloc();
        state.windows.insert(
            window,
            Geometry {
                x: 0,
                y: 0,
                width,
                height,
                depth: 24,
            },
        );
        window
    }

    pub fn resize_window(&self, window: Xid, width: u32, height: u32) {
        let mut state = self.state.lock();
        if let Some(geometry) = state.windows.get_mut(&window) {
            geometry.width = width;
            geometry.height = height;
        }
        state.emit(window, |event_id| PresentEvent::Configure {
            event_id,
            window,
            x: 0,
            y: 0,
            width,
            height,
        });
    }

    pub fn presents(&self) -> Vec<PresentRequest> {
        self.state.lock().presents.clone()
    }

    pub fn live_pixmaps(&self) -> usize {
        self.state.lock().pixmaps.len()
    }

    pub fn selected_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub fn notifies(&self) -> usize {
        self.state.lock().notifies
    }
}

impl PresentConnection for SimServer {
    fn root(&self) -> Xid {
        1
    }

    fn drawable_geometry(&self, drawable: Xid) -> Result<Geometry, ProtocolError> {
        let state = self.state.lock();
        state
            .windows
            .get(&drawable)
            .or_else(|| state.pixmaps.get(&drawable))
            .copied()
            .ok_or(ProtocolError::BadWindow(drawable))
    }

    fn pixmap_from_buffer(
        &self,
        _drawable: Xid,
        descriptor: BufferDescriptor,
    ) -> Result<Xid, ProtocolError> {
        let mut state = self.state.lock();
        let pixmap = state.alloc();
        state.pixmaps.insert(
            pixmap,
            Geometry {
                x: 0,
                y: 0,
                width: u32::from(descriptor.width),
                height: u32::from(descriptor.height),
                depth: descriptor.depth,
            },
        );
        Ok(pixmap)
    }

    fn free_pixmap(&self, pixmap: Xid) -> Result<(), ProtocolError> {
        self.state.lock().pixmaps.remove(&pixmap);
        Ok(())
    }

    fn select_input(&self, window: Xid) -> Result<Xid, ProtocolError> {
        let mut state = self.state.lock();
        if !state.windows.contains_key(&window) {
            return Err(ProtocolError::BadWindow(window));
        }
        let event_id = state.alloc();
        state.contexts.insert(event_id, window);
        Ok(event_id)
    }

    fn deselect_input(&self, event_id: Xid, _window: Xid) -> Result<(), ProtocolError> {
        self.state.lock().contexts.remove(&event_id);
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        if !state.windows.contains_key(&request.window) {
            return Err(ProtocolError::BadWindow(request.window));
        }
        state.presents.push(request.clone());
        let present = Pending {
            window: request.window,
            serial: request.serial,
            pixmap: request.pixmap,
            target_msc: request.target_msc,
        };
        if state.hold {
            state.pending.push(present);
        } else {
            state.answer(present, request.options.contains(PresentOptions::COPY));
        }
        Ok(())
    }

    fn notify_msc(&self, window: Xid, serial: u32, target_msc: u64) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state.notifies += 1;

        let (due, later): (Vec<Pending>, Vec<Pending>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|p| p.window == window && p.target_msc <= target_msc);
        state.pending = later;
        for present in due {
            state.answer(present, true);
        }

        state.msc = state.msc.max(target_msc);
        state.complete(window, serial, CompleteKind::NotifyMsc, CompleteMode::Copy);
        Ok(())
    }

    fn copy_area(&self, src: Xid, dst: Xid, _width: u32, _height: u32) -> Result<(), ProtocolError> {
        let state = self.state.lock();
        if !state.windows.contains_key(&src) || !state.pixmaps.contains_key(&dst) {
            return Err(ProtocolError::Request("CopyArea on unknown drawable".into()));
        }
        Ok(())
    }

    fn poll_event(&self) -> Result<Option<PresentEvent>, ProtocolError> {
        Ok(self.state.lock().queue.pop_front())
    }

    fn wait_event(&self) -> Result<PresentEvent, ProtocolError> {
        self.state
            .lock()
            .queue
            .pop_front()
            .ok_or_else(|| ProtocolError::ConnectionLost("simulated server went quiet".into()))
    }

    fn flush(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[derive(Debug)]
struct HostState {
    drawables: HashMap<WindowHandle, DrawableInfo>,
    styles: HashMap<WindowHandle, WindowStyle>,
    current_mode: DisplayMode,
    registry_mode: DisplayMode,
    mode_changes: Vec<DisplayMode>,
    shown: Vec<(WindowHandle, ShowCommand)>,
    cursor: (i32, i32),
    cursor_visible: bool,
    gamma_windows: Vec<WindowHandle>,
}

/// Host window system with a fixed desktop mode.
pub struct SimHost {
    state: Mutex<HostState>,
}

impl SimHost {
    pub fn new(desktop: DisplayMode) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HostState {
                drawables: HashMap::new(),
                styles: HashMap::new(),
                current_mode: desktop,
                registry_mode: desktop,
                mode_changes: Vec::new(),
                shown: Vec::new(),
                cursor: (0, 0),
                cursor_visible: false,
                gamma_windows: Vec::new(),
            }),
        })
    }

    /// Map a host window onto an X window of the simulated server.
    pub fn add_window(&self, handle: u64, drawable: Xid, width: u32, height: u32) -> WindowHandle {
        let window = WindowHandle(handle);
        let mut state = self.state.lock();
        state.drawables.insert(
            window,
            DrawableInfo {
                window,
                drawable,
                device_context: handle << 4,
                window_rect: Rect::new(0, 0, width, height),
                client_offset: (0, 0),
                width,
                height,
                depth: 24,
            },
        );
        state.styles.insert(
            window,
            WindowStyle::new(Style::VISIBLE | Style::CAPTION | Style::THICKFRAME, Default::default()),
        );
        window
    }

    pub fn current_mode(&self) -> DisplayMode {
        self.state.lock().current_mode
    }

    pub fn mode_changes(&self) -> Vec<DisplayMode> {
        self.state.lock().mode_changes.clone()
    }

    pub fn style(&self, window: WindowHandle) -> WindowStyle {
        self.state.lock().styles.get(&window).copied().unwrap_or_default()
    }

    pub fn shown(&self) -> Vec<(WindowHandle, ShowCommand)> {
        self.state.lock().shown.clone()
    }

    pub fn cursor_visible(&self) -> bool {
        self.state.lock().cursor_visible
    }

    pub fn gamma_windows(&self) -> Vec<WindowHandle> {
        self.state.lock().gamma_windows.clone()
    }
}

impl WindowHost for SimHost {
    fn drawable_info(&self, window: WindowHandle) -> Option<DrawableInfo> {
        self.state.lock().drawables.get(&window).cloned()
    }

    fn current_display_mode(&self) -> DisplayMode {
        self.state.lock().current_mode
    }

    fn registry_display_mode(&self) -> DisplayMode {
        self.state.lock().registry_mode
    }

    fn change_display_mode(&self, mode: DisplayMode) -> ninepresent::Result<()> {
        let mut state = self.state.lock();
        state.current_mode = mode;
        state.mode_changes.push(mode);
        Ok(())
    }

    fn window_style(&self, window: WindowHandle) -> WindowStyle {
        self.state.lock().styles.get(&window).copied().unwrap_or_default()
    }

    fn set_window_style(&self, window: WindowHandle, style: WindowStyle) {
        self.state.lock().styles.insert(window, style);
    }

    fn set_window_pos(&self, _window: WindowHandle, _rect: Rect, _topmost: bool) {}

    fn show_window(&self, window: WindowHandle, command: ShowCommand) {
        self.state.lock().shown.push((window, command));
    }

    fn cursor_pos(&self) -> (i32, i32) {
        self.state.lock().cursor
    }

    fn set_cursor_pos(&self, x: i32, y: i32) -> bool {
        self.state.lock().cursor = (x, y);
        true
    }

    fn set_cursor(&self, _image: Option<CursorImage>, show: bool) -> bool {
        self.state.lock().cursor_visible = show;
        true
    }

    fn set_gamma_ramp(&self, window: WindowHandle, _ramp: &GammaRamp) -> bool {
        self.state.lock().gamma_windows.push(window);
        true
    }
}
