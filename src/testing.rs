//! Simulated Present server for unit tests
//!
//! [`FakeServer`] implements [`PresentConnection`] in memory. Windows and
//! pixmaps are plain map entries; presents are recorded and, depending on the
//! configured mode, answered with completion and idle events:
//! - manual (`set_auto_events(None)`, the default): nothing happens until a
//!   test injects events, except that a `NotifyMSC` first answers every
//!   present that is still unanswered and targets an earlier frame, the way a
//!   real server completes in MSC order;
//! - auto: every present is answered right away as a flip or a copy.
//!
//! With `hold_events(true)` generated events are only delivered once a thread
//! blocks in `wait_event`, which is how tests model time passing.

use crate::buffer::{BufferDescriptor, BufferId};
use crate::error::ProtocolError;
use crate::protocol::{
    CompleteKind, CompleteMode, Geometry, PresentConnection, PresentEvent, PresentOptions,
    PresentRequest, Xid,
};
use crate::session::{DrainSettings, PresentationSession};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

const ROOT: Xid = 0x100;

/// Descriptor backed by `/dev/null`; the fake never maps it.
pub(crate) fn descriptor(width: u16, height: u16, depth: u8) -> BufferDescriptor {
    let fd: OwnedFd = File::open("/dev/null")
        .expect("open /dev/null")
        .into();
    BufferDescriptor {
        fd,
        width,
        height,
        stride: width * 4,
        depth,
        bpp: 32,
    }
}

#[derive(Debug, Clone, Copy)]
struct Unanswered {
    window: Xid,
    serial: u32,
    pixmap: Xid,
    target_msc: u64,
    completed: bool,
}

#[derive(Default)]
struct ServerState {
    next_xid: Xid,
    windows: HashMap<Xid, Geometry>,
    pixmaps: HashMap<Xid, Geometry>,
    /// event id -> window
    contexts: HashMap<Xid, Xid>,
    select_calls: usize,
    queue: VecDeque<PresentEvent>,
    held: VecDeque<PresentEvent>,
    hold: bool,
    auto: Option<CompleteMode>,
    /// Flipped pixmap currently scanned out, per window.
    on_screen: HashMap<Xid, (u32, Xid)>,
    unanswered: Vec<Unanswered>,
    presents: Vec<PresentRequest>,
    notify_requests: usize,
    copies: usize,
    msc: u64,
    pixmap_size: Option<(u32, u32)>,
    fail_pixmap_geometry: bool,
    fail_next_present: bool,
    disconnected: bool,
    readers: usize,
    max_readers: usize,
}

impl ServerState {
    fn alloc(&mut self) -> Xid {
        self.next_xid += 1;
        ROOT + self.next_xid
    }

    fn context_for(&self, window: Xid) -> Xid {
        self.contexts
            .iter()
            .find(|(_, w)| **w == window)
            .map(|(eid, _)| *eid)
            .unwrap_or(0)
    }

    fn emit(&mut self, event: PresentEvent) {
        if self.hold {
            self.held.push_back(event);
        } else {
            self.queue.push_back(event);
        }
    }

    fn complete(&mut self, window: Xid, serial: u32, mode: CompleteMode, msc: u64) {
        let event_id = self.context_for(window);
        self.emit(PresentEvent::Complete {
            event_id,
            window,
            serial,
            kind: CompleteKind::Pixmap,
            mode,
            ust: msc * 16_667,
            msc,
        });
    }

    fn idle(&mut self, window: Xid, serial: u32, pixmap: Xid) {
        let event_id = self.context_for(window);
        self.emit(PresentEvent::Idle {
            event_id,
            window,
            serial,
            pixmap,
        });
    }

    /// Answer a present as the real server would in `mode`.
    fn answer(&mut self, request: &PresentRequest, mode: CompleteMode) {
        self.msc = self.msc.max(request.target_msc);
        let msc = self.msc;
        let window = request.window;
        let flip = mode == CompleteMode::Flip && !request.options.contains(PresentOptions::COPY);

        if flip {
            self.complete(window, request.serial, CompleteMode::Flip, msc);
            if let Some((serial, pixmap)) = self.on_screen.insert(window, (request.serial, request.pixmap)) {
                if pixmap != request.pixmap {
                    self.idle(window, serial, pixmap);
                }
            }
        } else {
            self.complete(window, request.serial, CompleteMode::Copy, msc);
            self.idle(window, request.serial, request.pixmap);
            if let Some((serial, pixmap)) = self.on_screen.remove(&window) {
                if pixmap != request.pixmap {
                    self.idle(window, serial, pixmap);
                }
            }
        }
    }
}

/// In-memory Present server; cheap to clone, clones share state.
#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    arrived: Arc<Condvar>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn session(&self) -> Arc<PresentationSession> {
        Arc::new(PresentationSession::new(
            Box::new(self.clone()),
            DrainSettings::default(),
        ))
    }

    pub(crate) fn create_window(&self, width: u32, height: u32, depth: u8) -> Xid {
        let mut state = self.state.lock();
        let window = state.alloc();
        state.windows.insert(
            window,
            Geometry {
                x: 0,
                y: 0,
                width,
                height,
                depth,
            },
        );
        window
    }

    /// Resize a window and send configure events to its listeners.
    pub(crate) fn resize_window(&self, window: Xid, width: u32, height: u32) {
        let mut state = self.state.lock();
        if let Some(geometry) = state.windows.get_mut(&window) {
            geometry.width = width;
            geometry.height = height;
        }
        let event_id = state.context_for(window);
        state.emit(PresentEvent::Configure {
            event_id,
            window,
            x: 0,
            y: 0,
            width,
            height,
        });
        self.arrived.notify_all();
    }

    pub(crate) fn set_auto_events(&self, mode: Option<CompleteMode>) {
        self.state.lock().auto = mode;
    }

    pub(crate) fn hold_events(&self, hold: bool) {
        let mut state = self.state.lock();
        state.hold = hold;
        if !hold {
            let held: Vec<_> = state.held.drain(..).collect();
            state.queue.extend(held);
            self.arrived.notify_all();
        }
    }

    pub(crate) fn override_pixmap_size(&self, size: Option<(u32, u32)>) {
        self.state.lock().pixmap_size = size;
    }

    pub(crate) fn fail_pixmap_geometry(&self, fail: bool) {
        self.state.lock().fail_pixmap_geometry = fail;
    }

    pub(crate) fn fail_next_present(&self) {
        self.state.lock().fail_next_present = true;
    }

    pub(crate) fn disconnect(&self) {
        self.state.lock().disconnected = true;
        self.arrived.notify_all();
    }

    pub(crate) fn push_event(&self, event: PresentEvent) {
        self.state.lock().queue.push_back(event);
        self.arrived.notify_all();
    }

    pub(crate) fn event_id_for(&self, window: Xid) -> Xid {
        self.state.lock().context_for(window)
    }

    /// Deliver the completion of the last present of `id`.
    pub(crate) fn inject_complete(&self, id: BufferId, mode: CompleteMode, msc: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state
            .unanswered
            .iter_mut()
            .rev()
            .find(|u| u.serial == id.serial() && !u.completed)
        else {
            panic!("no unanswered present for buffer {}", id.serial());
        };
        entry.completed = true;
        let window = entry.window;
        state.msc = state.msc.max(msc);
        let event_id = state.context_for(window);
        state.queue.push_back(PresentEvent::Complete {
            event_id,
            window,
            serial: id.serial(),
            kind: CompleteKind::Pixmap,
            mode,
            ust: msc * 16_667,
            msc,
        });
        self.arrived.notify_all();
    }

    /// Deliver the idle notification for the last present of `id`.
    pub(crate) fn inject_idle(&self, id: BufferId) {
        let mut state = self.state.lock();
        let Some(position) = state.unanswered.iter().rposition(|u| u.serial == id.serial()) else {
            panic!("no present recorded for buffer {}", id.serial());
        };
        let entry = state.unanswered.remove(position);
        if !entry.completed {
            // Idle before completion: keep the completion outstanding.
            state.unanswered.insert(position, Unanswered {
                pixmap: 0,
                ..entry
            });
        }
        let event_id = state.context_for(entry.window);
        state.queue.push_back(PresentEvent::Idle {
            event_id,
            window: entry.window,
            serial: entry.serial,
            pixmap: entry.pixmap,
        });
        self.arrived.notify_all();
    }

    pub(crate) fn presents(&self) -> Vec<PresentRequest> {
        self.state.lock().presents.clone()
    }

    pub(crate) fn live_pixmaps(&self) -> usize {
        self.state.lock().pixmaps.len()
    }

    pub(crate) fn select_count(&self) -> usize {
        self.state.lock().select_calls
    }

    pub(crate) fn selected_contexts(&self) -> usize {
        self.state.lock().contexts.len()
    }

    pub(crate) fn notify_requests(&self) -> usize {
        self.state.lock().notify_requests
    }

    pub(crate) fn copies(&self) -> usize {
        self.state.lock().copies
    }

    pub(crate) fn max_concurrent_readers(&self) -> usize {
        self.state.lock().max_readers
    }

    fn check_connected(state: &ServerState) -> Result<(), ProtocolError> {
        if state.disconnected {
            Err(ProtocolError::ConnectionLost("fake server gone".into()))
        } else {
            Ok(())
        }
    }
}

impl PresentConnection for FakeServer {
    fn root(&self) -> Xid {
        ROOT
    }

    fn drawable_geometry(&self, drawable: Xid) -> Result<Geometry, ProtocolError> {
        let state = self.state.lock();
        Self::check_connected(&state)?;
        if let Some(geometry) = state.windows.get(&drawable) {
            return Ok(*geometry);
        }
        if state.fail_pixmap_geometry {
            return Err(ProtocolError::Request("BadDrawable".into()));
        }
        state
            .pixmaps
            .get(&drawable)
            .copied()
            .ok_or(ProtocolError::BadWindow(drawable))
    }

    fn pixmap_from_buffer(
        &self,
        _drawable: Xid,
        descriptor: BufferDescriptor,
    ) -> Result<Xid, ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        let (width, height) = state
            .pixmap_size
            .unwrap_or((u32::from(descriptor.width), u32::from(descriptor.height)));
        let pixmap = state.alloc();
        state.pixmaps.insert(
            pixmap,
            Geometry {
                x: 0,
                y: 0,
                width,
                height,
                depth: descriptor.depth,
            },
        );
        Ok(pixmap)
    }

    fn free_pixmap(&self, pixmap: Xid) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        state
            .pixmaps
            .remove(&pixmap)
            .map(|_| ())
            .ok_or_else(|| ProtocolError::Request(format!("BadPixmap {:#x}", pixmap)))
    }

    fn select_input(&self, window: Xid) -> Result<Xid, ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        if !state.windows.contains_key(&window) {
            return Err(ProtocolError::BadWindow(window));
        }
        let event_id = state.alloc();
        state.contexts.insert(event_id, window);
        state.select_calls += 1;
        Ok(event_id)
    }

    fn deselect_input(&self, event_id: Xid, _window: Xid) -> Result<(), ProtocolError> {
        self.state.lock().contexts.remove(&event_id);
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        if std::mem::take(&mut state.fail_next_present) {
            return Err(ProtocolError::Request("BadMatch".into()));
        }
        if !state.windows.contains_key(&request.window) {
            return Err(ProtocolError::BadWindow(request.window));
        }
        state.presents.push(request.clone());

        match state.auto {
            Some(mode) => state.answer(request, mode),
            None => state.unanswered.push(Unanswered {
                window: request.window,
                serial: request.serial,
                pixmap: request.pixmap,
                target_msc: request.target_msc,
                completed: false,
            }),
        }
        self.arrived.notify_all();
        Ok(())
    }

    fn notify_msc(&self, window: Xid, serial: u32, target_msc: u64) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        state.notify_requests += 1;

        // Presents due before the notification complete first.
        let due: Vec<Unanswered> = state
            .unanswered
            .iter()
            .filter(|u| u.window == window && !u.completed && u.target_msc <= target_msc)
            .copied()
            .collect();
        state
            .unanswered
            .retain(|u| !(u.window == window && !u.completed && u.target_msc <= target_msc));
        for present in due {
            state.msc = state.msc.max(present.target_msc);
            let msc = state.msc;
            state.complete(window, present.serial, CompleteMode::Copy, msc);
            if present.pixmap != 0 {
                state.idle(window, present.serial, present.pixmap);
            }
        }

        state.msc = state.msc.max(target_msc);
        let msc = state.msc;
        let event_id = state.context_for(window);
        state.emit(PresentEvent::Complete {
            event_id,
            window,
            serial,
            kind: CompleteKind::NotifyMsc,
            mode: CompleteMode::Copy,
            ust: msc * 16_667,
            msc,
        });
        self.arrived.notify_all();
        Ok(())
    }

    fn copy_area(&self, src: Xid, dst: Xid, _width: u32, _height: u32) -> Result<(), ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        if !state.windows.contains_key(&src) || !state.pixmaps.contains_key(&dst) {
            return Err(ProtocolError::Request("BadDrawable".into()));
        }
        state.copies += 1;
        Ok(())
    }

    fn poll_event(&self) -> Result<Option<PresentEvent>, ProtocolError> {
        let mut state = self.state.lock();
        Self::check_connected(&state)?;
        Ok(state.queue.pop_front())
    }

    fn wait_event(&self) -> Result<PresentEvent, ProtocolError> {
        let mut state = self.state.lock();
        state.readers += 1;
        state.max_readers = state.max_readers.max(state.readers);

        let result = loop {
            if let Err(err) = Self::check_connected(&state) {
                break Err(err);
            }
            if let Some(event) = state.queue.pop_front() {
                break Ok(event);
            }
            // Blocking lets held events through.
            if !state.held.is_empty() {
                let held: Vec<_> = state.held.drain(..).collect();
                state.queue.extend(held);
                continue;
            }
            self.arrived.wait(&mut state);
        };

        state.readers -= 1;
        result
    }

    fn flush(&self) -> Result<(), ProtocolError> {
        Self::check_connected(&self.state.lock())
    }
}
