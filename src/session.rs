//! Presentation session
//!
//! A [`PresentationSession`] ties one window-system connection to at most one
//! bound window and the buffers presented to it. All mutable state sits in a
//! single [`SessionState`] behind one lock; the lock is held while events are
//! dispatched and presents are scheduled, and released only while the single
//! reader thread blocks on the event channel.
//!
//! The component operations are spread over sibling modules:
//! - `buffer`: buffer creation and deferred release
//! - `reactor`: event polling, blocking waits and dispatch
//! - `binding`: window (re)binding
//! - `scheduler`: prepare/submit, waits and the forced drain

use crate::buffer::BufferRecord;
use crate::config::PresentSection;
use crate::protocol::{Geometry, PresentConnection, Xid, NONE};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::ThreadId;

/// Forced-drain tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainSettings {
    /// How many frames past the last submitted target the sentinel lands.
    pub margin: u64,
    /// Size of the copy-mode re-present used to release flipped pixmaps.
    pub sliver_width: u16,
    pub sliver_height: u16,
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            margin: 5,
            sliver_width: 8,
            sliver_height: 1,
        }
    }
}

impl From<&PresentSection> for DrainSettings {
    fn from(section: &PresentSection) -> Self {
        Self {
            margin: section.drain_margin,
            sliver_width: section.release_sliver_width,
            sliver_height: section.release_sliver_height,
        }
    }
}

/// Counters describing what a session has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub buffers_created: u64,
    pub buffers_freed: u64,
    pub presents_submitted: u64,
    pub present_failures: u64,
    pub completions: u64,
    pub flips: u64,
    pub copies: u64,
    pub idles: u64,
    pub foreign_events: u64,
    /// Times a thread waited for another thread's dispatch instead of reading.
    pub cooperative_waits: u64,
    pub forced_drains: u64,
    pub sliver_presents: u64,
}

/// Mutable session state, guarded by [`PresentationSession::state`].
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Bound window, [`NONE`] when unbound.
    pub(crate) window: Xid,
    /// Present event context selected on `window`.
    pub(crate) event_id: Xid,
    pub(crate) geometry: Geometry,
    pub(crate) geometry_updated: bool,
    /// An idle event arrived since `wait_any_idle_event` last returned.
    pub(crate) idle_since_check: bool,
    /// MSC and UST of the last confirmed present.
    pub(crate) last_msc: u64,
    pub(crate) last_ust: u64,
    /// MSC and UST reported by the last `NotifyMSC` completion.
    pub(crate) notify_msc: u64,
    pub(crate) notify_ust: u64,
    /// Target MSC of the last submitted present.
    pub(crate) last_target: u64,
    /// Presents submitted but not yet completion-confirmed.
    pub(crate) in_flight: u32,
    /// Serial of an outstanding drain sentinel `NotifyMSC`.
    pub(crate) pending_sentinel: Option<u32>,
    /// Serial of an outstanding [`PresentationSession::wait_msc`] request.
    pub(crate) pending_notify: Option<u32>,
    pub(crate) buffers: HashMap<u32, BufferRecord>,
    /// A thread is blocked reading the event channel.
    pub(crate) reader_active: bool,
    /// Bumped after every blocking-read dispatch.
    pub(crate) dispatch_generation: u64,
    /// Thread running a forced drain; only it may read the channel meanwhile.
    pub(crate) drain_owner: Option<ThreadId>,
    pub(crate) destroyed: bool,
    pub(crate) stats: SessionStats,
}

/// Per-window presentation context.
pub struct PresentationSession {
    pub(crate) conn: Box<dyn PresentConnection>,
    pub(crate) state: Mutex<SessionState>,
    /// Signalled whenever the reader finished a dispatch.
    pub(crate) dispatched: Condvar,
    pub(crate) drain: DrainSettings,
}

impl std::fmt::Debug for PresentationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PresentationSession")
            .field("window", &state.window)
            .field("buffers", &state.buffers.len())
            .field("in_flight", &state.in_flight)
            .finish()
    }
}

impl PresentationSession {
    /// Create an unbound session on `conn`.
    pub fn new(conn: Box<dyn PresentConnection>, drain: DrainSettings) -> Self {
        debug!(
            "Presentation session created (drain margin {}, sliver {}x{})",
            drain.margin, drain.sliver_width, drain.sliver_height
        );
        Self {
            conn,
            state: Mutex::new(SessionState::default()),
            dispatched: Condvar::new(),
            drain,
        }
    }

    /// Currently bound window, if any.
    pub fn window(&self) -> Option<Xid> {
        let window = self.state.lock().window;
        (window != NONE).then_some(window)
    }

    /// Last known geometry of the bound window.
    pub fn geometry(&self) -> Geometry {
        self.state.lock().geometry
    }

    /// Whether a configure event updated the geometry since the last call.
    pub fn take_geometry_updated(&self) -> bool {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);
        std::mem::take(&mut state.geometry_updated)
    }

    /// MSC of the last confirmed present on the bound window.
    pub fn last_msc(&self) -> u64 {
        self.state.lock().last_msc
    }

    /// UST (microseconds) of the last confirmed present.
    pub fn last_ust(&self) -> u64 {
        self.state.lock().last_ust
    }

    pub fn in_flight(&self) -> u32 {
        self.state.lock().in_flight
    }

    pub fn stats(&self) -> SessionStats {
        self.state.lock().stats.clone()
    }

    /// Copy the bound window's current contents into a buffer's pixmap.
    pub fn copy_window_to_buffer(&self, window: Xid, id: crate::buffer::BufferId) -> crate::Result<()> {
        let state = self.state.lock();
        let record = state
            .buffers
            .get(&id.0)
            .ok_or(crate::PresentError::UnknownBuffer(id.0))?;
        self.conn
            .copy_area(window, record.pixmap, record.width, record.height)?;
        self.conn.flush()?;
        Ok(())
    }

    /// Drain every outstanding present and free all buffers.
    ///
    /// Runs at most once; later calls are no-ops.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }

        if let Err(err) = self.forced_drain(&mut state) {
            warn!("Forced drain during teardown failed: {}", err);
        }

        if state.window != NONE {
            if let Err(err) = self.conn.deselect_input(state.event_id, state.window) {
                debug!("Deselecting Present events failed: {}", err);
            }
            state.window = NONE;
            state.event_id = NONE;
        }

        let serials: Vec<u32> = state.buffers.keys().copied().collect();
        for serial in serials {
            self.destroy_buffer_content(&mut state, serial);
        }
        if let Err(err) = self.conn.flush() {
            debug!("Flush during teardown failed: {}", err);
        }

        state.destroyed = true;
        info!(
            "Presentation session destroyed after {} presents ({} flips, {} copies)",
            state.stats.presents_submitted, state.stats.flips, state.stats.copies
        );
    }
}

impl Drop for PresentationSession {
    fn drop(&mut self) {
        self.destroy();
    }
}
