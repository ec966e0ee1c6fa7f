//! Window binding
//!
//! A session presents to one window at a time. Switching windows drains every
//! present still queued on the old one first, so no completion or idle event
//! can arrive for a window the session no longer listens to.

use crate::error::Result;
use crate::protocol::{Geometry, Xid, NONE};
use crate::session::{PresentationSession, SessionState};
use log::{debug, error, info};
use parking_lot::MutexGuard;

impl PresentationSession {
    /// Point the session at `window`; [`NONE`] unbinds.
    pub fn bind_window(&self, window: Xid) -> Result<()> {
        let mut state = self.state.lock();
        self.bind_locked(&mut state, window)
    }

    pub(crate) fn bind_locked(
        &self,
        state: &mut MutexGuard<'_, SessionState>,
        window: Xid,
    ) -> Result<()> {
        if state.window == window {
            return Ok(());
        }

        if state.window != NONE {
            debug!("Rebinding session from {:#x} to {:#x}", state.window, window);
            self.forced_drain(state)?;
            if let Err(err) = self.conn.deselect_input(state.event_id, state.window) {
                debug!("Deselecting Present events on {:#x} failed: {}", state.window, err);
            }
            state.window = NONE;
            state.event_id = NONE;
            state.geometry = Geometry::default();
        }

        if window == NONE {
            return Ok(());
        }

        let geometry = self.conn.drawable_geometry(window).map_err(|err| {
            error!("Window {:#x} cannot be presented to: {}", window, err);
            err
        })?;
        let event_id = self.conn.select_input(window).map_err(|err| {
            error!("Selecting Present events on {:#x} failed: {}", window, err);
            err
        })?;

        state.window = window;
        state.event_id = event_id;
        state.geometry = geometry;
        state.geometry_updated = false;
        state.last_msc = 0;
        state.last_target = 0;
        info!(
            "🪟 Bound presentation to window {:#x} ({}x{}, depth {})",
            window, geometry.width, geometry.height, geometry.depth
        );
        Ok(())
    }
}
