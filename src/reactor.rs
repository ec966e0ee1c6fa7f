//! Present event reactor
//!
//! Completion, idle and configure events are consumed here and folded into the
//! session state. Two ways in:
//! - [`PresentationSession::poll_drain`] dispatches whatever is already queued
//!   without blocking;
//! - [`PresentationSession::wait_until`] blocks until a predicate over the
//!   state holds. Exactly one thread reads the channel at a time; every other
//!   waiter sleeps on the session condition variable and rechecks after each
//!   dispatch.

use crate::error::Result;
use crate::protocol::{CompleteKind, CompleteMode, PresentEvent, NONE};
use crate::session::{PresentationSession, SessionState};
use log::{error, trace, warn};
use parking_lot::MutexGuard;
use std::thread;

impl PresentationSession {
    /// Apply one event to the session state.
    pub(crate) fn dispatch(&self, state: &mut SessionState, event: PresentEvent) {
        if state.event_id == NONE || event.event_id() != state.event_id {
            trace!(
                "Ignoring Present event for context {:#x} (ours {:#x})",
                event.event_id(),
                state.event_id
            );
            state.stats.foreign_events += 1;
            return;
        }

        match event {
            PresentEvent::Complete {
                serial,
                kind: CompleteKind::Pixmap,
                mode,
                ust,
                msc,
                ..
            } => {
                state.stats.completions += 1;
                match mode {
                    CompleteMode::Flip => state.stats.flips += 1,
                    CompleteMode::Copy | CompleteMode::SuboptimalCopy => state.stats.copies += 1,
                    CompleteMode::Skip => {}
                }

                match state.buffers.get_mut(&serial) {
                    Some(buffer) => {
                        buffer.pending_completions = buffer.pending_completions.saturating_sub(1);
                        buffer.last_present_was_flip = mode == CompleteMode::Flip;
                    }
                    None => error!("Completion for unknown buffer serial {}", serial),
                }

                state.in_flight = state.in_flight.saturating_sub(1);
                state.last_msc = msc;
                state.last_ust = ust;
                trace!("Present {} completed ({:?}) at msc {}", serial, mode, msc);
            }
            PresentEvent::Complete {
                serial,
                kind: CompleteKind::NotifyMsc,
                ust,
                msc,
                ..
            } => {
                state.notify_msc = msc;
                state.notify_ust = ust;
                // Serial 0 is the reader wake-up nudge.
                if serial != 0 && state.pending_sentinel == Some(serial) {
                    trace!("Drain sentinel {} observed at msc {}", serial, msc);
                    state.pending_sentinel = None;
                }
                if serial != 0 && state.pending_notify == Some(serial) {
                    state.pending_notify = None;
                }
            }
            PresentEvent::Idle { serial, pixmap, .. } => {
                state.stats.idles += 1;
                match state.buffers.get_mut(&serial) {
                    Some(buffer) if buffer.pixmap == pixmap => {
                        buffer.released = true;
                        state.idle_since_check = true;
                        trace!("Buffer {} idle", serial);
                    }
                    Some(buffer) => warn!(
                        "Idle for buffer {} names pixmap {:#x}, expected {:#x}",
                        serial, pixmap, buffer.pixmap
                    ),
                    None => trace!("Idle for untracked serial {}", serial),
                }
            }
            PresentEvent::Configure {
                window,
                x,
                y,
                width,
                height,
                ..
            } => {
                if window == state.window {
                    state.geometry.x = x;
                    state.geometry.y = y;
                    state.geometry.width = width;
                    state.geometry.height = height;
                    state.geometry_updated = true;
                    trace!("Window {:#x} configured to {}x{}", window, width, height);
                }
            }
        }

        self.reap_deferred(state);
    }

    /// Dispatch every event already queued, without blocking.
    ///
    /// Does nothing while another thread is the blocking reader; that thread
    /// owns the channel until it hands it back.
    pub(crate) fn poll_drain(&self, state: &mut SessionState) {
        if state.reader_active {
            return;
        }
        loop {
            match self.conn.poll_event() {
                Ok(Some(event)) => self.dispatch(state, event),
                Ok(None) => break,
                Err(err) => {
                    warn!("Polling Present events failed: {}", err);
                    break;
                }
            }
        }
    }

    /// Block for one round of progress.
    ///
    /// Becomes the reader if nobody is, otherwise waits for the current
    /// reader's next dispatch. While another thread drains, waits for that
    /// drain instead.
    pub(crate) fn wait_progress(&self, state: &mut MutexGuard<'_, SessionState>) -> Result<()> {
        // A drain running on another thread owns the channel until it is done.
        let me = thread::current().id();
        if state.drain_owner.is_some_and(|owner| owner != me) {
            state.stats.cooperative_waits += 1;
            let generation = state.dispatch_generation;
            while state.drain_owner.is_some_and(|owner| owner != me)
                && state.dispatch_generation == generation
            {
                self.dispatched.wait(state);
            }
            return Ok(());
        }

        if state.reader_active {
            state.stats.cooperative_waits += 1;
            let generation = state.dispatch_generation;
            while state.reader_active && state.dispatch_generation == generation {
                self.dispatched.wait(state);
            }
            return Ok(());
        }

        state.reader_active = true;
        let received = MutexGuard::unlocked(state, || self.conn.wait_event());
        state.reader_active = false;
        state.dispatch_generation = state.dispatch_generation.wrapping_add(1);

        let outcome = match received {
            Ok(event) => {
                self.dispatch(state, event);
                self.poll_drain(state);
                Ok(())
            }
            Err(err) => {
                error!("Waiting for Present events failed: {}", err);
                Err(err.into())
            }
        };
        self.dispatched.notify_all();
        outcome
    }

    /// Block until `done` holds for the session state.
    pub(crate) fn wait_until<F>(&self, state: &mut MutexGuard<'_, SessionState>, done: F) -> Result<()>
    where
        F: Fn(&SessionState) -> bool,
    {
        self.poll_drain(state);
        while !done(&**state) {
            self.wait_progress(state)?;
        }
        Ok(())
    }
}
