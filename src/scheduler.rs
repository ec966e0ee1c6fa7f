//! Presentation scheduler
//!
//! Turns "show this buffer" into `PresentPixmap` requests paced against the
//! window's media stream counter, and provides the blocking waits built on top
//! of the event reactor. The forced drain lives here too: it is the only way a
//! session can prove the server is finished with every pixmap before the
//! pixmaps are freed or the window changes.

use crate::buffer::{next_serial, BufferId};
use crate::error::{PresentError, Result};
use crate::protocol::{PresentOptions, PresentRegions, PresentRequest, Rect, Xid, NONE};
use crate::session::{PresentationSession, SessionState};
use log::{debug, error, trace, warn};
use parking_lot::MutexGuard;
use std::thread;

/// Per-present scheduling parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitParams {
    /// Frames between presents; 0 presents as soon as possible.
    pub interval: u32,
    /// Present immediately if the target frame already passed.
    pub async_present: bool,
    /// Never page-flip this present.
    pub force_copy: bool,
    pub regions: PresentRegions,
}

impl SubmitParams {
    /// Whole-buffer present every `interval` frames.
    pub fn vsync(interval: u32) -> Self {
        Self {
            interval,
            ..Self::default()
        }
    }

    /// Whole-buffer present without waiting for vblank.
    pub fn immediate() -> Self {
        Self {
            interval: 0,
            async_present: true,
            ..Self::default()
        }
    }

    pub fn with_regions(mut self, regions: PresentRegions) -> Self {
        self.regions = regions;
        self
    }

    pub fn options(&self) -> PresentOptions {
        let mut options = PresentOptions::empty();
        if self.async_present || self.interval == 0 {
            options |= PresentOptions::ASYNC;
        }
        if self.force_copy {
            options |= PresentOptions::COPY;
        }
        options
    }
}

/// Frame a present should land on.
///
/// Each present still in flight occupies one `interval` slot after the last
/// confirmed frame.
pub fn target_msc(last_msc: u64, interval: u32, in_flight: u32) -> u64 {
    let slots = u64::from(in_flight) + 1;
    last_msc.saturating_add(u64::from(interval).saturating_mul(slots))
}

impl PresentationSession {
    /// Make sure `id` can be presented to `window`.
    pub fn prepare(&self, window: Xid, id: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);

        if state.window != window {
            self.bind_locked(&mut state, window)?;
        }

        let record = state
            .buffers
            .get(&id.0)
            .ok_or(PresentError::UnknownBuffer(id.0))?;
        if !record.released {
            error!("Buffer {} prepared while still owned by the server", id.0);
            return Err(PresentError::internal(format!(
                "buffer {} is not released",
                id.0
            )));
        }
        Ok(())
    }

    /// Queue a present of `id` on `window`.
    pub fn submit(&self, window: Xid, id: BufferId, params: &SubmitParams) -> Result<()> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);

        if state.window != window {
            self.bind_locked(&mut state, window)?;
        }

        let (pixmap, released, width, height) = {
            let record = state
                .buffers
                .get(&id.0)
                .ok_or(PresentError::UnknownBuffer(id.0))?;
            (record.pixmap, record.released, record.width, record.height)
        };
        if !released {
            error!("Buffer {} submitted while still owned by the server", id.0);
            return Err(PresentError::invalid_call(format!(
                "buffer {} is still in use",
                id.0
            )));
        }

        let target = target_msc(state.last_msc, params.interval, state.in_flight);
        let request = PresentRequest {
            window,
            pixmap,
            serial: id.0,
            regions: params.regions.clone(),
            options: params.options(),
            target_msc: target,
        };

        if let Err(err) = self.conn.present_pixmap(&request) {
            let window_geometry = state.geometry;
            warn!(
                "PresentPixmap of buffer {} failed: {} (buffer {}x{}, window {}x{}, offset {},{})",
                id.0,
                err,
                width,
                height,
                window_geometry.width,
                window_geometry.height,
                request.regions.x_off,
                request.regions.y_off
            );
            state.stats.present_failures += 1;
            return Err(err.into());
        }

        if let Some(record) = state.buffers.get_mut(&id.0) {
            record.pending_completions += 1;
            record.released = false;
        }
        state.in_flight += 1;
        state.last_target = target;
        state.stats.presents_submitted += 1;
        trace!(
            "Buffer {} queued for msc {} ({} in flight)",
            id.0,
            target,
            state.in_flight
        );
        Ok(())
    }

    /// Block until the server is done with `id`.
    pub fn wait_released(&self, id: BufferId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.buffers.contains_key(&id.0) {
            return Err(PresentError::UnknownBuffer(id.0));
        }
        // A deferred buffer may be reaped while we wait; gone means free.
        self.wait_until(&mut state, |s| {
            s.buffers.get(&id.0).map_or(true, |b| b.is_free())
        })
    }

    /// Whether `id` could be presented again right now.
    pub fn is_released(&self, id: BufferId) -> Result<bool> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);
        state
            .buffers
            .get(&id.0)
            .map(|b| b.is_free())
            .ok_or(PresentError::UnknownBuffer(id.0))
    }

    /// Block until some buffer went idle since the previous call.
    ///
    /// Returns at once when no buffer is owned by the server, since no idle
    /// event could ever arrive.
    pub fn wait_any_idle_event(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);

        if !state.idle_since_check && state.buffers.values().all(|b| b.released) {
            debug!("No buffer owned by the server, not waiting for an idle event");
            return Ok(());
        }

        self.wait_until(&mut state, |s| s.idle_since_check)?;
        state.idle_since_check = false;
        Ok(())
    }

    /// Block until the bound window's MSC reaches `frames` past the last
    /// reported counter and return the `(msc, ust)` the server reported.
    ///
    /// With no prior report the first call returns the current counter.
    pub fn wait_msc(&self, frames: u64) -> Result<(u64, u64)> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);
        let window = state.window;
        if window == NONE {
            return Err(PresentError::invalid_call("no window bound"));
        }

        let token = next_serial();
        let base = if state.notify_msc == 0 { 0 } else { state.notify_msc.max(state.last_msc) };
        state.pending_notify = Some(token);
        let sent = self
            .conn
            .notify_msc(window, token, base.saturating_add(frames))
            .and_then(|_| self.conn.flush());
        if let Err(err) = sent {
            state.pending_notify = None;
            return Err(err.into());
        }

        self.wait_until(&mut state, |s| s.pending_notify.is_none())?;
        Ok((state.notify_msc, state.notify_ust))
    }

    /// Wait out every present still queued on the bound window.
    pub fn drain(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.forced_drain(&mut state)
    }

    /// Bring the session to a state where no pixmap is referenced by the
    /// server: nothing in flight and every buffer released.
    pub(crate) fn forced_drain(&self, state: &mut MutexGuard<'_, SessionState>) -> Result<()> {
        state.stats.forced_drains += 1;

        let me = thread::current().id();
        if state.drain_owner == Some(me) {
            return self.drain_owned(state);
        }
        while state.drain_owner.is_some() {
            self.dispatched.wait(state);
        }

        state.drain_owner = Some(me);
        let result = self.drain_owned(state);
        state.drain_owner = None;
        self.dispatched.notify_all();
        result
    }

    /// Drain body; the caller holds drain ownership.
    fn drain_owned(&self, state: &mut MutexGuard<'_, SessionState>) -> Result<()> {
        let window = state.window;

        if window == NONE {
            for buffer in state.buffers.values_mut().filter(|b| !b.released) {
                warn!("Buffer {} owned by the server with no bound window", buffer.serial);
                buffer.released = true;
            }
            return Ok(());
        }

        // Kick any blocked reader off the channel so the drain owns it.
        while state.reader_active {
            self.conn.notify_msc(window, 0, 0)?;
            self.conn.flush()?;
            self.dispatched.wait(state);
        }

        self.wait_until(state, |s| s.in_flight < 2)?;

        // The server answers in MSC order, so once the sentinel is seen every
        // earlier present has completed.
        let token = next_serial();
        let target = state.last_target.saturating_add(self.drain.margin);
        state.pending_sentinel = Some(token);
        let sent = self
            .conn
            .notify_msc(window, token, target)
            .and_then(|_| self.conn.flush());
        if let Err(err) = sent {
            state.pending_sentinel = None;
            return Err(err.into());
        }
        debug!("Drain sentinel {} sent for msc {}", token, target);
        self.wait_until(state, |s| s.pending_sentinel.is_none() && s.in_flight == 0)?;

        let unreleased: Vec<u32> = state
            .buffers
            .values()
            .filter(|b| !b.released)
            .map(|b| b.serial)
            .collect();

        for serial in unreleased {
            let Some(record) = state.buffers.get(&serial) else {
                continue;
            };
            if !record.last_present_was_flip {
                error!(
                    "Buffer {} still owned by the server after a copy present, forcing release",
                    serial
                );
                if let Some(record) = state.buffers.get_mut(&serial) {
                    record.released = true;
                }
                continue;
            }

            // A copy present of the scanned-out pixmap makes the server let go of it.
            let sliver = Rect::new(
                0,
                0,
                u32::from(self.drain.sliver_width).min(record.width).max(1),
                u32::from(self.drain.sliver_height).min(record.height).max(1),
            );
            let request = PresentRequest {
                window,
                pixmap: record.pixmap,
                serial,
                regions: PresentRegions {
                    valid: Some(sliver),
                    update: vec![sliver],
                    x_off: 0,
                    y_off: 0,
                },
                options: PresentOptions::COPY | PresentOptions::ASYNC,
                target_msc: 0,
            };
            self.conn.present_pixmap(&request)?;
            self.conn.flush()?;

            if let Some(record) = state.buffers.get_mut(&serial) {
                record.pending_completions += 1;
            }
            state.in_flight += 1;
            state.stats.sliver_presents += 1;
            trace!("Sliver re-present of flipped buffer {}", serial);

            self.wait_until(state, |s| {
                s.buffers
                    .get(&serial)
                    .map_or(true, |b| b.released && b.pending_completions == 0)
            })?;
        }

        self.reap_deferred(state);
        Ok(())
    }
}
