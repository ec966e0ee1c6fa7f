//! Buffer registry
//!
//! Presentable buffers are X pixmaps imported from GPU buffers. Each one
//! carries a process-unique serial used to match Present completion and idle
//! events back to it. A buffer may only be presented again once the server
//! has sent an idle notification for it (`released`), and its pixmap is only
//! freed once no completion is outstanding.

use crate::error::{PresentError, Result};
use crate::protocol::{Geometry, Xid};
use crate::session::{PresentationSession, SessionState};
use log::{debug, trace, warn};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};

/// Serial 0 is never handed out; notify requests without a buffer use it.
static NEXT_SERIAL: AtomicU32 = AtomicU32::new(1);

/// Allocate the next process-wide serial.
pub(crate) fn next_serial() -> u32 {
    loop {
        let serial = NEXT_SERIAL.fetch_add(1, Ordering::Relaxed);
        if serial != 0 {
            return serial;
        }
    }
}

/// Raw GPU buffer handed over by the render backend.
#[derive(Debug)]
pub struct BufferDescriptor {
    /// dma-buf file descriptor; ownership passes to the X server on import.
    pub fd: OwnedFd,
    pub width: u16,
    pub height: u16,
    pub stride: u16,
    pub depth: u8,
    pub bpp: u8,
}

impl BufferDescriptor {
    /// Size in bytes of the memory behind `fd`.
    pub fn size(&self) -> u32 {
        u32::from(self.stride) * u32::from(self.height)
    }
}

/// Handle to a presentable buffer; wraps its serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub(crate) u32);

impl BufferId {
    pub fn serial(&self) -> u32 {
        self.0
    }
}

/// Session-owned state of one presentable buffer.
#[derive(Debug, Clone)]
pub(crate) struct BufferRecord {
    pub(crate) pixmap: Xid,
    pub(crate) serial: u32,
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) depth: u8,
    /// True when the server no longer reads the pixmap.
    pub(crate) released: bool,
    /// Presents submitted but not yet completion-confirmed.
    pub(crate) pending_completions: u32,
    pub(crate) last_present_was_flip: bool,
    /// The owner asked for destruction while the buffer was busy.
    pub(crate) destroy_requested: bool,
}

impl BufferRecord {
    pub(crate) fn is_free(&self) -> bool {
        self.released && self.pending_completions == 0
    }
}

/// Snapshot of a buffer's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub pixmap: Xid,
    pub width: u32,
    pub height: u32,
    pub depth: u8,
    pub released: bool,
    pub pending_completions: u32,
    pub last_present_was_flip: bool,
    pub destroy_requested: bool,
}

impl From<&BufferRecord> for BufferStatus {
    fn from(record: &BufferRecord) -> Self {
        Self {
            pixmap: record.pixmap,
            width: record.width,
            height: record.height,
            depth: record.depth,
            released: record.released,
            pending_completions: record.pending_completions,
            last_present_was_flip: record.last_present_was_flip,
            destroy_requested: record.destroy_requested,
        }
    }
}

impl PresentationSession {
    /// Import `descriptor` as a pixmap and start tracking it.
    pub fn create_buffer(&self, descriptor: BufferDescriptor) -> Result<BufferId> {
        let requested = (descriptor.width, descriptor.height, descriptor.depth);
        let pixmap = self
            .conn
            .pixmap_from_buffer(self.conn.root(), descriptor)?;

        // Trust the server's idea of the pixmap over the caller's.
        let geometry: Geometry = match self.conn.drawable_geometry(pixmap) {
            Ok(geometry) => geometry,
            Err(err) => {
                warn!("Failed to query geometry of new pixmap {:#x}: {}", pixmap, err);
                if let Err(err) = self.conn.free_pixmap(pixmap) {
                    debug!("Freeing pixmap {:#x} failed: {}", pixmap, err);
                }
                return Err(err.into());
            }
        };

        if (geometry.width, geometry.height, geometry.depth)
            != (u32::from(requested.0), u32::from(requested.1), requested.2)
        {
            debug!(
                "Pixmap {:#x} geometry {}x{}x{} differs from descriptor {}x{}x{}",
                pixmap,
                geometry.width,
                geometry.height,
                geometry.depth,
                requested.0,
                requested.1,
                requested.2
            );
        }

        let serial = next_serial();
        let record = BufferRecord {
            pixmap,
            serial,
            width: geometry.width,
            height: geometry.height,
            depth: geometry.depth,
            released: true,
            pending_completions: 0,
            last_present_was_flip: false,
            destroy_requested: false,
        };

        let mut state = self.state.lock();
        state.buffers.insert(serial, record);
        state.stats.buffers_created += 1;
        trace!("Buffer {} created on pixmap {:#x}", serial, pixmap);

        Ok(BufferId(serial))
    }

    /// Free the buffer if the server is done with it, otherwise queue it.
    ///
    /// Returns `true` when the pixmap was freed right away. A queued buffer
    /// is freed by the event reactor once its last completion and idle
    /// notification have arrived.
    pub fn try_release(&self, id: BufferId) -> Result<bool> {
        let mut state = self.state.lock();
        self.poll_drain(&mut state);

        let record = state
            .buffers
            .get_mut(&id.0)
            .ok_or(PresentError::UnknownBuffer(id.0))?;

        if !record.is_free() {
            debug!(
                "Buffer {} busy (released={}, pending={}), deferring free",
                id.0, record.released, record.pending_completions
            );
            record.destroy_requested = true;
            return Ok(false);
        }

        if let Some(record) = state.buffers.remove(&id.0) {
            self.free_record(&mut state, record);
        }
        Ok(true)
    }

    /// Free the buffer regardless of its state.
    ///
    /// Only valid once a forced drain proved nothing references the pixmap.
    pub(crate) fn destroy_buffer_content(&self, state: &mut SessionState, serial: u32) {
        if let Some(record) = state.buffers.remove(&serial) {
            if !record.is_free() {
                warn!(
                    "Destroying buffer {} with released={} pending={}",
                    serial, record.released, record.pending_completions
                );
            }
            self.free_record(state, record);
        }
    }

    /// Free every deferred buffer that became free.
    pub(crate) fn reap_deferred(&self, state: &mut SessionState) {
        let ready: Vec<u32> = state
            .buffers
            .values()
            .filter(|b| b.destroy_requested && b.is_free())
            .map(|b| b.serial)
            .collect();

        for serial in ready {
            if let Some(record) = state.buffers.remove(&serial) {
                trace!("Reaping deferred buffer {}", serial);
                self.free_record(state, record);
            }
        }
    }

    fn free_record(&self, state: &mut SessionState, record: BufferRecord) {
        if let Err(err) = self.conn.free_pixmap(record.pixmap) {
            warn!("FreePixmap {:#x} failed: {}", record.pixmap, err);
        }
        state.stats.buffers_freed += 1;
    }

    /// Lifecycle snapshot of a buffer, if it is still tracked.
    pub fn buffer_status(&self, id: BufferId) -> Option<BufferStatus> {
        self.state.lock().buffers.get(&id.0).map(BufferStatus::from)
    }

    /// Number of buffers still tracked, deferred ones included.
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }
}
