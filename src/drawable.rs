//! Drawable cache
//!
//! Maps host window handles to the X drawable behind them. Lookups are
//! frequent (every present) and resolving is a round trip through the host,
//! so results are cached until the window is destroyed or explicitly
//! invalidated.
//!
//! Lock order: this cache is always consulted before a session lock is taken,
//! never while one is held.

use crate::host::{WindowHandle, WindowHost};
use crate::protocol::{Rect, Xid};
use log::{debug, trace};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Where a host window lives on the X side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawableInfo {
    pub window: WindowHandle,
    pub drawable: Xid,
    /// Host device context the drawable was resolved through.
    pub device_context: u64,
    /// Window rectangle in screen coordinates.
    pub window_rect: Rect,
    /// Client area origin relative to the window rectangle.
    pub client_offset: (i32, i32),
    pub width: u32,
    pub height: u32,
    pub depth: u8,
}

#[derive(Default)]
pub struct DrawableCache {
    entries: Mutex<HashMap<WindowHandle, Arc<DrawableInfo>>>,
}

impl DrawableCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `window`, resolving it through `host` on a miss.
    pub fn get(&self, host: &dyn WindowHost, window: WindowHandle) -> Option<Arc<DrawableInfo>> {
        if let Some(info) = self.entries.lock().get(&window) {
            return Some(Arc::clone(info));
        }

        // Resolve without the lock held; the host may call back into us.
        let resolved = host.drawable_info(window)?;
        trace!("Resolved window {} to drawable {:#x}", window, resolved.drawable);

        let mut entries = self.entries.lock();
        let info = entries
            .entry(window)
            .or_insert_with(|| Arc::new(resolved));
        Some(Arc::clone(info))
    }

    /// Forget `window`, e.g. because it was destroyed.
    pub fn invalidate(&self, window: WindowHandle) -> bool {
        let removed = self.entries.lock().remove(&window).is_some();
        if removed {
            debug!("Drawable cache entry for window {} invalidated", window);
        }
        removed
    }

    /// Re-resolve `window` and replace its cached entry.
    pub fn refresh(&self, host: &dyn WindowHost, window: WindowHandle) -> Option<Arc<DrawableInfo>> {
        let resolved = host.drawable_info(window);
        let mut entries = self.entries.lock();
        match resolved {
            Some(info) => {
                let info = Arc::new(info);
                entries.insert(window, Arc::clone(&info));
                Some(info)
            }
            None => {
                entries.remove(&window);
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
