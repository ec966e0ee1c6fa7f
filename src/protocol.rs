//! Window-system channel abstraction
//!
//! Everything the engine needs from the X server goes through
//! [`PresentConnection`]: DRI3 pixmap import, geometry queries, Present event
//! selection, `PresentPixmap`/`PresentNotifyMSC` requests and the event queue
//! itself. The real implementation lives in [`crate::x11`]; tests drive the
//! engine with a simulated server.
//!
//! Events are delivered on a single-reader channel. Callers must never have
//! two threads inside [`PresentConnection::wait_event`] for the same
//! connection; the reactor enforces this per session.

use crate::buffer::BufferDescriptor;
use crate::error::ProtocolError;
use bitflags::bitflags;

/// An X resource id (window, pixmap, event context, region...).
pub type Xid = u32;

/// The "no resource" id.
pub const NONE: Xid = 0;

/// Drawable geometry as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub depth: u8,
}

/// Axis-aligned rectangle, origin plus extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from Win32-style left/top/right/bottom edges.
    pub fn from_edges(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            x: left,
            y: top,
            width: right.saturating_sub(left).max(0) as u32,
            height: bottom.saturating_sub(top).max(0) as u32,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// How the server carried out a present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteMode {
    Copy,
    /// Zero-copy page flip; the server decides when the pixmap goes idle.
    Flip,
    Skip,
    SuboptimalCopy,
}

/// What a completion event acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteKind {
    /// A `PresentPixmap` request.
    Pixmap,
    /// A `PresentNotifyMSC` request.
    NotifyMsc,
}

/// A decoded Present extension event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentEvent {
    Complete {
        event_id: Xid,
        window: Xid,
        serial: u32,
        kind: CompleteKind,
        mode: CompleteMode,
        ust: u64,
        msc: u64,
    },
    Idle {
        event_id: Xid,
        window: Xid,
        serial: u32,
        pixmap: Xid,
    },
    Configure {
        event_id: Xid,
        window: Xid,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    },
}

impl PresentEvent {
    /// Event context the server tagged this event with.
    pub fn event_id(&self) -> Xid {
        match self {
            Self::Complete { event_id, .. }
            | Self::Idle { event_id, .. }
            | Self::Configure { event_id, .. } => *event_id,
        }
    }

    pub fn window(&self) -> Xid {
        match self {
            Self::Complete { window, .. }
            | Self::Idle { window, .. }
            | Self::Configure { window, .. } => *window,
        }
    }
}

bitflags! {
    /// `PresentPixmap` options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PresentOptions: u32 {
        /// Present immediately if the target MSC already passed.
        const ASYNC = 1 << 0;
        /// Never flip; blit into the window.
        const COPY = 1 << 1;
    }
}

/// Partial-update description of a present.
///
/// `valid` is the part of the pixmap holding meaningful content, `update` the
/// damaged part; both in pixmap coordinates. `None`/empty means the whole
/// pixmap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentRegions {
    pub valid: Option<Rect>,
    pub update: Vec<Rect>,
    pub x_off: i16,
    pub y_off: i16,
}

impl PresentRegions {
    /// Whole buffer, no offset.
    pub fn whole() -> Self {
        Self::default()
    }

    /// Derive the regions from Direct3D-style source/dest rects and dirty region.
    pub fn from_rects(src: Option<Rect>, dst: Option<Rect>, dirty: Option<&[Rect]>) -> Self {
        let (src_x, src_y) = src.map(|r| (r.x, r.y)).unwrap_or((0, 0));
        let (x_off, y_off) = dst
            .map(|d| (d.x - src_x, d.y - src_y))
            .unwrap_or((0, 0));

        let update = match dirty {
            Some(rects) if !rects.is_empty() => rects.to_vec(),
            _ => src.into_iter().collect(),
        };

        Self {
            valid: src,
            update,
            x_off: clamp_i16(x_off),
            y_off: clamp_i16(y_off),
        }
    }

    pub fn is_whole(&self) -> bool {
        self.valid.is_none() && self.update.is_empty() && self.x_off == 0 && self.y_off == 0
    }
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// A single `PresentPixmap` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRequest {
    pub window: Xid,
    pub pixmap: Xid,
    pub serial: u32,
    pub regions: PresentRegions,
    pub options: PresentOptions,
    pub target_msc: u64,
}

/// Capability interface over the X server connection used by one session.
pub trait PresentConnection: Send + Sync {
    /// Root window of the screen the connection presents on.
    fn root(&self) -> Xid;

    /// `GetGeometry` on a window or pixmap.
    fn drawable_geometry(&self, drawable: Xid) -> Result<Geometry, ProtocolError>;

    /// Import a GPU buffer as a pixmap (DRI3 `PixmapFromBuffer`).
    fn pixmap_from_buffer(
        &self,
        drawable: Xid,
        descriptor: BufferDescriptor,
    ) -> Result<Xid, ProtocolError>;

    fn free_pixmap(&self, pixmap: Xid) -> Result<(), ProtocolError>;

    /// Select configure/complete/idle events on `window`; returns the event id.
    fn select_input(&self, window: Xid) -> Result<Xid, ProtocolError>;

    /// Stop receiving events for `event_id` on `window`.
    fn deselect_input(&self, event_id: Xid, window: Xid) -> Result<(), ProtocolError>;

    /// Send a checked `PresentPixmap`.
    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), ProtocolError>;

    /// Ask for a completion event once `target_msc` is reached.
    fn notify_msc(&self, window: Xid, serial: u32, target_msc: u64) -> Result<(), ProtocolError>;

    /// Copy the top-left `width`x`height` of `src` into `dst`.
    fn copy_area(&self, src: Xid, dst: Xid, width: u32, height: u32)
        -> Result<(), ProtocolError>;

    /// Return the next queued event without blocking.
    fn poll_event(&self) -> Result<Option<PresentEvent>, ProtocolError>;

    /// Block until the next event arrives.
    fn wait_event(&self) -> Result<PresentEvent, ProtocolError>;

    fn flush(&self) -> Result<(), ProtocolError>;
}
