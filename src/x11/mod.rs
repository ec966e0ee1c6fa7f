//! X11 backend
//!
//! [`X11Connection`] implements [`PresentConnection`] on top of an x11rb
//! `RustConnection`. Each presentation session gets its own connection, so
//! special events selected by one session are never seen by another.
//!
//! Extensions used:
//! - DRI3 1.0 `PixmapFromBuffer` to import GPU buffers as pixmaps
//! - Present 1.2 for `PresentPixmap`, `NotifyMSC` and the event stream
//! - XFixes 5.0 regions for partial presents

use crate::buffer::BufferDescriptor;
use crate::error::ProtocolError;
use crate::protocol::{
    CompleteKind, CompleteMode, Geometry, PresentConnection, PresentEvent, PresentRequest, Rect,
    Xid, NONE,
};
use log::{debug, info, trace};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::errors::{ConnectError, ConnectionError, ReplyError, ReplyOrIdError};
use x11rb::protocol::dri3::{self, ConnectionExt as _};
use x11rb::protocol::present::{self, ConnectionExt as _};
use x11rb::protocol::xfixes::{self, ConnectionExt as _};
use x11rb::protocol::xproto::{self, ConnectionExt as _, CreateGCAux};
use x11rb::protocol::{ErrorKind, Event};
use x11rb::rust_connection::RustConnection;
use x11rb::x11_utils::X11Error;

impl From<X11Error> for ProtocolError {
    fn from(err: X11Error) -> Self {
        match err.error_kind {
            ErrorKind::Window => ProtocolError::BadWindow(err.bad_value),
            ErrorKind::Alloc | ErrorKind::IDChoice => ProtocolError::Alloc,
            kind => ProtocolError::Request(format!(
                "{:?} (bad value {:#x}, major opcode {})",
                kind, err.bad_value, err.major_opcode
            )),
        }
    }
}

impl From<ConnectionError> for ProtocolError {
    fn from(err: ConnectionError) -> Self {
        ProtocolError::ConnectionLost(err.to_string())
    }
}

impl From<ReplyError> for ProtocolError {
    fn from(err: ReplyError) -> Self {
        match err {
            ReplyError::ConnectionError(err) => err.into(),
            ReplyError::X11Error(err) => err.into(),
        }
    }
}

impl From<ReplyOrIdError> for ProtocolError {
    fn from(err: ReplyOrIdError) -> Self {
        match err {
            ReplyOrIdError::IdsExhausted => ProtocolError::Alloc,
            ReplyOrIdError::ConnectionError(err) => err.into(),
            ReplyOrIdError::X11Error(err) => err.into(),
        }
    }
}

impl From<ConnectError> for ProtocolError {
    fn from(err: ConnectError) -> Self {
        ProtocolError::ConnectionLost(err.to_string())
    }
}

/// Negotiated extension versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionVersions {
    pub present: (u32, u32),
    pub dri3: (u32, u32),
    pub xfixes: (u32, u32),
}

pub struct X11Connection {
    conn: RustConnection,
    root: Xid,
    versions: ExtensionVersions,
}

impl X11Connection {
    /// Open a new connection to `display` (or `$DISPLAY`).
    pub fn connect(display: Option<&str>) -> Result<Self, ProtocolError> {
        let (conn, screen_num) = x11rb::connect(display)?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| ProtocolError::ConnectionLost(format!("no screen {}", screen_num)))?;

        for name in [
            present::X11_EXTENSION_NAME,
            dri3::X11_EXTENSION_NAME,
            xfixes::X11_EXTENSION_NAME,
        ] {
            if conn.extension_information(name)?.is_none() {
                return Err(ProtocolError::MissingExtension(name));
            }
        }

        let present_version = conn.present_query_version(1, 2)?.reply()?;
        let dri3_version = conn.dri3_query_version(1, 0)?.reply()?;
        let xfixes_version = conn.xfixes_query_version(5, 0)?.reply()?;

        let versions = ExtensionVersions {
            present: (present_version.major_version, present_version.minor_version),
            dri3: (dri3_version.major_version, dri3_version.minor_version),
            xfixes: (xfixes_version.major_version, xfixes_version.minor_version),
        };
        if versions.xfixes.0 < 2 {
            return Err(ProtocolError::MissingExtension(xfixes::X11_EXTENSION_NAME));
        }

        info!(
            "🔌 Connected to X server (Present {}.{}, DRI3 {}.{}, XFixes {}.{})",
            versions.present.0,
            versions.present.1,
            versions.dri3.0,
            versions.dri3.1,
            versions.xfixes.0,
            versions.xfixes.1
        );

        Ok(Self {
            conn,
            root,
            versions,
        })
    }

    pub fn versions(&self) -> ExtensionVersions {
        self.versions
    }

    /// Build an XFixes region, or `NONE` for "everything".
    fn create_region(&self, rects: &[Rect]) -> Result<Xid, ProtocolError> {
        if rects.is_empty() {
            return Ok(NONE);
        }
        let rectangles: Vec<xproto::Rectangle> = rects
            .iter()
            .map(|r| xproto::Rectangle {
                x: clamp_i16(r.x),
                y: clamp_i16(r.y),
                width: clamp_u16(r.width),
                height: clamp_u16(r.height),
            })
            .collect();
        let region = self.conn.generate_id()?;
        self.conn.xfixes_create_region(region, &rectangles)?;
        Ok(region)
    }

    fn destroy_region(&self, region: Xid) -> Result<(), ProtocolError> {
        if region != NONE {
            self.conn.xfixes_destroy_region(region)?;
        }
        Ok(())
    }

    fn decode(event: Event) -> Option<PresentEvent> {
        match event {
            Event::PresentCompleteNotify(ev) => {
                let kind = if ev.kind == present::CompleteKind::NOTIFY_MSC {
                    CompleteKind::NotifyMsc
                } else {
                    CompleteKind::Pixmap
                };
                let mode = match ev.mode {
                    present::CompleteMode::FLIP => CompleteMode::Flip,
                    present::CompleteMode::SKIP => CompleteMode::Skip,
                    present::CompleteMode::SUBOPTIMAL_COPY => CompleteMode::SuboptimalCopy,
                    _ => CompleteMode::Copy,
                };
                Some(PresentEvent::Complete {
                    event_id: ev.event,
                    window: ev.window,
                    serial: ev.serial,
                    kind,
                    mode,
                    ust: ev.ust,
                    msc: ev.msc,
                })
            }
            Event::PresentIdleNotify(ev) => Some(PresentEvent::Idle {
                event_id: ev.event,
                window: ev.window,
                serial: ev.serial,
                pixmap: ev.pixmap,
            }),
            Event::PresentConfigureNotify(ev) => Some(PresentEvent::Configure {
                event_id: ev.event,
                window: ev.window,
                x: i32::from(ev.x),
                y: i32::from(ev.y),
                width: u32::from(ev.width),
                height: u32::from(ev.height),
            }),
            Event::Error(err) => {
                debug!("Asynchronous X error: {:?}", err.error_kind);
                None
            }
            other => {
                trace!("Skipping non-Present event {:?}", other);
                None
            }
        }
    }
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u32::from(u16::MAX)) as u16
}

impl PresentConnection for X11Connection {
    fn root(&self) -> Xid {
        self.root
    }

    fn drawable_geometry(&self, drawable: Xid) -> Result<Geometry, ProtocolError> {
        let reply = self.conn.get_geometry(drawable)?.reply()?;
        Ok(Geometry {
            x: i32::from(reply.x),
            y: i32::from(reply.y),
            width: u32::from(reply.width),
            height: u32::from(reply.height),
            depth: reply.depth,
        })
    }

    fn pixmap_from_buffer(
        &self,
        drawable: Xid,
        descriptor: BufferDescriptor,
    ) -> Result<Xid, ProtocolError> {
        let pixmap = self.conn.generate_id()?;
        let size = descriptor.size();
        self.conn
            .dri3_pixmap_from_buffer(
                pixmap,
                drawable,
                size,
                descriptor.width,
                descriptor.height,
                descriptor.stride,
                descriptor.depth,
                descriptor.bpp,
                descriptor.fd,
            )?
            .check()?;
        trace!("Imported {}x{} buffer as pixmap {:#x}", descriptor.width, descriptor.height, pixmap);
        Ok(pixmap)
    }

    fn free_pixmap(&self, pixmap: Xid) -> Result<(), ProtocolError> {
        self.conn.free_pixmap(pixmap)?;
        Ok(())
    }

    fn select_input(&self, window: Xid) -> Result<Xid, ProtocolError> {
        let event_id = self.conn.generate_id()?;
        self.conn
            .present_select_input(
                event_id,
                window,
                present::EventMask::CONFIGURE_NOTIFY
                    | present::EventMask::COMPLETE_NOTIFY
                    | present::EventMask::IDLE_NOTIFY,
            )?
            .check()?;
        Ok(event_id)
    }

    fn deselect_input(&self, event_id: Xid, window: Xid) -> Result<(), ProtocolError> {
        self.conn
            .present_select_input(event_id, window, present::EventMask::NO_EVENT)?;
        self.conn.flush()?;
        Ok(())
    }

    fn present_pixmap(&self, request: &PresentRequest) -> Result<(), ProtocolError> {
        let valid_rects: Vec<Rect> = request.regions.valid.into_iter().collect();
        let valid = self.create_region(&valid_rects)?;
        let update = match self.create_region(&request.regions.update) {
            Ok(update) => update,
            Err(err) => {
                self.destroy_region(valid)?;
                return Err(err);
            }
        };

        let result = self
            .conn
            .present_pixmap(
                request.window,
                request.pixmap,
                request.serial,
                valid,
                update,
                request.regions.x_off,
                request.regions.y_off,
                x11rb::NONE,
                x11rb::NONE,
                x11rb::NONE,
                request.options.bits(),
                request.target_msc,
                0,
                0,
                &[],
            )
            .map_err(ProtocolError::from)
            .and_then(|cookie| cookie.check().map_err(ProtocolError::from));

        self.destroy_region(valid)?;
        self.destroy_region(update)?;
        result
    }

    fn notify_msc(&self, window: Xid, serial: u32, target_msc: u64) -> Result<(), ProtocolError> {
        self.conn.present_notify_msc(window, serial, target_msc, 0, 0)?;
        Ok(())
    }

    fn copy_area(&self, src: Xid, dst: Xid, width: u32, height: u32) -> Result<(), ProtocolError> {
        let gc = self.conn.generate_id()?;
        self.conn
            .create_gc(gc, dst, &CreateGCAux::new().graphics_exposures(0))?;
        let copied = self
            .conn
            .copy_area(src, dst, gc, 0, 0, 0, 0, clamp_u16(width), clamp_u16(height))
            .map_err(ProtocolError::from)
            .and_then(|cookie| cookie.check().map_err(ProtocolError::from));
        self.conn.free_gc(gc)?;
        copied
    }

    fn poll_event(&self) -> Result<Option<PresentEvent>, ProtocolError> {
        while let Some(event) = self.conn.poll_for_event()? {
            if let Some(event) = Self::decode(event) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn wait_event(&self) -> Result<PresentEvent, ProtocolError> {
        loop {
            let event = self.conn.wait_for_event()?;
            if let Some(event) = Self::decode(event) {
                return Ok(event);
            }
        }
    }

    fn flush(&self) -> Result<(), ProtocolError> {
        self.conn.flush()?;
        Ok(())
    }
}
