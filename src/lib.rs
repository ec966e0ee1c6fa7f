//! # ninepresent
//!
//! Presentation engine for Direct3D-style swap chains on X11. GPU buffers are
//! imported as pixmaps through DRI3 and shown with the Present extension;
//! buffer reuse is driven by the server's completion and idle events.
//!
//! ## Architecture
//!
//! - `buffer`: presentable buffers and their release lifecycle
//! - `reactor`: Present event dispatch with a single reader per session
//! - `binding`: binding a session to a window
//! - `scheduler`: MSC-paced presents, blocking waits and the forced drain
//! - `fullscreen`: display modes, fullscreen window styles, focus handling
//! - `drawable`: host window to X drawable cache
//! - `present`: the [`Presenter`] API used by the device layer
//! - `config`: configuration parsing and management
//! - `x11`: the x11rb backed connection
//!
//! ## Usage
//!
//! ```rust,no_run
//! # #[cfg(feature = "x11")]
//! # fn main() -> anyhow::Result<()> {
//! # fn host() -> std::sync::Arc<dyn ninepresent::WindowHost> { unimplemented!() }
//! use ninepresent::{HostContext, PresentConfig, PresentParameters, Presenter, X11Connection};
//!
//! let config = PresentConfig::default();
//! let conn = X11Connection::connect(None)?;
//! let presenter = Presenter::new(
//!     Box::new(conn),
//!     HostContext::new(host()),
//!     &config,
//!     PresentParameters::default(),
//!     false,
//! )?;
//! println!("API {}", presenter.api_version());
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "x11"))]
//! # fn main() {}
//! ```

pub mod binding;
pub mod buffer;
pub mod config;
pub mod drawable;
pub mod error;
pub mod fullscreen;
pub mod host;
pub mod present;
pub mod protocol;
pub mod reactor;
pub mod scheduler;
pub mod session;

#[cfg(feature = "x11")]
pub mod x11;

#[cfg(test)]
pub(crate) mod testing;

// Re-export main types for easy access
pub use buffer::{BufferDescriptor, BufferId, BufferStatus};
pub use config::{PresentConfig, VblankMode};
pub use drawable::{DrawableCache, DrawableInfo};
pub use error::{PresentError, ProtocolError, Result, ResultCode};
pub use fullscreen::{
    FullscreenController, FullscreenSettings, MessageHandler, WindowMessage, WindowProcRegistry,
};
pub use host::{
    CursorImage, DisplayMode, ExStyle, GammaRamp, ShowCommand, Style, WindowHandle, WindowHost,
    WindowStyle,
};
pub use present::{
    ApiVersion, HostContext, PresentFlags, PresentInterval, PresentParameters, Presenter,
    RasterStatus, SwapEffect, WindowInfo,
};
pub use protocol::{
    CompleteKind, CompleteMode, Geometry, PresentConnection, PresentEvent, PresentOptions,
    PresentRegions, PresentRequest, Rect, Xid,
};
pub use scheduler::SubmitParams;
pub use session::{DrainSettings, PresentationSession, SessionStats};

#[cfg(feature = "x11")]
pub use x11::{ExtensionVersions, X11Connection};

/// Version information for ninepresent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
