//! Error types for the presentation engine
//!
//! Failures surface to the device layer as a small fixed set of result codes
//! (see [`ResultCode`]). Internally they are carried as [`PresentError`], which
//! keeps enough context for the log line written at the failure site.

use thiserror::Error;

/// Errors reported by a window-system connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A single request was rejected by the server.
    #[error("request rejected by the X server: {0}")]
    Request(String),

    /// The target window does not exist or cannot be presented to.
    #[error("window {0:#x} is not a valid presentation target")]
    BadWindow(u32),

    /// The connection is gone; nothing on it can be trusted anymore.
    #[error("connection to the X server lost: {0}")]
    ConnectionLost(String),

    /// A required extension is missing or too old.
    #[error("missing X extension: {0}")]
    MissingExtension(&'static str),

    /// The server ran out of resource ids or memory.
    #[error("X server resource allocation failed")]
    Alloc,
}

/// Result code returned through the downstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    InvalidCall,
    DriverInternalError,
    OutOfMemory,
    WasStillDrawing,
}

/// Core presentation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresentError {
    /// The caller broke the API contract (e.g. presenting a busy buffer).
    #[error("invalid call: {0}")]
    InvalidCall(String),

    /// Protocol or connection failure below us.
    #[error("driver internal error: {0}")]
    DriverInternal(String),

    #[error("out of memory")]
    OutOfMemory,

    /// A non-blocking present found the buffer still owned by the server.
    #[error("buffer is still in use by the display server")]
    WasStillDrawing,

    #[error("unknown buffer serial {0}")]
    UnknownBuffer(u32),
}

impl PresentError {
    pub fn invalid_call(msg: impl Into<String>) -> Self {
        Self::InvalidCall(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::DriverInternal(msg.into())
    }

    /// Collapse into the code the device layer understands.
    pub fn code(&self) -> ResultCode {
        match self {
            Self::InvalidCall(_) | Self::UnknownBuffer(_) => ResultCode::InvalidCall,
            Self::DriverInternal(_) => ResultCode::DriverInternalError,
            Self::OutOfMemory => ResultCode::OutOfMemory,
            Self::WasStillDrawing => ResultCode::WasStillDrawing,
        }
    }
}

impl From<ProtocolError> for PresentError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Alloc => Self::OutOfMemory,
            other => Self::DriverInternal(other.to_string()),
        }
    }
}

/// Result type for presentation operations
pub type Result<T> = std::result::Result<T, PresentError>;
