//! ioport-engine error types.

use std::fmt;

use ioport_core::CoreError;

#[derive(Debug)]
pub enum EngineError {
    /// Process-wide initialization failed (sticky for the process).
    InitFailed,
    /// The engine has not been initialized in this process.
    NotInitialized,
    /// The completion queue is full; the packet was not posted.
    PortFull,
    /// The completion port has been shut down.
    PortClosed,
    /// The channel's transport is not open.
    NotConnected,
    /// The driver does not support the requested option.
    UnknownOption(String),
    /// OS error with errno.
    Os(i32),
    /// Transport-level I/O error.
    Io(std::io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "engine initialization failed"),
            Self::NotInitialized => write!(f, "engine not initialized"),
            Self::PortFull => write!(f, "completion queue full"),
            Self::PortClosed => write!(f, "completion port shut down"),
            Self::NotConnected => write!(f, "transport not open"),
            Self::UnknownOption(name) => write!(f, "unknown channel option: {}", name),
            Self::Os(e) => write!(f, "OS error: errno {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CoreError> for EngineError {
    fn from(_: CoreError) -> Self {
        Self::InitFailed
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Read the calling thread's errno.
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
