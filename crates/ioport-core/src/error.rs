//! ioport-core error types.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// One-time initialization failed, either in this caller or in
    /// another thread. The failure is sticky for the process lifetime.
    InitFailed,
    /// Storage allocation failed.
    AllocFailed,
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitFailed => write!(f, "one-time initialization failed"),
            Self::AllocFailed => write!(f, "storage allocation failed"),
        }
    }
}

impl std::error::Error for CoreError {}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
