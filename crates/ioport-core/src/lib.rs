//! # ioport-core
//!
//! Core types for the ioport completion engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! All platform-specific pieces (the completion port itself, the
//! dispatcher thread, transport drivers) live in `ioport-engine`.
//!
//! ## Modules
//!
//! - `buffer` - byte staging buffers and I/O operation descriptors
//! - `once` - one-time initialization with memoized outcome
//! - `error` - error types
//! - `kprint` - kernel-style debug printing macros

#![allow(dead_code)]

pub mod buffer;
pub mod error;
pub mod kprint;
pub mod once;

// Re-exports for convenience
pub use buffer::{DataBuffer, IoBuffer, OpDesc, OpKind, Token};
pub use error::{CoreError, CoreResult};
pub use once::OnceFlag;
