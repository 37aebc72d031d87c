//! # ioport-engine
//!
//! A completion-port I/O engine: one process-wide completion queue,
//! one dedicated dispatcher thread, and per-thread ready lists.
//!
//! Transport drivers post overlapped operations against the shared
//! [`port::CompletionPort`]. The dispatcher drains it and routes each
//! completion to the originating [`channel::Channel`]: payload bytes
//! land in the channel's input queue, and either a synchronously
//! blocked caller is woken through the channel's condition variable or
//! the channel is linked onto the owning thread's ready list for that
//! thread's cooperative loop to pick up.
//!
//! ## Modules
//!
//! - `port` - the completion queue and its kernel wait primitive
//! - `channel` - the reference-counted, lockable connection object
//! - `registry` - per-thread ready lists and event-loop hooks
//! - `engine` - the dispatcher thread and process lifecycle
//! - `tcp` - the TCP transport driver
//! - `error` - error types

#![allow(dead_code)]

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod channel;
        pub mod engine;
        pub mod error;
        pub mod port;
        pub mod registry;
        pub mod tcp;
    } else {
        compile_error!("ioport-engine requires a host with eventfd (linux/android)");
    }
}

// Re-exports for convenience
pub use channel::{Channel, ChannelDriver, CHAN_BLOCKED_FOR_IO, CHAN_EOF};
pub use engine::{process_init, process_shutdown, EngineCore};
pub use error::{EngineError, EngineResult};
pub use port::{CompletionPacket, CompletionPort};
pub use registry::{
    current_registry, thread_attach, EventFdWaker, LoopWaker, Readiness, ThreadRegistry,
};
pub use tcp::TcpDriver;
