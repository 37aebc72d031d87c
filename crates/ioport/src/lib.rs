//! # ioport - completion-port I/O engine
//!
//! A single process-wide completion port accepts overlapped I/O
//! completions from any number of channels, funnels them through one
//! dedicated dispatcher thread, and redistributes readiness to the
//! specific thread that owns each channel.
//!
//! ## Quick Start
//!
//! ```ignore
//! use ioport::{init, Channel, TcpDriver};
//!
//! fn main() -> ioport::EngineResult<()> {
//!     // Process-wide port + dispatcher, and this thread's registry.
//!     init()?;
//!
//!     let chan = Channel::new(TcpDriver::new());
//!     chan.open("127.0.0.1:7000")?;
//!     chan.write(b"ping")?;
//!
//!     // Synchronous style: park in the channel's condition variable
//!     // until the dispatcher delivers a completion.
//!     let mut buf = [0u8; 4096];
//!     let n = chan.read_into(&mut buf)?;
//!     println!("got {} bytes", n);
//!     Ok(())
//! }
//! ```
//!
//! Callers running their own cooperative event loop use the
//! notification style instead: attach channels to the thread's
//! registry, poll [`ThreadRegistry::has_ready`] before waiting and
//! drain [`ThreadRegistry::take_ready`] after.

pub use ioport_core::buffer::{DataBuffer, IoBuffer, OpDesc, OpKind, Token};
pub use ioport_core::error::{CoreError, CoreResult};
pub use ioport_core::once::OnceFlag;

pub use ioport_engine::channel::{Channel, ChannelDriver};
pub use ioport_engine::engine::{process_init, process_shutdown, EngineCore};
pub use ioport_engine::error::{EngineError, EngineResult};
pub use ioport_engine::port::{CompletionPacket, CompletionPort};
pub use ioport_engine::registry::{
    current_registry, thread_attach, EventFdWaker, LoopWaker, Readiness, ThreadRegistry,
};
pub use ioport_engine::tcp::TcpDriver;

/// Initialize the engine for this process and attach the calling
/// thread. Both halves are idempotent.
pub fn init() -> EngineResult<std::sync::Arc<ThreadRegistry>> {
    process_init()?;
    Ok(thread_attach())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let a = init().unwrap();
        let b = init().unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
    }
}
