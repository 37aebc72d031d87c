//! Process-wide engine: the dispatcher thread and its lifecycle.
//!
//! One [`EngineCore`] exists per process: the completion port plus the
//! dedicated dispatcher thread that drains it. Initialization and
//! teardown both run under the one-time-initializer discipline, so a
//! failed init is sticky for the process lifetime and teardown runs at
//! most once (explicitly or via the registered process-exit hook).
//!
//! The dispatcher blocks on the port and, for each completion, locks
//! the originating channel, moves the payload into its input queue,
//! then either wakes a synchronously blocked waiter or links the
//! channel onto its owning thread's ready list and nudges that
//! thread's loop waker. Channels with neither a waiter nor an owner
//! simply accumulate data for a later reader.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ioport_core::buffer::{DataBuffer, OpDesc, OpKind};
use ioport_core::error::CoreError;
use ioport_core::{kdebug, kerror, kinfo, kwarn, OnceFlag};

use crate::channel::{Channel, CHAN_BLOCKED_FOR_IO, CHAN_EOF};
use crate::error::{EngineError, EngineResult};
use crate::port::{CompletionPacket, CompletionPort};

/// Undelivered completions the port can hold.
const PORT_CAPACITY: usize = 4096;

/// How long shutdown waits for the dispatcher to drain and exit.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// The completion port and its dispatcher thread.
pub struct EngineCore {
    port: Arc<CompletionPort>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl EngineCore {
    /// Create the port and spawn the dispatcher.
    pub fn start() -> EngineResult<Arc<Self>> {
        let port = Arc::new(CompletionPort::new(PORT_CAPACITY)?);
        let loop_port = Arc::clone(&port);
        let handle = thread::Builder::new()
            .name("ioport-dispatcher".into())
            .spawn(move || dispatcher_loop(loop_port))
            .map_err(EngineError::Io)?;
        kinfo!("dispatcher started");
        Ok(Arc::new(Self {
            port,
            dispatcher: Mutex::new(Some(handle)),
        }))
    }

    /// The shared completion port drivers post against.
    pub fn port(&self) -> Arc<CompletionPort> {
        Arc::clone(&self.port)
    }

    /// Stop the dispatcher: post the shutdown sentinel, wait for the
    /// thread within the grace period.
    ///
    /// Returns true when the dispatcher exited cleanly. A dispatcher
    /// that will not yield is detached rather than terminated (Rust
    /// offers no safe thread kill); that path is best-effort and
    /// logged as an error. Idempotent: later calls are no-ops.
    pub fn stop(&self) -> bool {
        let handle = {
            let mut g = self
                .dispatcher
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            g.take()
        };
        let Some(handle) = handle else {
            return true;
        };

        if let Err(e) = self.port.post(CompletionPacket::Shutdown) {
            kwarn!("shutdown sentinel not posted: {}", e);
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        if handle.is_finished() {
            let _ = handle.join();
            kinfo!("dispatcher stopped");
            true
        } else {
            kerror!(
                "dispatcher did not exit within {:?}; detaching its handle",
                SHUTDOWN_GRACE
            );
            drop(handle);
            false
        }
    }
}

fn dispatcher_loop(port: Arc<CompletionPort>) {
    loop {
        match port.wait() {
            Ok(CompletionPacket::Shutdown) => break,
            Ok(CompletionPacket::Io {
                channel,
                op,
                data,
                result,
            }) => deliver(channel, op, data, result),
            Err(e) => {
                kerror!("completion port wait failed: {}", e);
                break;
            }
        }
    }
    kdebug!("dispatcher exiting");
}

/// Route one completion to its channel.
fn deliver(channel: Weak<Channel>, op: OpDesc, data: DataBuffer, result: i64) {
    let Some(chan) = channel.upgrade() else {
        kdebug!("completion {} for a dropped channel", op.token);
        return;
    };

    let mut guard = chan.lock();
    if result < 0 {
        guard.last_error = Some((-result) as i32);
    } else {
        match op.kind {
            // Bytes land in arrival order; empty buffers are legal and
            // skipped by readers.
            OpKind::Read => guard.input.push_back(data),
            OpKind::Disconnect => guard.flags |= CHAN_EOF,
            OpKind::Write | OpKind::Connect => {}
        }
    }

    if guard.flags & CHAN_BLOCKED_FOR_IO != 0 {
        // A thread is parked in the channel's condvar; wake it
        // directly, still under the channel lock.
        chan.wake_after_completion(&mut guard);
        return;
    }

    // Notification style: hand the channel to its owning thread's
    // ready list. The registry reference is held only for the
    // duration of the delivery.
    let owner = chan.owner_registry(&guard);
    drop(guard);
    if let Some(registry) = owner {
        registry.retain();
        registry.link_ready(&chan);
        registry.release();
    }
}

// ── Process lifecycle ─────────────────────────────────────────────

static PROCESS_INIT: OnceFlag = OnceFlag::new();
static PROCESS_CLEANUP: OnceFlag = OnceFlag::new();
static ENGINE: Mutex<Option<Arc<EngineCore>>> = Mutex::new(None);

fn engine_slot() -> MutexGuard<'static, Option<Arc<EngineCore>>> {
    ENGINE.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Initialize the process-wide engine.
///
/// Idempotent and memoized: the first caller creates the port and
/// dispatcher, every caller observes the same outcome, and a failure
/// is permanent for the process.
pub fn process_init() -> EngineResult<()> {
    PROCESS_INIT.run(|| {
        let core = EngineCore::start().map_err(|e| {
            kerror!("engine initialization failed: {}", e);
            CoreError::InitFailed
        })?;
        *engine_slot() = Some(core);
        let rc = unsafe { libc::atexit(process_exit_handler) };
        if rc != 0 {
            kwarn!("could not register process-exit hook; call process_shutdown explicitly");
        }
        Ok(())
    })?;
    Ok(())
}

/// The process-wide engine, if initialized.
pub fn engine() -> EngineResult<Arc<EngineCore>> {
    engine_slot()
        .as_ref()
        .cloned()
        .ok_or(EngineError::NotInitialized)
}

/// The shared completion port, for transport drivers.
pub fn port() -> EngineResult<Arc<CompletionPort>> {
    engine().map(|e| e.port())
}

/// Tear the engine down. Runs at most once per process; also invoked
/// automatically at process exit.
pub fn process_shutdown() {
    let _ = PROCESS_CLEANUP.run(|| {
        let core = engine_slot().take();
        if let Some(core) = core {
            core.stop();
        }
        Ok(())
    });
}

extern "C" fn process_exit_handler() {
    process_shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::NullDriver;
    use crate::registry::ThreadRegistry;
    use ioport_core::buffer::Token;

    fn read_packet(chan: &Arc<Channel>, payload: &[u8]) -> CompletionPacket {
        CompletionPacket::Io {
            channel: Arc::downgrade(chan),
            op: OpDesc {
                kind: OpKind::Read,
                token: chan.token(),
            },
            data: DataBuffer::from_slice(payload),
            result: payload.len() as i64,
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_concurrent_init_creates_one_engine() {
        let handles: Vec<_> = (0..2)
            .map(|_| thread::spawn(process_init))
            .collect();
        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }

        // Exactly one port; later init calls see the same engine.
        let a = engine().unwrap();
        process_init().unwrap();
        let b = engine().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.port().handle(), b.port().handle());
    }

    #[test]
    fn test_completions_queue_without_waiter() {
        process_init().unwrap();
        let chan = Channel::new(NullDriver::boxed());
        let port = port().unwrap();

        // 4, 0 and 10 bytes; nobody is waiting.
        port.post(read_packet(&chan, b"abcd")).unwrap();
        port.post(read_packet(&chan, b"")).unwrap();
        port.post(read_packet(&chan, b"0123456789")).unwrap();

        wait_until(|| chan.lock().buffered() == 14);

        // A reader now returns immediately, in arrival order, with
        // the empty completion skipped.
        let mut buf = [0u8; 64];
        assert_eq!(chan.read_into(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(chan.read_into(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"0123456789");
    }

    #[test]
    fn test_dispatcher_wakes_blocked_waiter() {
        process_init().unwrap();
        let chan = Channel::new(NullDriver::boxed());

        let waiter = {
            let chan = Arc::clone(&chan);
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                chan.read_into(&mut buf).map(|n| buf[..n].to_vec())
            })
        };

        wait_until(|| chan.lock().flags() & CHAN_BLOCKED_FOR_IO != 0);

        port()
            .unwrap()
            .post(read_packet(&chan, b"hello"))
            .unwrap();

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, b"hello");
    }

    #[test]
    fn test_dispatcher_links_owned_channel() {
        process_init().unwrap();
        let registry = ThreadRegistry::new();
        let chan = Channel::new(NullDriver::boxed());
        {
            let mut g = chan.lock();
            chan.attach_owner(&mut g, &registry);
        }

        port().unwrap().post(read_packet(&chan, b"ping")).unwrap();

        wait_until(|| registry.has_ready());

        let ready = registry.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, chan.token());
        let mut buf = [0u8; 8];
        assert_eq!(ready[0].channel.read_into(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_error_completion_surfaces_to_reader() {
        process_init().unwrap();
        let chan = Channel::new(NullDriver::boxed());
        port()
            .unwrap()
            .post(CompletionPacket::Io {
                channel: Arc::downgrade(&chan),
                op: OpDesc {
                    kind: OpKind::Read,
                    token: chan.token(),
                },
                data: DataBuffer::with_capacity(0),
                result: -(libc::ECONNRESET as i64),
            })
            .unwrap();

        wait_until(|| chan.lock().last_error.is_some());

        let mut buf = [0u8; 8];
        match chan.read_into(&mut buf) {
            Err(EngineError::Os(e)) => assert_eq!(e, libc::ECONNRESET),
            other => panic!("expected Os error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_completion_for_dropped_channel_is_discarded() {
        process_init().unwrap();
        let port = port().unwrap();
        let packet = {
            let chan = Channel::new(NullDriver::boxed());
            read_packet(&chan, b"late")
        };
        // The channel is gone; the dispatcher must not crash.
        port.post(packet).unwrap();
        wait_until(|| port.pending() == 0);
    }

    #[test]
    fn test_shutdown_sentinel_stops_private_dispatcher() {
        // A private core, so the process-wide engine used by the other
        // tests stays up.
        let core = EngineCore::start().unwrap();
        let port = core.port();
        let port_weak = Arc::downgrade(&port);
        drop(port);

        assert!(core.stop(), "dispatcher should exit within the grace period");
        // Stopping again is a no-op.
        assert!(core.stop());

        // The dispatcher's clone of the port is gone; only the core's
        // own reference remains, released exactly once on drop.
        drop(core);
        assert!(port_weak.upgrade().is_none());
    }

    #[test]
    fn test_token_unique_per_channel() {
        let a = Channel::new(NullDriver::boxed());
        let b = Channel::new(NullDriver::boxed());
        assert_ne!(a.token(), b.token());
        let _ = Token::next();
    }
}
