//! The channel object: one logical connection, reference-counted and
//! independently lockable.
//!
//! A [`Channel`] owns no transport logic itself. Transport behavior is
//! supplied by a [`ChannelDriver`] (TCP today, other transports
//! tomorrow); the channel provides the lifecycle and synchronization
//! scaffolding around it: the per-channel lock and condition variable,
//! the input buffer queue that completions land in, the explicit
//! lifecycle reference count, and the blocked-for-I/O wait protocol.
//!
//! ## Locking
//!
//! Every mutable field lives in [`ChanState`] behind the channel's own
//! mutex. Nothing here ever takes two channel or registry locks at
//! once; cross-object protocols transfer a reference instead.
//!
//! ## Lifecycle
//!
//! created (refs=1, unlinked) → attached to a thread registry →
//! zero-or-more blocked-for-I/O ↔ ready cycles → detached → finalized
//! when refs hits zero. Releasing the last reference while the channel
//! is still linked on a ready list or attached to a registry is a
//! fatal invariant violation, not a recoverable error.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use ioport_core::buffer::{DataBuffer, Token};
use ioport_core::kwarn;

use crate::error::{EngineError, EngineResult};
use crate::registry::ThreadRegistry;

/// A thread is parked in the channel's condition variable awaiting an
/// I/O completion.
pub const CHAN_BLOCKED_FOR_IO: u32 = 1 << 0;
/// The transport reported end-of-stream (zero-byte read completion).
pub const CHAN_EOF: u32 = 1 << 1;

/// Transport behavior behind a channel.
///
/// Drivers own all transport state and post completions against the
/// shared completion port, correlated back to this channel by its
/// token. The optional hooks (`initialize`, `finalize`) bracket the
/// channel's lifetime; `finalize` runs exactly once, when the last
/// lifecycle reference is released.
pub trait ChannelDriver: Send + Sync {
    /// Transport type name, for diagnostics.
    fn name(&self) -> &'static str;

    /// Transport-specific setup, invoked once at construction.
    ///
    /// A failure here does not abort construction; the channel is
    /// still fully built and must be released through the normal drop
    /// path. That keeps a partially-built shared object from dangling.
    fn initialize(&self, _chan: &Arc<Channel>) -> EngineResult<()> {
        Ok(())
    }

    /// Open the transport (e.g. connect a socket).
    fn open(&self, chan: &Arc<Channel>, addr: &str) -> EngineResult<()>;

    /// Post an overlapped read against the completion port.
    ///
    /// Completion arrives later via the dispatcher; this call never
    /// waits for data.
    fn post_read(&self, chan: &Arc<Channel>) -> EngineResult<()>;

    /// Write bytes to the transport.
    fn write(&self, chan: &Arc<Channel>, data: &[u8]) -> EngineResult<usize>;

    fn set_option(&self, name: &str, _value: &str) -> EngineResult<()> {
        Err(EngineError::UnknownOption(name.to_string()))
    }

    fn get_option(&self, name: &str) -> EngineResult<String> {
        Err(EngineError::UnknownOption(name.to_string()))
    }

    /// Shut down the transport's write and/or read side.
    fn shutdown(&self, _chan: &Arc<Channel>) -> EngineResult<()> {
        Ok(())
    }

    /// The transport's underlying OS handle, if it has one.
    fn handle(&self) -> Option<RawFd> {
        None
    }

    /// Release transport resources. Runs exactly once.
    fn finalize(&self) {}
}

/// Mutable channel state. The channel lock is required for every
/// access, reads included.
pub struct ChanState {
    /// Bitset of `CHAN_*` flags.
    pub(crate) flags: u32,
    /// Pending incoming-data buffers, arrival order.
    pub(crate) input: VecDeque<DataBuffer>,
    /// Lifecycle reference count. Distinct from the `Arc` count: the
    /// `Arc` keeps memory alive, `refs` decides when the driver's
    /// `finalize` runs.
    pub(crate) refs: usize,
    /// Whether the channel sits on exactly one ready list right now.
    pub(crate) linked: bool,
    /// Non-owning association to the thread registry responsible for
    /// delivering this channel's readiness. Lookup only.
    pub(crate) owner: Option<Weak<ThreadRegistry>>,
    /// Last transport error delivered through the port, errno-style.
    pub(crate) last_error: Option<i32>,
    pub(crate) finalized: bool,
}

impl ChanState {
    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    /// Total unread bytes across all queued input buffers.
    pub fn buffered(&self) -> usize {
        self.input.iter().map(|b| b.len()).sum()
    }
}

/// One logical connection.
pub struct Channel {
    token: Token,
    driver: Box<dyn ChannelDriver>,
    state: Mutex<ChanState>,
    cond: Condvar,
}

impl Channel {
    /// Construct a channel over the given driver.
    ///
    /// The lifecycle count starts at 1. The driver's `initialize` hook
    /// runs after the object is fully built; if it fails, the channel
    /// is still considered constructed and the failure is only logged.
    pub fn new(driver: Box<dyn ChannelDriver>) -> Arc<Self> {
        let chan = Arc::new(Self {
            token: Token::next(),
            driver,
            state: Mutex::new(ChanState {
                flags: 0,
                input: VecDeque::new(),
                refs: 1,
                linked: false,
                owner: None,
                last_error: None,
                finalized: false,
            }),
            cond: Condvar::new(),
        });
        if let Err(e) = chan.driver.initialize(&chan) {
            kwarn!("channel {} ({}): initialize failed: {}", chan.token, chan.driver.name(), e);
        }
        chan
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Acquire the channel lock.
    pub fn lock(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take an additional lifecycle reference. Lock required.
    pub fn retain(&self, guard: &mut ChanState) {
        debug_assert!(!guard.finalized, "retain after finalize");
        guard.refs += 1;
    }

    /// Release one lifecycle reference. Consumes the lock.
    ///
    /// When the count reaches zero the driver's `finalize` hook runs,
    /// exactly once. Reaching zero while the channel is still linked
    /// on a ready list or attached to a registry means the reference
    /// protocol was violated somewhere; that is treated as fatal.
    pub fn release(&self, mut guard: MutexGuard<'_, ChanState>) {
        if guard.finalized {
            panic!("channel {}: release after finalize", self.token);
        }
        guard.refs -= 1;
        if guard.refs > 0 {
            return;
        }
        if guard.linked {
            panic!("channel {}: dropped while on a ready list", self.token);
        }
        if guard.owner.is_some() {
            panic!("channel {}: dropped while attached to a thread registry", self.token);
        }
        guard.finalized = true;
        drop(guard);
        self.driver.finalize();
    }

    /// Record which thread's registry delivers this channel's
    /// readiness. The association is weak: it never keeps the registry
    /// alive and carries no reference count of its own.
    pub fn attach_owner(&self, guard: &mut ChanState, registry: &Arc<ThreadRegistry>) {
        guard.owner = Some(Arc::downgrade(registry));
    }

    /// Clear the owning-registry association. Must happen before the
    /// last reference is released.
    pub fn detach_owner(&self, guard: &mut ChanState) {
        guard.owner = None;
    }

    pub(crate) fn owner_registry(&self, guard: &ChanState) -> Option<Arc<ThreadRegistry>> {
        guard.owner.as_ref().and_then(Weak::upgrade)
    }

    /// Park until an I/O completion is signaled.
    ///
    /// Sets the blocked-for-I/O flag, releases the lock while waiting
    /// and reacquires it atomically on wake. The wait is unbounded;
    /// timeout policy belongs to the caller or driver. Because the
    /// lock is dropped during the wait, the caller must re-validate
    /// its condition after this returns.
    pub fn await_completion<'a>(
        &self,
        mut guard: MutexGuard<'a, ChanState>,
    ) -> MutexGuard<'a, ChanState> {
        guard.flags |= CHAN_BLOCKED_FOR_IO;
        self.cond
            .wait(guard)
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wake a thread blocked in [`Self::await_completion`], if any.
    ///
    /// Checking the flag first skips the kernel transition when
    /// nothing is parked. Lock required.
    pub fn wake_after_completion(&self, guard: &mut ChanState) {
        if guard.flags & CHAN_BLOCKED_FOR_IO != 0 {
            guard.flags &= !CHAN_BLOCKED_FOR_IO;
            self.cond.notify_one();
        }
    }

    /// Link onto a ready list: marks linked and takes the list's
    /// lifecycle reference. Returns false when already linked or
    /// finalized. Lock required.
    pub(crate) fn mark_linked(&self, guard: &mut ChanState) -> bool {
        if guard.linked || guard.finalized {
            return false;
        }
        guard.linked = true;
        guard.refs += 1;
        true
    }

    /// The single choke point that unlinks from a ready list and drops
    /// the list's lifecycle reference, never one without the other.
    pub(crate) fn unlink_and_release(&self) {
        let mut guard = self.lock();
        debug_assert!(guard.linked, "unlink of an unlinked channel");
        guard.linked = false;
        self.release(guard);
    }

    /// Move queued input into `dst`, blocking until data, EOF or a
    /// transport error arrives.
    ///
    /// Buffers drain in arrival order; exhausted and zero-byte buffers
    /// are discarded. Returns the byte count moved, `Ok(0)` at
    /// end-of-stream. Never suspends when data is already queued.
    pub fn read_into(&self, dst: &mut [u8]) -> EngineResult<usize> {
        let mut guard = self.lock();
        loop {
            while let Some(front) = guard.input.front_mut() {
                if front.is_empty() {
                    guard.input.pop_front();
                    continue;
                }
                let n = front.move_out(dst);
                if front.is_empty() {
                    guard.input.pop_front();
                }
                return Ok(n);
            }
            if let Some(errno) = guard.last_error.take() {
                return Err(EngineError::Os(errno));
            }
            if guard.flags & CHAN_EOF != 0 {
                return Ok(0);
            }
            // Channel state may have changed while unlocked; loop and
            // re-check everything.
            guard = self.await_completion(guard);
        }
    }

    // Driver pass-throughs: the external interface of a channel is the
    // capability set of its transport.

    pub fn open(self: &Arc<Self>, addr: &str) -> EngineResult<()> {
        self.driver.open(self, addr)
    }

    pub fn post_read(self: &Arc<Self>) -> EngineResult<()> {
        self.driver.post_read(self)
    }

    pub fn write(self: &Arc<Self>, data: &[u8]) -> EngineResult<usize> {
        self.driver.write(self, data)
    }

    pub fn set_option(&self, name: &str, value: &str) -> EngineResult<()> {
        self.driver.set_option(name, value)
    }

    pub fn get_option(&self, name: &str) -> EngineResult<String> {
        self.driver.get_option(name)
    }

    pub fn shutdown_transport(self: &Arc<Self>) -> EngineResult<()> {
        self.driver.shutdown(self)
    }

    pub fn handle(&self) -> Option<RawFd> {
        self.driver.handle()
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }
}
