//! Per-thread registry: the ready list and event-loop hooks.
//!
//! Every thread that uses the engine owns one [`ThreadRegistry`],
//! created lazily by [`thread_attach`] and stored in TLS. The
//! dispatcher finds a channel's registry through the channel's owner
//! association and links the channel onto the registry's ready list;
//! the owning thread drains that list from its own cooperative loop.
//!
//! The registry is reference-counted with two owners: the thread
//! itself (released by the TLS destructor at thread exit) and,
//! transiently, the dispatcher while it is delivering. Releasing the
//! last reference while the ready list is non-empty is a dispatcher
//! defect and is treated as fatal.
//!
//! Event-loop integration is a readiness-polling interface rather
//! than a loop-registration mechanism: [`ThreadRegistry::has_ready`]
//! is the pre-wait hook (lets a loop shorten its wait when work is
//! already pending) and [`ThreadRegistry::take_ready`] the post-wait
//! hook (one [`Readiness`] notification per ready channel). A
//! [`LoopWaker`] lets the dispatcher nudge a loop parked in its own
//! wait primitive.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use ioport_core::buffer::Token;
use ioport_core::ktrace;

use crate::channel::Channel;
use crate::error::{last_errno, EngineError, EngineResult};

/// Wakes a thread's cooperative event loop out of its wait.
///
/// `wake()` must never block. Multiple wakes before the loop runs may
/// be coalesced into one.
pub trait LoopWaker: Send + Sync {
    fn wake(&self);
}

/// Stock [`LoopWaker`] over an eventfd.
///
/// Coalescing comes from eventfd counter semantics: the counter
/// accumulates, one read drains.
pub struct EventFdWaker {
    fd: RawFd,
    owned: bool,
}

impl EventFdWaker {
    /// Wrap an existing eventfd. The caller keeps ownership of the fd.
    pub fn new(eventfd: RawFd) -> Self {
        Self {
            fd: eventfd,
            owned: false,
        }
    }

    /// Create a fresh eventfd and own it.
    pub fn create() -> EngineResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(EngineError::Os(last_errno()));
        }
        Ok(Self { fd, owned: true })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Consume any accumulated wake count. Returns it, 0 when none.
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            0
        } else {
            val
        }
    }
}

impl LoopWaker for EventFdWaker {
    fn wake(&self) {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // EAGAIN means the counter is saturated; a wake is already
        // pending, which is all we need.
        let _ = ret;
    }
}

impl Drop for EventFdWaker {
    fn drop(&mut self) {
        if self.owned && self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

/// One readiness notification handed to the owning thread's loop.
pub struct Readiness {
    pub channel: Arc<Channel>,
    pub token: Token,
}

struct RegState {
    /// Identity of the owning thread; cleared once the thread exits.
    thread_id: Option<ThreadId>,
    /// Channels with undelivered completions for this thread.
    ready: VecDeque<Arc<Channel>>,
    /// Two owners at most: the thread, and the dispatcher transiently.
    refs: usize,
    waker: Option<Arc<dyn LoopWaker>>,
}

/// Per-thread engine state.
pub struct ThreadRegistry {
    state: Mutex<RegState>,
}

impl ThreadRegistry {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegState {
                thread_id: Some(thread::current().id()),
                ready: VecDeque::new(),
                refs: 1,
                waker: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of the owning thread, `None` after it has exited.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.lock().thread_id
    }

    /// Take a transient reference (dispatcher side).
    pub fn retain(&self) {
        self.lock().refs += 1;
    }

    /// Drop one reference. Finalizing with channels still on the
    /// ready list means the dispatcher delivered into a registry that
    /// was being torn down; that is a defect, not a runtime condition.
    pub fn release(&self) {
        let mut g = self.lock();
        g.refs -= 1;
        if g.refs == 0 && !g.ready.is_empty() {
            panic!("thread registry freed with channels on its ready list");
        }
    }

    /// Install the waker the dispatcher uses to nudge this thread's
    /// event loop.
    pub fn set_waker(&self, waker: Arc<dyn LoopWaker>) {
        self.lock().waker = Some(waker);
    }

    /// Pre-wait hook: whether ready channels are pending. A loop that
    /// sees `true` should skip or shorten its wait.
    pub fn has_ready(&self) -> bool {
        !self.lock().ready.is_empty()
    }

    /// Post-wait hook: drain the ready list, one notification per
    /// channel. Each channel is unlinked through the single
    /// unlink-and-release choke point.
    pub fn take_ready(&self) -> Vec<Readiness> {
        let drained: Vec<Arc<Channel>> = {
            let mut g = self.lock();
            g.ready.drain(..).collect()
        };
        drained
            .into_iter()
            .map(|channel| {
                channel.unlink_and_release();
                Readiness {
                    token: channel.token(),
                    channel,
                }
            })
            .collect()
    }

    /// Dispatcher side: put a channel on this registry's ready list
    /// and nudge the owning loop. Skips channels already linked.
    pub(crate) fn link_ready(&self, chan: &Arc<Channel>) {
        {
            let mut g = chan.lock();
            if !chan.mark_linked(&mut g) {
                return;
            }
        }
        let waker = {
            let mut g = self.lock();
            g.ready.push_back(Arc::clone(chan));
            g.waker.clone()
        };
        ktrace!("channel {} linked ready", chan.token());
        if let Some(w) = waker {
            w.wake();
        }
    }

    fn clear_thread(&self) {
        self.lock().thread_id = None;
    }
}

/// TLS slot whose destructor is the thread-exit hook: clears the
/// registry's thread identity and drops the thread's reference.
struct TlsSlot(Arc<ThreadRegistry>);

impl Drop for TlsSlot {
    fn drop(&mut self) {
        self.0.clear_thread();
        self.0.release();
    }
}

thread_local! {
    static REGISTRY: RefCell<Option<TlsSlot>> = const { RefCell::new(None) };
}

/// Begin using the engine on the calling thread.
///
/// Idempotent: repeated calls on one thread return the same registry.
/// Teardown is automatic at thread exit.
pub fn thread_attach() -> Arc<ThreadRegistry> {
    REGISTRY.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(TlsSlot(reg)) = slot.as_ref() {
            return Arc::clone(reg);
        }
        let reg = ThreadRegistry::new();
        *slot = Some(TlsSlot(Arc::clone(&reg)));
        reg
    })
}

/// The calling thread's registry, if it has attached.
pub fn current_registry() -> Option<Arc<ThreadRegistry>> {
    REGISTRY.with(|slot| slot.borrow().as_ref().map(|s| Arc::clone(&s.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::NullDriver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Weak;

    struct CountingWaker(AtomicUsize);

    impl LoopWaker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_thread_attach_is_idempotent() {
        let a = thread_attach();
        let b = thread_attach();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.thread_id(), Some(thread::current().id()));
    }

    #[test]
    fn test_exit_hook_clears_and_releases() {
        let weak: Weak<ThreadRegistry> = thread::spawn(|| Arc::downgrade(&thread_attach()))
            .join()
            .unwrap();
        // The TLS destructor dropped the thread's reference; nothing
        // else holds the registry.
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_link_and_take_ready() {
        let reg = ThreadRegistry::new();
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        reg.set_waker(Arc::clone(&waker) as Arc<dyn LoopWaker>);

        let chan = Channel::new(NullDriver::boxed());
        {
            let mut g = chan.lock();
            chan.attach_owner(&mut g, &reg);
        }

        assert!(!reg.has_ready());
        reg.link_ready(&chan);
        // Second link while already linked is a no-op.
        reg.link_ready(&chan);

        assert!(reg.has_ready());
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);

        let ready = reg.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].token, chan.token());
        assert!(!reg.has_ready());

        let g = chan.lock();
        assert!(!g.is_linked());
        assert_eq!(g.refs(), 1);
    }

    #[test]
    #[should_panic(expected = "ready list")]
    fn test_finalize_with_ready_channels_is_fatal() {
        let reg = ThreadRegistry::new();
        let chan = Channel::new(NullDriver::boxed());
        {
            let mut g = chan.lock();
            chan.attach_owner(&mut g, &reg);
        }
        reg.link_ready(&chan);
        // Dropping the last reference with a non-empty ready list.
        reg.release();
    }

    #[test]
    fn test_eventfd_waker_coalesces() {
        let waker = EventFdWaker::create().unwrap();
        waker.wake();
        waker.wake();
        waker.wake();
        assert_eq!(waker.drain(), 3);
        assert_eq!(waker.drain(), 0);
    }
}
