//! One-time initialization with memoized outcome.
//!
//! An [`OnceFlag`] guarantees that an initialization function runs to
//! completion exactly once within a process, no matter how many threads
//! race to call it. Every caller observes the final outcome: `Ok` once
//! the function has succeeded, `Err(InitFailed)` forever after it has
//! failed. A failed initialization is never retried — partial OS
//! resource state cannot be safely rolled back and re-run.
//!
//! State machine: `INIT → IN_PROGRESS → {DONE | ERROR}`. Racing callers
//! CAS from `INIT`; exactly one wins and runs the function. A caller
//! that observes `IN_PROGRESS` spins, yielding the processor between
//! checks, until the state settles.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{CoreError, CoreResult};

const STATE_INIT: u8 = 0;
const STATE_IN_PROGRESS: u8 = 1;
const STATE_DONE: u8 = 2;
const STATE_ERROR: u8 = 3;

/// Tracks the state of one process-global initialization.
///
/// Declare as a `static`; the zero state is "not yet initialized".
pub struct OnceFlag {
    state: AtomicU8,
}

impl OnceFlag {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_INIT),
        }
    }

    /// Run `init` exactly once across all concurrent callers.
    ///
    /// The winning caller gets `init`'s own error on failure; every
    /// other caller (including all later ones) gets
    /// [`CoreError::InitFailed`] once the flag is in the error state.
    pub fn run<F>(&self, init: F) -> CoreResult<()>
    where
        F: FnOnce() -> CoreResult<()>,
    {
        match self.state.compare_exchange(
            STATE_INIT,
            STATE_IN_PROGRESS,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // We won the race; we do the init.
                match init() {
                    Ok(()) => {
                        self.state.store(STATE_DONE, Ordering::Release);
                        Ok(())
                    }
                    Err(e) => {
                        self.state.store(STATE_ERROR, Ordering::Release);
                        Err(e)
                    }
                }
            }
            Err(STATE_DONE) => Ok(()),
            Err(STATE_ERROR) => Err(CoreError::InitFailed),
            Err(_) => {
                // Another thread is initializing. The yield keeps this
                // from being a hard loop; the initializer gets cycles.
                loop {
                    match self.state.load(Ordering::Acquire) {
                        STATE_DONE => return Ok(()),
                        STATE_ERROR => return Err(CoreError::InitFailed),
                        _ => std::thread::yield_now(),
                    }
                }
            }
        }
    }

    /// Whether the initialization has completed successfully.
    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DONE
    }

    /// Whether the initialization has failed permanently.
    pub fn is_error(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ERROR
    }
}

impl Default for OnceFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_runs_exactly_once() {
        let flag = OnceFlag::new();
        let count = AtomicUsize::new(0);

        for _ in 0..4 {
            flag.run(|| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(flag.is_done());
    }

    #[test]
    fn test_concurrent_callers_agree() {
        let flag = Arc::new(OnceFlag::new());
        let count = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..8 {
            let flag = Arc::clone(&flag);
            let count = Arc::clone(&count);
            handles.push(thread::spawn(move || {
                flag.run(|| {
                    // Widen the race window so losers actually observe
                    // IN_PROGRESS and take the spin path.
                    thread::sleep(std::time::Duration::from_millis(20));
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }));
        }

        for h in handles {
            assert!(h.join().unwrap().is_ok());
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_is_sticky() {
        let flag = OnceFlag::new();
        let count = AtomicUsize::new(0);

        let first = flag.run(|| {
            count.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::AllocFailed)
        });
        assert_eq!(first, Err(CoreError::AllocFailed));
        assert!(flag.is_error());

        // Later callers fail fast; the function never runs again.
        let second = flag.run(|| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(second, Err(CoreError::InitFailed));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
