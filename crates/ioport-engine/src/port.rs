//! The process-wide completion port.
//!
//! A [`CompletionPort`] is the primitive the dispatcher thread parks
//! on: a bounded queue of [`CompletionPacket`]s paired with an eventfd
//! in semaphore mode. Transport drivers `post()` from any thread; the
//! dispatcher `wait()`s, blocking in the kernel until a packet is
//! available. One eventfd count is consumed per packet, so the
//! dispatcher wakes exactly as many times as there are completions.
//!
//! A [`CompletionPacket::Shutdown`] sentinel wakes the dispatcher out
//! of its blocking wait at process teardown.

use std::os::unix::io::RawFd;
use std::sync::Weak;

use crossbeam_queue::ArrayQueue;
use ioport_core::buffer::{DataBuffer, OpDesc};
use ioport_core::kdebug;

use crate::channel::Channel;
use crate::error::{last_errno, EngineError, EngineResult};

/// One completion drained from the port.
pub enum CompletionPacket {
    /// A finished overlapped operation.
    ///
    /// `result` is the operation outcome: byte count for a successful
    /// read/write, `0` with `OpKind::Read` for end-of-stream, negative
    /// errno for a transport failure.
    Io {
        /// The originating channel. Weak: a completion must never keep
        /// a dead channel alive.
        channel: Weak<Channel>,
        op: OpDesc,
        data: DataBuffer,
        result: i64,
    },
    /// Sentinel posted at shutdown to unblock the dispatcher.
    Shutdown,
}

/// Bounded completion queue plus its kernel wait primitive.
pub struct CompletionPort {
    queue: ArrayQueue<CompletionPacket>,
    efd: RawFd,
}

impl CompletionPort {
    /// Create a port able to hold `capacity` undelivered completions.
    pub fn new(capacity: usize) -> EngineResult<Self> {
        let efd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_SEMAPHORE) };
        if efd < 0 {
            return Err(EngineError::Os(last_errno()));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
            efd,
        })
    }

    /// Post a completion packet. Never blocks.
    ///
    /// Returns [`EngineError::PortFull`] if the queue is at capacity;
    /// the packet is handed back to no one, so callers treat this as a
    /// dropped completion.
    pub fn post(&self, packet: CompletionPacket) -> EngineResult<()> {
        if self.queue.push(packet).is_err() {
            return Err(EngineError::PortFull);
        }
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.efd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            return Err(EngineError::Os(last_errno()));
        }
        Ok(())
    }

    /// Block until a packet is available and dequeue it.
    ///
    /// Only the dispatcher thread calls this.
    pub fn wait(&self) -> EngineResult<CompletionPacket> {
        loop {
            let mut val: u64 = 0;
            let ret = unsafe {
                libc::read(
                    self.efd,
                    &mut val as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if ret < 0 {
                let errno = last_errno();
                if errno == libc::EINTR {
                    continue;
                }
                return Err(EngineError::Os(errno));
            }
            // The count was written after the push, so the pop cannot
            // come up empty; tolerate it anyway.
            match self.queue.pop() {
                Some(packet) => return Ok(packet),
                None => kdebug!("completion port: counter ahead of queue"),
            }
        }
    }

    /// Number of undelivered completions.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// The raw eventfd backing the port's wait primitive.
    pub fn handle(&self) -> RawFd {
        self.efd
    }
}

impl Drop for CompletionPort {
    fn drop(&mut self) {
        if self.efd >= 0 {
            unsafe {
                libc::close(self.efd);
            }
            self.efd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ioport_core::buffer::{OpKind, Token};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn read_packet(token: Token, payload: &[u8]) -> CompletionPacket {
        CompletionPacket::Io {
            channel: Weak::new(),
            op: OpDesc {
                kind: OpKind::Read,
                token,
            },
            data: DataBuffer::from_slice(payload),
            result: payload.len() as i64,
        }
    }

    #[test]
    fn test_post_then_wait() {
        let port = CompletionPort::new(8).unwrap();
        let token = Token::next();
        port.post(read_packet(token, b"abcd")).unwrap();

        match port.wait().unwrap() {
            CompletionPacket::Io { op, data, .. } => {
                assert_eq!(op.token, token);
                assert_eq!(data.len(), 4);
            }
            CompletionPacket::Shutdown => panic!("unexpected sentinel"),
        }
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let port = Arc::new(CompletionPort::new(8).unwrap());
        let waiter = {
            let port = Arc::clone(&port);
            thread::spawn(move || port.wait())
        };

        thread::sleep(Duration::from_millis(50));
        port.post(CompletionPacket::Shutdown).unwrap();

        match waiter.join().unwrap().unwrap() {
            CompletionPacket::Shutdown => {}
            _ => panic!("expected the sentinel"),
        }
    }

    #[test]
    fn test_port_full() {
        let port = CompletionPort::new(1).unwrap();
        port.post(CompletionPacket::Shutdown).unwrap();
        match port.post(CompletionPacket::Shutdown) {
            Err(EngineError::PortFull) => {}
            other => panic!("expected PortFull, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_fifo_order() {
        let port = CompletionPort::new(8).unwrap();
        let token = Token::next();
        port.post(read_packet(token, b"first")).unwrap();
        port.post(read_packet(token, b"second!")).unwrap();

        let lens: Vec<usize> = (0..2)
            .map(|_| match port.wait().unwrap() {
                CompletionPacket::Io { data, .. } => data.len(),
                _ => panic!("unexpected sentinel"),
            })
            .collect();
        assert_eq!(lens, vec![5, 7]);
    }
}
