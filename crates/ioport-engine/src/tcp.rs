//! TCP transport driver.
//!
//! The concrete [`ChannelDriver`] over a `std::net::TcpStream`. Reads
//! are overlapped: `post_read` starts a poster thread that performs
//! the blocking reads and posts each result as a completion packet
//! against the shared port, correlated by the channel token. The
//! channel itself never blocks in transport code; data reaches callers
//! through the dispatcher like any other completion.
//!
//! Options mirror the usual socket knobs: `nodelay` and `keepalive`,
//! settable before or after `open`.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

use ioport_core::buffer::{DataBuffer, OpDesc, OpKind, Token};
use ioport_core::{kdebug, kwarn};

use crate::channel::{Channel, ChannelDriver};
use crate::engine;
use crate::error::{last_errno, EngineError, EngineResult};
use crate::port::{CompletionPacket, CompletionPort};

const READ_CHUNK: usize = 4096;

struct TcpState {
    stream: Option<TcpStream>,
    poster_running: bool,
    nodelay: bool,
    keepalive: bool,
}

/// `ChannelDriver` for TCP connections.
pub struct TcpDriver {
    inner: Mutex<TcpState>,
}

impl TcpDriver {
    /// An unconnected driver; `open` connects it.
    pub fn new() -> Box<Self> {
        Box::new(Self {
            inner: Mutex::new(TcpState {
                stream: None,
                poster_running: false,
                nodelay: false,
                keepalive: false,
            }),
        })
    }

    /// Wrap an already-connected stream (accepted connections).
    pub fn from_stream(stream: TcpStream) -> Box<Self> {
        Box::new(Self {
            inner: Mutex::new(TcpState {
                stream: Some(stream),
                poster_running: false,
                nodelay: false,
                keepalive: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, TcpState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the read poster thread if it is not already running.
    fn ensure_poster(&self, chan: &Arc<Channel>) -> EngineResult<()> {
        let mut g = self.lock();
        let Some(stream) = g.stream.as_ref() else {
            return Err(EngineError::NotConnected);
        };
        if g.poster_running {
            return Ok(());
        }
        let stream = stream.try_clone()?;
        let port = engine::port()?;
        let weak = Arc::downgrade(chan);
        let token = chan.token();
        thread::Builder::new()
            .name(format!("ioport-tcp-{}", token.0))
            .spawn(move || poster_loop(stream, weak, token, port))
            .map_err(EngineError::Io)?;
        g.poster_running = true;
        Ok(())
    }
}

impl ChannelDriver for TcpDriver {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn open(&self, chan: &Arc<Channel>, addr: &str) -> EngineResult<()> {
        let stream = TcpStream::connect(addr)?;
        {
            let mut g = self.lock();
            if g.nodelay {
                stream.set_nodelay(true)?;
            }
            if g.keepalive {
                set_keepalive(stream.as_raw_fd(), true)?;
            }
            g.stream = Some(stream);
        }
        kdebug!("channel {}: connected to {}", chan.token(), addr);
        // Reads are posted from the moment the connection is up.
        self.ensure_poster(chan)
    }

    fn post_read(&self, chan: &Arc<Channel>) -> EngineResult<()> {
        self.ensure_poster(chan)
    }

    fn write(&self, _chan: &Arc<Channel>, data: &[u8]) -> EngineResult<usize> {
        let g = self.lock();
        let Some(stream) = g.stream.as_ref() else {
            return Err(EngineError::NotConnected);
        };
        let n = (&*stream).write(data)?;
        Ok(n)
    }

    fn set_option(&self, name: &str, value: &str) -> EngineResult<()> {
        let on = matches!(value, "1" | "true" | "yes" | "on");
        let mut g = self.lock();
        match name {
            "nodelay" => {
                g.nodelay = on;
                if let Some(stream) = g.stream.as_ref() {
                    stream.set_nodelay(on)?;
                }
                Ok(())
            }
            "keepalive" => {
                g.keepalive = on;
                if let Some(stream) = g.stream.as_ref() {
                    set_keepalive(stream.as_raw_fd(), on)?;
                }
                Ok(())
            }
            _ => Err(EngineError::UnknownOption(name.to_string())),
        }
    }

    fn get_option(&self, name: &str) -> EngineResult<String> {
        let g = self.lock();
        match name {
            "nodelay" => Ok(if g.nodelay { "1" } else { "0" }.to_string()),
            "keepalive" => Ok(if g.keepalive { "1" } else { "0" }.to_string()),
            _ => Err(EngineError::UnknownOption(name.to_string())),
        }
    }

    fn shutdown(&self, _chan: &Arc<Channel>) -> EngineResult<()> {
        let g = self.lock();
        let Some(stream) = g.stream.as_ref() else {
            return Err(EngineError::NotConnected);
        };
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }

    fn handle(&self) -> Option<RawFd> {
        self.lock().stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn finalize(&self) {
        let mut g = self.lock();
        if let Some(stream) = g.stream.take() {
            // Unblocks the poster thread, which then exits on its own.
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Blocking read loop feeding the completion port.
fn poster_loop(mut stream: TcpStream, chan: Weak<Channel>, token: Token, port: Arc<CompletionPort>) {
    loop {
        if chan.upgrade().is_none() {
            break;
        }
        let mut tmp = [0u8; READ_CHUNK];
        let (packet, done) = match stream.read(&mut tmp) {
            Ok(0) => (
                CompletionPacket::Io {
                    channel: chan.clone(),
                    op: OpDesc {
                        kind: OpKind::Disconnect,
                        token,
                    },
                    data: DataBuffer::with_capacity(0),
                    result: 0,
                },
                true,
            ),
            Ok(n) => {
                let mut data = DataBuffer::with_capacity(n);
                data.write_in(&tmp[..n]);
                (
                    CompletionPacket::Io {
                        channel: chan.clone(),
                        op: OpDesc {
                            kind: OpKind::Read,
                            token,
                        },
                        data,
                        result: n as i64,
                    },
                    false,
                )
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => (
                CompletionPacket::Io {
                    channel: chan.clone(),
                    op: OpDesc {
                        kind: OpKind::Read,
                        token,
                    },
                    data: DataBuffer::with_capacity(0),
                    result: -(e.raw_os_error().unwrap_or(libc::EIO) as i64),
                },
                true,
            ),
        };
        if let Err(e) = port.post(packet) {
            kwarn!("channel {}: read completion dropped: {}", token, e);
            break;
        }
        if done {
            break;
        }
    }
}

fn set_keepalive(fd: RawFd, on: bool) -> EngineResult<()> {
    let val: libc::c_int = on as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &val as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(EngineError::Os(last_errno()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn echo_server() -> (String, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = sock.read(&mut buf).unwrap();
            sock.write_all(&buf[..n]).unwrap();
            sock.shutdown(Shutdown::Write).unwrap();
        });
        (addr, handle)
    }

    #[test]
    fn test_tcp_round_trip_and_eof() {
        engine::process_init().unwrap();
        let (addr, server) = echo_server();

        let chan = Channel::new(TcpDriver::new());
        chan.open(&addr).unwrap();
        assert_eq!(chan.write(b"hello port").unwrap(), 10);

        let mut buf = [0u8; 64];
        let mut got = Vec::new();
        loop {
            let n = chan.read_into(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello port");

        server.join().unwrap();
        chan.release(chan.lock());
    }

    #[test]
    fn test_options_before_and_after_open() {
        engine::process_init().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let chan = Channel::new(TcpDriver::new());
        chan.set_option("nodelay", "1").unwrap();
        assert_eq!(chan.get_option("nodelay").unwrap(), "1");

        chan.open(&addr).unwrap();
        let _accepted = listener.accept().unwrap();

        chan.set_option("keepalive", "on").unwrap();
        assert_eq!(chan.get_option("keepalive").unwrap(), "1");
        assert!(chan.handle().is_some());

        match chan.set_option("bogus", "1") {
            Err(EngineError::UnknownOption(name)) => assert_eq!(name, "bogus"),
            other => panic!("expected UnknownOption, got {:?}", other),
        }
        chan.release(chan.lock());
    }

    #[test]
    fn test_write_before_open_fails() {
        let chan = Channel::new(TcpDriver::new());
        match chan.write(b"x") {
            Err(EngineError::NotConnected) => {}
            other => panic!("expected NotConnected, got {:?}", other.map(|_| ())),
        }
        chan.release(chan.lock());
    }
}
