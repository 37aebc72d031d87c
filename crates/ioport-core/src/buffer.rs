//! Byte staging buffers and I/O operation descriptors.
//!
//! A [`DataBuffer`] stages bytes between a kernel completion and the
//! caller that eventually reads them. It is exclusively owned by
//! whichever component currently holds it: a channel's input queue, an
//! in-flight operation, or nothing at all. Partial consumption is
//! supported through a begin cursor; consuming never copies more than
//! is available.
//!
//! An [`IoBuffer`] pairs a `DataBuffer` with an outstanding-operation
//! descriptor ([`OpDesc`]) — the staging half of an overlapped I/O
//! request, correlated back to its channel by [`Token`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation token identifying one channel across the completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

impl Token {
    /// Allocate a fresh process-unique token.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Token(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The kind of I/O operation an in-flight buffer belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    Connect,
    Disconnect,
}

/// Descriptor for one outstanding overlapped operation.
#[derive(Debug, Clone, Copy)]
pub struct OpDesc {
    pub kind: OpKind,
    pub token: Token,
}

/// A capacity-bounded byte staging area with partial consumption.
///
/// `begin` is the consumption cursor, `len` the unread byte count.
/// Zero capacity is legal and allocates no storage.
pub struct DataBuffer {
    storage: Option<Box<[u8]>>,
    begin: usize,
    len: usize,
}

impl DataBuffer {
    /// Allocate a buffer able to hold `capacity` bytes.
    ///
    /// A capacity of zero yields no storage; that is not an error.
    pub fn with_capacity(capacity: usize) -> Self {
        let storage = if capacity > 0 {
            Some(vec![0u8; capacity].into_boxed_slice())
        } else {
            None
        };
        Self {
            storage,
            begin: 0,
            len: 0,
        }
    }

    /// Allocate a buffer holding a copy of `src`, ready to be consumed.
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::with_capacity(src.len());
        buf.write_in(src);
        buf
    }

    /// Append bytes after the unread region, up to remaining capacity.
    ///
    /// Returns the number of bytes actually written.
    pub fn write_in(&mut self, src: &[u8]) -> usize {
        let Some(storage) = self.storage.as_mut() else {
            return 0;
        };
        let end = self.begin + self.len;
        let room = storage.len() - end;
        let n = src.len().min(room);
        storage[end..end + n].copy_from_slice(&src[..n]);
        self.len += n;
        n
    }

    /// Move up to `dst.len()` bytes out of the buffer.
    ///
    /// Advances the consumption cursor and returns the count moved,
    /// which may be less than requested if fewer bytes remain.
    pub fn move_out(&mut self, dst: &mut [u8]) -> usize {
        let n = self.len.min(dst.len());
        if let Some(storage) = self.storage.as_ref() {
            dst[..n].copy_from_slice(&storage[self.begin..self.begin + n]);
        }
        self.begin += n;
        self.len -= n;
        n
    }

    /// Unread bytes remaining.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity of the underlying storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.as_ref().map_or(0, |s| s.len())
    }
}

impl fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataBuffer")
            .field("capacity", &self.capacity())
            .field("begin", &self.begin)
            .field("len", &self.len)
            .finish()
    }
}

/// A staging buffer paired with its outstanding-operation descriptor.
#[derive(Debug)]
pub struct IoBuffer {
    pub op: OpDesc,
    pub data: DataBuffer,
}

impl IoBuffer {
    pub fn new(kind: OpKind, token: Token, capacity: usize) -> Self {
        Self {
            op: OpDesc { kind, token },
            data: DataBuffer::with_capacity(capacity),
        }
    }
}
