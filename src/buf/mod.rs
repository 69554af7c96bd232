//! Buffers handed to the application by ring-tagged reads.
//!
//! A read against a buffer group completes with either a [`bufring::ProvidedBuffer`], a view
//! into one of the ring's kernel-selected slots, or an ordinarily allocated vector when the ring
//! had nothing to offer at the time the read was issued. [`ReadBuf`] hides the difference from
//! code that only wants the bytes.

pub mod bufring;

mod source;
pub use source::{BufSource, HeapSource};

use std::ops;

use bufring::ProvidedBuffer;

/// The data produced by one completed read.
#[derive(Debug)]
pub enum ReadBuf {
    /// Memory owned by a buffer ring slot. Returned to the ring once disposed.
    Provided(ProvidedBuffer),

    /// A vector-backed buffer, used when the ring could not serve the read.
    Allocated(Vec<u8>),
}

impl ReadBuf {
    /// Returns true if the bytes live in a buffer ring slot.
    pub fn is_provided(&self) -> bool {
        matches!(self, ReadBuf::Provided(_))
    }

    /// Number of bytes read.
    pub fn len(&self) -> usize {
        match self {
            ReadBuf::Provided(buf) => buf.len(),
            ReadBuf::Allocated(v) => v.len(),
        }
    }

    /// Returns true if the read produced no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ReadBuf::Provided(buf) => buf.as_slice(),
            ReadBuf::Allocated(v) => v,
        }
    }

    /// Borrow the ring buffer, if this read was served by the ring.
    pub fn as_provided(&self) -> Option<&ProvidedBuffer> {
        match self {
            ReadBuf::Provided(buf) => Some(buf),
            ReadBuf::Allocated(_) => None,
        }
    }

    /// Take the ring buffer, if this read was served by the ring.
    pub fn into_provided(self) -> Option<ProvidedBuffer> {
        match self {
            ReadBuf::Provided(buf) => Some(buf),
            ReadBuf::Allocated(_) => None,
        }
    }
}

impl ops::Deref for ReadBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ReadBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Copies a provided buffer out of its slot, which returns the slot to the ring.
impl From<ReadBuf> for Vec<u8> {
    fn from(buf: ReadBuf) -> Self {
        match buf {
            ReadBuf::Provided(buf) => buf.into(),
            ReadBuf::Allocated(v) => v,
        }
    }
}
