//! The buffer type returned by reads served from a buffer ring.
//!
//! ## Reference Counting
//!
//! Every `ProvidedBuffer` handle holds one reference to its slot. [`ProvidedBuffer::retain`]
//! (or `clone`) makes another handle to the same slot, [`ProvidedBuffer::dispose`] gives up the
//! reference a handle holds, and dropping a handle that was not disposed does the same. When the
//! last reference is given up the slot goes back to its ring, exactly once.
//!
//! Handles are `Send`. A handle disposed away from the engine thread has its slot queued for
//! the engine to pick up at its next completion cycle.

use std::fmt;
use std::ops;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::release::RingShared;
use super::{Bgid, Bid};
use crate::error::{DoubleDisposeError, Error};

/// A view of the bytes the kernel wrote into one ring slot.
///
/// # Memory Safety
///
/// - Slot memory is owned by the ring. Each handle keeps the ring memory alive, so the bytes
///   stay valid even if the ring is unregistered first.
/// - The slot is not handed back to the kernel while any handle still holds a reference.
/// - A disposed handle no longer gives access to the bytes.
pub struct ProvidedBuffer {
    lease: Arc<Lease>,
    disposed: bool,
}

struct Lease {
    ring: Arc<RingShared>,
    bid: Bid,
    len: usize,
    refs: AtomicUsize,
}

impl ProvidedBuffer {
    pub(crate) fn new(ring: Arc<RingShared>, bid: Bid, len: usize) -> ProvidedBuffer {
        // len has been checked against the slot length by the slot table.
        ProvidedBuffer {
            lease: Arc::new(Lease {
                ring,
                bid,
                len,
                refs: AtomicUsize::new(1),
            }),
            disposed: false,
        }
    }

    /// The buffer group id of the ring this buffer came from.
    pub fn bgid(&self) -> Bgid {
        self.lease.ring.bgid()
    }

    /// The slot within its ring.
    pub fn bid(&self) -> Bid {
        self.lease.bid
    }

    /// Number of bytes the kernel reported for the read.
    #[inline]
    pub fn len(&self) -> usize {
        self.lease.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slot length of the ring.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.lease.ring.memory().slot_len()
    }

    /// References outstanding across all handles to this slot.
    pub fn ref_count(&self) -> usize {
        self.lease.refs.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// The bytes read, or `None` once this handle is disposed.
    pub fn try_as_slice(&self) -> Option<&[u8]> {
        if self.disposed {
            return None;
        }
        let p = self.lease.ring.memory().slot_ptr(self.lease.bid);
        // Safety: this handle holds a reference, so the slot is delivered and the kernel does
        // not write to it. len was checked against the slot length when the slot was delivered.
        Some(unsafe { std::slice::from_raw_parts(p, self.lease.len) })
    }

    /// The bytes read.
    ///
    /// # Panics
    ///
    /// If this handle was already disposed.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self.try_as_slice() {
            Some(s) => s,
            None => panic!(
                "provided buffer {} of group {} used after dispose",
                self.bid(),
                self.bgid()
            ),
        }
    }

    /// Add a reference to the slot, returned as a new handle.
    ///
    /// # Panics
    ///
    /// If this handle was already disposed.
    pub fn retain(&self) -> ProvidedBuffer {
        assert!(
            !self.disposed,
            "provided buffer {} of group {} retained after dispose",
            self.bid(),
            self.bgid()
        );
        self.lease.refs.fetch_add(1, Ordering::Relaxed);
        ProvidedBuffer {
            lease: self.lease.clone(),
            disposed: false,
        }
    }

    /// Give up the reference held by this handle. The last one returns the slot to its ring.
    ///
    /// # Errors
    ///
    /// [`Error::DoubleDispose`] if this handle was already disposed; nothing changes in that
    /// case. [`Error::SlotState`] if the ring's slot table rejects the release, which points
    /// at a lifecycle bug.
    pub fn dispose(&mut self) -> Result<(), Error> {
        if self.disposed {
            return Err(DoubleDisposeError {
                bgid: self.bgid(),
                bid: self.bid(),
            }
            .into());
        }
        self.disposed = true;

        if self.lease.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lease.ring.release(self.lease.bid)?;
        }
        Ok(())
    }
}

impl Clone for ProvidedBuffer {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl Drop for ProvidedBuffer {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        if let Err(e) = self.dispose() {
            tracing::error!(bgid = self.bgid(), bid = self.bid(), error = %e, "releasing dropped buffer failed");
        }
    }
}

impl fmt::Debug for ProvidedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedBuffer")
            .field("bgid", &self.bgid())
            .field("bid", &self.bid())
            .field("len", &self.len())
            .field("refs", &self.ref_count())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl ops::Deref for ProvidedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for ProvidedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl From<ProvidedBuffer> for Vec<u8> {
    fn from(buf: ProvidedBuffer) -> Self {
        buf.as_slice().to_vec()
    }
}
