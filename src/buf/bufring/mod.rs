//! A buf_ring pool of buffers registered with the kernel.
//!
//! The io_uring device implements several provided-buffer mechanisms, which are all called buffer
//! groups in the liburing man pages. They share a few things:
//!     o all seed the kernel with userland buffers for use by later read operations
//!     o all use a u16 Buffer Group ID and a u16 Buffer ID
//!     o reads select a group by setting the IOSQE_BUFFER_SELECT bit in the sqe flags and
//!       naming the group in the sqe buf_group field
//!     o reads that used a group have the IORING_CQE_F_BUFFER bit set in the cqe flags and
//!       the chosen buffer id in the upper 16 bits of the cqe flags
//!
//! The buf_ring is the mechanism with the least overhead: a shared ring of buffer entries the
//! kernel pulls from, refilled by userland writing entries and bumping the ring's tail. Aside
//! from the register and unregister steps there are no syscalls involved in handing buffers to
//! the kernel.
//!
//! This module adds the bookkeeping around that ring:
//!
//! - [`RingConfig`] and [`EngineRingSet`] describe the rings an engine starts with.
//! - [`RingRegistration`] owns one ring's kernel registration, through a [`RingHandle`].
//! - [`BufferRingManager`] tracks every slot through `free -> in-flight -> delivered -> free`
//!   and reports exhaustion.
//! - [`ProvidedBuffer`] is the application's reference-counted view of a delivered slot.
//!   Disposing the last reference puts the slot back on the ring.
//! - [`RingEvent`] values go to the channel pipeline through an [`EventSink`].

// Developer's note about io_uring return codes when a buf_ring is used:
//
// While a buf_ring pool is exhausted, new calls to read that are, or are not, ready to read will
// fail with the 105 error, "no buffers", while existing calls that were waiting to become ready to
// read will not fail. Only when the data becomes ready to read will they fail, if the buffer ring
// is still empty at that time. The manager avoids ever issuing more ring reads than it has free
// slots for, so outside of misuse of a group id the "no buffers" error is not seen.

mod config;
pub use config::{EngineRingSet, RingConfig, RingConfigBuilder};

mod event;
pub use event::{EventSink, ExhaustionEvent, NoopSink, RingEvent};

pub(crate) mod manager;
pub use manager::{BufferOutcome, BufferRingManager, ReadSource, Selector};

mod provided;
pub use provided::ProvidedBuffer;

pub(crate) mod registration;
pub use registration::{BufRingRegistrar, RingHandle, RingRegistration};

mod release;

pub(crate) mod ring;

/// The buffer group ID.
///
/// The creator of a buffer group is responsible for picking a bgid that does not conflict with
/// other buffer groups registered with the same io_uring instance.
pub type Bgid = u16;

/// The buffer ID, the index of a slot within its ring.
///
/// Buffer ids run from 0 to capacity - 1. The kernel reports the id it chose in the completion.
pub type Bid = u16;

/// The largest number of entries the kernel accepts for one buffer ring.
pub const MAX_RING_ENTRIES: u32 = 1 << 15;

/// Where a slot currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// On the kernel-visible ring and not claimed by any outstanding read.
    Free,
    /// Claimed for a ring read whose completion has not been processed.
    InFlight,
    /// Filled by the kernel and owned by a `ProvidedBuffer`.
    Delivered,
}
