//! Error types for buffer ring configuration, registration and the read path.

use std::io;

use thiserror::Error;

use crate::buf::bufring::{Bgid, Bid, SlotState};

/// A specialized `Result` for this crate's fallible operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top level error returned by the driver and the read completion path.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(transparent)]
    DoubleDispose(#[from] DoubleDisposeError),

    #[error(transparent)]
    SlotState(#[from] SlotStateError),

    /// The read completed with a failure status. No slot was handed to the application.
    #[error("read failed: {0}")]
    ReadFailure(#[source] io::Error),

    /// An ordinary buffer could not be allocated for a read the ring could not serve.
    #[error("could not allocate a {len} byte fallback buffer")]
    FallbackAlloc { len: usize },

    #[error("no buffer ring is registered for group {0}")]
    UnknownGroup(Bgid),

    /// The kernel reported data for a ring read without naming the buffer it used.
    #[error("read of {len} bytes for group {bgid} completed without a selected buffer")]
    MissingBufferSelect { bgid: Bgid, len: usize },

    /// Engine setup outside of buffer ring registration failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Rejected ring configuration. Raised before anything is registered with the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("buffer group id {0} is configured more than once")]
    DuplicateGroup(Bgid),

    #[error("group {bgid}: capacity {capacity} must be between 1 and 32768")]
    InvalidCapacity { bgid: Bgid, capacity: u32 },

    #[error("group {bgid}: slot length {slot_len} must be non-zero and fit in 32 bits")]
    InvalidSlotLength { bgid: Bgid, slot_len: usize },

    #[error("group {bgid}: watermark {watermark} must be below the capacity {capacity}")]
    InvalidWatermark {
        bgid: Bgid,
        watermark: u16,
        capacity: u16,
    },
}

/// A ring could not be registered with the engine.
#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("buffer group id {0} is already registered with this engine")]
    DuplicateGroup(Bgid),

    #[error("group {bgid}: the engine is not ready to register buffer rings")]
    EngineNotReady { bgid: Bgid },

    /// Most likely a kernel older than 5.19, or an entry count the kernel refuses.
    #[error("group {bgid}: buffer rings are not supported: {source}")]
    Unsupported {
        bgid: Bgid,
        #[source]
        source: io::Error,
    },

    #[error("group {bgid}: could not allocate {len} bytes of ring memory")]
    Alloc { bgid: Bgid, len: usize },

    #[error("group {bgid}: registration failed: {source}")]
    Kernel {
        bgid: Bgid,
        #[source]
        source: io::Error,
    },
}

impl RegistrationError {
    /// The group the failed registration was for.
    pub fn bgid(&self) -> Bgid {
        match self {
            RegistrationError::DuplicateGroup(bgid) => *bgid,
            RegistrationError::EngineNotReady { bgid }
            | RegistrationError::Unsupported { bgid, .. }
            | RegistrationError::Alloc { bgid, .. }
            | RegistrationError::Kernel { bgid, .. } => *bgid,
        }
    }
}

/// A ring could not be unregistered.
#[derive(Debug, Error)]
pub enum TeardownError {
    #[error("buffer ring for group {0} was already released")]
    AlreadyReleased(Bgid),

    #[error("group {bgid}: unregistration failed: {source}")]
    Kernel {
        bgid: Bgid,
        #[source]
        source: io::Error,
    },
}

/// A `ProvidedBuffer` handle was disposed a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("provided buffer {bid} of group {bgid} was already disposed")]
pub struct DoubleDisposeError {
    pub bgid: Bgid,
    pub bid: Bid,
}

/// A slot table transition that the ring's lifecycle does not allow.
///
/// These indicate a lifecycle bug upstream of the ring and are never masked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotStateError {
    #[error("group {bgid}: slot {bid} is out of range for capacity {capacity}")]
    OutOfRange { bgid: Bgid, bid: Bid, capacity: u16 },

    #[error("group {bgid}: slot {bid} is {found:?}, expected {expected:?}")]
    UnexpectedState {
        bgid: Bgid,
        bid: Bid,
        expected: SlotState,
        found: SlotState,
    },

    #[error("group {bgid}: {len} bytes reported for slot {bid} exceed the slot length {slot_len}")]
    LengthExceedsSlot {
        bgid: Bgid,
        bid: Bid,
        len: usize,
        slot_len: usize,
    },

    #[error("group {bgid}: completion arrived with no ring read in flight")]
    NothingInFlight { bgid: Bgid },
}

/// A buffer source could not satisfy an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("could not allocate {len} bytes")]
pub struct AllocError {
    pub len: usize,
}
