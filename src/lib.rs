//! Kernel-selected receive buffers for io_uring.
//!
//! Rather than allocating a buffer for every read, an engine registers one or more rings of
//! fixed-size buffer slots with the kernel. A read tagged with a ring's buffer group lets the
//! kernel pick a slot when data arrives and report which one it used in the completion. This
//! crate manages the life of those rings and their slots:
//!
//! - registering and unregistering the rings of an engine instance,
//! - tracking every slot from the ring to the kernel to the application and back,
//! - wrapping a filled slot in a reference-counted [`ProvidedBuffer`] that puts the slot back
//!   on the ring once the last reference is disposed, from any thread,
//! - reading into an ordinary buffer when a ring has no slot left, and
//! - reporting ring exhaustion to the channel's event pipeline as it happens.
//!
//! # Examples
//!
//! ```no_run
//! use tokio_uring_bufring::buf::bufring::{RingConfig, RingEvent};
//!
//! fn main() -> Result<(), tokio_uring_bufring::Error> {
//!     let mut driver = tokio_uring_bufring::builder()
//!         .entries(64)
//!         .buf_ring(RingConfig::new(1, 64, 4096)?)?
//!         .build()?;
//!
//!     # let fd = 0;
//!     let user_data = driver.submit_recv(fd, 1)?;
//!     driver.submit_and_wait(1)?;
//!
//!     let mut events: Vec<RingEvent> = vec![];
//!     for (ud, res) in driver.reap(&mut events) {
//!         assert_eq!(ud, user_data);
//!         let buf = res?;
//!         println!("read {} bytes", buf.len());
//!         // Dropping the buffer returns its slot to the ring.
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Buffer rings need Linux 5.19 or later.

#![warn(missing_debug_implementations)]

pub mod buf;
pub mod error;
pub mod io;
pub mod runtime;

pub use buf::bufring::ProvidedBuffer;
pub use buf::ReadBuf;
pub use error::{Error, Result};
pub use runtime::{Driver, RegistrationPolicy};

use buf::bufring::{BufRingRegistrar, EngineRingSet, RingConfig};
use error::ConfigError;
use io_uring::IoUring;

/// Builder API that can create and start an engine with its buffer rings.
#[derive(Clone)]
pub struct Builder {
    entries: u32,
    urb: io_uring::Builder,
    rings: EngineRingSet,
    policy: RegistrationPolicy,
}

/// Constructs a [`Builder`] with default settings.
///
/// Use this to alter submission and completion queue parameters, and to attach the buffer
/// rings the engine starts with.
pub fn builder() -> Builder {
    Builder {
        entries: 256,
        urb: io_uring::IoUring::builder(),
        rings: EngineRingSet::new(),
        policy: RegistrationPolicy::default(),
    }
}

impl Builder {
    /// Sets the number of Submission Queue entries in uring.
    ///
    /// The default value is 256.
    /// The kernel requires the number of submission queue entries to be a power of two,
    /// and that it be less than the number of completion queue entries.
    /// This function will adjust the `cq_entries` value to be at least 2 times `sq_entries`
    pub fn entries(&mut self, sq_entries: u32) -> &mut Self {
        self.entries = sq_entries;
        self
    }

    /// Replaces the default [`io_uring::Builder`], which controls the settings for the
    /// inner `io_uring` API.
    ///
    /// Refer to the [`io_uring::Builder`] documentation for all the supported methods.
    pub fn uring_builder(&mut self, b: &io_uring::Builder) -> &mut Self {
        self.urb = b.clone();
        self
    }

    /// Attach a buffer ring. Its group id must not already be attached.
    pub fn buf_ring(&mut self, config: RingConfig) -> Result<&mut Self, ConfigError> {
        self.rings.add(config)?;
        Ok(self)
    }

    /// What to do when a ring fails to register. Defaults to [`RegistrationPolicy::FailFast`].
    pub fn registration_policy(&mut self, policy: RegistrationPolicy) -> &mut Self {
        self.policy = policy;
        self
    }

    /// The rings attached so far.
    pub fn rings(&self) -> &EngineRingSet {
        &self.rings
    }

    /// Create the io_uring instance and register the attached rings with it.
    pub fn build(&self) -> Result<Driver<IoUring>> {
        let mut urb = self.urb.clone();
        let uring = urb.dontfork().build(self.entries)?;
        self.build_with(uring)
    }

    /// Register the attached rings with an engine created elsewhere.
    pub fn build_with<K: BufRingRegistrar>(&self, kernel: K) -> Result<Driver<K>> {
        Ok(Driver::start(kernel, &self.rings, self.policy)?)
    }
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("entries", &self.entries)
            .field("rings", &self.rings)
            .field("policy", &self.policy)
            .finish()
    }
}
