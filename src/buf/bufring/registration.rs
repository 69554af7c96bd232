use std::io;
use std::sync::Arc;

use io_uring::IoUring;

use super::ring::RingMemory;
use super::{Bgid, RingConfig};
use crate::error::{RegistrationError, TeardownError};

/// The kernel side of buffer ring registration.
///
/// Implemented for [`IoUring`]. Tests and alternative engines can supply their own.
pub trait BufRingRegistrar {
    /// Register a buffer ring of `ring_entries` entries starting at `ring_addr` for `bgid`.
    ///
    /// # Safety
    ///
    /// `ring_addr` must point to a page aligned array of `ring_entries` buffer ring entries
    /// that stays valid until `bgid` is unregistered or the engine is destroyed.
    unsafe fn register_buf_ring(
        &self,
        ring_addr: u64,
        ring_entries: u16,
        bgid: Bgid,
    ) -> io::Result<()>;

    fn unregister_buf_ring(&self, bgid: Bgid) -> io::Result<()>;
}

impl BufRingRegistrar for IoUring {
    unsafe fn register_buf_ring(
        &self,
        ring_addr: u64,
        ring_entries: u16,
        bgid: Bgid,
    ) -> io::Result<()> {
        self.submitter()
            .register_buf_ring(ring_addr, ring_entries, bgid)
    }

    fn unregister_buf_ring(&self, bgid: Bgid) -> io::Result<()> {
        self.submitter().unregister_buf_ring(bgid)
    }
}

impl<R: BufRingRegistrar + ?Sized> BufRingRegistrar for &R {
    unsafe fn register_buf_ring(
        &self,
        ring_addr: u64,
        ring_entries: u16,
        bgid: Bgid,
    ) -> io::Result<()> {
        (**self).register_buf_ring(ring_addr, ring_entries, bgid)
    }

    fn unregister_buf_ring(&self, bgid: Bgid) -> io::Result<()> {
        (**self).unregister_buf_ring(bgid)
    }
}

/// The kernel's registration of one buffer ring.
///
/// Owned by exactly one [`super::BufferRingManager`] and released exactly once.
#[derive(Debug)]
pub struct RingHandle {
    bgid: Bgid,
    ring_addr: u64,
    ring_entries: u16,
    released: bool,
}

impl RingHandle {
    pub fn bgid(&self) -> Bgid {
        self.bgid
    }

    /// The address of the ring entries the kernel reads from.
    pub fn ring_addr(&self) -> u64 {
        self.ring_addr
    }

    pub fn ring_entries(&self) -> u16 {
        self.ring_entries
    }

    /// Returns true while the kernel still knows the ring.
    pub fn is_registered(&self) -> bool {
        !self.released
    }
}

/// Allocates a ring's shared memory and registers it with the engine.
#[derive(Debug)]
pub struct RingRegistration {
    handle: RingHandle,
    memory: Arc<RingMemory>,
}

impl RingRegistration {
    /// Allocate `capacity * slot_len` bytes of slot memory plus the ring entries, push every
    /// slot onto the ring, and register the ring with the engine.
    ///
    /// # Errors
    ///
    /// If a buffer group with the same `bgid` is already registered, if the engine is not in a
    /// state to accept registrations, or if the kernel does not support buffer rings.
    pub fn register<R>(registrar: &R, config: &RingConfig) -> Result<RingRegistration, RegistrationError>
    where
        R: BufRingRegistrar + ?Sized,
    {
        let bgid = config.bgid();
        let memory = RingMemory::new(
            bgid,
            config.capacity(),
            config.ring_entries(),
            config.slot_len(),
            config.source().as_ref(),
        )?;

        // Safety: the ring memory is kept alive by the Arc below until it is unregistered, and
        // beyond that for as long as any provided buffer refers to it.
        let res = unsafe {
            registrar.register_buf_ring(memory.ring_addr(), memory.ring_entries(), bgid)
        };

        if let Err(e) = res {
            return Err(match e.raw_os_error() {
                Some(libc::EINVAL) => {
                    tracing::warn!(
                        bgid,
                        error = %e,
                        "buf_ring register rejected, most likely indicating this kernel is not 5.19+"
                    );
                    RegistrationError::Unsupported { bgid, source: e }
                }
                Some(libc::EEXIST) => {
                    // Registering a duplicate bgid is not allowed.
                    tracing::warn!(bgid, "buf_ring register rejected, group id already registered");
                    RegistrationError::DuplicateGroup(bgid)
                }
                Some(libc::EBADF) | Some(libc::EBADFD) | Some(libc::ENXIO) => {
                    RegistrationError::EngineNotReady { bgid }
                }
                _ => RegistrationError::Kernel { bgid, source: e },
            });
        }

        tracing::debug!(
            bgid,
            capacity = config.capacity(),
            slot_len = config.slot_len(),
            ring_entries = memory.ring_entries(),
            "registered buf_ring"
        );

        Ok(RingRegistration {
            handle: RingHandle {
                bgid,
                ring_addr: memory.ring_addr(),
                ring_entries: memory.ring_entries(),
                released: false,
            },
            memory: Arc::new(memory),
        })
    }

    /// Unregister the ring from the engine.
    ///
    /// This is one-shot: a second call fails with [`TeardownError::AlreadyReleased`] without
    /// reaching the kernel. The slot memory is not freed here; it lives on until the last
    /// provided buffer referring to it is gone.
    pub fn unregister<R>(&mut self, registrar: &R) -> Result<(), TeardownError>
    where
        R: BufRingRegistrar + ?Sized,
    {
        let bgid = self.handle.bgid;
        if self.handle.released {
            return Err(TeardownError::AlreadyReleased(bgid));
        }
        self.handle.released = true;

        registrar.unregister_buf_ring(bgid).map_err(|source| {
            tracing::error!(bgid, error = %source, "buf_ring unregister failed");
            TeardownError::Kernel { bgid, source }
        })?;

        tracing::debug!(bgid, "unregistered buf_ring");
        Ok(())
    }

    pub fn handle(&self) -> &RingHandle {
        &self.handle
    }

    pub(crate) fn memory(&self) -> &Arc<RingMemory> {
        &self.memory
    }
}
