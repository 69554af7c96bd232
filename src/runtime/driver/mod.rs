use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::collections::BTreeMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::buf::bufring::{
    Bgid, BufRingRegistrar, BufferRingManager, EngineRingSet, EventSink, NoopSink, RingHandle,
};
use crate::buf::ReadBuf;
use crate::error::{Error, RegistrationError, Result, TeardownError};
use crate::io::{self as read, ReadCompletion, ReadTicket};

/// What to do when one of the configured rings cannot be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationPolicy {
    /// Unregister the rings already registered and fail to start.
    #[default]
    FailFast,
    /// Log the failure and start with the remaining rings.
    SkipFailed,
}

/// The buffer rings of one engine instance, and the reads issued against them.
///
/// Completion processing happens on one thread: the driver is neither `Send` nor `Sync`. Each
/// cycle starts with [`begin_cycle`](Driver::begin_cycle), which applies the releases other
/// threads queued since the last one.
pub struct Driver<K: BufRingRegistrar = IoUring> {
    /// IoUring bindings, or whatever else registers the rings.
    kernel: K,

    rings: BTreeMap<Bgid, BufferRingManager>,

    /// Reads submitted and not yet reaped, keyed by user_data.
    reads: Slab<ReadTicket>,
}

impl<K: BufRingRegistrar> Driver<K> {
    /// Register every ring in `rings` with `kernel`.
    ///
    /// # Errors
    ///
    /// Under [`RegistrationPolicy::FailFast`], the first ring that fails to register. The rings
    /// registered before it are unregistered again.
    pub fn start(
        kernel: K,
        rings: &EngineRingSet,
        policy: RegistrationPolicy,
    ) -> Result<Driver<K>, RegistrationError> {
        let mut driver = Driver {
            kernel,
            rings: BTreeMap::new(),
            reads: Slab::new(),
        };

        for config in rings {
            match BufferRingManager::register(&driver.kernel, config) {
                Ok(ring) => {
                    driver.rings.insert(config.bgid(), ring);
                }
                Err(e) if policy == RegistrationPolicy::SkipFailed => {
                    tracing::warn!(bgid = e.bgid(), error = %e, "skipping buf_ring that failed to register");
                }
                // Dropping the driver unregisters what was registered so far.
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(rings = driver.rings.len(), "driver started");
        Ok(driver)
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn ring(&self, bgid: Bgid) -> Option<&BufferRingManager> {
        self.rings.get(&bgid)
    }

    pub fn ring_mut(&mut self, bgid: Bgid) -> Option<&mut BufferRingManager> {
        self.rings.get_mut(&bgid)
    }

    /// The kernel handle of the ring for `bgid`, what a channel needs to tag its reads.
    pub fn ring_handle(&self, bgid: Bgid) -> Option<&RingHandle> {
        self.rings.get(&bgid).map(BufferRingManager::handle)
    }

    /// The registered buffer group ids, in ascending order.
    pub fn groups(&self) -> impl Iterator<Item = Bgid> + '_ {
        self.rings.keys().copied()
    }

    /// Reads submitted through this driver and not yet reaped.
    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    /// Start a completion cycle: apply the releases queued from other threads to every ring.
    ///
    /// Returns the number of slots returned. A ring whose queue holds a bad release reports it
    /// in the log and keeps the rest queued; the other rings are drained regardless.
    pub fn begin_cycle(&mut self, events: &mut dyn EventSink) -> usize {
        let mut n = 0;
        for (bgid, ring) in self.rings.iter_mut() {
            match ring.drain_releases(events) {
                Ok(drained) => n += drained,
                Err(e) => tracing::error!(bgid, error = %e, "draining queued releases failed"),
            }
        }
        n
    }

    fn ring_or_err(&mut self, bgid: Bgid) -> Result<&mut BufferRingManager> {
        self.rings.get_mut(&bgid).ok_or(Error::UnknownGroup(bgid))
    }

    /// Prepare a read against `bgid`. See [`crate::io::prepare_read`].
    pub fn prepare_read(&mut self, bgid: Bgid) -> Result<ReadTicket> {
        read::prepare_read(self.ring_or_err(bgid)?)
    }

    /// Complete a read prepared with [`prepare_read`](Self::prepare_read). See
    /// [`crate::io::complete_read`].
    pub fn complete_read(
        &mut self,
        ticket: ReadTicket,
        completion: ReadCompletion,
        events: &mut dyn EventSink,
    ) -> Result<ReadBuf> {
        let ring = self.ring_or_err(ticket.bgid())?;
        read::complete_read(ring, ticket, completion, events)
    }

    /// Unregister every ring that is still registered.
    ///
    /// A ring that fails to unregister does not keep the others from it. Calling this again
    /// does nothing.
    pub fn shutdown(&mut self) -> Vec<TeardownError> {
        let mut errors = vec![];
        for ring in self.rings.values_mut() {
            if ring.is_shut_down() {
                continue;
            }
            if let Err(e) = ring.shutdown(&self.kernel) {
                errors.push(e);
            }
        }
        tracing::debug!(errors = errors.len(), "driver shut down");
        errors
    }
}

impl Driver<IoUring> {
    /// Prepare a recv on `fd` against the ring for `bgid` and push it to the submission queue.
    ///
    /// Returns the user_data its completion will carry. The read is only submitted by the next
    /// [`submit`](Self::submit) or [`submit_and_wait`](Self::submit_and_wait).
    pub fn submit_recv(&mut self, fd: RawFd, bgid: Bgid) -> Result<u64> {
        let ticket = self.prepare_read(bgid)?;
        let key = self.reads.insert(ticket);

        let sqe = match self.reads[key].staging_mut() {
            Some(buf) => opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as _)
                .build()
                .user_data(key as u64),
            None => opcode::Recv::new(types::Fd(fd), std::ptr::null_mut(), 0 as _)
                .buf_group(bgid)
                .build()
                .flags(squeue::Flags::BUFFER_SELECT)
                .user_data(key as u64),
        };

        // Safety: a fallback read's buffer is owned by its ticket, which stays in the slab until
        // the read is reaped.
        while unsafe { self.kernel.submission().push(&sqe) }.is_err() {
            if let Err(e) = self.submit() {
                // Never reached the kernel: return the ticket's slot before failing.
                let ticket = self.reads.remove(key);
                let cancelled = ReadCompletion::new(-libc::ECANCELED, 0);
                let _ = self.complete_read(ticket, cancelled, &mut NoopSink);
                return Err(e.into());
            }
        }
        Ok(key as u64)
    }

    /// Submit queued submissions to the kernel.
    pub fn submit(&mut self) -> io::Result<usize> {
        loop {
            match self.kernel.submit() {
                Ok(n) => return Ok(n),
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Submit and wait for at least `want` completions.
    pub fn submit_and_wait(&mut self, want: usize) -> io::Result<usize> {
        loop {
            match self.kernel.submit_and_wait(want) {
                Ok(n) => return Ok(n),
                Err(ref e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Run one completion cycle: drain queued releases, then complete every read whose
    /// completion is ready, in completion order.
    pub fn reap(&mut self, events: &mut dyn EventSink) -> Vec<(u64, Result<ReadBuf>)> {
        self.begin_cycle(events);

        let cqes: Vec<io_uring::cqueue::Entry> = self.kernel.completion().collect();
        let mut out = Vec::with_capacity(cqes.len());
        for cqe in cqes {
            let key = cqe.user_data() as usize;
            let ticket = match self.reads.try_remove(key) {
                Some(ticket) => ticket,
                None => {
                    tracing::warn!(user_data = cqe.user_data(), "completion for unknown read");
                    continue;
                }
            };
            let res = self.complete_read(ticket, ReadCompletion::from_cqe(&cqe), events);
            out.push((key as u64, res));
        }
        out
    }
}

impl AsRawFd for Driver<IoUring> {
    fn as_raw_fd(&self) -> RawFd {
        self.kernel.as_raw_fd()
    }
}

/// Drop the driver, unregistering the rings that are still registered.
///
/// Reads still in flight keep their buffers: fallback buffers are leaked rather than freed
/// under the kernel. Reap every submitted read before dropping to avoid that.
impl<K: BufRingRegistrar> Drop for Driver<K> {
    fn drop(&mut self) {
        if !self.reads.is_empty() {
            tracing::warn!(reads = self.reads.len(), "driver dropped with reads in flight");
            for ticket in self.reads.drain() {
                std::mem::forget(ticket);
            }
        }
        for e in self.shutdown() {
            tracing::error!(error = %e, "buf_ring teardown failed");
        }
    }
}

impl<K: BufRingRegistrar> std::fmt::Debug for Driver<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("rings", &self.rings)
            .field("reads", &self.reads.len())
            .finish()
    }
}
