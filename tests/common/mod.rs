#![allow(dead_code)]

pub mod probe;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

use io_uring::types::BufRingEntry;
use tokio_uring_bufring::buf::bufring::{Bgid, Bid, BufRingRegistrar, EngineRingSet, RingConfig};
use tokio_uring_bufring::io::ReadCompletion;
use tokio_uring_bufring::{Driver, RegistrationPolicy};

const IORING_CQE_F_BUFFER: u32 = 1;

/// Stands in for the kernel: keeps the registered rings and consumes their entries the way the
/// io_uring device does, from the head in publication order.
#[derive(Debug, Default)]
pub struct RecordingKernel {
    rings: RefCell<BTreeMap<Bgid, SimRing>>,
    pub unregistered: RefCell<Vec<Bgid>>,
}

#[derive(Debug)]
struct SimRing {
    addr: u64,
    entries: u16,
    head: u16,
}

impl SimRing {
    fn tail(&self) -> u16 {
        // Safety: addr is a registered ring, the tail overlays the first entry.
        unsafe {
            let tail = BufRingEntry::tail(self.addr as *const BufRingEntry) as *const AtomicU16;
            (*tail).load(Ordering::Acquire)
        }
    }

    fn take(&mut self) -> Option<(u64, u32, Bid)> {
        if self.head == self.tail() {
            return None;
        }
        let idx = self.head & (self.entries - 1);
        // Safety: idx is below the entry count the ring was registered with.
        let entry = unsafe { &*(self.addr as *const BufRingEntry).add(idx as usize) };
        self.head = self.head.wrapping_add(1);
        Some((entry.addr(), entry.len(), entry.bid()))
    }
}

impl BufRingRegistrar for RecordingKernel {
    unsafe fn register_buf_ring(&self, ring_addr: u64, ring_entries: u16, bgid: Bgid) -> io::Result<()> {
        let mut rings = self.rings.borrow_mut();
        if rings.contains_key(&bgid) {
            return Err(io::Error::from_raw_os_error(libc::EEXIST));
        }
        if !ring_entries.is_power_of_two() || ring_addr % 4096 != 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        rings.insert(
            bgid,
            SimRing {
                addr: ring_addr,
                entries: ring_entries,
                head: 0,
            },
        );
        Ok(())
    }

    fn unregister_buf_ring(&self, bgid: Bgid) -> io::Result<()> {
        match self.rings.borrow_mut().remove(&bgid) {
            Some(_) => {
                self.unregistered.borrow_mut().push(bgid);
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }
}

impl RecordingKernel {
    /// Serve a ring read of `data` for `bgid`: pick the slot at the head, copy the data in,
    /// and produce the completion the kernel would post.
    pub fn recv(&self, bgid: Bgid, data: &[u8]) -> ReadCompletion {
        let mut rings = self.rings.borrow_mut();
        let ring = rings.get_mut(&bgid).expect("group not registered");
        match ring.take() {
            Some((addr, len, bid)) => {
                assert!(data.len() <= len as usize);
                // Safety: addr is the slot the entry points at, len bytes long.
                unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
                ReadCompletion::new(data.len() as i32, IORING_CQE_F_BUFFER | (bid as u32) << 16)
            }
            None => ReadCompletion::new(-libc::ENOBUFS, 0),
        }
    }

    /// Entries published on the ring and not yet consumed.
    pub fn available(&self, bgid: Bgid) -> u16 {
        let rings = self.rings.borrow();
        let ring = &rings[&bgid];
        ring.tail().wrapping_sub(ring.head)
    }

    pub fn is_registered(&self, bgid: Bgid) -> bool {
        self.rings.borrow().contains_key(&bgid)
    }
}

/// Two rings: group 1 with two slots, group 2 with sixteen slots and a watermark of twelve.
pub fn two_rings() -> EngineRingSet {
    let mut set = EngineRingSet::new();
    set.add(RingConfig::new(1, 2, 1024).unwrap()).unwrap();
    set.add(
        RingConfig::builder(2)
            .capacity(16)
            .slot_len(1024)
            .watermark(12)
            .build()
            .unwrap(),
    )
    .unwrap();
    set
}

pub fn start<'a>(kernel: &'a RecordingKernel, rings: &EngineRingSet) -> Driver<&'a RecordingKernel> {
    Driver::start(kernel, rings, RegistrationPolicy::FailFast).unwrap()
}
