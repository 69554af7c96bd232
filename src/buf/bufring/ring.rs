//! Memory shared with the kernel for one buf_ring.

use io_uring::types;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU16};

use super::{Bgid, Bid};
use crate::buf::BufSource;
use crate::error::RegistrationError;

/// The kernel-visible ring of buffer entries and the slot memory the entries point into.
///
/// The ring entries are a page aligned allocation of `ring_entries` [`types::BufRingEntry`]
/// values, as the io_uring device requires. The slots are one contiguous block of
/// `capacity * slot_len` bytes obtained from the ring's [`BufSource`], which lets callers place
/// slot memory where they like.
///
/// Entries are only written by the engine thread. Slot memory is written by the kernel while a
/// slot is free or in-flight, and only read by userland while the slot is delivered, so the two
/// never overlap.
#[derive(Debug)]
pub(crate) struct RingMemory {
    bgid: Bgid,

    // Keep mask rather than ring size because mask is used often, ring size not.
    ring_entries_mask: u16, // Invariant: one less than ring_entries which is > 0, power of 2, max 2^15.

    capacity: u16,  // Invariants: > 0, <= ring_entries.
    slot_len: usize, // Invariant: > 0.

    layout: Layout,
    ring_addr: NonNull<types::BufRingEntry>, // Invariant: constant.
    tail_addr: *const AtomicU16,             // Invariant: constant.

    // Slot memory, taken apart from the Vec the source returned and rebuilt on drop.
    slots_addr: NonNull<u8>,
    slots_len: usize,
    slots_cap: usize,
}

// Safety: the raw pointers refer to allocations owned by this value. Entry writes and tail
// stores happen on the engine thread only; slot reads happen through delivered slots, which the
// kernel no longer writes to.
unsafe impl Send for RingMemory {}
unsafe impl Sync for RingMemory {}

impl RingMemory {
    /// Allocate the ring and its slots, and push every slot onto the ring.
    ///
    /// All slots start out on the ring: the tail is left at `capacity`.
    pub(crate) fn new(
        bgid: Bgid,
        capacity: u16,
        ring_entries: u16,
        slot_len: usize,
        source: &dyn BufSource,
    ) -> Result<RingMemory, RegistrationError> {
        assert!(capacity > 0 && capacity <= ring_entries);
        assert!(ring_entries.is_power_of_two());
        assert!(slot_len > 0);

        // entry_size is 16 bytes.
        let entry_size = std::mem::size_of::<types::BufRingEntry>();
        let ring_size = entry_size * ring_entries as usize;

        let layout = Layout::from_size_align(ring_size, page_size()).map_err(|_| {
            RegistrationError::Alloc {
                bgid,
                len: ring_size,
            }
        })?;

        // Safety: layout has a nonzero size, ring_entries is at least one.
        let ring_addr = unsafe { alloc_zeroed(layout) } as *mut types::BufRingEntry;
        let ring_addr = NonNull::new(ring_addr).ok_or(RegistrationError::Alloc {
            bgid,
            len: ring_size,
        })?;

        let slots_len = match slot_len.checked_mul(capacity as usize) {
            Some(len) => len,
            None => {
                // Safety: allocated just above with the same layout.
                unsafe { dealloc(ring_addr.as_ptr() as *mut u8, layout) };
                return Err(RegistrationError::Alloc {
                    bgid,
                    len: usize::MAX,
                });
            }
        };
        let mut slots = match source.allocate(slots_len) {
            Ok(slots) if slots.capacity() >= slots_len => slots,
            _ => {
                // Safety: allocated just above with the same layout.
                unsafe { dealloc(ring_addr.as_ptr() as *mut u8, layout) };
                return Err(RegistrationError::Alloc {
                    bgid,
                    len: slots_len,
                });
            }
        };
        slots.clear();
        slots.resize(slots_len, 0);
        let mut slots = std::mem::ManuallyDrop::new(slots);
        let slots_cap = slots.capacity();
        // Safety: a Vec pointer is never null.
        let slots_addr = unsafe { NonNull::new_unchecked(slots.as_mut_ptr()) };

        // Safety: the ring_addr passed into tail is the start of the ring. It is both the start
        // of the ring and the first entry in the ring.
        let tail_addr = unsafe { types::BufRingEntry::tail(ring_addr.as_ptr()) } as *const AtomicU16;

        let memory = RingMemory {
            bgid,
            ring_entries_mask: ring_entries - 1,
            capacity,
            slot_len,
            layout,
            ring_addr,
            tail_addr,
            slots_addr,
            slots_len,
            slots_cap,
        };

        for bid in 0..capacity {
            memory.write_entry(bid, bid);
        }
        memory.store_tail(capacity);

        Ok(memory)
    }

    pub(crate) fn bgid(&self) -> Bgid {
        self.bgid
    }

    pub(crate) fn capacity(&self) -> u16 {
        self.capacity
    }

    pub(crate) fn slot_len(&self) -> usize {
        self.slot_len
    }

    #[inline]
    pub(crate) fn ring_entries(&self) -> u16 {
        self.ring_entries_mask + 1
    }

    /// The address handed to the kernel at registration.
    pub(crate) fn ring_addr(&self) -> u64 {
        self.ring_addr.as_ptr() as u64
    }

    // # Panic
    //
    // This function will panic if given a bid that is not within the valid range 0..capacity.
    #[inline]
    pub(crate) fn slot_ptr(&self, bid: Bid) -> *mut u8 {
        assert!(bid < self.capacity);
        // Safety: slots_addr points to an allocation of capacity * slot_len bytes and bid was
        // just asserted to be less than capacity.
        unsafe { self.slots_addr.as_ptr().add(self.slot_len * bid as usize) }
    }

    /// Write `bid` into the ring entry at position `tail`, masked to the ring size.
    ///
    /// Only the engine thread calls this, and only for positions the kernel has consumed or
    /// never seen. The kernel does not look at the entry until the tail is stored.
    pub(crate) fn write_entry(&self, tail: u16, bid: Bid) {
        let ring_idx = tail & self.ring_entries_mask;

        // Safety: the mask keeps ring_idx below ring_entries, and the allocation holds exactly
        // ring_entries entries.
        let entry = unsafe { &mut *self.ring_addr.as_ptr().add(ring_idx as usize) };

        entry.set_addr(self.slot_ptr(bid) as u64);
        entry.set_len(self.slot_len as u32);
        entry.set_bid(bid);
    }

    /// Make entries written up to `tail` visible to the kernel.
    #[inline]
    pub(crate) fn store_tail(&self, tail: u16) {
        // Safety: tail_addr was computed once at init to refer to the tail field of the ring and
        // is held constant for self's lifetime.
        unsafe { (*self.tail_addr).store(tail, atomic::Ordering::Release) };
    }

    /// The tail as last published. Used to play the kernel's side in tests.
    #[cfg(test)]
    pub(crate) fn tail(&self) -> u16 {
        // Safety: see store_tail.
        unsafe { (*self.tail_addr).load(atomic::Ordering::Acquire) }
    }

    /// Read back the entry at ring position `head`: (addr, len, bid).
    #[cfg(test)]
    pub(crate) fn entry(&self, head: u16) -> (u64, u32, Bid) {
        let ring_idx = head & self.ring_entries_mask;
        // Safety: as in write_entry.
        let entry = unsafe { &*self.ring_addr.as_ptr().add(ring_idx as usize) };
        (entry.addr(), entry.len(), entry.bid())
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        // Safety: ring_addr was allocated with alloc_zeroed using the same layout, and the slot
        // parts were taken from a Vec that was never dropped.
        unsafe {
            dealloc(self.ring_addr.as_ptr() as *mut u8, self.layout);
            drop(Vec::from_raw_parts(
                self.slots_addr.as_ptr(),
                self.slots_len,
                self.slots_cap,
            ));
        }
    }
}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        (size as usize).next_power_of_two()
    } else {
        4096
    }
}
