//! Slot bookkeeping for one registered buffer ring.
//!
//! Every slot is in exactly one of three states. A slot is free while its entry sits on the
//! kernel ring unclaimed, in-flight once a ring read has been issued that the kernel may serve
//! with it, and delivered once a completion named it and a [`ProvidedBuffer`] owns it. Slots
//! only move `free -> in-flight -> delivered -> free`, except when a ring read delivers nothing.
//! If the kernel took no buffer, the read's reservation goes back to the free list and its
//! entry, which never left the kernel ring, is not republished. If the read failed after the
//! kernel picked a slot, that slot goes back to free and is republished.
//!
//! The kernel consumes ring entries in the order they were published. The free list mirrors the
//! kernel ring from its head, which makes the in-flight slots the oldest published ones, and
//! lets a returned reservation go back to the front of the free list.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use super::event::{EventSink, ExhaustionEvent, RingEvent};
use super::provided::ProvidedBuffer;
use super::registration::{BufRingRegistrar, RingHandle, RingRegistration};
use super::release::RingShared;
use super::ring::RingMemory;
use super::{Bgid, Bid, RingConfig, SlotState};
use crate::buf::BufSource;
use crate::error::{RegistrationError, SlotStateError, TeardownError};

/// What a completion says about the buffer the kernel used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selector {
    /// The kernel filled the slot with this id.
    Slot(Bid),
    /// The kernel did not take a buffer from the ring.
    NoBuffer,
}

impl Selector {
    /// Decode the selector from a completion's flags.
    pub fn from_flags(flags: u32) -> Selector {
        match io_uring::cqueue::buffer_select(flags) {
            Some(bid) => Selector::Slot(bid),
            None => Selector::NoBuffer,
        }
    }
}

/// The outcome of handing a completion to [`BufferRingManager::on_read_completed`].
#[derive(Debug)]
pub enum BufferOutcome {
    /// The data is in a ring slot, now owned by the returned buffer.
    Delivered(ProvidedBuffer),
    /// The ring was not involved. The caller supplies an ordinary buffer.
    Fallback,
}

/// Where a read issued now will get its buffer from. Fixed when the read is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Tag the read with this buffer group; the kernel picks the slot.
    Ring(Bgid),
    /// Read into an ordinarily allocated buffer.
    Fallback,
}

pub(crate) struct SlotTable {
    bgid: Bgid,
    memory: Arc<RingMemory>,

    states: Vec<SlotState>,
    free: VecDeque<Bid>,
    in_flight: VecDeque<Bid>,
    delivered: u16,

    // Tail as last published to the kernel. Starts at capacity, all slots having been pushed
    // at allocation.
    local_tail: u16,

    exhausted: bool,
    below_watermark: bool,
    replenished_pending: bool,
    watermark: Option<u16>,
    notify_replenished: bool,

    // Lowest free count observed since creation or the last reset.
    min_free: u16,
}

impl SlotTable {
    fn new(memory: Arc<RingMemory>, config: &RingConfig) -> SlotTable {
        let capacity = memory.capacity();
        SlotTable {
            bgid: memory.bgid(),
            states: vec![SlotState::Free; capacity as usize],
            free: (0..capacity).collect(),
            in_flight: VecDeque::with_capacity(capacity as usize),
            delivered: 0,
            local_tail: capacity,
            exhausted: false,
            below_watermark: false,
            replenished_pending: false,
            watermark: config.watermark(),
            notify_replenished: config.notify_replenished(),
            min_free: capacity,
            memory,
        }
    }

    fn capacity(&self) -> u16 {
        self.memory.capacity()
    }

    fn free_count(&self) -> u16 {
        self.free.len() as u16
    }

    fn check_bid(&self, bid: Bid) -> Result<SlotState, SlotStateError> {
        match self.states.get(bid as usize) {
            Some(state) => Ok(*state),
            None => Err(SlotStateError::OutOfRange {
                bgid: self.bgid,
                bid,
                capacity: self.capacity(),
            }),
        }
    }

    fn expect_state(&self, bid: Bid, expected: SlotState) -> Result<(), SlotStateError> {
        let found = self.check_bid(bid)?;
        if found != expected {
            tracing::error!(bgid = self.bgid, bid, ?expected, ?found, "slot table violation");
            return Err(SlotStateError::UnexpectedState {
                bgid: self.bgid,
                bid,
                expected,
                found,
            });
        }
        Ok(())
    }

    /// Claim the front free slot for a ring read.
    fn reserve(&mut self) -> Option<Bid> {
        let bid = self.free.pop_front()?;
        self.states[bid as usize] = SlotState::InFlight;
        self.in_flight.push_back(bid);
        self.min_free = std::cmp::min(self.min_free, self.free_count());
        tracing::trace!(bgid = self.bgid, bid, free = self.free.len(), "reserved slot");
        self.debug_check();
        Some(bid)
    }

    /// Hand back the most recent reservation of a ring read the kernel did not serve.
    fn unreserve(&mut self) -> Result<Bid, SlotStateError> {
        let bid = self
            .in_flight
            .pop_back()
            .ok_or(SlotStateError::NothingInFlight { bgid: self.bgid })?;
        self.states[bid as usize] = SlotState::Free;
        self.free.push_front(bid);
        self.slot_freed();
        tracing::trace!(bgid = self.bgid, bid, "returned reservation");
        self.debug_check();
        Ok(bid)
    }

    fn deliver(
        &mut self,
        bid: Bid,
        len: usize,
        shared: &RingShared,
        events: &mut dyn EventSink,
    ) -> Result<(), SlotStateError> {
        self.expect_state(bid, SlotState::InFlight)?;
        let slot_len = self.memory.slot_len();
        if len > slot_len {
            tracing::error!(bgid = self.bgid, bid, len, slot_len, "completion overran slot");
            return Err(SlotStateError::LengthExceedsSlot {
                bgid: self.bgid,
                bid,
                len,
                slot_len,
            });
        }

        // Usually the front, the kernel consumes entries in publication order.
        if let Some(pos) = self.in_flight.iter().position(|b| *b == bid) {
            self.in_flight.remove(pos);
        }
        self.states[bid as usize] = SlotState::Delivered;
        self.delivered += 1;
        tracing::trace!(bgid = self.bgid, bid, len, "delivered slot");
        self.debug_check();

        // Refill from queued releases first, so a ring that is topped up here never reports
        // exhaustion.
        let mut low = None;
        if let Some(watermark) = self.watermark {
            if !self.below_watermark && self.free_count() <= watermark {
                self.below_watermark = true;
                // The slot is delivered by now; a bad queued release must not take it down too.
                let drained = self.drain(shared, events).unwrap_or_else(|e| {
                    tracing::error!(bgid = self.bgid, error = %e, "draining releases at watermark failed");
                    0
                });
                let free = self.free_count();
                if free <= watermark {
                    tracing::debug!(bgid = self.bgid, free, watermark, drained, "buf_ring below watermark");
                    low = Some(free);
                }
            }
        }

        if self.free.is_empty() && !self.exhausted {
            self.exhausted = true;
            self.replenished_pending = false;
            tracing::debug!(bgid = self.bgid, "buf_ring exhausted");
            events.deliver(ExhaustionEvent::new(self.bgid).into());
        }
        if let Some(free) = low {
            events.deliver(RingEvent::LowWatermark {
                bgid: self.bgid,
                free,
            });
        }
        Ok(())
    }

    /// Give back the slot a failed read claimed. Nothing was delivered, so the slot goes
    /// straight from in-flight to free.
    fn cancel(&mut self, bid: Bid) -> Result<(), SlotStateError> {
        self.expect_state(bid, SlotState::InFlight)?;
        if let Some(pos) = self.in_flight.iter().position(|b| *b == bid) {
            self.in_flight.remove(pos);
        }
        // The kernel consumed the entry when it picked the slot.
        self.republish(bid);
        tracing::trace!(bgid = self.bgid, bid, "failed read returned its slot");
        self.debug_check();
        Ok(())
    }

    /// Return a delivered slot to the free list and republish its entry to the kernel.
    pub(crate) fn release(&mut self, bid: Bid) -> Result<(), SlotStateError> {
        self.expect_state(bid, SlotState::Delivered)?;

        self.delivered -= 1;
        self.republish(bid);

        tracing::trace!(bgid = self.bgid, bid, free = self.free.len(), "released slot");
        self.debug_check();
        Ok(())
    }

    fn republish(&mut self, bid: Bid) {
        self.states[bid as usize] = SlotState::Free;
        self.memory.write_entry(self.local_tail, bid);
        self.local_tail = self.local_tail.wrapping_add(1);
        self.memory.store_tail(self.local_tail);
        self.free.push_back(bid);
        self.slot_freed();
    }

    fn slot_freed(&mut self) {
        if self.exhausted {
            self.exhausted = false;
            self.replenished_pending = self.notify_replenished;
            tracing::debug!(bgid = self.bgid, "buf_ring replenished");
        }
        if let Some(watermark) = self.watermark {
            if self.below_watermark && self.free_count() > watermark {
                self.below_watermark = false;
            }
        }
    }

    /// Apply the releases queued by other threads, in queue order.
    fn drain(&mut self, shared: &RingShared, events: &mut dyn EventSink) -> Result<usize, SlotStateError> {
        let mut n = 0;
        while let Some(bid) = shared.pop() {
            self.release(bid)?;
            n += 1;
        }
        self.flush_replenished(events);
        Ok(n)
    }

    fn flush_replenished(&mut self, events: &mut dyn EventSink) {
        if !self.replenished_pending {
            return;
        }
        self.replenished_pending = false;
        // Dropped if the ring ran dry again in between.
        if !self.exhausted {
            events.deliver(RingEvent::Replenished { bgid: self.bgid });
        }
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            self.free.len() + self.in_flight.len() + self.delivered as usize,
            self.capacity() as usize,
            "slot counts out of balance for group {}",
            self.bgid
        );
    }
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotTable")
            .field("bgid", &self.bgid)
            .field("free", &self.free.len())
            .field("in_flight", &self.in_flight.len())
            .field("delivered", &self.delivered)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

/// Owns one registered buffer ring and tracks every one of its slots.
///
/// A manager lives on the engine thread; it is neither `Send` nor `Sync`. The
/// [`ProvidedBuffer`]s it hands out can go anywhere.
#[derive(Debug)]
pub struct BufferRingManager {
    registration: RingRegistration,
    table: Rc<RefCell<SlotTable>>,
    shared: Arc<RingShared>,
    source: Arc<dyn BufSource>,
    slot_len: usize,
}

impl BufferRingManager {
    /// Allocate and register the ring described by `config`.
    pub fn register<R>(registrar: &R, config: &RingConfig) -> Result<BufferRingManager, RegistrationError>
    where
        R: BufRingRegistrar + ?Sized,
    {
        let registration = RingRegistration::register(registrar, config)?;
        let memory = registration.memory().clone();
        let table = Rc::new(RefCell::new(SlotTable::new(memory.clone(), config)));
        let shared = Arc::new(RingShared::new(memory, &table));

        Ok(BufferRingManager {
            registration,
            table,
            shared,
            source: config.source().clone(),
            slot_len: config.slot_len(),
        })
    }

    pub fn bgid(&self) -> Bgid {
        self.registration.handle().bgid()
    }

    pub fn capacity(&self) -> u16 {
        self.table.borrow().capacity()
    }

    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// The kernel registration this manager owns.
    pub fn handle(&self) -> &RingHandle {
        self.registration.handle()
    }

    /// Where fallback buffers for this ring are allocated from.
    pub fn source(&self) -> &Arc<dyn BufSource> {
        &self.source
    }

    /// Decide where the next read gets its buffer from, claiming a slot if the ring has one.
    ///
    /// Every [`ReadSource::Ring`] must be followed by exactly one call to
    /// [`on_read_completed`](Self::on_read_completed) once the read completes.
    pub fn begin_read(&mut self) -> ReadSource {
        if self.is_shut_down() {
            return ReadSource::Fallback;
        }
        match self.table.borrow_mut().reserve() {
            Some(_) => ReadSource::Ring(self.bgid()),
            None => ReadSource::Fallback,
        }
    }

    /// Process the completion of a read issued with [`ReadSource::Ring`].
    ///
    /// A selected slot moves to delivered and comes back wrapped in a [`ProvidedBuffer`] of
    /// `len` bytes. If that took the last free slot, an [`ExhaustionEvent`] goes to `events`
    /// before this returns. A completion without a selected slot hands the read's reservation
    /// back and yields [`BufferOutcome::Fallback`].
    ///
    /// # Errors
    ///
    /// If the slot was not in flight, or `len` does not fit the slot. The table is unchanged.
    pub fn on_read_completed(
        &mut self,
        selector: Selector,
        len: usize,
        events: &mut dyn EventSink,
    ) -> Result<BufferOutcome, SlotStateError> {
        let mut table = self.table.borrow_mut();
        match selector {
            Selector::Slot(bid) => {
                table.deliver(bid, len, &self.shared, events)?;
                Ok(BufferOutcome::Delivered(ProvidedBuffer::new(
                    self.shared.clone(),
                    bid,
                    len,
                )))
            }
            Selector::NoBuffer => {
                table.unreserve()?;
                Ok(BufferOutcome::Fallback)
            }
        }
    }

    /// Process the completion of a ring read that failed.
    ///
    /// A slot the kernel selected anyway goes back on the ring, otherwise the read's reservation
    /// is handed back. No events are raised either way.
    pub fn on_read_failed(&mut self, selector: Selector) -> Result<(), SlotStateError> {
        let mut table = self.table.borrow_mut();
        match selector {
            Selector::Slot(bid) => table.cancel(bid),
            Selector::NoBuffer => table.unreserve().map(|_| ()),
        }
    }

    /// Return a delivered slot to the ring.
    #[cfg(test)]
    pub(crate) fn release(&self, bid: Bid) -> Result<(), SlotStateError> {
        self.table.borrow_mut().release(bid)
    }

    /// Apply releases queued from other threads. Returns how many were applied.
    pub fn drain_releases(&mut self, events: &mut dyn EventSink) -> Result<usize, SlotStateError> {
        self.table.borrow_mut().drain(&self.shared, events)
    }

    /// Releases queued from other threads and not yet applied.
    pub fn pending_releases(&self) -> usize {
        self.shared.pending()
    }

    pub fn free_count(&self) -> u16 {
        self.table.borrow().free_count()
    }

    pub fn in_flight_count(&self) -> u16 {
        self.table.borrow().in_flight.len() as u16
    }

    pub fn delivered_count(&self) -> u16 {
        self.table.borrow().delivered
    }

    /// Returns true from the completion that took the last free slot until the next release.
    pub fn is_exhausted(&self) -> bool {
        self.table.borrow().exhausted
    }

    pub fn is_below_watermark(&self) -> bool {
        self.table.borrow().below_watermark
    }

    /// The state of slot `bid`, or `None` if it is out of range.
    pub fn slot_state(&self, bid: Bid) -> Option<SlotState> {
        self.table.borrow().states.get(bid as usize).copied()
    }

    /// The lowest free count seen since the ring was created or last reset.
    pub fn min_free(&self) -> u16 {
        self.table.borrow().min_free
    }

    /// Like [`min_free`](Self::min_free), and start tracking again from the current count.
    pub fn min_free_and_reset(&self) -> u16 {
        let mut table = self.table.borrow_mut();
        let res = table.min_free;
        table.min_free = table.free_count();
        res
    }

    /// Unregister the ring. Releases from buffers still out are dropped from here on.
    ///
    /// Buffers still delivered keep their bytes readable; the slot memory is freed once the
    /// last of them is gone.
    pub fn shutdown<R>(&mut self, registrar: &R) -> Result<(), TeardownError>
    where
        R: BufRingRegistrar + ?Sized,
    {
        let delivered = self.delivered_count();
        if delivered > 0 && self.registration.handle().is_registered() {
            tracing::warn!(bgid = self.bgid(), delivered, "shutting down buf_ring with buffers outstanding");
        }
        self.shared.close();
        self.registration.unregister(registrar)
    }

    pub fn is_shut_down(&self) -> bool {
        !self.registration.handle().is_registered()
    }

    #[cfg(test)]
    pub(crate) fn memory(&self) -> &Arc<RingMemory> {
        self.registration.memory()
    }
}

impl Drop for BufferRingManager {
    fn drop(&mut self) {
        if self.registration.handle().is_registered() {
            // The kernel may still write into the ring and its slots.
            tracing::warn!(bgid = self.bgid(), "buf_ring manager dropped while still registered, leaking its memory");
            std::mem::forget(self.registration.memory().clone());
        }
        self.shared.close();
    }
}
