//! Returning slots to their ring from any thread.
//!
//! A ring's slot table lives on the engine thread and is never touched from anywhere else. A
//! provided buffer disposed on the engine thread applies its release straight to the table,
//! unless the table is busy further up the stack. Every other release is pushed onto the
//! ring's lock-free queue, which the engine drains at the start of each completion cycle.

use crossbeam_queue::SegQueue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use super::manager::SlotTable;
use super::ring::RingMemory;
use super::{Bgid, Bid};
use crate::error::SlotStateError;

static NEXT_RING_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    // Slot tables of the rings owned by this thread, by ring id.
    static LOCAL_RINGS: RefCell<HashMap<u64, Weak<RefCell<SlotTable>>>> =
        RefCell::new(HashMap::new());
}

/// The part of a ring that provided buffers hold on to. Safe to share across threads.
#[derive(Debug)]
pub(crate) struct RingShared {
    id: u64,
    bgid: Bgid,
    owner: ThreadId,
    memory: Arc<RingMemory>,
    queue: SegQueue<Bid>,
    closed: AtomicBool,
}

impl RingShared {
    /// Creates the shared half of a ring owned by the calling thread, and makes `table` the
    /// target of this thread's fast path releases.
    pub(crate) fn new(memory: Arc<RingMemory>, table: &Rc<RefCell<SlotTable>>) -> RingShared {
        let id = NEXT_RING_ID.fetch_add(1, Ordering::Relaxed);
        LOCAL_RINGS.with(|rings| {
            rings.borrow_mut().insert(id, Rc::downgrade(table));
        });

        RingShared {
            id,
            bgid: memory.bgid(),
            owner: thread::current().id(),
            memory,
            queue: SegQueue::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn bgid(&self) -> Bgid {
        self.bgid
    }

    pub(crate) fn memory(&self) -> &RingMemory {
        &self.memory
    }

    /// Give `bid` back to the ring.
    ///
    /// Applied immediately when called on the owning thread while the slot table is free,
    /// queued otherwise. Releases into a closed ring are dropped.
    pub(crate) fn release(&self, bid: Bid) -> Result<(), SlotStateError> {
        if self.closed.load(Ordering::Acquire) {
            tracing::trace!(bgid = self.bgid, bid, "ring closed, dropping release");
            return Ok(());
        }

        if thread::current().id() == self.owner {
            let local = LOCAL_RINGS
                .try_with(|rings| rings.borrow().get(&self.id).and_then(Weak::upgrade))
                .ok()
                .flatten();
            if let Some(cell) = local {
                if let Ok(mut table) = cell.try_borrow_mut() {
                    return table.release(bid);
                }
            }
        }

        tracing::trace!(bgid = self.bgid, bid, "queueing release");
        self.queue.push(bid);
        Ok(())
    }

    /// Next queued release, in the order they were queued.
    pub(crate) fn pop(&self) -> Option<Bid> {
        self.queue.pop()
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Stop accepting releases and forget the ones queued.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        while self.queue.pop().is_some() {}
        let id = self.id;
        let _ = LOCAL_RINGS.try_with(|rings| rings.borrow_mut().remove(&id));
    }
}
