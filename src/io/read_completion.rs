use std::io;

use crate::buf::bufring::{Bgid, BufferOutcome, BufferRingManager, EventSink, ReadSource, Selector};
use crate::buf::ReadBuf;
use crate::error::{Error, Result};

/// A read that has been prepared against a buffer group and not yet completed.
///
/// The ticket fixes where the read's buffer comes from. A ring ticket tags the read for the
/// group and lets the kernel pick a slot. A fallback ticket carries the buffer to read into.
/// Every ticket must be passed to [`complete_read`] once its read completes, including reads
/// that were cancelled.
#[derive(Debug)]
pub struct ReadTicket {
    bgid: Bgid,
    kind: TicketKind,
}

#[derive(Debug)]
enum TicketKind {
    Ring,
    Fallback(Vec<u8>),
}

impl ReadTicket {
    /// The buffer group the read was prepared against.
    pub fn bgid(&self) -> Bgid {
        self.bgid
    }

    pub fn is_ring(&self) -> bool {
        matches!(self.kind, TicketKind::Ring)
    }

    /// The group to name in the submission, with `IOSQE_BUFFER_SELECT` set, or `None` for a
    /// fallback read.
    pub fn buf_group(&self) -> Option<Bgid> {
        match self.kind {
            TicketKind::Ring => Some(self.bgid),
            TicketKind::Fallback(_) => None,
        }
    }

    /// The buffer a fallback read reads into. Its length is the most the read may return.
    pub fn staging_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.kind {
            TicketKind::Ring => None,
            TicketKind::Fallback(buf) => Some(buf.as_mut_slice()),
        }
    }
}

/// The parts of a completion queue entry the read path looks at.
#[derive(Debug)]
pub struct ReadCompletion {
    result: io::Result<u32>,
    flags: u32,
}

impl ReadCompletion {
    /// From a raw result, negative errno on failure, and the completion flags.
    pub fn new(res: i32, flags: u32) -> ReadCompletion {
        let result = if res >= 0 {
            Ok(res as u32)
        } else {
            Err(io::Error::from_raw_os_error(-res))
        };
        ReadCompletion { result, flags }
    }

    pub fn from_cqe(cqe: &io_uring::cqueue::Entry) -> ReadCompletion {
        ReadCompletion::new(cqe.result(), cqe.flags())
    }

    /// The buffer the kernel selected, if any.
    pub fn selector(&self) -> Selector {
        Selector::from_flags(self.flags)
    }

    pub fn result(&self) -> &io::Result<u32> {
        &self.result
    }
}

/// Decide the buffer source of a read about to be submitted for `ring`'s group.
///
/// # Errors
///
/// [`Error::FallbackAlloc`] if the ring is out of slots and the fallback buffer could not be
/// allocated. The ring is not touched in that case.
pub fn prepare_read(ring: &mut BufferRingManager) -> Result<ReadTicket> {
    let bgid = ring.bgid();
    let kind = match ring.begin_read() {
        ReadSource::Ring(_) => TicketKind::Ring,
        ReadSource::Fallback => {
            let len = ring.slot_len();
            let mut buf = ring
                .source()
                .allocate(len)
                .map_err(|e| Error::FallbackAlloc { len: e.len })?;
            buf.clear();
            buf.resize(len, 0);
            tracing::trace!(bgid, len, "ring empty, reading into fallback buffer");
            TicketKind::Fallback(buf)
        }
    };
    Ok(ReadTicket { bgid, kind })
}

/// Turn a read completion into the buffer handed to the application.
///
/// Ring reads go through the ring's slot table; any [`ExhaustionEvent`] the completion causes
/// reaches `events` before this returns, so ahead of the data. Fallback reads hand over their
/// staging buffer cut to the length read.
///
/// # Errors
///
/// - [`Error::ReadFailure`] if the read failed. A slot the kernel selected anyway goes straight
///   back to the ring.
/// - [`Error::MissingBufferSelect`] if a ring read returned data without naming a slot.
/// - [`Error::SlotState`] if the completion does not fit the slot table.
///
/// [`ExhaustionEvent`]: crate::buf::bufring::ExhaustionEvent
pub fn complete_read(
    ring: &mut BufferRingManager,
    ticket: ReadTicket,
    completion: ReadCompletion,
    events: &mut dyn EventSink,
) -> Result<ReadBuf> {
    debug_assert_eq!(ticket.bgid, ring.bgid());
    let bgid = ticket.bgid;
    let selector = completion.selector();

    match ticket.kind {
        TicketKind::Fallback(mut buf) => match completion.result {
            Ok(n) => {
                buf.truncate(n as usize);
                Ok(ReadBuf::Allocated(buf))
            }
            Err(e) => Err(Error::ReadFailure(e)),
        },
        TicketKind::Ring => match completion.result {
            Ok(n) => match ring.on_read_completed(selector, n as usize, events)? {
                BufferOutcome::Delivered(buf) => Ok(ReadBuf::Provided(buf)),
                // End of stream, nothing was read.
                BufferOutcome::Fallback if n == 0 => Ok(ReadBuf::Allocated(Vec::new())),
                BufferOutcome::Fallback => {
                    tracing::error!(bgid, len = n, "ring read completed without a buffer id");
                    Err(Error::MissingBufferSelect {
                        bgid,
                        len: n as usize,
                    })
                }
            },
            Err(e) => {
                ring.on_read_failed(selector)?;
                Err(Error::ReadFailure(e))
            }
        },
    }
}
