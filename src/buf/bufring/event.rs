use tokio::sync::mpsc;

use super::Bgid;

/// A ring ran out of free slots.
///
/// Emitted once per exhaustion episode, at the completion that took the last free slot. The
/// next one can only follow after a slot has been returned to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExhaustionEvent {
    bgid: Bgid,
}

impl ExhaustionEvent {
    pub fn new(bgid: Bgid) -> ExhaustionEvent {
        ExhaustionEvent { bgid }
    }

    /// The group that is exhausted.
    pub fn bgid(&self) -> Bgid {
        self.bgid
    }
}

/// Notifications a ring delivers to the channel pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingEvent {
    Exhausted(ExhaustionEvent),

    /// The free slot count fell to or below the configured watermark, even after draining
    /// pending releases.
    LowWatermark { bgid: Bgid, free: u16 },

    /// An exhausted ring got a slot back. Only delivered for rings configured with
    /// `notify_replenished`.
    Replenished { bgid: Bgid },
}

impl RingEvent {
    pub fn bgid(&self) -> Bgid {
        match self {
            RingEvent::Exhausted(e) => e.bgid(),
            RingEvent::LowWatermark { bgid, .. } | RingEvent::Replenished { bgid } => *bgid,
        }
    }

    pub fn as_exhausted(&self) -> Option<ExhaustionEvent> {
        match self {
            RingEvent::Exhausted(e) => Some(*e),
            _ => None,
        }
    }
}

impl From<ExhaustionEvent> for RingEvent {
    fn from(e: ExhaustionEvent) -> Self {
        RingEvent::Exhausted(e)
    }
}

/// Receives ring events, inline with the completion or release that caused them.
pub trait EventSink {
    fn deliver(&mut self, event: RingEvent);
}

impl EventSink for Vec<RingEvent> {
    fn deliver(&mut self, event: RingEvent) {
        self.push(event);
    }
}

/// A channel's user-event pipeline. Events for a closed pipeline are dropped.
impl EventSink for mpsc::UnboundedSender<RingEvent> {
    fn deliver(&mut self, event: RingEvent) {
        if self.send(event).is_err() {
            tracing::trace!(bgid = event.bgid(), "event receiver gone, dropping {:?}", event);
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn deliver(&mut self, event: RingEvent) {
        (**self).deliver(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn deliver(&mut self, _: RingEvent) {}
}
