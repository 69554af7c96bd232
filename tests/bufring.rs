mod common;

use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use common::{start, two_rings, RecordingKernel};
use tokio_uring_bufring::buf::bufring::{ExhaustionEvent, RingConfig, RingEvent, SlotState};
use tokio_uring_bufring::buf::ReadBuf;
use tokio_uring_bufring::error::{DoubleDisposeError, Error};
use tokio_uring_bufring::io::ReadCompletion;
use tokio_test::{assert_err, assert_ok};

fn provided(buf: ReadBuf) -> tokio_uring_bufring::ProvidedBuffer {
    buf.into_provided().expect("read was not served by the ring")
}

#[test]
fn exhaustion_fallback_and_replenish() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    // R1 and R2 take both slots.
    let r1 = driver.prepare_read(1).unwrap();
    let mut a = provided(driver.complete_read(r1, kernel.recv(1, b"first"), &mut events).unwrap());
    assert!(events.is_empty());

    let r2 = driver.prepare_read(1).unwrap();
    let mut b = provided(driver.complete_read(r2, kernel.recv(1, b"second"), &mut events).unwrap());
    assert_eq!(events, vec![RingEvent::Exhausted(ExhaustionEvent::new(1))]);
    assert_ne!(a.bid(), b.bid());
    assert_eq!(&a[..], b"first");
    assert_eq!(&b[..], b"second");
    assert!(driver.ring(1).unwrap().is_exhausted());

    // R3 falls back while the ring is empty.
    let mut r3 = driver.prepare_read(1).unwrap();
    assert!(!r3.is_ring());
    r3.staging_mut().unwrap()[..5].copy_from_slice(b"third");
    let c = driver.complete_read(r3, ReadCompletion::new(5, 0), &mut events).unwrap();
    assert!(!c.is_provided());
    assert_eq!(&c[..], b"third");

    // R4 is issued before the slots come back.
    let mut r4 = driver.prepare_read(1).unwrap();
    assert!(!r4.is_ring());

    a.dispose().unwrap();
    b.dispose().unwrap();
    let ring = driver.ring(1).unwrap();
    assert_eq!(ring.free_count(), 2);
    assert!(!ring.is_exhausted());
    assert_eq!(kernel.available(1), 2);

    // Decided at issue time, so R4 still falls back.
    r4.staging_mut().unwrap()[..6].copy_from_slice(b"fourth");
    let d = driver.complete_read(r4, ReadCompletion::new(6, 0), &mut events).unwrap();
    assert!(!d.is_provided());
    assert_eq!(&d[..], b"fourth");

    // R5, issued after the release, gets a slot.
    let r5 = driver.prepare_read(1).unwrap();
    assert!(r5.is_ring());
    let e = driver.complete_read(r5, kernel.recv(1, b"fifth"), &mut events).unwrap();
    assert!(e.is_provided());
    assert_eq!(&e[..], b"fifth");

    // One event for the whole episode, and the other ring never noticed.
    assert_eq!(events.len(), 1);
    assert_eq!(driver.ring(2).unwrap().free_count(), 16);
}

#[test]
fn rings_are_independent() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    assert_eq!(driver.groups().collect::<Vec<_>>(), vec![1, 2]);
    assert_eq!(driver.ring(1).unwrap().slot_len(), 1024);
    assert_eq!(driver.ring(2).unwrap().capacity(), 16);

    let mut held = vec![];
    for i in 0..4u8 {
        let t = driver.prepare_read(2).unwrap();
        assert_eq!(t.buf_group(), Some(2));
        held.push(driver.complete_read(t, kernel.recv(2, &[i; 10]), &mut events).unwrap());
    }
    assert_eq!(events, vec![RingEvent::LowWatermark { bgid: 2, free: 12 }]);
    assert_eq!(driver.ring(2).unwrap().delivered_count(), 4);
    assert_eq!(driver.ring(1).unwrap().free_count(), 2);

    for (i, buf) in held.iter().enumerate() {
        assert_eq!(&buf[..], &[i as u8; 10][..]);
    }
}

#[test]
fn double_dispose_is_reported() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    let t = driver.prepare_read(1).unwrap();
    let mut buf = provided(driver.complete_read(t, kernel.recv(1, b"x"), &mut events).unwrap());
    let bid = buf.bid();

    assert_ok!(buf.dispose());
    assert!(buf.is_disposed());
    assert!(buf.try_as_slice().is_none());
    let ring = driver.ring(1).unwrap();
    let free = ring.free_count();

    match assert_err!(buf.dispose()) {
        Error::DoubleDispose(e) => assert_eq!(e, DoubleDisposeError { bgid: 1, bid }),
        e => panic!("unexpected {:?}", e),
    }
    assert_eq!(ring.free_count(), free);
    assert_eq!(ring.slot_state(bid), Some(SlotState::Free));
    assert_eq!(kernel.available(1), 2);
}

#[test]
fn retained_buffer_returns_once() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    let t = driver.prepare_read(1).unwrap();
    let mut buf = provided(driver.complete_read(t, kernel.recv(1, b"shared"), &mut events).unwrap());
    let mut other = buf.retain();
    let third = other.clone();
    assert_eq!(buf.ref_count(), 3);

    buf.dispose().unwrap();
    other.dispose().unwrap();
    assert_eq!(third.ref_count(), 1);
    assert_eq!(&third[..], b"shared");
    assert_eq!(driver.ring(1).unwrap().slot_state(third.bid()), Some(SlotState::Delivered));

    drop(third);
    assert_eq!(driver.ring(1).unwrap().free_count(), 2);
    assert_eq!(kernel.available(1), 2);
}

#[test]
fn dispose_from_worker_threads() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    let mut bufs = vec![];
    for i in 0..8u8 {
        let t = driver.prepare_read(2).unwrap();
        bufs.push(provided(driver.complete_read(t, kernel.recv(2, &[i]), &mut events).unwrap()));
    }

    let workers: Vec<_> = bufs
        .into_iter()
        .enumerate()
        .map(|(i, mut buf)| {
            std::thread::spawn(move || {
                assert_eq!(&buf[..], &[i as u8]);
                buf.dispose().unwrap();
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    let ring = driver.ring(2).unwrap();
    assert_eq!(ring.delivered_count(), 8);
    assert_eq!(ring.pending_releases(), 8);

    assert_eq!(driver.begin_cycle(&mut events), 8);
    let ring = driver.ring(2).unwrap();
    assert_eq!(ring.free_count(), 16);
    assert!(!ring.is_below_watermark());
    assert_eq!(kernel.available(2), 16);
}

#[test]
fn shutdown_unregisters_each_ring_once() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let mut events: Vec<RingEvent> = vec![];

    let t = driver.prepare_read(1).unwrap();
    let buf = driver.complete_read(t, kernel.recv(1, b"late"), &mut events).unwrap();

    assert!(driver.shutdown().is_empty());
    assert_eq!(*kernel.unregistered.borrow(), vec![1, 2]);
    // A ring that is shut down serves nothing.
    let t = assert_ok!(driver.prepare_read(1));
    assert!(!t.is_ring());
    assert!(!kernel.is_registered(1));

    // Buffers outlive their ring; dropping them afterwards is fine.
    assert_eq!(&buf[..], b"late");
    drop(driver);
    drop(buf);
    assert_eq!(kernel.unregistered.borrow().len(), 2);
}

#[test]
fn duplicate_group_against_a_live_engine() {
    let kernel = RecordingKernel::default();
    let _first = start(&kernel, &two_rings());

    let mut set = tokio_uring_bufring::buf::bufring::EngineRingSet::new();
    set.add(RingConfig::new(2, 4, 64).unwrap()).unwrap();
    let err = tokio_uring_bufring::Driver::start(
        &kernel,
        &set,
        tokio_uring_bufring::RegistrationPolicy::FailFast,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        tokio_uring_bufring::error::RegistrationError::DuplicateGroup(2)
    ));
}

#[tokio::test]
async fn exhaustion_reaches_the_event_channel() {
    let kernel = RecordingKernel::default();
    let mut driver = start(&kernel, &two_rings());
    let (mut tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RingEvent>();

    let mut bufs = vec![];
    for _ in 0..2 {
        let t = driver.prepare_read(1).unwrap();
        bufs.push(driver.complete_read(t, kernel.recv(1, b"."), &mut tx).unwrap());
    }

    let event = rx.recv().await.unwrap();
    assert_eq!(event.as_exhausted(), Some(ExhaustionEvent::new(1)));
    assert!(rx.try_recv().is_err());
}

#[test]
fn recv_on_a_real_ring() {
    if !common::probe::is_buf_ring_supported() {
        eprintln!("skipping recv_on_a_real_ring: kernel does not support buffer rings");
        return;
    }

    let mut driver = tokio_uring_bufring::builder()
        .entries(8)
        .buf_ring(RingConfig::new(3, 2, 256).unwrap())
        .unwrap()
        .build()
        .unwrap();
    let mut events: Vec<RingEvent> = vec![];

    let (mut tx, rx) = UnixStream::pair().unwrap();
    tx.write_all(b"hello ring").unwrap();

    let ud = driver.submit_recv(rx.as_raw_fd(), 3).unwrap();
    driver.submit_and_wait(1).unwrap();
    let mut done = driver.reap(&mut events);
    assert_eq!(done.len(), 1);
    let (got, res) = done.pop().unwrap();
    assert_eq!(got, ud);

    let buf = res.unwrap();
    assert!(buf.is_provided());
    assert_eq!(&buf[..], b"hello ring");
    assert_eq!(driver.ring(3).unwrap().free_count(), 1);

    drop(buf);
    assert_eq!(driver.ring(3).unwrap().free_count(), 2);
    assert_eq!(driver.pending_reads(), 0);
}
