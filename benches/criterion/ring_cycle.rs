/// Benchmark the bookkeeping cost of one buffer ring read, from preparing the read through
/// completing it to disposing the buffer.
///
/// No kernel is involved: registration is accepted by a stand-in, and completions name the slot
/// the kernel would have picked. What is measured is the slot table, the provided buffer's
/// reference count, and republishing the slot's ring entry.
///
/// The `cross_thread` variant disposes the buffers from a second thread and drains the release
/// queue once per batch, the way a completion cycle would.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::io;

use tokio_uring_bufring::buf::bufring::{Bgid, BufRingRegistrar, EngineRingSet, NoopSink, RingConfig};
use tokio_uring_bufring::io::ReadCompletion;
use tokio_uring_bufring::{Driver, RegistrationPolicy};

const BGID: Bgid = 1;
const IORING_CQE_F_BUFFER: u32 = 1;

struct AcceptAll;

impl BufRingRegistrar for AcceptAll {
    unsafe fn register_buf_ring(&self, _: u64, _: u16, _: Bgid) -> io::Result<()> {
        Ok(())
    }

    fn unregister_buf_ring(&self, _: Bgid) -> io::Result<()> {
        Ok(())
    }
}

fn driver(capacity: u16) -> Driver<AcceptAll> {
    let mut rings = EngineRingSet::new();
    rings
        .add(RingConfig::new(BGID, capacity, 4096).unwrap())
        .unwrap();
    Driver::start(AcceptAll, &rings, RegistrationPolicy::FailFast).unwrap()
}

fn completion(bid: u16, len: i32) -> ReadCompletion {
    ReadCompletion::new(len, IORING_CQE_F_BUFFER | (bid as u32) << 16)
}

fn bench_same_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cycle");

    for capacity in [8u16, 128, 1024] {
        let mut driver = driver(capacity);
        // With one read at a time the kernel walks the slots in order.
        let mut next: u16 = 0;

        group.bench_function(BenchmarkId::new("same_thread", capacity), |b| {
            b.iter(|| {
                let ticket = driver.prepare_read(BGID).unwrap();
                let buf = driver
                    .complete_read(ticket, completion(next, 512), &mut NoopSink)
                    .unwrap();
                next = (next + 1) % capacity;
                black_box(buf.len());
            })
        });
    }
    group.finish();
}

fn bench_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_cycle");

    for batch in [16u16, 256] {
        let mut driver = driver(batch);

        group.bench_function(BenchmarkId::new("cross_thread", batch), |b| {
            b.iter(|| {
                let mut bufs = Vec::with_capacity(batch as usize);
                // Every batch starts from a full ring, slots in publication order.
                for _ in 0..batch {
                    let ticket = driver.prepare_read(BGID).unwrap();
                    let bid = bufs.len() as u16;
                    bufs.push(
                        driver
                            .complete_read(ticket, completion(bid, 64), &mut NoopSink)
                            .unwrap(),
                    );
                }
                std::thread::spawn(move || drop(bufs)).join().unwrap();
                black_box(driver.begin_cycle(&mut NoopSink));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_same_thread, bench_cross_thread);
criterion_main!(benches);
