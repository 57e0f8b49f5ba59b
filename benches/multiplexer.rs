//! Multiplexer throughput benchmarks

use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ptyhost::{IoMultiplexer, Side};

/// Push `payload` from one side to the other and count what arrives
fn transfer(mux: &mut IoMultiplexer, payload: &[u8]) -> usize {
    mux.queue(Side::Master, payload);
    let mut received = 0;
    while received < payload.len() {
        mux.poll_once(Duration::from_millis(10), &mut |side: Side, bytes: &[u8]| {
            if side == Side::Slave {
                received += bytes.len();
            }
        })
        .expect("poll failed");
    }
    received
}

fn bench_socket_pair(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplexer");

    let payload = b"The quick brown fox jumps over the lazy dog\r\n".repeat(1000);
    group.throughput(Throughput::Bytes(payload.len() as u64));

    for buffer_size in [256usize, 1024, 4096] {
        let (a, b) = UnixStream::pair().expect("Failed to create socket pair");
        let mut mux = IoMultiplexer::new(buffer_size);
        mux.register(Side::Master, a.as_fd()).unwrap();
        mux.register(Side::Slave, b.as_fd()).unwrap();

        group.bench_function(format!("socket_pair_{}", buffer_size), |bench| {
            bench.iter(|| black_box(transfer(&mut mux, black_box(&payload))))
        });

        mux.unregister(Side::Master);
        mux.unregister(Side::Slave);
    }

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("multiplexer");

    let chunk = [b'x'; 64];
    group.throughput(Throughput::Bytes((chunk.len() * 1000) as u64));

    group.bench_function("queue_chunks", |b| {
        b.iter(|| {
            let mut mux = IoMultiplexer::default();
            for _ in 0..1000 {
                mux.queue(Side::Master, black_box(&chunk));
            }
            black_box(mux.pending(Side::Master))
        })
    });

    group.finish();
}

criterion_group!(benches, bench_socket_pair, bench_queue);
criterion_main!(benches);
