//! Send window throughput: framing, checksumming and ring cycling.
//!
//! Run with:
//! ```sh
//! cargo bench --bench window_bench
//! ```

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;

use marlinfeed_protocol::SendWindow;

/// A realistic mix of movement commands, as a slicer would emit them.
fn sample_lines() -> Vec<String> {
    (0..96)
        .map(|i| format!("G1 X{}.{} Y{}.{} E{}.{}", i, i % 10, 96 - i, i % 7, i, i % 3))
        .collect()
}

fn bench_append_cycle(c: &mut Criterion) {
    let lines = sample_lines();
    let bytes: usize = lines.iter().map(|l| l.len()).sum();

    let mut group = c.benchmark_group("send_window");
    group.throughput(Throughput::Bytes(bytes as u64));

    group.bench_function("append_next_ack", |b| {
        b.iter(|| {
            let mut window = SendWindow::new();
            window.set_buf_size(100_000);
            for line in &lines {
                window.append(black_box(line.as_bytes()));
                let frame = window.next();
                black_box(&frame);
                window.ack();
            }
        })
    });

    group.bench_function("append_windowed", |b| {
        // bounded by the real 128 byte printer buffer: appends interleave
        // with acks the way a live print does
        b.iter(|| {
            let mut window = SendWindow::new();
            let mut sent = 0usize;
            for line in &lines {
                while window.max_append_len() < line.len() {
                    window.ack();
                    sent -= 1;
                }
                window.append(black_box(line.as_bytes()));
                while window.has_next() {
                    black_box(window.next());
                    sent += 1;
                }
            }
            black_box(sent)
        })
    });

    group.finish();
}

fn bench_seek_replay(c: &mut Criterion) {
    c.bench_function("send_window/seek_replay", |b| {
        let mut window = SendWindow::new();
        window.set_buf_size(100_000);
        for i in 0..90 {
            window.append(format!("G1 X{} Y{}", i, i).as_bytes());
        }
        while window.has_next() {
            window.next();
        }
        b.iter(|| {
            assert!(window.seek(black_box(0)));
            let mut n = 0;
            while window.has_next() {
                black_box(window.next());
                n += 1;
            }
            black_box(n)
        })
    });
}

criterion_group!(benches, bench_append_cycle, bench_seek_replay);
criterion_main!(benches);
