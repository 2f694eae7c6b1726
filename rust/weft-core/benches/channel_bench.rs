//! Channel hand-off throughput under the blocking event loop.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use weft_core::{coroutine_scope, run_blocking, Capacity, Channel};

fn buffered_pipe(n: u32, capacity: usize) -> u64 {
    run_blocking(async move {
        coroutine_scope(|scope| async move {
            let ch = Channel::new(Capacity::Buffered(capacity));
            let producer_ch = ch.clone();
            scope.launch(async move {
                for v in 0..n {
                    producer_ch.send(v).await?;
                }
                producer_ch.close();
                Ok(())
            });
            let mut sum = 0u64;
            let mut iter = ch.iter();
            while let Some(item) = iter.next().await {
                sum += item? as u64;
            }
            Ok(sum)
        })
        .await
    })
    .unwrap()
}

fn channel_benches(c: &mut Criterion) {
    c.bench_function("buffered_64_pipe_1k", |b| {
        b.iter(|| black_box(buffered_pipe(1_000, 64)))
    });
    c.bench_function("rendezvous_pipe_256", |b| {
        b.iter(|| black_box(buffered_pipe(256, 0)))
    });
}

criterion_group!(channel, channel_benches);
criterion_main!(channel);
