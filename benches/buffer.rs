use std::any::Any;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use metrelay::metric::Metric;
use metrelay::models::MetricBuffer;

#[derive(Debug, Clone)]
struct BenchMetric(u64);

impl Metric for BenchMetric {
    fn clone_metric(&self) -> Box<dyn Metric> {
        Box::new(self.clone())
    }

    fn to_value(&self) -> serde_json::Value {
        serde_json::json!(self.0)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn bench_buffer_add(c: &mut Criterion) {
    c.bench_function("buffer_add_1k", |b| {
        b.iter(|| {
            let buffer = MetricBuffer::new(10_000);
            for i in 0..1_000u64 {
                buffer.add(Box::new(BenchMetric(i)));
            }
            black_box(buffer.len())
        })
    });
}

fn bench_buffer_add_with_overflow(c: &mut Criterion) {
    c.bench_function("buffer_add_1k_overflowing", |b| {
        b.iter(|| {
            let buffer = MetricBuffer::new(256);
            let mut dropped = 0;
            for i in 0..1_000u64 {
                dropped += buffer.add(Box::new(BenchMetric(i)));
            }
            black_box(dropped)
        })
    });
}

fn bench_batch_accept_cycle(c: &mut Criterion) {
    c.bench_function("buffer_batch_accept_1k", |b| {
        b.iter(|| {
            let buffer = MetricBuffer::new(10_000);
            for i in 0..1_000u64 {
                buffer.add(Box::new(BenchMetric(i)));
            }

            let mut drained = 0;
            loop {
                let batch = buffer.batch(100);
                if batch.is_empty() {
                    break;
                }
                drained += batch.len();
                buffer.accept(batch);
            }
            black_box(drained)
        })
    });
}

fn bench_fan_out_clone(c: &mut Criterion) {
    let metric: Box<dyn Metric> = Box::new(BenchMetric(42));

    c.bench_function("metric_clone_1k", |b| {
        b.iter(|| {
            for _ in 0..1_000 {
                black_box(metric.clone_metric());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_buffer_add,
    bench_buffer_add_with_overflow,
    bench_batch_accept_cycle,
    bench_fan_out_clone,
);
criterion_main!(benches);
