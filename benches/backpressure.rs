use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use demand_pipeline::link::{link, Signal};
use demand_pipeline::{
    BoundedBranchBuffer, BranchSpec, CancelToken, Collector, DelayModel, NoopObserver,
    OverflowPolicy, PipelineRunner, Producer, TopologyBuilder,
};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn benchmark_demand_handoff(c: &mut Criterion) {
    c.bench_function("demand_handoff_10000_items", |b| {
        b.iter(|| {
            let cancel = CancelToken::new();
            let (mut outlet, mut inlet) = link::<u64>(&cancel);
            let producer = thread::spawn(move || {
                for i in 0..10_000 {
                    outlet.push(black_box(i)).expect("Push failed");
                }
                outlet.complete().expect("Complete failed");
            });

            let mut received = 0u64;
            while let Ok(Signal::Item(item)) = inlet.pull() {
                received += black_box(item);
            }
            producer.join().expect("Producer panicked");
            received
        });
    });
}

fn benchmark_buffer_policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_10000_items");
    for policy in [
        OverflowPolicy::Block,
        OverflowPolicy::DropOldest,
        OverflowPolicy::DropNewest,
    ] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", policy)),
            &policy,
            |b, &policy| {
                b.iter(|| {
                    let cancel = CancelToken::new();
                    let (mut writer, mut reader) =
                        BoundedBranchBuffer::channel(64, policy, &cancel).expect("Buffer failed");
                    let feeder = thread::spawn(move || {
                        for i in 0..10_000u64 {
                            writer.offer(black_box(i)).expect("Offer failed");
                        }
                        writer.complete();
                    });

                    let mut received = 0u64;
                    while let Ok(Signal::Item(_)) = reader.pop() {
                        received += 1;
                    }
                    feeder.join().expect("Feeder panicked");
                    received
                });
            },
        );
    }
    group.finish();
}

fn benchmark_fan_out_slow_branch(c: &mut Criterion) {
    let runner = PipelineRunner::new(Arc::new(NoopObserver));
    c.bench_function("fan_out_1000_items_drop_newest_slow_branch", |b| {
        b.iter(|| {
            let topology = TopologyBuilder::new("bench")
                .producer(Producer::new(0..1000u64))
                .tick_period(Duration::from_micros(10))
                .branch(
                    BranchSpec::new("slow", Collector::new())
                        .with_delay(DelayModel::Constant(Duration::from_micros(100)))
                        .with_buffer(16, OverflowPolicy::DropNewest),
                )
                .branch(BranchSpec::new("fast-a", Collector::new()))
                .branch(BranchSpec::new("fast-b", Collector::new()))
                .build()
                .expect("Build failed");
            runner.run(topology).expect("Run failed")
        });
    });
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(15))
        .sample_size(20);
    targets = benchmark_demand_handoff, benchmark_buffer_policies, benchmark_fan_out_slow_branch
);
criterion_main!(benches);
