//! Integrator and dispatch benchmarks
//!
//! Measures:
//! - Cost of one spin walk for a single pool and for two exchanging pools
//! - Effect of the batch size on a dispatched run
//! - Worker scaling over population sizes

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use larmor_runtime::sequence::shape::{Rect, Sinc};
use larmor_runtime::sequence::{Adc, GradientChannel, Pulse, RfChannel, Shape};
use larmor_runtime::{
    CheckpointOptions, DispatchOptions, ExchangeRate, ExchangeRates, IdealCoil, LoadBalancing,
    Pool, ReceiveCoil, RunInputs, ScheduleWalker, SequenceBuilder, SequenceTree, SpinProperties,
    SpinTable, WalkerOptions, run_dispatch,
};

/// Slice-selective excitation followed by a gradient echo readout.
fn gradient_echo(repetitions: u32) -> SequenceTree {
    let mut builder = SequenceBuilder::new();
    let root = builder.repeating("TR", repetitions);
    let excite = builder.atomic("excite");
    let sinc = Sinc {
        amplitude: 0.4,
        zeros: 3,
        apodization: 0.5,
    };
    let rf = builder.leaf(
        "rf",
        Pulse::delay(2.0)
            .with_rf(RfChannel::new(Shape::Sinc(sinc)))
            .with_gradient(2, GradientChannel::new(Shape::constant(0.3))),
    );
    let refocus = builder.atomic("refocus");
    let hard = builder.leaf(
        "hard",
        Pulse::delay(0.2).with_rf(RfChannel::new(Shape::Rect(Rect { flip_angle: 180.0 }))),
    );
    let read = builder.atomic("read");
    let adc = builder.leaf(
        "adc",
        Pulse::delay(4.0)
            .with_gradient(0, GradientChannel::new(Shape::constant(0.2)))
            .with_adc(Adc::new(64)),
    );
    builder.push_child(excite, rf);
    builder.push_child(refocus, hard);
    builder.push_child(read, adc);
    builder
        .push_child(root, excite)
        .push_child(root, refocus)
        .push_child(root, read);
    builder.build(root).unwrap()
}

fn spin(pools: Vec<Pool>, x: f64) -> SpinProperties {
    SpinProperties {
        position: [x, 0.0, 0.1],
        off_resonance: 0.02,
        r2_prime: 0.0,
        diffusion: 0.0,
        velocity: [0.0; 3],
        pools,
    }
}

/// Single walk cost per pool model
fn bench_spin_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("spin_walk");
    let tree = gradient_echo(4);

    let single = WalkerOptions::default();
    group.bench_function("single_pool", |b| {
        let mut walker = ScheduleWalker::new(&tree, &single);
        let properties = spin(vec![Pool::new(1.0, 0.001, 0.02)], 0.5);
        b.iter(|| {
            walker
                .simulate(0, black_box(properties.clone()), [1.0; 3])
                .unwrap()
        })
    });

    let coupled = WalkerOptions {
        exchange: ExchangeRates::new(
            2,
            vec![ExchangeRate {
                from: 0,
                to: 1,
                rate: 0.005,
            }],
        )
        .unwrap(),
        ..Default::default()
    };
    group.bench_function("two_pools_exchanging", |b| {
        let mut walker = ScheduleWalker::new(&tree, &coupled);
        let properties = spin(
            vec![Pool::new(0.8, 0.001, 0.02), Pool::new(0.2, 0.002, 0.1)],
            0.5,
        );
        b.iter(|| {
            walker
                .simulate(0, black_box(properties.clone()), [1.0; 3])
                .unwrap()
        })
    });

    group.finish();
}

fn run_inputs(population: usize) -> RunInputs {
    let spins = (0..population)
        .map(|i| spin(vec![Pool::new(1.0, 0.001, 0.02)], i as f64 * 0.01 - 1.0))
        .collect();
    RunInputs {
        tree: gradient_echo(1),
        spins: Arc::new(SpinTable::new(1, spins).unwrap()),
        coils: vec![Box::new(IdealCoil) as Box<dyn ReceiveCoil>],
        walker: WalkerOptions::default(),
    }
}

fn dispatch_options(workers: usize, batch_size: usize, balanced: bool) -> DispatchOptions {
    DispatchOptions {
        workers,
        batch_size,
        load_balancing: balanced.then_some(LoadBalancing {
            min_batch: 4,
            max_batch: batch_size,
        }),
        checkpoint: CheckpointOptions::disabled(),
        ..Default::default()
    }
}

/// Batch size for a fixed population
fn bench_batch_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("batch_sizes");
    let population = 512;
    group.throughput(Throughput::Elements(population as u64));
    group.sample_size(10);

    for batch_size in [8, 32, 128, 512] {
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                b.iter(|| {
                    run_dispatch(run_inputs(population), &dispatch_options(4, batch_size, true))
                        .unwrap()
                })
            },
        );
    }

    group.finish();
}

/// Worker scaling across population sizes
fn bench_worker_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("worker_scaling");
    group.sample_size(10);

    for population in [256, 1_024, 4_096] {
        group.throughput(Throughput::Elements(population as u64));
        for workers in [1, 2, 4, 8] {
            group.bench_with_input(
                BenchmarkId::new(format!("workers_{workers}"), population),
                &population,
                |b, &population| {
                    b.iter(|| {
                        run_dispatch(run_inputs(population), &dispatch_options(workers, 64, false))
                            .unwrap()
                    })
                },
            );
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_spin_walk,
    bench_batch_sizes,
    bench_worker_scaling
);
criterion_main!(benches);
