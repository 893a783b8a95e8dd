//! End-to-end runs through the public API.
//!
//! These tests cover what only shows across whole runs: interrupt and
//! resume, stale checkpoints, worker-count independence and scenario files.

use std::path::Path;
use std::sync::Arc;

use larmor_runtime::checkpoint::CHECKPOINT_FILE_NAME;
use larmor_runtime::sequence::shape::Rect;
use larmor_runtime::sequence::{Adc, GradientChannel, Pulse, RfChannel, Shape};
use larmor_runtime::signal::{channel_file_name, read_records};
use larmor_runtime::{
    CheckpointOptions, DispatchOptions, FieldCorrections, IdealCoil, LoadBalancing, Pool,
    ReceiveCoil, RunInputs, Scenario, SequenceBuilder, SequenceTree, SignalSet, SpinProperties,
    SpinTable, UniformCoil, WalkerOptions, partition_static, run_dispatch,
};

/// 90 degree excitation, a dephasing lobe and a readout, repeated twice.
fn gradient_echo() -> SequenceTree {
    let mut builder = SequenceBuilder::new();
    let root = builder.repeating("TR", 2);
    let excite = builder.atomic("excite");
    let rf = builder.leaf(
        "rf",
        Pulse::delay(0.1).with_rf(RfChannel::new(Shape::Rect(Rect { flip_angle: 90.0 }))),
    );
    let read = builder.atomic("read");
    let prephase = builder.leaf(
        "prephase",
        Pulse::delay(1.0).with_gradient(0, GradientChannel::new(Shape::constant(-0.5))),
    );
    let adc = builder.leaf(
        "adc",
        Pulse::delay(2.0)
            .with_gradient(0, GradientChannel::new(Shape::constant(0.5)))
            .with_adc(Adc::new(6)),
    );
    builder.push_child(excite, rf);
    builder.push_child(read, prephase).push_child(read, adc);
    builder.push_child(root, excite).push_child(root, read);
    builder.build(root).unwrap()
}

fn population(count: usize, diffusion: f64) -> SpinTable {
    let spins = (0..count)
        .map(|i| SpinProperties {
            position: [(i as f64 - count as f64 / 2.0) * 0.1, 0.0, 0.0],
            off_resonance: 0.01 * i as f64,
            r2_prime: 0.0,
            diffusion,
            velocity: [0.0; 3],
            pools: vec![Pool::new(1.0, 0.001, 0.02)],
        })
        .collect();
    SpinTable::new(1, spins).unwrap().with_resolution([0.1, 1.0, 1.0])
}

fn inputs(count: usize, walker: WalkerOptions) -> RunInputs {
    RunInputs {
        tree: gradient_echo(),
        spins: Arc::new(population(count, 0.0)),
        coils: vec![Box::new(IdealCoil) as Box<dyn ReceiveCoil>],
        walker,
    }
}

fn seeded(seed: u64) -> WalkerOptions {
    WalkerOptions {
        seed,
        ..Default::default()
    }
}

fn options(dir: &Path) -> DispatchOptions {
    DispatchOptions {
        batch_size: 2,
        output_dir: Some(dir.to_path_buf()),
        ..Default::default()
    }
}

fn assert_signals_close(a: &SignalSet, b: &SignalSet, tol: f64) {
    assert!(a.is_compatible(b));
    for (ca, cb) in a.channels().iter().zip(b.channels()) {
        for (ra, rb) in ca.iter().zip(cb) {
            assert_eq!(ra.time, rb.time);
            assert!((ra.mx - rb.mx).abs() < tol, "mx {} vs {}", ra.mx, rb.mx);
            assert!((ra.my - rb.my).abs() < tol, "my {} vs {}", ra.my, rb.my);
            assert!((ra.mz - rb.mz).abs() < tol, "mz {} vs {}", ra.mz, rb.mz);
        }
    }
}

#[test]
fn test_resumed_run_matches_uninterrupted_run() {
    let straight_dir = tempfile::tempdir().unwrap();
    let straight = run_dispatch(inputs(9, seeded(3)), &options(straight_dir.path())).unwrap();
    assert_eq!(straight.completed, 9);

    let dir = tempfile::tempdir().unwrap();
    let interrupted = DispatchOptions {
        spin_budget: Some(4),
        ..options(dir.path())
    };
    let first = run_dispatch(inputs(9, seeded(3)), &interrupted).unwrap();
    assert!(first.interrupted);
    assert_eq!(first.completed, 4);
    assert!(dir.path().join(CHECKPOINT_FILE_NAME).exists());

    let resumed = run_dispatch(inputs(9, seeded(3)), &options(dir.path())).unwrap();
    assert_eq!(resumed.resumed_from, Some(4));
    assert_eq!(resumed.completed, 9);
    assert!(!resumed.interrupted);
    assert_signals_close(&straight.signal, &resumed.signal, 1e-12);

    let on_disk = read_records(&dir.path().join(channel_file_name(0))).unwrap();
    assert_eq!(on_disk, resumed.signal.channel(0));
}

fn stale_archives(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("restart.ckpt.stale-")
        })
        .count()
}

#[test]
fn test_mismatched_checkpoint_is_archived() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = DispatchOptions {
        spin_budget: Some(2),
        ..options(dir.path())
    };
    run_dispatch(inputs(6, seeded(1)), &interrupted).unwrap();
    assert!(dir.path().join(CHECKPOINT_FILE_NAME).exists());

    // a different seed changes the run shape
    let report = run_dispatch(inputs(6, seeded(2)), &options(dir.path())).unwrap();
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.completed, 6);
    assert_eq!(stale_archives(dir.path()), 1);
}

#[test]
fn test_checkpoint_from_other_coils_is_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = DispatchOptions {
        spin_budget: Some(4),
        ..options(dir.path())
    };
    let first = run_dispatch(inputs(9, seeded(3)), &interrupted).unwrap();
    assert!(first.interrupted);
    assert!(dir.path().join(CHECKPOINT_FILE_NAME).exists());

    let mut rescaled = inputs(9, seeded(3));
    rescaled.coils = vec![Box::new(UniformCoil {
        magnitude: 2.0,
        phase: 0.0,
    })];
    let report = run_dispatch(rescaled, &options(dir.path())).unwrap();
    assert_eq!(report.resumed_from, None);
    assert_eq!(report.completed, 9);
    assert_eq!(stale_archives(dir.path()), 1);

    // every record comes from the new coil, none from the checkpoint
    let straight_dir = tempfile::tempdir().unwrap();
    let ideal = run_dispatch(inputs(9, seeded(3)), &options(straight_dir.path())).unwrap();
    for (a, b) in ideal.signal.channel(0).iter().zip(report.signal.channel(0)) {
        assert!((2.0 * a.mx - b.mx).abs() < 1e-12);
        assert!((2.0 * a.my - b.my).abs() < 1e-12);
    }
}

#[test]
fn test_checkpoint_from_other_spins_is_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let interrupted = DispatchOptions {
        spin_budget: Some(3),
        ..options(dir.path())
    };
    run_dispatch(inputs(6, seeded(1)), &interrupted).unwrap();

    // same count and seed, but every spin diffuses now
    let moved = RunInputs {
        spins: Arc::new(population(6, 0.001)),
        ..inputs(6, seeded(1))
    };
    let report = run_dispatch(moved, &options(dir.path())).unwrap();
    assert_eq!(report.resumed_from, None);
    assert_eq!(stale_archives(dir.path()), 1);
}

#[test]
fn test_random_streams_do_not_depend_on_worker_count() {
    let walker = WalkerOptions {
        seed: 99,
        corrections: FieldCorrections {
            position_jitter: 10.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let diffusing = |workers: usize, balancing: Option<LoadBalancing>| {
        let run = RunInputs {
            tree: gradient_echo(),
            spins: Arc::new(population(10, 0.001)),
            coils: vec![Box::new(IdealCoil) as Box<dyn ReceiveCoil>],
            walker: walker.clone(),
        };
        let options = DispatchOptions {
            workers,
            load_balancing: balancing,
            batch_size: 2,
            checkpoint: CheckpointOptions::disabled(),
            ..Default::default()
        };
        run_dispatch(run, &options).unwrap()
    };

    let serial = diffusing(1, None);
    let static_ranges = diffusing(4, None);
    let balanced = diffusing(
        3,
        Some(LoadBalancing {
            min_batch: 1,
            max_batch: 3,
        }),
    );
    assert_signals_close(&serial.signal, &static_ranges.signal, 1e-12);
    assert_signals_close(&serial.signal, &balanced.signal, 1e-12);
}

#[test]
fn test_static_partition_of_one_hundred_spins() {
    let ranges = partition_static(100, 4);
    assert_eq!(ranges, vec![0..25, 25..50, 50..75, 75..100]);
}

#[test]
fn test_scenario_file_runs_end_to_end() {
    let yaml = r#"
apiVersion: larmor/v1
kind: Scenario
metadata:
  name: fid
seed: 5
workers: 2
batchSize: 3
sequence:
  root: scan
  nodes:
    - name: scan
      repeat: 1
      children: [acq]
    - name: acq
      block: {}
      children: [rf, adc]
    - name: rf
      pulse:
        duration: 0.1
        rf: { shape: { type: rect, flipAngle: 90 } }
    - name: adc
      pulse:
        duration: 4.0
        adc: { samples: 5 }
sample:
  grid:
    size: [3, 2, 1]
    resolution: [1.0, 1.0, 1.0]
    template:
      position: [0, 0, 0]
      pools: [{ m0: 1.0, r1: 0.001, r2: 0.05 }]
coils:
  - type: ideal
  - type: uniform
    magnitude: 2.0
"#;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fid.yaml");
    std::fs::write(&path, yaml).unwrap();

    let scenario = Scenario::load(&path).unwrap();
    let output = dir.path().join("out");
    std::fs::create_dir_all(&output).unwrap();
    let (inputs, options) = scenario.into_run(Some(output.clone())).unwrap();
    let report = run_dispatch(inputs, &options).unwrap();

    assert_eq!(report.completed, 6);
    assert_eq!(report.files.len(), 2);
    assert!(!output.join(CHECKPOINT_FILE_NAME).exists());

    let ideal = read_records(&output.join(channel_file_name(0))).unwrap();
    let scaled = read_records(&output.join(channel_file_name(1))).unwrap();
    assert_eq!(ideal.len(), 5);
    assert!(ideal.windows(2).all(|w| w[0].time < w[1].time));
    // free decay: transverse magnitude shrinks sample by sample
    let magnitude = |r: &larmor_runtime::SignalRecord| r.mx.hypot(r.my);
    assert!(ideal.windows(2).all(|w| magnitude(&w[1]) < magnitude(&w[0])));
    for (a, b) in ideal.iter().zip(&scaled) {
        assert!((2.0 * a.mx - b.mx).abs() < 1e-12);
        assert!((2.0 * a.my - b.my).abs() < 1e-12);
    }
}
