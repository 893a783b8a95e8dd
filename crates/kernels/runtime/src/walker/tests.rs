use super::*;
use crate::integrator::Tolerances;
use crate::sample::Pool;
use crate::sequence::shape::Rect;
use crate::sequence::{Adc, PhaseCycling, PhaseStep, Pulse, RfChannel, SamplePlacement, SequenceBuilder, Shape};

/// `TR x reps` of a 90 degree hard pulse followed by a readout with `samples` points.
fn fid_tree(reps: u32, samples: u32) -> SequenceTree {
    let mut builder = SequenceBuilder::new();
    let tr = builder.repeating("TR", reps);
    let excite = builder.atomic("excite");
    let rf = builder.leaf(
        "rf",
        Pulse::delay(0.5).with_rf(RfChannel::new(Shape::Rect(Rect { flip_angle: 90.0 }))),
    );
    let readout = builder.atomic("readout");
    let wait = builder.leaf("wait", Pulse::delay(1.0));
    let adc = builder.leaf("adc", Pulse::delay(2.0).with_adc(Adc::new(samples)));
    builder.push_child(excite, rf);
    builder.push_child(readout, wait).push_child(readout, adc);
    builder.push_child(tr, excite).push_child(tr, readout);
    builder.build(tr).unwrap()
}

fn spin(r1: f64, r2: f64) -> SpinProperties {
    SpinProperties {
        position: [0.0; 3],
        off_resonance: 0.0,
        r2_prime: 0.0,
        diffusion: 0.0,
        velocity: [0.0; 3],
        pools: vec![Pool::new(1.0, r1, r2)],
    }
}

#[test]
fn test_sample_stream_is_strictly_increasing() {
    let tree = fid_tree(3, 4);
    let options = WalkerOptions::default();
    let mut walker = ScheduleWalker::new(&tree, &options);
    let ctx = walker.simulate(0, spin(0.001, 0.02), [0.0; 3]).unwrap();

    assert_eq!(ctx.samples.len() as u64, tree.total_samples());
    for (i, sample) in ctx.samples.iter().enumerate() {
        assert_eq!(sample.request.sample_index, i as u64);
    }
    for pair in ctx.samples.windows(2) {
        assert!(pair[1].request.global_time > pair[0].request.global_time);
    }
    assert!((ctx.time_offset - tree.total_duration()).abs() < 1e-12);
}

#[test]
fn test_timeline_matches_emitted_times() {
    let tree = fid_tree(2, 3);
    let options = WalkerOptions::default();
    let mut walker = ScheduleWalker::new(&tree, &options);
    let timeline = walker.sample_timeline().unwrap();
    let ctx = walker.simulate(0, spin(0.0, 0.0), [0.0; 3]).unwrap();

    let emitted: Vec<f64> = ctx.samples.iter().map(|s| s.request.global_time).collect();
    assert_eq!(timeline, emitted);
    // first readout sample: excite (0.5) + wait (1.0) + half a dwell
    assert!((timeline[0] - (1.5 + 2.0 / 6.0)).abs() < 1e-12);
}

#[test]
fn test_excited_magnetization_stays_transverse_without_relaxation() {
    let tree = fid_tree(1, 4);
    let options = WalkerOptions::default();
    let mut walker = ScheduleWalker::new(&tree, &options);
    let ctx = walker.simulate(0, spin(0.0, 0.0), [0.0; 3]).unwrap();

    for sample in &ctx.samples {
        let [mx, my, mz] = sample.magnetization;
        assert!((mx.hypot(my) - 1.0).abs() < 1e-4);
        assert!(mz.abs() < 1e-4);
    }
}

#[test]
fn test_failing_block_is_retried_then_reported() {
    let tree = fid_tree(1, 2);
    let options = WalkerOptions {
        integrator: crate::integrator::IntegratorSettings {
            single_pool: Tolerances {
                max_steps: 2,
                ..Tolerances::single_pool()
            },
            ..Default::default()
        },
        ..Default::default()
    };
    let mut walker = ScheduleWalker::new(&tree, &options);
    let mut ctx = walker.prepare(7, spin(0.0, 0.0), [0.0; 3]);
    let err = walker.walk(&mut ctx).unwrap_err();

    // 1e-6 tightened by 10x four times reaches the 1e-10 floor
    match err {
        WalkError::Integration {
            spin,
            block,
            attempts,
            ..
        } => {
            assert_eq!(spin, 7);
            assert_eq!(block, "excite");
            assert_eq!(attempts, 5);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(ctx.samples.is_empty());
    assert_eq!(ctx.sample_index, 0);
    assert_eq!(ctx.retries, 4);
}

#[test]
fn test_receiver_phase_follows_cycling() {
    let mut builder = SequenceBuilder::new();
    let tr = builder.repeating("TR", 3);
    let block = builder.atomic("acq");
    let mut adc = Adc::new(1);
    adc.cycling = Some(PhaseCycling {
        node: tr,
        increment: 90.0,
        quadratic: false,
    });
    let leaf = builder.leaf("adc", Pulse::delay(1.0).with_adc(adc));
    builder.push_child(block, leaf).push_child(tr, block);
    let tree = builder.build(tr).unwrap();

    let options = WalkerOptions::default();
    let mut walker = ScheduleWalker::new(&tree, &options);
    let ctx = walker.simulate(0, spin(0.0, 0.0), [0.0; 3]).unwrap();
    let phases: Vec<f64> = ctx.samples.iter().map(|s| s.request.receiver_phase.to_degrees()).collect();
    assert_eq!(phases.len(), 3);
    for (rep, phase) in phases.iter().enumerate() {
        assert!((phase - 90.0 * rep as f64).abs() < 1e-9);
    }
}

#[test]
fn test_sample_on_a_discontinuity_is_still_emitted() {
    let mut builder = SequenceBuilder::new();
    let block = builder.atomic("block");
    let mut rf = RfChannel::new(Shape::constant(0.0));
    rf.phase_steps.push(PhaseStep { at: 1.0, phase: 180.0 });
    let mut adc = Adc::new(2);
    adc.placement = SamplePlacement::Explicit(vec![1.0, 1.5]);
    let leaf = builder.leaf("leaf", Pulse::delay(2.0).with_rf(rf).with_adc(adc));
    builder.push_child(block, leaf);
    let tree = builder.build(block).unwrap();

    let options = WalkerOptions::default();
    let mut walker = ScheduleWalker::new(&tree, &options);
    let ctx = walker.simulate(0, spin(0.0, 0.0), [0.0; 3]).unwrap();
    let times: Vec<f64> = ctx.samples.iter().map(|s| s.request.global_time).collect();
    assert_eq!(times, vec![1.0, 1.5]);
}

#[test]
fn test_stochastic_streams_depend_on_spin_index_only() {
    let tree = fid_tree(2, 2);
    let options = WalkerOptions {
        seed: 99,
        corrections: FieldCorrections {
            position_jitter: 20.0,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut diffusing = spin(0.0, 0.0);
    diffusing.diffusion = 0.002;

    let mut walker = ScheduleWalker::new(&tree, &options);
    let a = walker.simulate(3, diffusing.clone(), [1.0; 3]).unwrap();
    let b = ScheduleWalker::new(&tree, &options)
        .simulate(3, diffusing.clone(), [1.0; 3])
        .unwrap();
    let c = walker.simulate(4, diffusing, [1.0; 3]).unwrap();

    assert_eq!(a.position, b.position);
    assert_eq!(a.samples, b.samples);
    assert_ne!(a.position, c.position);
}

#[test]
fn test_flowing_spin_reports_its_position_at_each_sample() {
    let tree = fid_tree(2, 3);
    let options = WalkerOptions::default();
    let mut flowing = spin(0.0, 0.0);
    flowing.position = [1.0, 0.0, 0.0];
    flowing.velocity = [0.2, 0.0, 0.0];

    let mut walker = ScheduleWalker::new(&tree, &options);
    let ctx = walker.simulate(0, flowing, [0.0; 3]).unwrap();
    for sample in &ctx.samples {
        let expected = 1.0 + 0.2 * sample.request.global_time;
        assert!((sample.position[0] - expected).abs() < 1e-12);
    }
    let end = 1.0 + 0.2 * tree.total_duration();
    assert!((ctx.position[0] - end).abs() < 1e-12);
}

#[test]
fn test_diffusion_moves_the_spin_within_a_block() {
    let mut builder = SequenceBuilder::new();
    let block = builder.atomic("acq");
    let mut adc = Adc::new(2);
    adc.placement = SamplePlacement::Explicit(vec![1.0, 2.0]);
    let leaf = builder.leaf("adc", Pulse::delay(3.0).with_adc(adc));
    builder.push_child(block, leaf);
    let tree = builder.build(block).unwrap();

    let options = WalkerOptions {
        seed: 4,
        ..Default::default()
    };
    let mut diffusing = spin(0.0, 0.0);
    diffusing.diffusion = 0.01;
    let ctx = ScheduleWalker::new(&tree, &options)
        .simulate(2, diffusing, [0.0; 3])
        .unwrap();

    // one block, yet every sample sees a different position
    assert_ne!(ctx.samples[0].position, ctx.samples[1].position);
    assert_ne!(ctx.samples[1].position, ctx.position);
    assert_ne!(ctx.samples[0].position, [0.0; 3]);
}
