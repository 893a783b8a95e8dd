//! Spin trajectories.
//!
//! The position of a spin at sequence time `t` is built up in this order:
//!
//! ```text
//! tissue  = start + velocity * t + walk(t)       flow and diffusion
//! moved   = R(t) * (tissue - origin) + origin + T(t)   rigid motion
//! final   = moved + respiration(t)
//! ```
//!
//! The diffusion walk is sampled on knots `diffusion_step` apart and
//! interpolated linearly in between, so the integrator sees a continuous
//! position even inside a block. Knots are drawn block by block from the
//! spin's own random stream; the sequence of draws depends only on the
//! block durations, never on how spins are spread over workers.

use serde::{Deserialize, Serialize};

use larmor_foundation::geometry::{add3, mat3_transform, scale3};
use larmor_foundation::{AxisRotation, Fingerprint, RngStream, Vec3};

use crate::error::ConfigError;

/// Spacing of the diffusion knots when a scenario does not set one (ms).
pub const DEFAULT_DIFFUSION_STEP: f64 = 0.05;

/// Pose of the whole sample at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotionKeyframe {
    /// Sequence time (ms).
    pub time: f64,
    /// Translation (mm).
    #[serde(default)]
    pub translation: Vec3,
    /// Rotation about x, then y, then z (degrees).
    #[serde(default)]
    pub rotation: Vec3,
}

/// Rigid motion given as keyframes, linearly interpolated.
///
/// Before the first keyframe the sample holds the first pose, after the
/// last one it holds the last pose.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RigidMotion {
    /// Centre of rotation (mm).
    pub origin: Vec3,
    pub keyframes: Vec<MotionKeyframe>,
}

impl RigidMotion {
    pub fn is_static(&self) -> bool {
        self.keyframes
            .iter()
            .all(|k| k.translation == [0.0; 3] && k.rotation == [0.0; 3])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (i, frame) in self.keyframes.iter().enumerate() {
            let finite = frame.time.is_finite()
                && frame.translation.iter().all(|v| v.is_finite())
                && frame.rotation.iter().all(|v| v.is_finite());
            if !finite {
                return Err(ConfigError::InvalidOption(format!(
                    "motion keyframe {i} is not finite"
                )));
            }
            if i > 0 && frame.time <= self.keyframes[i - 1].time {
                return Err(ConfigError::InvalidOption(format!(
                    "motion keyframe {i}: times must increase"
                )));
            }
        }
        Ok(())
    }

    fn pose(&self, t: f64) -> (Vec3, Vec3) {
        let frames = &self.keyframes;
        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return ([0.0; 3], [0.0; 3]);
        };
        if t <= first.time {
            return (first.translation, first.rotation);
        }
        if t >= last.time {
            return (last.translation, last.rotation);
        }
        let hi = frames.partition_point(|k| k.time <= t);
        let (a, b) = (&frames[hi - 1], &frames[hi]);
        let w = (t - a.time) / (b.time - a.time);
        let lerp = |x: Vec3, y: Vec3| std::array::from_fn(|i| x[i] + w * (y[i] - x[i]));
        (lerp(a.translation, b.translation), lerp(a.rotation, b.rotation))
    }

    /// Move `position` with the sample pose at time `t`.
    pub fn apply(&self, t: f64, position: Vec3) -> Vec3 {
        let (translation, [rx, ry, rz]) = self.pose(t);
        let mut p = add3(position, scale3(self.origin, -1.0));
        let axes = [(rx, 90.0, 0.0), (ry, 90.0, 90.0), (rz, 0.0, 0.0)];
        for (angle, inclination, azimuth) in axes {
            if angle != 0.0 {
                let rotation = AxisRotation {
                    angle,
                    inclination,
                    azimuth,
                };
                p = mat3_transform(rotation.matrix(), p);
            }
        }
        add3(add3(p, self.origin), translation)
    }
}

/// Periodic breathing displacement.
///
/// Follows the usual `cos^2n` breathing curve, offset so that the
/// displacement is zero at phase zero:
/// `amplitude * (1 - cos^(2n)(pi * t / period + phase))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Respiration {
    /// Peak displacement (mm).
    pub amplitude: Vec3,
    /// Breathing period (ms).
    pub period: f64,
    /// Degrees.
    #[serde(default)]
    pub phase: f64,
    /// Exponent `n`; larger values give longer end-expiration plateaus.
    #[serde(default = "default_sharpness")]
    pub sharpness: u32,
}

fn default_sharpness() -> u32 {
    1
}

impl Respiration {
    pub fn displacement(&self, t: f64) -> Vec3 {
        let c = (std::f64::consts::PI * t / self.period + self.phase.to_radians()).cos();
        let exponent = 2 * self.sharpness.max(1) as i32;
        scale3(self.amplitude, 1.0 - c.powi(exponent))
    }
}

/// Motion settings shared by every spin of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MotionOptions {
    pub rigid: RigidMotion,
    pub respiration: Option<Respiration>,
    /// Spacing of the diffusion random-walk knots (ms).
    pub diffusion_step: f64,
}

impl Default for MotionOptions {
    fn default() -> Self {
        Self {
            rigid: RigidMotion::default(),
            respiration: None,
            diffusion_step: DEFAULT_DIFFUSION_STEP,
        }
    }
}

impl MotionOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.diffusion_step.is_finite() && self.diffusion_step > 0.0) {
            return Err(ConfigError::InvalidOption(format!(
                "diffusion step must be positive, got {}",
                self.diffusion_step
            )));
        }
        if let Some(breathing) = &self.respiration {
            let ok = breathing.period.is_finite()
                && breathing.period > 0.0
                && breathing.phase.is_finite()
                && breathing.amplitude.iter().all(|v| v.is_finite());
            if !ok {
                return Err(ConfigError::InvalidOption(
                    "respiration needs a positive period and finite amplitude".to_string(),
                ));
            }
        }
        self.rigid.validate()
    }

    /// True when no sample-wide motion is configured.
    pub fn is_static(&self) -> bool {
        self.rigid.is_static() && self.respiration.is_none()
    }

    pub fn fingerprint(&self, mut fp: Fingerprint) -> Fingerprint {
        fp = fp.f64(self.diffusion_step).f64_slice(&self.rigid.origin);
        fp = fp.u64(self.rigid.keyframes.len() as u64);
        for frame in &self.rigid.keyframes {
            fp = fp
                .f64(frame.time)
                .f64_slice(&frame.translation)
                .f64_slice(&frame.rotation);
        }
        match &self.respiration {
            Some(r) => fp
                .u64(1)
                .f64_slice(&r.amplitude)
                .f64(r.period)
                .f64(r.phase)
                .u64(r.sharpness as u64),
            None => fp.u64(0),
        }
    }
}

/// Trajectory state of one spin across its walk.
#[derive(Debug, Clone)]
pub struct SpinTrajectory {
    start: Vec3,
    velocity: Vec3,
    diffusion: f64,
    /// Diffusion displacement reached at the end of the last block.
    walk: Vec3,
    rng: RngStream,
}

impl SpinTrajectory {
    pub fn new(start: Vec3, velocity: Vec3, diffusion: f64, rng: RngStream) -> Self {
        Self {
            start,
            velocity,
            diffusion,
            walk: [0.0; 3],
            rng,
        }
    }

    /// Position at sequence time 0.
    pub fn start(&self) -> Vec3 {
        self.start
    }

    /// Path over the block starting at sequence time `start` and lasting
    /// `duration` ms. Draws the diffusion knots of that block, so call it
    /// exactly once per block.
    pub fn block_path<'m>(
        &mut self,
        motion: &'m MotionOptions,
        start: f64,
        duration: f64,
    ) -> BlockPath<'m> {
        let mut knots = vec![self.walk];
        let mut knot_dt = duration;
        if self.diffusion > 0.0 && duration > 0.0 {
            let count = (duration / motion.diffusion_step).ceil().max(1.0) as usize;
            knot_dt = duration / count as f64;
            let sigma = (2.0 * self.diffusion * knot_dt).sqrt();
            knots.reserve(count);
            for _ in 0..count {
                self.walk = add3(self.walk, self.rng.normal_vec3(sigma));
                knots.push(self.walk);
            }
        }
        let moving = self.diffusion > 0.0 || self.velocity != [0.0; 3] || !motion.is_static();
        BlockPath {
            start_position: self.start,
            velocity: self.velocity,
            block_start: start,
            motion: (!motion.is_static()).then_some(motion),
            knots,
            knot_dt,
            moving,
        }
    }
}

/// Position of one spin over one block, in block-local time.
#[derive(Debug, Clone)]
pub struct BlockPath<'m> {
    start_position: Vec3,
    velocity: Vec3,
    block_start: f64,
    motion: Option<&'m MotionOptions>,
    /// Diffusion displacement at `block_start + k * knot_dt`.
    knots: Vec<Vec3>,
    knot_dt: f64,
    moving: bool,
}

impl BlockPath<'static> {
    /// A spin that never moves.
    pub fn fixed(position: Vec3) -> Self {
        Self {
            start_position: position,
            velocity: [0.0; 3],
            block_start: 0.0,
            motion: None,
            knots: vec![[0.0; 3]],
            knot_dt: 0.0,
            moving: false,
        }
    }
}

impl BlockPath<'_> {
    pub fn is_moving(&self) -> bool {
        self.moving
    }

    fn walk_at(&self, t: f64) -> Vec3 {
        let last = self.knots.len() - 1;
        if last == 0 || self.knot_dt <= 0.0 {
            return self.knots[0];
        }
        let x = (t / self.knot_dt).max(0.0);
        let k = (x.floor() as usize).min(last - 1);
        let w = (x - k as f64).min(1.0);
        let (a, b) = (self.knots[k], self.knots[k + 1]);
        std::array::from_fn(|i| a[i] + w * (b[i] - a[i]))
    }

    /// Position at block time `t`.
    #[inline]
    pub fn position(&self, t: f64) -> Vec3 {
        if !self.moving {
            return add3(self.start_position, self.knots[0]);
        }
        let global = self.block_start + t;
        let tissue = add3(
            add3(self.start_position, scale3(self.velocity, global)),
            self.walk_at(t),
        );
        let Some(motion) = self.motion else {
            return tissue;
        };
        let moved = motion.rigid.apply(global, tissue);
        match &motion.respiration {
            Some(breathing) => add3(moved, breathing.displacement(global)),
            None => moved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(spin: u64) -> RngStream {
        RngStream::derive(11, "diffusion.walk").for_spin(spin)
    }

    #[test]
    fn test_flow_moves_linearly_in_sequence_time() {
        let motion = MotionOptions::default();
        let mut trajectory = SpinTrajectory::new([1.0, 0.0, 0.0], [0.1, 0.0, -0.2], 0.0, stream(0));
        let first = trajectory.block_path(&motion, 0.0, 5.0);
        let second = trajectory.block_path(&motion, 5.0, 5.0);
        assert!(first.is_moving());
        assert_eq!(first.position(0.0), [1.0, 0.0, 0.0]);
        let end = first.position(5.0);
        let again = second.position(0.0);
        for i in 0..3 {
            assert!((end[i] - again[i]).abs() < 1e-12);
        }
        let later = second.position(2.0);
        assert!((later[0] - 1.7).abs() < 1e-12);
        assert!((later[2] + 1.4).abs() < 1e-12);
    }

    #[test]
    fn test_walk_is_continuous_across_blocks_and_reproducible() {
        let motion = MotionOptions {
            diffusion_step: 0.25,
            ..Default::default()
        };
        let mut a = SpinTrajectory::new([0.0; 3], [0.0; 3], 0.002, stream(4));
        let mut b = SpinTrajectory::new([0.0; 3], [0.0; 3], 0.002, stream(4));
        let a1 = a.block_path(&motion, 0.0, 1.0);
        let a2 = a.block_path(&motion, 1.0, 3.0);
        let b1 = b.block_path(&motion, 0.0, 1.0);
        let b2 = b.block_path(&motion, 1.0, 3.0);

        assert_eq!(a1.knots.len(), 5);
        assert_eq!(a2.knots.len(), 13);
        assert_eq!(a1.position(1.0), a2.position(0.0));
        for t in [0.0, 0.1, 0.6, 2.9] {
            assert_eq!(a2.position(t), b2.position(t));
        }
        assert_eq!(a1.position(0.7), b1.position(0.7));
        assert_ne!(a2.position(3.0), [0.0; 3]);

        let mut other = SpinTrajectory::new([0.0; 3], [0.0; 3], 0.002, stream(5));
        assert_ne!(other.block_path(&motion, 0.0, 1.0).position(1.0), a1.position(1.0));
    }

    #[test]
    fn test_walk_interpolates_between_knots() {
        let motion = MotionOptions {
            diffusion_step: 0.5,
            ..Default::default()
        };
        let mut trajectory = SpinTrajectory::new([0.0; 3], [0.0; 3], 0.01, stream(1));
        let path = trajectory.block_path(&motion, 0.0, 1.0);
        let (k0, k1) = (path.knots[0], path.knots[1]);
        let mid = path.position(0.25);
        for i in 0..3 {
            assert!((mid[i] - 0.5 * (k0[i] + k1[i])).abs() < 1e-12);
        }
    }

    #[test]
    fn test_rigid_motion_interpolates_and_holds_end_poses() {
        let rigid = RigidMotion {
            origin: [0.0; 3],
            keyframes: vec![
                MotionKeyframe {
                    time: 10.0,
                    translation: [0.0; 3],
                    rotation: [0.0; 3],
                },
                MotionKeyframe {
                    time: 20.0,
                    translation: [2.0, 0.0, 0.0],
                    rotation: [0.0, 0.0, 90.0],
                },
            ],
        };
        rigid.validate().unwrap();
        assert_eq!(rigid.apply(0.0, [1.0, 0.0, 0.0]), [1.0, 0.0, 0.0]);
        let half = rigid.apply(15.0, [0.0; 3]);
        assert!((half[0] - 1.0).abs() < 1e-12);
        // quarter turn about z, then the full translation
        let end = rigid.apply(30.0, [1.0, 0.0, 0.0]);
        assert!((end[0] - 2.0).abs() < 1e-12);
        assert!((end[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_keyframes_must_increase() {
        let rigid = RigidMotion {
            origin: [0.0; 3],
            keyframes: vec![
                MotionKeyframe {
                    time: 5.0,
                    ..Default::default()
                },
                MotionKeyframe {
                    time: 5.0,
                    ..Default::default()
                },
            ],
        };
        let motion = MotionOptions {
            rigid,
            ..Default::default()
        };
        assert!(matches!(motion.validate(), Err(ConfigError::InvalidOption(_))));
    }

    #[test]
    fn test_respiration_starts_at_rest_and_peaks_mid_period() {
        let breathing = Respiration {
            amplitude: [0.0, 0.0, 8.0],
            period: 4000.0,
            phase: 0.0,
            sharpness: 1,
        };
        assert_eq!(breathing.displacement(0.0), [0.0; 3]);
        let peak = breathing.displacement(2000.0);
        assert!((peak[2] - 8.0).abs() < 1e-9);

        let motion = MotionOptions {
            respiration: Some(breathing),
            ..Default::default()
        };
        let mut trajectory = SpinTrajectory::new([0.0; 3], [0.0; 3], 0.0, stream(2));
        let path = trajectory.block_path(&motion, 1000.0, 2000.0);
        assert!(path.is_moving());
        assert!((path.position(1000.0)[2] - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_still_spin_has_a_fixed_path() {
        let motion = MotionOptions::default();
        let mut trajectory = SpinTrajectory::new([0.5, 1.0, 2.0], [0.0; 3], 0.0, stream(3));
        let path = trajectory.block_path(&motion, 0.0, 10.0);
        assert!(!path.is_moving());
        assert_eq!(path.position(7.0), [0.5, 1.0, 2.0]);
        assert_eq!(BlockPath::fixed([1.0; 3]).position(3.0), [1.0; 3]);
    }

    #[test]
    fn test_motion_from_yaml() {
        let yaml = r#"
rigid:
  keyframes:
    - { time: 0, translation: [0, 0, 0] }
    - { time: 100, translation: [1, 0, 0], rotation: [0, 0, 5] }
respiration:
  amplitude: [0, 0, 5]
  period: 4000
diffusionStep: 0.1
"#;
        let motion: MotionOptions = serde_yaml::from_str(yaml).unwrap();
        motion.validate().unwrap();
        assert_eq!(motion.rigid.keyframes.len(), 2);
        assert_eq!(motion.respiration.unwrap().sharpness, 1);
        assert_eq!(motion.diffusion_step, 0.1);
        assert_ne!(
            motion.fingerprint(Fingerprint::new()).finish(),
            MotionOptions::default().fingerprint(Fingerprint::new()).finish()
        );
    }
}
