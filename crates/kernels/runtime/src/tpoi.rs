//! Time points of interest (TPOIs).
//!
//! Each leaf reports the instants at which the physics must be evaluated:
//! its boundaries, its ADC samples and any hard waveform jumps. For one
//! atomic block the collector shifts every leaf list by the leaf's start
//! offset, sorts, and merges entries closer than [`TIME_EPSILON`] keeping
//! the highest-priority tag:
//!
//! ```text
//! Discontinuity  >  Sample  >  Marker
//! ```
//!
//! A discontinuity that swallows a sample keeps the sample slot, so the
//! sample is still emitted (before the integrator restarts).

use crate::error::ConfigError;
use crate::sequence::{NodeKind, SequenceTree};
use crate::sequence::counters::RepetitionCounters;
use crate::types::{NodeId, TIME_EPSILON};

/// Receiver-side data attached to a sample time point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleSlot {
    /// Position of the sample within its block, after merging.
    pub ordinal: u32,
    /// Receiver phase (rad), including any phase cycling.
    pub receiver_phase: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TpoiTag {
    Marker,
    Sample(SampleSlot),
    Discontinuity { sample: Option<SampleSlot> },
}

impl TpoiTag {
    fn priority(&self) -> u8 {
        match self {
            TpoiTag::Marker => 0,
            TpoiTag::Sample(_) => 1,
            TpoiTag::Discontinuity { .. } => 2,
        }
    }

    pub fn sample(&self) -> Option<&SampleSlot> {
        match self {
            TpoiTag::Sample(slot) => Some(slot),
            TpoiTag::Discontinuity { sample } => sample.as_ref(),
            TpoiTag::Marker => None,
        }
    }

    fn sample_mut(&mut self) -> Option<&mut SampleSlot> {
        match self {
            TpoiTag::Sample(slot) => Some(slot),
            TpoiTag::Discontinuity { sample } => sample.as_mut(),
            TpoiTag::Marker => None,
        }
    }

    pub fn is_discontinuity(&self) -> bool {
        matches!(self, TpoiTag::Discontinuity { .. })
    }
}

/// One instant in block-local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tpoi {
    pub time: f64,
    pub tag: TpoiTag,
}

impl Tpoi {
    pub fn marker(time: f64) -> Self {
        Self {
            time,
            tag: TpoiTag::Marker,
        }
    }

    pub fn discontinuity(time: f64) -> Self {
        Self {
            time,
            tag: TpoiTag::Discontinuity { sample: None },
        }
    }
}

/// Merged, ascending time points of one atomic block.
#[derive(Debug, Clone, PartialEq)]
pub struct TpoiList {
    points: Vec<Tpoi>,
    samples: u64,
}

impl TpoiList {
    pub fn points(&self) -> &[Tpoi] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Time of the first discontinuity strictly after point `index`.
    pub fn next_discontinuity_after(&self, index: usize) -> Option<f64> {
        self.points[index + 1..]
            .iter()
            .find(|p| p.tag.is_discontinuity())
            .map(|p| p.time)
    }
}

/// Sort and merge raw time points of one block.
pub fn merge_time_points(mut points: Vec<Tpoi>, block: &str) -> Result<TpoiList, ConfigError> {
    if points.is_empty() {
        return Err(ConfigError::NoTimePoints {
            block: block.to_string(),
        });
    }

    // stable: equal times keep leaf order
    points.sort_by(|a, b| a.time.total_cmp(&b.time));

    let mut merged: Vec<Tpoi> = Vec::with_capacity(points.len());
    for point in points {
        match merged.last_mut() {
            Some(last) if point.time - last.time < TIME_EPSILON => {
                *last = combine(*last, point, block)?;
            }
            _ => merged.push(point),
        }
    }

    let mut samples = 0u64;
    for point in &mut merged {
        if let Some(slot) = point.tag.sample_mut() {
            slot.ordinal = samples as u32;
            samples += 1;
        }
    }

    Ok(TpoiList {
        points: merged,
        samples,
    })
}

fn combine(a: Tpoi, b: Tpoi, block: &str) -> Result<Tpoi, ConfigError> {
    let coincident = || ConfigError::CoincidentSamples {
        block: block.to_string(),
        time: b.time,
    };
    if a.tag.sample().is_some() && b.tag.sample().is_some() {
        return Err(coincident());
    }
    let (winner, loser) = if b.tag.priority() > a.tag.priority() {
        (b, a)
    } else {
        (a, b)
    };
    let tag = match (winner.tag, loser.tag.sample()) {
        (TpoiTag::Discontinuity { sample: None }, Some(slot)) => {
            TpoiTag::Discontinuity { sample: Some(*slot) }
        }
        (tag, _) => tag,
    };
    // the sample instant wins so that emitted times are exact
    let time = if loser.tag.sample().is_some() {
        loser.time
    } else {
        winner.time
    };
    Ok(Tpoi { time, tag })
}

/// Collect the merged time point list of `block` for the given counters.
///
/// Leaves play back to back; every interior leaf boundary is a
/// discontinuity because the waveform switches segment there.
pub fn collect_block_tpois(
    tree: &SequenceTree,
    block: NodeId,
    counters: &RepetitionCounters,
) -> Result<TpoiList, ConfigError> {
    let node = tree.node(block);
    let mut raw = Vec::new();
    let mut start = 0.0;
    for (position, &child) in node.children.iter().enumerate() {
        let leaf = tree.node(child);
        let NodeKind::Leaf(pulse) = &leaf.kind else {
            return Err(ConfigError::NonLeafInAtomic {
                block: node.name.clone(),
                child: leaf.name.clone(),
            });
        };
        if position > 0 {
            raw.push(Tpoi::discontinuity(start));
        }
        raw.extend(pulse.tpois(&leaf.name, counters)?.into_iter().map(|mut p| {
            p.time += start;
            p
        }));
        start += pulse.duration;
    }

    let list = merge_time_points(raw, &node.name)?;
    let expected = tree.num_samples(block);
    if list.sample_count() != expected {
        return Err(ConfigError::SampleCountMismatch {
            block: node.name.clone(),
            expected,
            collected: list.sample_count(),
        });
    }
    Ok(list)
}
