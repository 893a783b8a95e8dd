//! Serde form of the sequence tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use larmor_foundation::geometry::AxisRotation;

use crate::error::ConfigError;
use crate::sequence::{
    Adc, GradientChannel, PhaseCycling, PhaseStep, Pulse, RepetitionScaling, RfChannel,
    SamplePlacement, SequenceBuilder, SequenceTree, Shape,
};
use crate::types::NodeId;

use super::ScenarioError;

/// Flat list of named nodes plus the name of the root.
///
/// A node may be listed as the child of several parents; it is shared, not
/// copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceSpec {
    pub root: String,
    pub nodes: Vec<NodeSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKindSpec,
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKindSpec {
    /// Repeating node with its repetition count.
    Repeat(u32),
    /// Atomic block with an optional gradient rotation.
    Block(AxisRotation),
    Pulse(PulseSpec),
}

/// A leaf whose repetition-dependent parameters name their loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PulseSpec {
    pub duration: f64,
    #[serde(default)]
    pub rf: Option<RfSpec>,
    #[serde(default)]
    pub gx: Option<GradientSpec>,
    #[serde(default)]
    pub gy: Option<GradientSpec>,
    #[serde(default)]
    pub gz: Option<GradientSpec>,
    #[serde(default)]
    pub adc: Option<AdcSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RfSpec {
    pub shape: Shape,
    #[serde(default)]
    pub phase: f64,
    #[serde(default)]
    pub frequency_offset: f64,
    #[serde(default)]
    pub phase_steps: Vec<PhaseStep>,
    #[serde(default)]
    pub scaling: Option<ScalingSpec>,
    #[serde(default)]
    pub cycling: Option<CyclingSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradientSpec {
    pub shape: Shape,
    #[serde(default)]
    pub scaling: Option<ScalingSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdcSpec {
    pub samples: u32,
    #[serde(default)]
    pub phase: f64,
    #[serde(default)]
    pub placement: SamplePlacement,
    #[serde(default)]
    pub cycling: Option<CyclingSpec>,
}

/// `offset + step * counter(loop)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    #[serde(rename = "loop")]
    pub loop_name: String,
    #[serde(default)]
    pub offset: f64,
    pub step: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclingSpec {
    #[serde(rename = "loop")]
    pub loop_name: String,
    pub increment: f64,
    #[serde(default)]
    pub quadratic: bool,
}

/// Name to arena id, in list order.
struct NameTable<'a> {
    ids: HashMap<&'a str, NodeId>,
}

impl<'a> NameTable<'a> {
    fn new(nodes: &'a [NodeSpec]) -> Result<Self, ScenarioError> {
        let mut ids = HashMap::with_capacity(nodes.len());
        for (index, node) in nodes.iter().enumerate() {
            if ids.insert(node.name.as_str(), NodeId(index)).is_some() {
                return Err(ScenarioError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
        }
        Ok(Self { ids })
    }

    fn node(&self, name: &str, parent: &str) -> Result<NodeId, ScenarioError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownNode {
                name: name.to_string(),
                parent: parent.to_string(),
            })
    }

    fn loop_ref(&self, name: &str, leaf: &str) -> Result<NodeId, ConfigError> {
        self.ids
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownLoop {
                leaf: leaf.to_string(),
                reference: name.to_string(),
            })
    }
}

impl SequenceSpec {
    /// Build and validate the tree.
    pub fn build(&self) -> Result<SequenceTree, ScenarioError> {
        let names = NameTable::new(&self.nodes)?;
        let mut builder = SequenceBuilder::new();
        for node in &self.nodes {
            let id = match &node.kind {
                NodeKindSpec::Repeat(repetitions) => builder.repeating(&node.name, *repetitions),
                NodeKindSpec::Block(rotation) => builder.atomic_rotated(&node.name, *rotation),
                NodeKindSpec::Pulse(pulse) => {
                    builder.leaf(&node.name, pulse.resolve(&node.name, &names)?)
                }
            };
            debug_assert_eq!(id, names.ids[node.name.as_str()]);
        }
        for node in &self.nodes {
            let parent = names.node(&node.name, &node.name)?;
            for child in &node.children {
                let child = names.node(child, &node.name)?;
                builder.push_child(parent, child);
            }
        }
        let root = names.node(&self.root, "root")?;
        Ok(builder.build(root)?)
    }
}

impl PulseSpec {
    fn resolve(&self, leaf: &str, names: &NameTable<'_>) -> Result<Pulse, ConfigError> {
        let scaling = |spec: &Option<ScalingSpec>| -> Result<Option<RepetitionScaling>, ConfigError> {
            spec.as_ref()
                .map(|s| {
                    Ok(RepetitionScaling {
                        node: names.loop_ref(&s.loop_name, leaf)?,
                        offset: s.offset,
                        step: s.step,
                    })
                })
                .transpose()
        };
        let cycling = |spec: &Option<CyclingSpec>| -> Result<Option<PhaseCycling>, ConfigError> {
            spec.as_ref()
                .map(|c| {
                    Ok(PhaseCycling {
                        node: names.loop_ref(&c.loop_name, leaf)?,
                        increment: c.increment,
                        quadratic: c.quadratic,
                    })
                })
                .transpose()
        };
        let gradient = |spec: &Option<GradientSpec>| -> Result<Option<GradientChannel>, ConfigError> {
            spec.as_ref()
                .map(|g| {
                    Ok(GradientChannel {
                        shape: g.shape,
                        scaling: scaling(&g.scaling)?,
                    })
                })
                .transpose()
        };

        let rf = match &self.rf {
            Some(rf) => Some(RfChannel {
                shape: rf.shape,
                phase: rf.phase,
                frequency_offset: rf.frequency_offset,
                phase_steps: rf.phase_steps.clone(),
                scaling: scaling(&rf.scaling)?,
                cycling: cycling(&rf.cycling)?,
            }),
            None => None,
        };
        let adc = match &self.adc {
            Some(adc) => Some(Adc {
                samples: adc.samples,
                phase: adc.phase,
                placement: adc.placement.clone(),
                cycling: cycling(&adc.cycling)?,
            }),
            None => None,
        };
        Ok(Pulse {
            duration: self.duration,
            rf,
            gradients: [gradient(&self.gx)?, gradient(&self.gy)?, gradient(&self.gz)?],
            adc,
        })
    }
}
