//! Model persistence
//!
//! A baked model serializes to a versioned JSON document holding the model
//! name, a table of *distinct* distributions (one entry per shared handle,
//! so tie classes survive a round-trip), the state records referencing that
//! table, and the transition records with probabilities and pseudocounts.
//!
//! Reading yields a [`ModelBuilder`] — the caller re-bakes it, which also
//! re-checks every structural invariant. `Custom` distributions wrap opaque
//! functions and cannot be persisted.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::builder::{EdgeSpec, ModelBuilder};
use crate::distribution::{Distribution, SharedDistribution};
use crate::model::Model;
use crate::state::{State, StateId};

/// Bumped whenever the document layout changes.
const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct ModelDocument {
    version: u32,
    name: String,
    start: u64,
    end: u64,
    distributions: Vec<DistributionRecord>,
    states: Vec<StateRecord>,
    transitions: Vec<TransitionRecord>,
}

#[derive(Serialize, Deserialize)]
struct StateRecord {
    id: u64,
    name: String,
    weight: f64,
    /// Index into the distribution table; `None` for silent states.
    distribution: Option<usize>,
}

#[derive(Serialize, Deserialize)]
struct TransitionRecord {
    from: u64,
    to: u64,
    probability: f64,
    pseudocount: f64,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum DistributionRecord {
    Uniform { low: f64, high: f64 },
    Normal { mean: f64, std: f64 },
    Exponential { rate: f64 },
    Gamma { shape: f64, rate: f64 },
    InverseGamma { shape: f64, rate: f64 },
    Discrete { probabilities: BTreeMap<String, f64> },
    GaussianKernelDensity { points: Vec<f64>, bandwidth: f64, weights: Vec<f64> },
    UniformKernelDensity { points: Vec<f64>, bandwidth: f64, weights: Vec<f64> },
    TriangleKernelDensity { points: Vec<f64>, bandwidth: f64, weights: Vec<f64> },
    Mixture { components: Vec<DistributionRecord>, weights: Vec<f64> },
}

fn to_record(d: &Distribution) -> Result<DistributionRecord> {
    Ok(match d {
        Distribution::Uniform { low, high } => {
            DistributionRecord::Uniform { low: *low, high: *high }
        }
        Distribution::Normal { mean, std } => DistributionRecord::Normal { mean: *mean, std: *std },
        Distribution::Exponential { rate } => DistributionRecord::Exponential { rate: *rate },
        Distribution::Gamma { shape, rate } => {
            DistributionRecord::Gamma { shape: *shape, rate: *rate }
        }
        Distribution::InverseGamma { shape, rate } => {
            DistributionRecord::InverseGamma { shape: *shape, rate: *rate }
        }
        Distribution::Discrete { probabilities } => {
            DistributionRecord::Discrete { probabilities: probabilities.clone() }
        }
        Distribution::GaussianKernelDensity(kd) => DistributionRecord::GaussianKernelDensity {
            points: kd.points.clone(),
            bandwidth: kd.bandwidth,
            weights: kd.weights.clone(),
        },
        Distribution::UniformKernelDensity(kd) => DistributionRecord::UniformKernelDensity {
            points: kd.points.clone(),
            bandwidth: kd.bandwidth,
            weights: kd.weights.clone(),
        },
        Distribution::TriangleKernelDensity(kd) => DistributionRecord::TriangleKernelDensity {
            points: kd.points.clone(),
            bandwidth: kd.bandwidth,
            weights: kd.weights.clone(),
        },
        Distribution::Mixture { components, weights } => DistributionRecord::Mixture {
            components: components.iter().map(to_record).collect::<Result<_>>()?,
            weights: weights.clone(),
        },
        Distribution::Custom(_) => bail!("custom distributions cannot be serialized"),
    })
}

fn from_record(r: &DistributionRecord) -> Result<Distribution> {
    Ok(match r {
        DistributionRecord::Uniform { low, high } => Distribution::uniform(*low, *high)?,
        DistributionRecord::Normal { mean, std } => Distribution::normal(*mean, *std)?,
        DistributionRecord::Exponential { rate } => Distribution::exponential(*rate)?,
        DistributionRecord::Gamma { shape, rate } => Distribution::gamma(*shape, *rate)?,
        DistributionRecord::InverseGamma { shape, rate } => {
            Distribution::inverse_gamma(*shape, *rate)?
        }
        DistributionRecord::Discrete { probabilities } => Distribution::Discrete {
            probabilities: probabilities.clone(),
        },
        DistributionRecord::GaussianKernelDensity { points, bandwidth, weights } => {
            Distribution::gaussian_kde(points.clone(), *bandwidth, Some(weights.clone()))?
        }
        DistributionRecord::UniformKernelDensity { points, bandwidth, weights } => {
            Distribution::uniform_kde(points.clone(), *bandwidth, Some(weights.clone()))?
        }
        DistributionRecord::TriangleKernelDensity { points, bandwidth, weights } => {
            Distribution::triangle_kde(points.clone(), *bandwidth, Some(weights.clone()))?
        }
        DistributionRecord::Mixture { components, weights } => Distribution::mixture(
            components.iter().map(from_record).collect::<Result<_>>()?,
            Some(weights.clone()),
        )?,
    })
}

/// Render a baked model as a JSON document.
pub fn model_to_json(model: &Model) -> Result<String> {
    let mut handles: Vec<SharedDistribution> = Vec::new();
    let mut distributions = Vec::new();
    let mut states = Vec::new();
    for state in model.states() {
        let dist_ref = match &state.distribution {
            None => None,
            Some(handle) => {
                let slot = handles.iter().position(|h| Arc::ptr_eq(h, handle));
                let slot = match slot {
                    Some(s) => s,
                    None => {
                        let guard = handle.read().expect("poisoned distribution lock");
                        distributions.push(
                            to_record(&guard)
                                .with_context(|| format!("state `{}`", state.name))?,
                        );
                        handles.push(handle.clone());
                        handles.len() - 1
                    }
                };
                Some(slot)
            }
        };
        states.push(StateRecord {
            id: state.id().as_u64(),
            name: state.name.clone(),
            weight: state.weight,
            distribution: dist_ref,
        });
    }

    let mut transitions = Vec::new();
    for k in 0..model.n_states() {
        for (l, lp, pc) in model.out_edges(k) {
            transitions.push(TransitionRecord {
                from: model.state(k).id().as_u64(),
                to: model.state(l).id().as_u64(),
                probability: lp.exp(),
                pseudocount: pc,
            });
        }
    }

    let doc = ModelDocument {
        version: FORMAT_VERSION,
        name: model.name().to_owned(),
        start: model.state(model.start_index()).id().as_u64(),
        end: model.state(model.end_index()).id().as_u64(),
        distributions,
        states,
        transitions,
    };
    serde_json::to_string_pretty(&doc).context("serializing model document")
}

/// Parse a JSON document back into a builder, ready to be baked.
pub fn model_from_json(json: &str) -> Result<ModelBuilder> {
    let doc: ModelDocument = serde_json::from_str(json).context("parsing model document")?;
    if doc.version != FORMAT_VERSION {
        bail!("unsupported model document version {} (expected {FORMAT_VERSION})", doc.version);
    }

    let handles: Vec<SharedDistribution> = doc
        .distributions
        .iter()
        .map(|r| from_record(r).map(Distribution::shared))
        .collect::<Result<_>>()?;

    let mut states = Vec::with_capacity(doc.states.len());
    let mut id_map: HashMap<u64, StateId> = HashMap::with_capacity(doc.states.len());
    for record in &doc.states {
        let state = match record.distribution {
            None => State::silent(record.name.clone()),
            Some(slot) => {
                let handle = handles
                    .get(slot)
                    .with_context(|| format!("state `{}` references distribution {slot}", record.name))?;
                State::emitting(record.name.clone(), handle.clone())
            }
        };
        let state = state.weighted(record.weight);
        id_map.insert(record.id, state.id());
        states.push(state);
    }

    let start = *id_map.get(&doc.start).context("start state missing from document")?;
    let end = *id_map.get(&doc.end).context("end state missing from document")?;

    let mut edges = Vec::with_capacity(doc.transitions.len());
    for t in &doc.transitions {
        let from = *id_map.get(&t.from).with_context(|| format!("unknown source id {}", t.from))?;
        let to = *id_map.get(&t.to).with_context(|| format!("unknown target id {}", t.to))?;
        edges.push(EdgeSpec { from, to, probability: t.probability, pseudocount: t.pseudocount });
    }

    Ok(ModelBuilder::from_parts(doc.name, states, edges, start, end))
}

/// Write a baked model to a file.
pub fn write_model(path: &Path, model: &Model) -> Result<()> {
    let json = model_to_json(model)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

/// Read a model file back into a builder.
pub fn read_model(path: &Path) -> Result<ModelBuilder> {
    let json =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    model_from_json(&json)
}

// ============================================================================
// Tests
// ============================================================================
