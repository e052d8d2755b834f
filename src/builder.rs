//! Mutable model graph
//!
//! A [`ModelBuilder`] collects states and weighted transitions before the
//! compile step ([`bake`](ModelBuilder::bake)). It is a directed multigraph:
//! self-loops and parallel edges are accepted here and merged/normalized by
//! the baker; no outgoing-sum invariant is enforced while editing.
//!
//! Builders compose: [`add_submodel`](ModelBuilder::add_submodel) takes the
//! disjoint union with another builder (whose start/end become ordinary
//! silent states), and [`concatenate`](ModelBuilder::concatenate)
//! additionally wires `self.end → other.start` at probability 1 and adopts
//! the other builder's end.

#![forbid(unsafe_code)]

use thiserror::Error;

use crate::bake::{self, BakeError, MergePolicy};
use crate::model::Model;
use crate::state::{State, StateId};

/// Errors surfaced while editing the graph.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("transition probability must lie in [0, 1] (got {0})")]
    ProbabilityOutOfRange(f64),
    #[error("pseudocount must be non-negative and finite (got {0})")]
    BadPseudocount(f64),
    #[error("state `{0}` was not added to this model")]
    UnknownState(String),
    #[error("state `{0}` is already part of this model")]
    DuplicateState(String),
}

/// One directed, weighted transition.
#[derive(Clone, Debug)]
pub(crate) struct EdgeSpec {
    pub from: StateId,
    pub to: StateId,
    pub probability: f64,
    pub pseudocount: f64,
}

/// Mutable directed multigraph of states, with built-in silent `start` and
/// `end` states.
#[derive(Clone, Debug)]
pub struct ModelBuilder {
    pub name: String,
    pub(crate) states: Vec<State>,
    pub(crate) edges: Vec<EdgeSpec>,
    pub(crate) start: StateId,
    pub(crate) end: StateId,
}

impl ModelBuilder {
    /// Create an empty graph named `name`, containing only the silent
    /// `<name>-start` and `<name>-end` states.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let start = State::silent(format!("{name}-start"));
        let end = State::silent(format!("{name}-end"));
        let (start_id, end_id) = (start.id(), end.id());
        Self {
            name,
            states: vec![start, end],
            edges: Vec::new(),
            start: start_id,
            end: end_id,
        }
    }

    /// Rebuild a graph from previously persisted parts. The start and end
    /// ids must belong to `states`.
    pub(crate) fn from_parts(
        name: String,
        states: Vec<State>,
        edges: Vec<EdgeSpec>,
        start: StateId,
        end: StateId,
    ) -> Self {
        debug_assert!(states.iter().any(|s| s.id() == start));
        debug_assert!(states.iter().any(|s| s.id() == end));
        Self { name, states, edges, start, end }
    }

    /// The distinguished start state.
    pub fn start(&self) -> &State {
        self.state_by_id(self.start).expect("start state is always registered")
    }

    /// The distinguished end state.
    pub fn end(&self) -> &State {
        self.state_by_id(self.end).expect("end state is always registered")
    }

    fn state_by_id(&self, id: StateId) -> Option<&State> {
        self.states.iter().find(|s| s.id() == id)
    }

    fn contains(&self, id: StateId) -> bool {
        self.state_by_id(id).is_some()
    }

    /// Number of registered states (including start and end).
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Number of transitions added so far (parallel edges counted apart).
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Register a state.
    pub fn add_state(&mut self, state: State) -> Result<(), BuildError> {
        if self.contains(state.id()) {
            return Err(BuildError::DuplicateState(state.name.clone()));
        }
        self.states.push(state);
        Ok(())
    }

    /// Register several states.
    pub fn add_states(&mut self, states: impl IntoIterator<Item = State>) -> Result<(), BuildError> {
        for s in states {
            self.add_state(s)?;
        }
        Ok(())
    }

    /// Add a transition `from → to` with the given probability.
    ///
    /// The training pseudocount defaults to the probability itself. Both
    /// endpoints must already be registered.
    pub fn add_transition(
        &mut self,
        from: &State,
        to: &State,
        probability: f64,
        pseudocount: Option<f64>,
    ) -> Result<(), BuildError> {
        if !(0.0..=1.0).contains(&probability) || !probability.is_finite() {
            return Err(BuildError::ProbabilityOutOfRange(probability));
        }
        let pseudocount = pseudocount.unwrap_or(probability);
        if pseudocount < 0.0 || !pseudocount.is_finite() {
            return Err(BuildError::BadPseudocount(pseudocount));
        }
        if !self.contains(from.id()) {
            return Err(BuildError::UnknownState(from.name.clone()));
        }
        if !self.contains(to.id()) {
            return Err(BuildError::UnknownState(to.name.clone()));
        }
        self.edges.push(EdgeSpec { from: from.id(), to: to.id(), probability, pseudocount });
        Ok(())
    }

    /// Disjoint union with another builder. The other builder's start and
    /// end lose their special role and become ordinary silent states here.
    pub fn add_submodel(&mut self, other: ModelBuilder) {
        self.states.extend(other.states);
        self.edges.extend(other.edges);
    }

    /// Union plus `self.end → other.start` at probability 1; the other
    /// builder's end becomes this builder's end.
    pub fn concatenate(&mut self, other: ModelBuilder) {
        let bridge = EdgeSpec {
            from: self.end,
            to: other.start,
            probability: 1.0,
            pseudocount: 1.0,
        };
        let new_end = other.end;
        self.states.extend(other.states);
        self.edges.extend(other.edges);
        self.edges.push(bridge);
        self.end = new_end;
    }

    /// Compile into the immutable [`Model`] consumed by the kernels and
    /// trainers. See [`MergePolicy`] for silent-state merging options.
    pub fn bake(self, merge: MergePolicy) -> Result<Model, BakeError> {
        bake::bake(self, merge)
    }
}
