//! The compiled model
//!
//! Produced by the baker and immutable thereafter (training mutates only the
//! probability arrays and the shared distributions, through `train`). States
//! are stored emitting-first, silent states topologically ordered, and both
//! edge directions live in CSR-like stores:
//!
//! - out-edges: `out_offset[k] .. out_offset[k+1]` indexes `out_target` /
//!   `out_log_p` / `out_pc`;
//! - in-edges: the same layout keyed by target, over `in_source` /
//!   `in_log_p` / `in_pc`;
//! - `out_to_in[e]` maps an out-edge slot to its in-edge twin so updates can
//!   be mirrored without a search.
//!
//! The tie table is CSR as well: `tie_member[tie_offset[k]..tie_offset[k+1]]`
//! lists the *other* members of `k`'s tie class. `state_log_weight` biases
//! Viterbi only and never enters the generative probability.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use rand::Rng;
use thiserror::Error;

use crate::distribution::{DistributionError, SharedDistribution, Symbol};
use crate::state::{State, StateId};

/// Errors surfaced by model-level operations.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model `{0}` never reaches its end state; sampling needs an explicit length")]
    EndlessSample(String),
    #[error(transparent)]
    Distribution(#[from] DistributionError),
}

/// An immutable, index-based hidden Markov model.
///
/// Cloning is shallow with respect to distributions: clones share (and
/// therefore co-train) the same emission parameters.
#[derive(Clone, Debug)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) states: Vec<State>,
    pub(crate) silent_start: usize,
    pub(crate) start_index: usize,
    pub(crate) end_index: usize,
    pub(crate) finite: bool,

    pub(crate) out_offset: Vec<usize>,
    pub(crate) out_target: Vec<usize>,
    pub(crate) out_log_p: Vec<f64>,
    pub(crate) out_pc: Vec<f64>,

    pub(crate) in_offset: Vec<usize>,
    pub(crate) in_source: Vec<usize>,
    pub(crate) in_log_p: Vec<f64>,
    pub(crate) in_pc: Vec<f64>,

    pub(crate) out_to_in: Vec<usize>,

    pub(crate) tie_offset: Vec<usize>,
    pub(crate) tie_member: Vec<usize>,
    pub(crate) state_log_weight: Vec<f64>,

    pub(crate) state_index: HashMap<StateId, usize>,
}

impl Model {
    /// The model's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of states, silent ones included.
    pub fn n_states(&self) -> usize {
        self.states.len()
    }

    /// First silent index; states below it are emitting.
    pub fn silent_start(&self) -> usize {
        self.silent_start
    }

    /// Index of the start state (silent).
    pub fn start_index(&self) -> usize {
        self.start_index
    }

    /// Index of the end state (silent).
    pub fn end_index(&self) -> usize {
        self.end_index
    }

    /// Whether at least one edge enters the end state. Finite models must
    /// terminate there; infinite models may stop in any emitting state.
    pub fn is_finite(&self) -> bool {
        self.finite
    }

    /// The state at a baked index.
    pub fn state(&self, index: usize) -> &State {
        &self.states[index]
    }

    /// All states in baked order.
    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Baked index of a state, if it survived the bake.
    pub fn index_of(&self, state: &State) -> Option<usize> {
        self.state_index.get(&state.id()).copied()
    }

    /// Outgoing edges of `k` as `(target, log probability, pseudocount)`,
    /// in storage order.
    pub fn out_edges(&self, k: usize) -> impl Iterator<Item = (usize, f64, f64)> + '_ {
        (self.out_offset[k]..self.out_offset[k + 1])
            .map(move |e| (self.out_target[e], self.out_log_p[e], self.out_pc[e]))
    }

    /// Incoming edges of `l` as `(source, log probability, pseudocount)`.
    pub fn in_edges(&self, l: usize) -> impl Iterator<Item = (usize, f64, f64)> + '_ {
        (self.in_offset[l]..self.in_offset[l + 1])
            .map(move |e| (self.in_source[e], self.in_log_p[e], self.in_pc[e]))
    }

    /// Log probability of the transition `from → to`, `ln 0` when absent.
    pub fn transition_log_probability(&self, from: usize, to: usize) -> f64 {
        self.out_edges(from)
            .find(|&(t, _, _)| t == to)
            .map_or(crate::numerics::LOG_ZERO, |(_, lp, _)| lp)
    }

    /// The shared distribution of an emitting state.
    pub fn distribution(&self, index: usize) -> Option<&SharedDistribution> {
        self.states[index].distribution.as_ref()
    }

    /// Tie classes over emitting states, each class listed once (singletons
    /// included). Members are ascending baked indices.
    pub(crate) fn tie_classes(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.silent_start];
        let mut classes = Vec::new();
        for i in 0..self.silent_start {
            if seen[i] {
                continue;
            }
            let mut class = vec![i];
            for &j in &self.tie_member[self.tie_offset[i]..self.tie_offset[i + 1]] {
                class.push(j);
            }
            class.sort_unstable();
            for &j in &class {
                seen[j] = true;
            }
            classes.push(class);
        }
        classes
    }

    // ------------------------------------------------------------------
    // Generative sampling
    // ------------------------------------------------------------------

    /// Draw a sequence from the model.
    ///
    /// `length = 0` means "walk until the end state", which is only possible
    /// for finite models. With `length > 0` the walk stops after that many
    /// emissions, and on finite models the end edge is avoided while symbols
    /// are still owed (unless it is a state's sole outgoing edge).
    pub fn sample<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        length: usize,
    ) -> Result<Vec<Symbol>, ModelError> {
        self.sample_walk(rng, length).map(|(symbols, _)| symbols)
    }

    /// Like [`sample`](Self::sample), also returning the visited states
    /// (silent ones included).
    pub fn sample_with_path<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        length: usize,
    ) -> Result<(Vec<Symbol>, Vec<State>), ModelError> {
        let (symbols, path) = self.sample_walk(rng, length)?;
        let states = path.into_iter().map(|i| self.states[i].clone()).collect();
        Ok((symbols, states))
    }

    fn sample_walk<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        length: usize,
    ) -> Result<(Vec<Symbol>, Vec<usize>), ModelError> {
        if !self.finite && length == 0 {
            return Err(ModelError::EndlessSample(self.name.clone()));
        }

        let mut symbols = Vec::new();
        let mut path = Vec::new();
        let mut current = self.start_index;
        loop {
            path.push(current);
            if current == self.end_index {
                break;
            }
            if let Some(dist) = &self.states[current].distribution {
                let symbol = dist.read().expect("poisoned distribution lock").sample(rng)?;
                symbols.push(symbol);
                if length > 0 && symbols.len() == length {
                    break;
                }
            }

            // Walk the outgoing row, skipping the end edge while symbols are
            // still owed (unless it is the sole edge out of here).
            let row = self.out_offset[current]..self.out_offset[current + 1];
            let skip_end = length > 0
                && self.finite
                && symbols.len() < length
                && row.len() > 1;
            let eligible: Vec<usize> = row
                .filter(|&e| !(skip_end && self.out_target[e] == self.end_index))
                .collect();
            let total: f64 = eligible.iter().map(|&e| self.out_log_p[e].exp()).sum();
            if total <= 0.0 {
                // Dead end (e.g. the end edge was the only probable one).
                break;
            }
            let mut u = rng.gen::<f64>() * total;
            let mut next = self.out_target[*eligible.last().expect("non-empty row")];
            for &e in &eligible {
                let p = self.out_log_p[e].exp();
                if u < p {
                    next = self.out_target[e];
                    break;
                }
                u -= p;
            }
            current = next;
        }
        Ok((symbols, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bake::MergePolicy;
    use crate::builder::ModelBuilder;
    use crate::distribution::Distribution;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn two_state_model() -> Model {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", Distribution::uniform(0.0, 1.0).unwrap());
        let s2 = State::with_distribution("s2", Distribution::uniform(10.0, 11.0).unwrap());
        b.add_states([s1.clone(), s2.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &s2, 0.5, None).unwrap();
        b.add_transition(&s1, &s1, 0.25, None).unwrap();
        b.add_transition(&s1, &end, 0.25, None).unwrap();
        b.add_transition(&s2, &end, 1.0, None).unwrap();
        b.bake(MergePolicy::None).unwrap()
    }

    #[test]
    fn csr_stores_agree_between_directions() {
        let m = two_state_model();
        for k in 0..m.n_states() {
            for (l, lp, pc) in m.out_edges(k) {
                let found = m
                    .in_edges(l)
                    .any(|(src, ilp, ipc)| src == k && ilp == lp && ipc == pc);
                assert!(found, "out-edge {k} → {l} missing from the in-store");
            }
        }
        let n_out: usize = (0..m.n_states()).map(|k| m.out_edges(k).count()).sum();
        let n_in: usize = (0..m.n_states()).map(|l| m.in_edges(l).count()).sum();
        assert_eq!(n_out, n_in);
    }

    #[test]
    fn out_to_in_twins_carry_the_same_edge() {
        let m = two_state_model();
        for k in 0..m.n_states() {
            for e in m.out_offset[k]..m.out_offset[k + 1] {
                let twin = m.out_to_in[e];
                assert_eq!(m.in_source[twin], k);
                assert_eq!(m.in_log_p[twin], m.out_log_p[e]);
            }
        }
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let m = two_state_model();
        let mut a = StdRng::seed_from_u64(0);
        let mut b = StdRng::seed_from_u64(0);
        let sa = m.sample(&mut a, 8).unwrap();
        let sb = m.sample(&mut b, 8).unwrap();
        assert_eq!(sa, sb);
        assert!(sa.len() <= 8);
    }

    #[test]
    fn unbounded_sampling_terminates_at_end() {
        let m = two_state_model();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..50 {
            let (symbols, path) = m.sample_with_path(&mut rng, 0).unwrap();
            assert_eq!(path.first().unwrap().name, "m-start");
            assert_eq!(path.last().unwrap().name, "m-end");
            assert!(!symbols.is_empty());
        }
    }

    #[test]
    fn bounded_sampling_avoids_end_until_length() {
        let m = two_state_model();
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..50 {
            let symbols = m.sample(&mut rng, 4).unwrap();
            // s2 → end is the sole outgoing edge of s2, so a walk may still
            // stop early; otherwise the end edge is skipped until length.
            assert!(!symbols.is_empty() && symbols.len() <= 4);
        }
    }

    #[test]
    fn infinite_models_require_a_length() {
        let mut b = ModelBuilder::new("inf");
        let s1 = State::with_distribution("s1", Distribution::uniform(0.0, 1.0).unwrap());
        b.add_state(s1.clone()).unwrap();
        let start = b.start().clone();
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &s1, 1.0, None).unwrap();
        let m = b.bake(MergePolicy::None).unwrap();

        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(m.sample(&mut rng, 0), Err(ModelError::EndlessSample(_))));
        assert_eq!(m.sample(&mut rng, 6).unwrap().len(), 6);
    }
}
