//! Parameter re-estimation
//!
//! Three trainers over the compiled model, sharing one edge update rule and
//! one tie-class refitting step:
//!
//! - **Baum–Welch** — soft counts from forward–backward, iterated until the
//!   total log probability stops improving;
//! - **Viterbi** — hard counts from each sequence's most likely path,
//!   iterated the same way;
//! - **Labelled** — exact counts along caller-provided paths, one pass.
//!
//! The edge update for source `k` normalizes
//! `expected[k, l] + transition_pseudocount + pc[k, l]·use_pseudocount`
//! over `k`'s outgoing row, then mixes with the previous probability by
//! `edge_inertia`. A row with no mass is left unchanged, as is a tie class
//! whose aggregated sample weight is zero. Sequences the model cannot
//! produce are skipped with a warning.
//!
//! Training is the only mutator of a baked model: it rewrites the transition
//! arrays (mirroring each out-edge into its in-edge twin) and refits the
//! shared distributions in place. Between rounds it checks a cancellation
//! flag and an optional deadline; a partial round is never committed.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::distribution::Symbol;
use crate::model::Model;
use crate::numerics::LOG_ZERO;
use crate::state::State;

/// Knobs shared by all trainers. The iteration bounds and threshold only
/// apply to the iterative algorithms.
#[derive(Clone, Debug)]
pub struct TrainOptions {
    /// Stop once a round improves the total log probability by no more than
    /// this.
    pub stop_threshold: f64,
    /// Run at least this many rounds before the threshold may stop training.
    pub min_iterations: usize,
    /// Hard cap on rounds.
    pub max_iterations: usize,
    /// Flat additive prior on every transition count.
    pub transition_pseudocount: f64,
    /// Gate the per-edge pseudocounts recorded at build time.
    pub use_pseudocount: bool,
    /// Convex share of the previous transition probability retained by an
    /// update, in `[0, 1]`.
    pub edge_inertia: f64,
    /// Minimum posterior weight for an observation to enter a distribution
    /// refit.
    pub emission_threshold: f64,
    /// Checked between rounds; set to request cancellation.
    pub cancel: Option<Arc<AtomicBool>>,
    /// Wall-clock cutoff, checked between rounds.
    pub deadline: Option<Instant>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            stop_threshold: 1e-9,
            min_iterations: 0,
            max_iterations: 1000,
            transition_pseudocount: 0.0,
            use_pseudocount: false,
            edge_inertia: 0.0,
            emission_threshold: 0.0,
            cancel: None,
            deadline: None,
        }
    }
}

/// A training request: the algorithm together with the data it needs.
#[derive(Clone, Debug)]
pub enum TrainingSet<'a> {
    /// Soft expectation-maximization over unlabelled sequences.
    BaumWelch(&'a [Vec<Symbol>]),
    /// Hard expectation-maximization over unlabelled sequences.
    Viterbi(&'a [Vec<Symbol>]),
    /// Supervised counting along known paths.
    Labelled(&'a [(Vec<Symbol>, Vec<State>)]),
}

/// Errors surfaced by the trainers.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("edge inertia must lie in [0, 1] (got {0})")]
    BadInertia(f64),
    #[error("training cancelled after {iterations} rounds ({improvement:+.6} improvement so far)")]
    Cancelled { iterations: usize, improvement: f64 },
    #[error("labelled path state `{0}` is not part of this model")]
    UnknownPathState(String),
}

#[derive(Copy, Clone)]
enum CountMode {
    Soft,
    Hard,
}

impl Model {
    /// Train the model in place; returns the total log-probability
    /// improvement across all rounds.
    pub fn train(&mut self, data: TrainingSet<'_>, options: &TrainOptions) -> Result<f64, TrainError> {
        if !(0.0..=1.0).contains(&options.edge_inertia) {
            return Err(TrainError::BadInertia(options.edge_inertia));
        }
        match data {
            TrainingSet::BaumWelch(seqs) => self.train_iterative(seqs, options, CountMode::Soft),
            TrainingSet::Viterbi(seqs) => self.train_iterative(seqs, options, CountMode::Hard),
            TrainingSet::Labelled(pairs) => self.labelled_pass(pairs, options),
        }
    }

    /// Baum–Welch over unlabelled sequences.
    pub fn train_baum_welch(
        &mut self,
        sequences: &[Vec<Symbol>],
        options: &TrainOptions,
    ) -> Result<f64, TrainError> {
        self.train(TrainingSet::BaumWelch(sequences), options)
    }

    /// Viterbi hard-EM over unlabelled sequences.
    pub fn train_viterbi(
        &mut self,
        sequences: &[Vec<Symbol>],
        options: &TrainOptions,
    ) -> Result<f64, TrainError> {
        self.train(TrainingSet::Viterbi(sequences), options)
    }

    /// One supervised pass over `(sequence, path)` pairs.
    pub fn train_labelled(
        &mut self,
        data: &[(Vec<Symbol>, Vec<State>)],
        options: &TrainOptions,
    ) -> Result<f64, TrainError> {
        self.train(TrainingSet::Labelled(data), options)
    }

    // ------------------------------------------------------------------
    // Iteration driver
    // ------------------------------------------------------------------

    fn train_iterative(
        &mut self,
        sequences: &[Vec<Symbol>],
        options: &TrainOptions,
        mode: CountMode,
    ) -> Result<f64, TrainError> {
        let mut last = self.usable_log_probability(sequences.iter());
        let mut total = 0.0;
        let mut iterations = 0usize;

        while iterations < options.max_iterations {
            if stop_requested(options) {
                return Err(TrainError::Cancelled { iterations, improvement: total });
            }
            match mode {
                CountMode::Soft => self.soft_count_round(sequences, options),
                CountMode::Hard => self.hard_count_round(sequences, options),
            }
            iterations += 1;
            let now = self.usable_log_probability(sequences.iter());
            let improvement = now - last;
            total += improvement;
            last = now;
            debug!(iterations, improvement, "training round finished");
            if iterations >= options.min_iterations && improvement <= options.stop_threshold {
                break;
            }
        }
        Ok(total)
    }

    /// Total log probability over the sequences the model can produce at
    /// all; impossible ones contribute nothing (they are skipped by the
    /// counting passes too).
    fn usable_log_probability<'a>(&self, seqs: impl Iterator<Item = &'a Vec<Symbol>>) -> f64 {
        seqs.map(|s| self.log_probability(s)).filter(|&lp| lp > LOG_ZERO).sum()
    }

    // ------------------------------------------------------------------
    // Counting passes
    // ------------------------------------------------------------------

    fn soft_count_round(&mut self, sequences: &[Vec<Symbol>], options: &TrainOptions) {
        let classes = self.tie_classes();
        let mut expected = vec![0.0f64; self.out_target.len()];
        let mut samples: Vec<SampleSet> = vec![SampleSet::default(); classes.len()];

        for seq in sequences {
            let (counts, weights) = match self.forward_backward(seq, true) {
                Ok(pair) => pair,
                Err(_) => {
                    warn!(model = %self.name, "skipping sequence with zero probability");
                    continue;
                }
            };
            for k in 0..self.n_states() {
                for e in self.out_offset[k]..self.out_offset[k + 1] {
                    expected[e] += counts[[k, self.out_target[e]]];
                }
            }
            // Weights are tie-aggregated, so one entry per class per symbol.
            for (class, set) in classes.iter().zip(&mut samples) {
                for (t, x) in seq.iter().enumerate() {
                    let w = weights[[t, class[0]]];
                    if w > options.emission_threshold {
                        set.push(x.clone(), w);
                    }
                }
            }
        }

        self.apply_edge_update(&expected, options);
        self.refit_classes(&classes, &samples);
    }

    fn hard_count_round(&mut self, sequences: &[Vec<Symbol>], options: &TrainOptions) {
        let classes = self.tie_classes();
        let class_of = class_index(&classes, self.silent_start);
        let mut expected = vec![0.0f64; self.out_target.len()];
        let mut samples: Vec<SampleSet> = vec![SampleSet::default(); classes.len()];

        for seq in sequences {
            let (_, path) = self.viterbi(seq);
            let Some(path) = path else {
                warn!(model = %self.name, "skipping sequence with no viterbi path");
                continue;
            };
            let indices: Vec<usize> = path
                .iter()
                .filter_map(|(_, s)| self.index_of(s))
                .collect();
            self.accumulate_path(&indices, seq, &mut expected, &class_of, &mut samples, options);
        }

        self.apply_edge_update(&expected, options);
        self.refit_classes(&classes, &samples);
    }

    fn labelled_pass(
        &mut self,
        data: &[(Vec<Symbol>, Vec<State>)],
        options: &TrainOptions,
    ) -> Result<f64, TrainError> {
        let before = self.usable_log_probability(data.iter().map(|(s, _)| s));

        let classes = self.tie_classes();
        let class_of = class_index(&classes, self.silent_start);
        let mut expected = vec![0.0f64; self.out_target.len()];
        let mut samples: Vec<SampleSet> = vec![SampleSet::default(); classes.len()];

        for (seq, path) in data {
            let mut indices = Vec::with_capacity(path.len() + 2);
            for state in path {
                match self.index_of(state) {
                    Some(i) => indices.push(i),
                    None => return Err(TrainError::UnknownPathState(state.name.clone())),
                }
            }
            // Implicit bracketing transitions.
            if indices.first() != Some(&self.start_index) {
                indices.insert(0, self.start_index);
            }
            if indices.last() != Some(&self.end_index) {
                indices.push(self.end_index);
            }
            let emitted = indices.iter().filter(|&&s| s < self.silent_start).count();
            if emitted != seq.len() {
                warn!(
                    model = %self.name,
                    expected = seq.len(),
                    got = emitted,
                    "labelled path emits the wrong number of symbols; skipping"
                );
                continue;
            }
            self.accumulate_path(&indices, seq, &mut expected, &class_of, &mut samples, options);
        }

        self.apply_edge_update(&expected, options);
        self.refit_classes(&classes, &samples);

        let after = self.usable_log_probability(data.iter().map(|(s, _)| s));
        Ok(after - before)
    }

    /// Unit transition counts along a path, plus per-class emission samples.
    fn accumulate_path(
        &self,
        path: &[usize],
        seq: &[Symbol],
        expected: &mut [f64],
        class_of: &[usize],
        samples: &mut [SampleSet],
        options: &TrainOptions,
    ) {
        for pair in path.windows(2) {
            match self.edge_slot(pair[0], pair[1]) {
                Some(e) => expected[e] += 1.0,
                None => warn!(
                    from = %self.states[pair[0]].name,
                    to = %self.states[pair[1]].name,
                    "path uses a transition the model does not have; skipping it"
                ),
            }
        }
        let mut t = 0usize;
        for &s in path {
            if s < self.silent_start {
                if 1.0 > options.emission_threshold {
                    samples[class_of[s]].push(seq[t].clone(), 1.0);
                }
                t += 1;
            }
        }
    }

    fn edge_slot(&self, from: usize, to: usize) -> Option<usize> {
        (self.out_offset[from]..self.out_offset[from + 1]).find(|&e| self.out_target[e] == to)
    }

    // ------------------------------------------------------------------
    // Update steps
    // ------------------------------------------------------------------

    fn apply_edge_update(&mut self, expected: &[f64], options: &TrainOptions) {
        let inertia = options.edge_inertia;
        for k in 0..self.n_states() {
            if k == self.end_index {
                continue;
            }
            let row = self.out_offset[k]..self.out_offset[k + 1];
            let mass = |e: usize, this: &Self| {
                expected[e]
                    + options.transition_pseudocount
                    + if options.use_pseudocount { this.out_pc[e] } else { 0.0 }
            };
            let norm: f64 = row.clone().map(|e| mass(e, self)).sum();
            if norm <= 0.0 {
                if row.len() > 0 {
                    debug!(state = %self.states[k].name, "no transition mass; row left unchanged");
                }
                continue;
            }
            for e in row {
                let new_p = mass(e, self) / norm;
                let mixed = self.out_log_p[e].exp() * inertia + new_p * (1.0 - inertia);
                let lp = if mixed > 0.0 { mixed.ln() } else { LOG_ZERO };
                let twin = self.out_to_in[e];
                self.out_log_p[e] = lp;
                self.in_log_p[twin] = lp;
            }
        }
    }

    fn refit_classes(&mut self, classes: &[Vec<usize>], samples: &[SampleSet]) {
        for (class, set) in classes.iter().zip(samples) {
            let total: f64 = set.weights.iter().sum();
            if set.symbols.is_empty() || total <= 0.0 {
                continue;
            }
            let dist = self.states[class[0]]
                .distribution
                .as_ref()
                .expect("emitting state carries a distribution");
            dist.write()
                .expect("poisoned distribution lock")
                .fit(&set.symbols, Some(&set.weights));
        }
    }
}

/// Weighted observations gathered for one tie class.
#[derive(Clone, Default)]
struct SampleSet {
    symbols: Vec<Symbol>,
    weights: Vec<f64>,
}

impl SampleSet {
    fn push(&mut self, x: Symbol, w: f64) {
        self.symbols.push(x);
        self.weights.push(w);
    }
}

/// Map each emitting state to its class slot.
fn class_index(classes: &[Vec<usize>], silent_start: usize) -> Vec<usize> {
    let mut class_of = vec![0usize; silent_start];
    for (ci, class) in classes.iter().enumerate() {
        for &s in class {
            class_of[s] = ci;
        }
    }
    class_of
}

fn stop_requested(options: &TrainOptions) -> bool {
    options.cancel.as_ref().is_some_and(|c| c.load(Ordering::Relaxed))
        || options.deadline.is_some_and(|d| Instant::now() >= d)
}

// ============================================================================
// Tests
// ============================================================================
