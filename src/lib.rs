//! Crate root: public surface, core aliases, and model-wide invariants
//!
//! `hmmkit` builds, compiles and trains hidden Markov models with
//! heterogeneous emissions, silent states, tied distributions and
//! sub-model composition. The crate is split along the model lifecycle:
//!
//! 1. **Edit** — a [`ModelBuilder`] collects states and weighted
//!    transitions as a mutable multigraph; builders compose through
//!    [`ModelBuilder::add_submodel`] and [`ModelBuilder::concatenate`].
//! 2. **Bake** — [`ModelBuilder::bake`] prunes orphans, normalizes each
//!    outgoing row, optionally contracts silent unit edges, orders states
//!    emitting-first with silent states topologically sorted, derives tie
//!    classes and emits the immutable CSR-backed [`Model`].
//! 3. **Decode** — forward, backward, Viterbi, forward–backward and MAP
//!    run over the compiled model in log space with per-row rescaling.
//! 4. **Train** — Baum–Welch, Viterbi hard-EM and labelled training update
//!    the transition arrays and refit each tied distribution class once
//!    per round.
//!
//! ## Invariants (established by the bake, relied on everywhere)
//!
//! - Every non-end state's outgoing probabilities sum to one (±1e-8).
//! - Emitting states occupy indices `[0, silent_start)`; silent states are
//!   topologically ordered, so silent-to-silent edges always go from lower
//!   to higher index and no silent cycle exists (a cycle rejects the bake).
//! - `start` and `end` are silent; a model is *finite* exactly when some
//!   edge enters `end`, and only finite models can be sampled without an
//!   explicit length.
//! - All probability sums go through the log-sum-exp in [`numerics`];
//!   "impossible" is the additive identity [`LOG_ZERO`](numerics::LOG_ZERO)
//!   and kernels report it through sentinels, never panics.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

/// Baking pipeline: graph → immutable compiled model.
pub mod bake;
/// Mutable model graph and its editing operations.
pub mod builder;
/// Emission distributions and the shared-ownership handle that ties states.
pub mod distribution;
/// Model persistence (versioned JSON; ties survive a round-trip).
pub mod io;
/// Forward / backward / Viterbi / forward–backward / MAP kernels.
pub mod kernels;
/// The compiled model: CSR edge stores, tie table, generative sampling.
pub mod model;
/// Log-space primitives and the special functions behind the Gamma fit.
pub mod numerics;
/// States and their process-unique identities.
pub mod state;
/// Baum–Welch, Viterbi and labelled trainers.
pub mod train;

// ============================================================================
// Canonical aliases and root-level re-exports
// ============================================================================

/// Natural-log probability. `f64::NEG_INFINITY` encodes probability zero.
pub type LogProb = f64;

/// One observation sequence.
pub type Sequence = Vec<Symbol>;

pub use crate::bake::{BakeError, MergePolicy};
pub use crate::builder::{BuildError, ModelBuilder};
pub use crate::distribution::{Distribution, DistributionError, SharedDistribution, Symbol};
pub use crate::kernels::KernelError;
pub use crate::model::{Model, ModelError};
pub use crate::state::{State, StateId};
pub use crate::train::{TrainError, TrainOptions, TrainingSet};
