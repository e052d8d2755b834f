//! States and their identities
//!
//! A [`State`] is a named node of the model graph. A state with a
//! distribution emits exactly one symbol per visit; a state without one is
//! *silent* and participates in transitions only. Names are advisory —
//! equality is decided by [`StateId`], a process-unique identity handed out
//! at construction. Cloning a `State` clones the handle, not the identity:
//! the clone still *is* the same state wherever identity matters (tied
//! distributions, labelled paths).

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use crate::distribution::{Distribution, SharedDistribution};

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(u64);

impl StateId {
    /// Allocate a fresh identity.
    pub(crate) fn fresh() -> Self {
        Self(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Access the underlying id.
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A node of the model graph.
#[derive(Clone, Debug)]
pub struct State {
    id: StateId,
    /// Human-readable name. Advisory only; identity is the equality key.
    pub name: String,
    /// Emission distribution. `None` makes the state silent.
    pub distribution: Option<SharedDistribution>,
    /// Positive decoding weight. Enters Viterbi scores only, never the
    /// generative probability. Default 1.
    pub weight: f64,
}

impl State {
    /// Create an emitting state around a shared distribution handle.
    ///
    /// Pass the *same* handle to several states to tie them: tied states
    /// share parameters and are refit together during training.
    pub fn emitting(name: impl Into<String>, distribution: SharedDistribution) -> Self {
        Self {
            id: StateId::fresh(),
            name: name.into(),
            distribution: Some(distribution),
            weight: 1.0,
        }
    }

    /// Create an emitting state that owns its (untied) distribution.
    pub fn with_distribution(name: impl Into<String>, distribution: Distribution) -> Self {
        Self::emitting(name, distribution.shared())
    }

    /// Create a silent state.
    pub fn silent(name: impl Into<String>) -> Self {
        Self {
            id: StateId::fresh(),
            name: name.into(),
            distribution: None,
            weight: 1.0,
        }
    }

    /// Set the decoding weight (builder-style).
    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// The state's identity.
    #[inline]
    pub fn id(&self) -> StateId {
        self.id
    }

    /// Whether the state emits nothing.
    #[inline]
    pub fn is_silent(&self) -> bool {
        self.distribution.is_none()
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for State {}
