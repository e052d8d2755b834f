//! Emission distributions
//!
//! A small algebra of distributions with a uniform contract:
//! `log_probability` / `sample` / `fit` / `clone_untied`. Heterogeneous
//! emissions live in one model through the closed [`Distribution`] enum —
//! parametric continuous families, a string-keyed discrete table, three
//! kernel-density estimates, a composable mixture, and an opaque
//! user-supplied log-probability (`Custom`, not samplable, not fittable).
//!
//! ## Contracts
//! - `log_probability` never fails; a symbol outside the support (or of the
//!   wrong kind) scores [`LOG_ZERO`].
//! - `fit` replaces parameters by the weighted maximum-likelihood estimate
//!   and is a no-op when the (filtered) sample set is empty or its weight
//!   sum is zero.
//! - `sample` is fallible: `Custom` and empty-support tables report an error
//!   instead of panicking.
//!
//! Distributions are shared between states through [`SharedDistribution`]
//! (`Arc<RwLock<_>>`). Handing the same handle to several states ties them:
//! the bake step derives tie classes by pointer identity and training refits
//! each class exactly once.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use rand::Rng;
use rand_distr::{Distribution as Sampler, Exp, Gamma as GammaSampler, Normal as NormalSampler, Triangular};
use statrs::function::gamma::{digamma, ln_gamma};
use thiserror::Error;

use crate::numerics::{ln_weight, lse, trigamma, LOG_ZERO};

/// Lower bound on a fitted Normal standard deviation.
pub const SIGMA_FLOOR: f64 = 0.01;

/// Half-width of the point mass a zero-variance Normal degenerates to.
const POINT_MASS_EPS: f64 = 1e-9;

/// `0.5 · ln(2π)`.
const HALF_LN_TWO_PI: f64 = 0.918_938_533_204_672_7;

/// One observation: a real number or a discrete category.
///
/// Continuous distributions score categories at `ln 0` and vice versa, so a
/// model can mix numeric and categorical emitting states and paths simply
/// become impossible where the kinds disagree.
#[derive(Clone, Debug, PartialEq)]
pub enum Symbol {
    /// A real-valued observation.
    Number(f64),
    /// A categorical observation.
    Category(String),
}

impl Symbol {
    /// The numeric value, if this is a number.
    #[inline]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Symbol::Number(v) => Some(*v),
            Symbol::Category(_) => None,
        }
    }

    /// The category, if this is one.
    #[inline]
    pub fn as_category(&self) -> Option<&str> {
        match self {
            Symbol::Number(_) => None,
            Symbol::Category(c) => Some(c),
        }
    }
}

impl From<f64> for Symbol {
    fn from(v: f64) -> Self {
        Symbol::Number(v)
    }
}

impl From<&str> for Symbol {
    fn from(c: &str) -> Self {
        Symbol::Category(c.to_owned())
    }
}

impl From<String> for Symbol {
    fn from(c: String) -> Self {
        Symbol::Category(c)
    }
}

impl From<char> for Symbol {
    fn from(c: char) -> Self {
        Symbol::Category(c.to_string())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Number(v) => write!(f, "{v}"),
            Symbol::Category(c) => write!(f, "{c}"),
        }
    }
}

/// Errors surfaced by distribution constructors and sampling.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("uniform bounds out of order (low={low}, high={high})")]
    BadUniformBounds { low: f64, high: f64 },
    #[error("standard deviation must be non-negative (got {0})")]
    NegativeSigma(f64),
    #[error("rate must be positive and finite (got {0})")]
    BadRate(f64),
    #[error("shape must be positive and finite (got {0})")]
    BadShape(f64),
    #[error("bandwidth must be positive and finite (got {0})")]
    BadBandwidth(f64),
    #[error("kernel density needs at least one support point")]
    EmptySupport,
    #[error("weight must be non-negative and finite (got {0})")]
    BadWeight(f64),
    #[error("expected {expected} weights (got {got})")]
    WeightArity { expected: usize, got: usize },
    #[error("mixture needs at least one component")]
    EmptyMixture,
    #[error("{0} distributions cannot be sampled")]
    NotSamplable(&'static str),
    #[error("degenerate parameters for sampling a {0} distribution")]
    DegenerateParameters(&'static str),
}

/// Shared-ownership handle to a distribution.
///
/// States holding clones of the same handle are *tied*: they share one set
/// of parameters, which training refits once per tie class.
pub type SharedDistribution = Arc<RwLock<Distribution>>;

/// Support points, common bandwidth and normalized weights of a kernel
/// density estimate.
#[derive(Clone, Debug, PartialEq)]
pub struct KernelDensity {
    /// Support points.
    pub points: Vec<f64>,
    /// Kernel bandwidth, shared by all points.
    pub bandwidth: f64,
    /// Per-point weights, normalized to sum to one.
    pub weights: Vec<f64>,
}

impl KernelDensity {
    fn new(
        points: Vec<f64>,
        bandwidth: f64,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, DistributionError> {
        if points.is_empty() {
            return Err(DistributionError::EmptySupport);
        }
        if !(bandwidth > 0.0 && bandwidth.is_finite()) {
            return Err(DistributionError::BadBandwidth(bandwidth));
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != points.len() {
                    return Err(DistributionError::WeightArity {
                        expected: points.len(),
                        got: w.len(),
                    });
                }
                normalize_weights(w)?
            }
            None => vec![1.0 / points.len() as f64; points.len()],
        };
        Ok(Self { points, bandwidth, weights })
    }

    /// Replace the support with a weighted sample set, keeping the bandwidth.
    fn refit(&mut self, pairs: &[(f64, f64)]) {
        let total: f64 = pairs.iter().map(|&(_, w)| w).sum();
        if pairs.is_empty() || total <= 0.0 {
            return;
        }
        self.points = pairs.iter().map(|&(x, _)| x).collect();
        self.weights = pairs.iter().map(|&(_, w)| w / total).collect();
    }
}

/// A user-supplied log-probability function.
///
/// Wraps an opaque closure; the state using it can score sequences but the
/// model can neither sample from it nor refit it.
#[derive(Clone)]
pub struct CustomDistribution(Arc<dyn Fn(&Symbol) -> f64 + Send + Sync>);

impl CustomDistribution {
    /// Wrap a log-probability function.
    pub fn new(f: impl Fn(&Symbol) -> f64 + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    #[inline]
    fn log_probability(&self, x: &Symbol) -> f64 {
        (self.0)(x)
    }
}

impl fmt::Debug for CustomDistribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CustomDistribution(..)")
    }
}

/// The closed set of emission distributions.
#[derive(Clone, Debug)]
pub enum Distribution {
    /// Uniform density on `[low, high]`. `low == high` is a point mass.
    Uniform { low: f64, high: f64 },
    /// Normal with mean and standard deviation. `std == 0` is a point mass.
    Normal { mean: f64, std: f64 },
    /// Exponential with the given rate, supported on `x ≥ 0`.
    Exponential { rate: f64 },
    /// Gamma in shape/rate parameterization, supported on `x > 0`.
    Gamma { shape: f64, rate: f64 },
    /// Inverse-Gamma; scores and fits through the Gamma of the reciprocals.
    InverseGamma { shape: f64, rate: f64 },
    /// Finite table of category probabilities. Unknown categories score
    /// `ln 0`.
    Discrete { probabilities: BTreeMap<String, f64> },
    /// Mixture of Gaussians centered on the support points.
    GaussianKernelDensity(KernelDensity),
    /// Per-point contribution 1 within one bandwidth of the point.
    UniformKernelDensity(KernelDensity),
    /// Per-point contribution `max(0, bandwidth − |x − point|)`.
    TriangleKernelDensity(KernelDensity),
    /// Weighted mixture of child distributions.
    Mixture { components: Vec<Distribution>, weights: Vec<f64> },
    /// User-supplied log-probability; not samplable, not fittable.
    Custom(CustomDistribution),
}

fn check_weight(w: f64) -> Result<f64, DistributionError> {
    if w >= 0.0 && w.is_finite() {
        Ok(w)
    } else {
        Err(DistributionError::BadWeight(w))
    }
}

fn normalize_weights(weights: Vec<f64>) -> Result<Vec<f64>, DistributionError> {
    let mut total = 0.0;
    for &w in &weights {
        total += check_weight(w)?;
    }
    if total <= 0.0 {
        return Err(DistributionError::BadWeight(total));
    }
    Ok(weights.into_iter().map(|w| w / total).collect())
}

/// Normal log-density, with the `std == 0` point-mass convention.
pub(crate) fn normal_logp(x: f64, mean: f64, std: f64) -> f64 {
    if std == 0.0 {
        return if (x - mean).abs() < POINT_MASS_EPS { 0.0 } else { LOG_ZERO };
    }
    let z = (x - mean) / std;
    -HALF_LN_TWO_PI - std.ln() - 0.5 * z * z
}

fn gamma_logp(x: f64, shape: f64, rate: f64) -> f64 {
    if x <= 0.0 {
        return LOG_ZERO;
    }
    shape * rate.ln() - ln_gamma(shape) + (shape - 1.0) * x.ln() - rate * x
}

/// Draw an index proportionally to `weights` (assumed non-negative).
fn pick_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> usize {
    let total: f64 = weights.iter().sum();
    let mut u = rng.gen::<f64>() * total;
    for (i, &w) in weights.iter().enumerate() {
        if u < w {
            return i;
        }
        u -= w;
    }
    weights.len() - 1
}

impl Distribution {
    // ------------------------------------------------------------------
    // Constructors
    // ------------------------------------------------------------------

    /// Uniform on `[low, high]`.
    pub fn uniform(low: f64, high: f64) -> Result<Self, DistributionError> {
        if low > high || !low.is_finite() || !high.is_finite() {
            return Err(DistributionError::BadUniformBounds { low, high });
        }
        Ok(Distribution::Uniform { low, high })
    }

    /// Normal with mean and standard deviation (`std ≥ 0`).
    pub fn normal(mean: f64, std: f64) -> Result<Self, DistributionError> {
        if std < 0.0 || !std.is_finite() {
            return Err(DistributionError::NegativeSigma(std));
        }
        Ok(Distribution::Normal { mean, std })
    }

    /// Exponential with rate `λ > 0`.
    pub fn exponential(rate: f64) -> Result<Self, DistributionError> {
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(DistributionError::BadRate(rate));
        }
        Ok(Distribution::Exponential { rate })
    }

    /// Gamma with shape `α > 0` and rate `β > 0`.
    pub fn gamma(shape: f64, rate: f64) -> Result<Self, DistributionError> {
        if !(shape > 0.0 && shape.is_finite()) {
            return Err(DistributionError::BadShape(shape));
        }
        if !(rate > 0.0 && rate.is_finite()) {
            return Err(DistributionError::BadRate(rate));
        }
        Ok(Distribution::Gamma { shape, rate })
    }

    /// Inverse-Gamma with shape `α > 0` and rate `β > 0`.
    pub fn inverse_gamma(shape: f64, rate: f64) -> Result<Self, DistributionError> {
        match Self::gamma(shape, rate)? {
            Distribution::Gamma { shape, rate } => Ok(Distribution::InverseGamma { shape, rate }),
            _ => unreachable!(),
        }
    }

    /// Discrete table over categories. Probabilities must be non-negative
    /// and finite; they are used as given (no renormalization).
    pub fn discrete<K: Into<String>>(
        table: impl IntoIterator<Item = (K, f64)>,
    ) -> Result<Self, DistributionError> {
        let mut probabilities = BTreeMap::new();
        for (k, p) in table {
            probabilities.insert(k.into(), check_weight(p)?);
        }
        Ok(Distribution::Discrete { probabilities })
    }

    /// Gaussian kernel density over `points` with a common `bandwidth`.
    /// Weights default to uniform and are normalized to sum to one.
    pub fn gaussian_kde(
        points: Vec<f64>,
        bandwidth: f64,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, DistributionError> {
        Ok(Distribution::GaussianKernelDensity(KernelDensity::new(points, bandwidth, weights)?))
    }

    /// Uniform (box) kernel density.
    pub fn uniform_kde(
        points: Vec<f64>,
        bandwidth: f64,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, DistributionError> {
        Ok(Distribution::UniformKernelDensity(KernelDensity::new(points, bandwidth, weights)?))
    }

    /// Triangular kernel density.
    pub fn triangle_kde(
        points: Vec<f64>,
        bandwidth: f64,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, DistributionError> {
        Ok(Distribution::TriangleKernelDensity(KernelDensity::new(points, bandwidth, weights)?))
    }

    /// Mixture of child distributions. Weights default to uniform and are
    /// normalized to sum to one.
    pub fn mixture(
        components: Vec<Distribution>,
        weights: Option<Vec<f64>>,
    ) -> Result<Self, DistributionError> {
        if components.is_empty() {
            return Err(DistributionError::EmptyMixture);
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != components.len() {
                    return Err(DistributionError::WeightArity {
                        expected: components.len(),
                        got: w.len(),
                    });
                }
                normalize_weights(w)?
            }
            None => vec![1.0 / components.len() as f64; components.len()],
        };
        Ok(Distribution::Mixture { components, weights })
    }

    /// Wrap a user-supplied log-probability function.
    pub fn custom(f: impl Fn(&Symbol) -> f64 + Send + Sync + 'static) -> Self {
        Distribution::Custom(CustomDistribution::new(f))
    }

    /// Move into a shared handle, ready to be given to one or more states.
    pub fn shared(self) -> SharedDistribution {
        Arc::new(RwLock::new(self))
    }

    /// Deep copy with independent parameters (breaks any tie).
    pub fn clone_untied(&self) -> Distribution {
        self.clone()
    }

    // ------------------------------------------------------------------
    // Log-probability
    // ------------------------------------------------------------------

    /// Log density (or mass) at `x`. `LOG_ZERO` outside the support.
    pub fn log_probability(&self, x: &Symbol) -> f64 {
        match self {
            Distribution::Uniform { low, high } => match x.as_number() {
                Some(v) if *low == *high => {
                    if v == *low {
                        0.0
                    } else {
                        LOG_ZERO
                    }
                }
                Some(v) if v >= *low && v <= *high => -(high - low).ln(),
                _ => LOG_ZERO,
            },
            Distribution::Normal { mean, std } => match x.as_number() {
                Some(v) => normal_logp(v, *mean, *std),
                None => LOG_ZERO,
            },
            Distribution::Exponential { rate } => match x.as_number() {
                Some(v) if v >= 0.0 => rate.ln() - rate * v,
                _ => LOG_ZERO,
            },
            Distribution::Gamma { shape, rate } => match x.as_number() {
                Some(v) => gamma_logp(v, *shape, *rate),
                None => LOG_ZERO,
            },
            Distribution::InverseGamma { shape, rate } => match x.as_number() {
                Some(v) if v > 0.0 => gamma_logp(1.0 / v, *shape, *rate),
                _ => LOG_ZERO,
            },
            Distribution::Discrete { probabilities } => match x.as_category() {
                Some(c) => probabilities.get(c).copied().map_or(LOG_ZERO, ln_weight),
                None => LOG_ZERO,
            },
            Distribution::GaussianKernelDensity(kd) => match x.as_number() {
                Some(v) => kd
                    .points
                    .iter()
                    .zip(&kd.weights)
                    .fold(LOG_ZERO, |acc, (&p, &w)| {
                        lse(acc, ln_weight(w) + normal_logp(v, p, kd.bandwidth))
                    }),
                None => LOG_ZERO,
            },
            Distribution::UniformKernelDensity(kd) => match x.as_number() {
                Some(v) => {
                    let mass: f64 = kd
                        .points
                        .iter()
                        .zip(&kd.weights)
                        .filter(|(&p, _)| (v - p).abs() <= kd.bandwidth)
                        .map(|(_, &w)| w)
                        .sum();
                    ln_weight(mass)
                }
                None => LOG_ZERO,
            },
            Distribution::TriangleKernelDensity(kd) => match x.as_number() {
                Some(v) => {
                    let mass: f64 = kd
                        .points
                        .iter()
                        .zip(&kd.weights)
                        .map(|(&p, &w)| w * (kd.bandwidth - (v - p).abs()).max(0.0))
                        .sum();
                    ln_weight(mass)
                }
                None => LOG_ZERO,
            },
            Distribution::Mixture { components, weights } => components
                .iter()
                .zip(weights)
                .fold(LOG_ZERO, |acc, (c, &w)| {
                    lse(acc, ln_weight(w) + c.log_probability(x))
                }),
            Distribution::Custom(f) => f.log_probability(x),
        }
    }

    // ------------------------------------------------------------------
    // Sampling
    // ------------------------------------------------------------------

    /// Draw one variate.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Symbol, DistributionError> {
        match self {
            Distribution::Uniform { low, high } => Ok(Symbol::Number(if low == high {
                *low
            } else {
                rng.gen_range(*low..=*high)
            })),
            Distribution::Normal { mean, std } => {
                if *std == 0.0 {
                    return Ok(Symbol::Number(*mean));
                }
                let d = NormalSampler::new(*mean, *std)
                    .map_err(|_| DistributionError::DegenerateParameters("normal"))?;
                Ok(Symbol::Number(d.sample(rng)))
            }
            Distribution::Exponential { rate } => {
                let d = Exp::new(*rate)
                    .map_err(|_| DistributionError::DegenerateParameters("exponential"))?;
                Ok(Symbol::Number(d.sample(rng)))
            }
            Distribution::Gamma { shape, rate } => {
                let d = GammaSampler::new(*shape, 1.0 / rate)
                    .map_err(|_| DistributionError::DegenerateParameters("gamma"))?;
                Ok(Symbol::Number(d.sample(rng)))
            }
            Distribution::InverseGamma { shape, rate } => {
                let d = GammaSampler::new(*shape, 1.0 / rate)
                    .map_err(|_| DistributionError::DegenerateParameters("inverse-gamma"))?;
                Ok(Symbol::Number(1.0 / d.sample(rng)))
            }
            Distribution::Discrete { probabilities } => {
                if probabilities.is_empty() {
                    return Err(DistributionError::NotSamplable("empty discrete"));
                }
                let weights: Vec<f64> = probabilities.values().copied().collect();
                let i = pick_index(rng, &weights);
                let c = probabilities.keys().nth(i).cloned().unwrap_or_default();
                Ok(Symbol::Category(c))
            }
            Distribution::GaussianKernelDensity(kd) => {
                let p = kd.points[pick_index(rng, &kd.weights)];
                let d = NormalSampler::new(p, kd.bandwidth)
                    .map_err(|_| DistributionError::DegenerateParameters("gaussian kernel"))?;
                Ok(Symbol::Number(d.sample(rng)))
            }
            Distribution::UniformKernelDensity(kd) => {
                let p = kd.points[pick_index(rng, &kd.weights)];
                Ok(Symbol::Number(rng.gen_range(p - kd.bandwidth..=p + kd.bandwidth)))
            }
            Distribution::TriangleKernelDensity(kd) => {
                let p = kd.points[pick_index(rng, &kd.weights)];
                let d = Triangular::new(p - kd.bandwidth, p + kd.bandwidth, p)
                    .map_err(|_| DistributionError::DegenerateParameters("triangle kernel"))?;
                Ok(Symbol::Number(d.sample(rng)))
            }
            Distribution::Mixture { components, weights } => {
                let i = pick_index(rng, weights);
                components[i].sample(rng)
            }
            Distribution::Custom(_) => Err(DistributionError::NotSamplable("custom")),
        }
    }

    // ------------------------------------------------------------------
    // Fitting
    // ------------------------------------------------------------------

    /// Replace parameters by the weighted maximum-likelihood estimate.
    ///
    /// `weights` defaults to all-ones and must have the sample length when
    /// given. Symbols of the wrong kind are ignored. A no-op when nothing
    /// usable remains, when the weight sum is zero, or for `Mixture` and
    /// `Custom` (which carry no fittable sufficient statistics here).
    pub fn fit(&mut self, samples: &[Symbol], weights: Option<&[f64]>) {
        if let Some(w) = weights {
            debug_assert_eq!(w.len(), samples.len(), "one weight per sample");
        }
        let weight_of = |i: usize| weights.map_or(1.0, |w| w[i]);

        match self {
            Distribution::Discrete { probabilities } => {
                let mut acc: BTreeMap<String, f64> = BTreeMap::new();
                let mut total = 0.0;
                for (i, s) in samples.iter().enumerate() {
                    if let Some(c) = s.as_category() {
                        let w = weight_of(i);
                        if w > 0.0 {
                            *acc.entry(c.to_owned()).or_insert(0.0) += w;
                            total += w;
                        }
                    }
                }
                if total > 0.0 {
                    for w in acc.values_mut() {
                        *w /= total;
                    }
                    *probabilities = acc;
                }
            }
            Distribution::Mixture { .. } | Distribution::Custom(_) => {}
            _ => {
                let pairs: Vec<(f64, f64)> = samples
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| {
                        let w = weight_of(i);
                        s.as_number().filter(|_| w > 0.0).map(|x| (x, w))
                    })
                    .collect();
                self.fit_numeric(&pairs);
            }
        }
    }

    fn fit_numeric(&mut self, pairs: &[(f64, f64)]) {
        let total: f64 = pairs.iter().map(|&(_, w)| w).sum();
        if pairs.is_empty() || total <= 0.0 {
            return;
        }
        match self {
            Distribution::Uniform { low, high } => {
                let mut lo = f64::INFINITY;
                let mut hi = f64::NEG_INFINITY;
                for &(x, _) in pairs {
                    lo = lo.min(x);
                    hi = hi.max(x);
                }
                *low = lo;
                *high = hi;
            }
            Distribution::Normal { mean, std } => {
                let sx: f64 = pairs.iter().map(|&(x, w)| x * w).sum();
                let sxx: f64 = pairs.iter().map(|&(x, w)| x * x * w).sum();
                let mu = sx / total;
                *mean = mu;
                // Variance needs at least two weighted observations.
                if pairs.len() >= 2 {
                    let var = (sxx / total - mu * mu).max(0.0);
                    *std = var.sqrt().max(SIGMA_FLOOR);
                }
            }
            Distribution::Exponential { rate } => {
                let sx: f64 = pairs.iter().map(|&(x, w)| x * w).sum();
                if sx > 0.0 {
                    *rate = total / sx;
                }
            }
            Distribution::Gamma { shape, rate } => {
                fit_gamma(shape, rate, pairs);
            }
            Distribution::InverseGamma { shape, rate } => {
                let inverted: Vec<(f64, f64)> =
                    pairs.iter().filter(|&&(x, _)| x > 0.0).map(|&(x, w)| (1.0 / x, w)).collect();
                fit_gamma(shape, rate, &inverted);
            }
            Distribution::GaussianKernelDensity(kd)
            | Distribution::UniformKernelDensity(kd)
            | Distribution::TriangleKernelDensity(kd) => {
                kd.refit(pairs);
            }
            Distribution::Discrete { .. }
            | Distribution::Mixture { .. }
            | Distribution::Custom(_) => {}
        }
    }
}

/// Weighted Gamma MLE: Newton–Raphson on the shape, analytic rate.
///
/// The sufficient statistic is `s = ln(weighted mean) − weighted mean of ln x`.
/// Seeded by the Minka closed form when `s > 0`, otherwise by the previous
/// shape. An iterate escaping `(0, ∞)` is reseeded uniformly in `(0, 1)`.
/// Non-convergence after 1000 steps keeps the last iterate.
fn fit_gamma(shape: &mut f64, rate: &mut f64, pairs: &[(f64, f64)]) {
    let usable: Vec<(f64, f64)> = pairs.iter().copied().filter(|&(x, _)| x > 0.0).collect();
    let total: f64 = usable.iter().map(|&(_, w)| w).sum();
    if usable.is_empty() || total <= 0.0 {
        return;
    }
    let sx: f64 = usable.iter().map(|&(x, w)| x * w).sum();
    let mean = sx / total;
    let mean_log: f64 = usable.iter().map(|&(x, w)| x.ln() * w).sum::<f64>() / total;
    let s = mean.ln() - mean_log;

    let mut a = if s > 0.0 {
        (3.0 - s + ((s - 3.0) * (s - 3.0) + 24.0 * s).sqrt()) / (12.0 * s)
    } else {
        *shape
    };
    if !(a.is_finite() && a > 0.0) {
        a = *shape;
    }

    for _ in 0..1000 {
        let step = (a.ln() - digamma(a) - s) / (1.0 / a - trigamma(a));
        let mut next = a - step;
        if !next.is_finite() || next <= 0.0 {
            next = rand::thread_rng().gen::<f64>().max(f64::EPSILON);
        }
        let delta = (next - a).abs();
        a = next;
        if delta < 1e-9 {
            break;
        }
    }

    *shape = a;
    *rate = a * total / sx;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn nums(values: &[f64]) -> Vec<Symbol> {
        values.iter().map(|&v| Symbol::Number(v)).collect()
    }

    #[test]
    fn uniform_density_and_point_mass() {
        let d = Distribution::uniform(-1.0, 3.0).unwrap();
        assert!((d.log_probability(&0.0.into()) - (-4.0f64.ln())).abs() < 1e-12);
        assert_eq!(d.log_probability(&3.5.into()), LOG_ZERO);
        assert_eq!(d.log_probability(&"a".into()), LOG_ZERO);

        let point = Distribution::uniform(2.0, 2.0).unwrap();
        assert_eq!(point.log_probability(&2.0.into()), 0.0);
        assert_eq!(point.log_probability(&2.1.into()), LOG_ZERO);

        assert!(Distribution::uniform(1.0, 0.0).is_err());
    }

    #[test]
    fn uniform_fit_takes_weighted_extremes() {
        let mut d = Distribution::uniform(0.0, 1.0).unwrap();
        let samples = nums(&[5.0, -2.0, 3.0, 9.0]);
        // The 9.0 sample carries zero weight and must be ignored.
        d.fit(&samples, Some(&[1.0, 1.0, 1.0, 0.0]));
        match d {
            Distribution::Uniform { low, high } => {
                assert_eq!(low, -2.0);
                assert_eq!(high, 5.0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn normal_logp_matches_closed_form() {
        let d = Distribution::normal(1.0, 2.0).unwrap();
        let expected = -HALF_LN_TWO_PI - 2.0f64.ln() - 0.5 * 0.25;
        assert!((d.log_probability(&2.0.into()) - expected).abs() < 1e-12);
        assert!(Distribution::normal(0.0, -1.0).is_err());

        let point = Distribution::normal(0.5, 0.0).unwrap();
        assert_eq!(point.log_probability(&0.5.into()), 0.0);
        assert_eq!(point.log_probability(&0.6.into()), LOG_ZERO);
    }

    #[test]
    fn normal_fit_clamps_sigma_and_needs_two_samples() {
        let mut d = Distribution::normal(0.0, 5.0).unwrap();
        d.fit(&nums(&[2.0]), None);
        match d {
            Distribution::Normal { mean, std } => {
                assert_eq!(mean, 2.0);
                assert_eq!(std, 5.0, "single sample keeps the old sigma");
            }
            _ => unreachable!(),
        }

        let mut d = Distribution::normal(0.0, 5.0).unwrap();
        d.fit(&nums(&[1.0, 1.0, 1.0]), None);
        match d {
            Distribution::Normal { mean, std } => {
                assert_eq!(mean, 1.0);
                assert_eq!(std, SIGMA_FLOOR, "zero variance clamps to the floor");
            }
            _ => unreachable!(),
        }

        let mut d = Distribution::normal(0.0, 1.0).unwrap();
        d.fit(&nums(&[0.0, 4.0]), Some(&[1.0, 3.0]));
        match d {
            Distribution::Normal { mean, std } => {
                assert!((mean - 3.0).abs() < 1e-12);
                // E[x²] − μ² = 12 − 9 = 3.
                assert!((std - 3.0f64.sqrt()).abs() < 1e-12);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn exponential_fit_is_inverse_weighted_mean() {
        let mut d = Distribution::exponential(1.0).unwrap();
        d.fit(&nums(&[1.0, 3.0]), Some(&[1.0, 1.0]));
        match d {
            Distribution::Exponential { rate } => assert!((rate - 0.5).abs() < 1e-12),
            _ => unreachable!(),
        }
        assert_eq!(
            Distribution::exponential(2.0).unwrap().log_probability(&(-1.0).into()),
            LOG_ZERO
        );
    }

    #[test]
    fn empty_or_zero_weight_fit_is_a_no_op() {
        let mut d = Distribution::exponential(2.5).unwrap();
        d.fit(&[], None);
        d.fit(&nums(&[1.0, 2.0]), Some(&[0.0, 0.0]));
        match d {
            Distribution::Exponential { rate } => assert_eq!(rate, 2.5),
            _ => unreachable!(),
        }
    }

    #[test]
    fn gamma_fit_recovers_parameters() {
        let mut rng = StdRng::seed_from_u64(7);
        let truth = Distribution::gamma(3.0, 2.0).unwrap();
        let samples: Vec<Symbol> =
            (0..20_000).map(|_| truth.sample(&mut rng).unwrap()).collect();
        let mut d = Distribution::gamma(1.0, 1.0).unwrap();
        d.fit(&samples, None);
        match d {
            Distribution::Gamma { shape, rate } => {
                assert!((shape - 3.0).abs() < 0.15, "shape {shape}");
                assert!((rate - 2.0).abs() < 0.15, "rate {rate}");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn gamma_fit_survives_degenerate_statistics() {
        // Identical samples have s = 0, where the shape MLE diverges. The
        // Newton loop caps at 1000 steps and the last iterate is accepted;
        // the rate stays coupled to the shape through the weighted mean.
        let mut d = Distribution::gamma(4.0, 1.0).unwrap();
        d.fit(&nums(&[2.0, 2.0, 2.0]), None);
        match d {
            Distribution::Gamma { shape, rate } => {
                assert!(shape.is_finite() && shape > 0.0, "shape {shape}");
                let rel = (rate - shape / 2.0).abs() / rate.abs().max(1.0);
                assert!(rel < 1e-9, "rate {rate} decoupled from shape {shape}");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn inverse_gamma_round_trip() {
        // Draw from InverseGamma(10, 0.5), refit, recover the parameters.
        let mut rng = StdRng::seed_from_u64(0);
        let truth = Distribution::inverse_gamma(10.0, 0.5).unwrap();
        let samples: Vec<Symbol> =
            (0..10_000).map(|_| truth.sample(&mut rng).unwrap()).collect();
        let mut d = Distribution::inverse_gamma(1.0, 1.0).unwrap();
        d.fit(&samples, None);
        match d {
            Distribution::InverseGamma { shape, rate } => {
                assert!((shape - 10.0).abs() < 0.5, "shape {shape}");
                assert!((rate - 0.5).abs() < 0.05, "rate {rate}");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn inverse_gamma_scores_reciprocal() {
        let ig = Distribution::inverse_gamma(3.0, 2.0).unwrap();
        let g = Distribution::gamma(3.0, 2.0).unwrap();
        let x = 0.8;
        assert_eq!(ig.log_probability(&x.into()), g.log_probability(&(1.0 / x).into()));
        assert_eq!(ig.log_probability(&(-1.0).into()), LOG_ZERO);
    }

    #[test]
    fn discrete_table_and_fit() {
        let d = Distribution::discrete([("a", 0.5), ("b", 0.25), ("c", 0.25)]).unwrap();
        assert!((d.log_probability(&"a".into()) - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(d.log_probability(&"z".into()), LOG_ZERO);
        assert_eq!(d.log_probability(&1.0.into()), LOG_ZERO);

        let mut d = d;
        let samples: Vec<Symbol> = ["a", "a", "b"].iter().map(|&c| c.into()).collect();
        d.fit(&samples, Some(&[1.0, 1.0, 2.0]));
        match &d {
            Distribution::Discrete { probabilities } => {
                assert!((probabilities["a"] - 0.5).abs() < 1e-12);
                assert!((probabilities["b"] - 0.5).abs() < 1e-12);
                assert!(!probabilities.contains_key("c"), "unseen categories drop out");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn gaussian_kde_single_point_is_a_normal() {
        let kde = Distribution::gaussian_kde(vec![1.5], 0.3, None).unwrap();
        let n = Distribution::normal(1.5, 0.3).unwrap();
        for x in [-1.0, 0.0, 1.5, 2.0] {
            let a = kde.log_probability(&x.into());
            let b = n.log_probability(&x.into());
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn box_and_triangle_kernels_have_bounded_support() {
        let ukde = Distribution::uniform_kde(vec![0.0, 10.0], 1.0, None).unwrap();
        assert!((ukde.log_probability(&0.5.into()) - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(ukde.log_probability(&5.0.into()), LOG_ZERO);

        let tkde = Distribution::triangle_kde(vec![0.0], 2.0, None).unwrap();
        // Contribution is bandwidth − |x|, weighted by the (single) weight 1.
        assert!((tkde.log_probability(&0.5.into()) - 1.5f64.ln()).abs() < 1e-12);
        assert_eq!(tkde.log_probability(&2.5.into()), LOG_ZERO);
    }

    #[test]
    fn kde_fit_replaces_support() {
        let mut d = Distribution::gaussian_kde(vec![0.0], 0.5, None).unwrap();
        d.fit(&nums(&[1.0, 2.0]), Some(&[3.0, 1.0]));
        match &d {
            Distribution::GaussianKernelDensity(kd) => {
                assert_eq!(kd.points, vec![1.0, 2.0]);
                assert!((kd.weights[0] - 0.75).abs() < 1e-12);
                assert!((kd.weights[1] - 0.25).abs() < 1e-12);
                assert_eq!(kd.bandwidth, 0.5);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn mixture_scores_weighted_children() {
        let d = Distribution::mixture(
            vec![
                Distribution::uniform(0.0, 1.0).unwrap(),
                Distribution::uniform(0.0, 2.0).unwrap(),
            ],
            Some(vec![1.0, 3.0]),
        )
        .unwrap();
        // p(0.5) = 0.25·1 + 0.75·0.5 = 0.625
        assert!((d.log_probability(&0.5.into()) - 0.625f64.ln()).abs() < 1e-12);
        // p(1.5) = 0.75·0.5 (first child out of support)
        assert!((d.log_probability(&1.5.into()) - 0.375f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn mixture_sampling_selects_children_by_weight() {
        let d = Distribution::mixture(
            vec![
                Distribution::uniform(0.0, 1.0).unwrap(),
                Distribution::uniform(10.0, 11.0).unwrap(),
            ],
            Some(vec![0.25, 0.75]),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let mut high = 0usize;
        let n = 4000;
        for _ in 0..n {
            if d.sample(&mut rng).unwrap().as_number().unwrap() > 5.0 {
                high += 1;
            }
        }
        let frac = high as f64 / n as f64;
        assert!((frac - 0.75).abs() < 0.05, "child weight not respected: {frac}");
    }

    #[test]
    fn custom_scores_but_never_samples_or_fits() {
        let mut d = Distribution::custom(|x| match x.as_number() {
            Some(v) if v > 0.0 => 0.0,
            _ => LOG_ZERO,
        });
        assert_eq!(d.log_probability(&1.0.into()), 0.0);
        assert_eq!(d.log_probability(&(-1.0).into()), LOG_ZERO);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(d.sample(&mut rng), Err(DistributionError::NotSamplable(_))));
        d.fit(&nums(&[1.0, 2.0]), None);
    }

    #[test]
    fn sampling_is_deterministic_under_a_fixed_seed() {
        let d = Distribution::normal(0.0, 1.0).unwrap();
        let mut a = StdRng::seed_from_u64(0);
        let mut b = StdRng::seed_from_u64(0);
        for _ in 0..8 {
            assert_eq!(
                d.sample(&mut a).unwrap().as_number().unwrap(),
                d.sample(&mut b).unwrap().as_number().unwrap()
            );
        }
    }

    #[test]
    fn shared_handles_tie_by_pointer() {
        let h = Distribution::normal(0.0, 1.0).unwrap().shared();
        let h2 = Arc::clone(&h);
        assert!(Arc::ptr_eq(&h, &h2));
        let untied = h.read().expect("poisoned distribution lock").clone_untied();
        let h3 = untied.shared();
        assert!(!Arc::ptr_eq(&h, &h3));
    }
}
