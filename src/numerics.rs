//! Log-space numeric primitives
//!
//! Every probability in this crate lives in natural-log space. Sums of
//! probabilities therefore go through [`lse`], the numerically stable
//! log-sum-exp, and "impossible" is the additive identity [`LOG_ZERO`].
//!
//! ## Conventions
//! - `lse(LOG_ZERO, y) = y` and `lse(x, LOG_ZERO) = x`.
//! - `lse(+∞, _) = +∞` (a certain event absorbs).
//! - Per-row rescaling in the DP kernels subtracts a row's `lse` and restores
//!   the accumulated column of scale factors at read time; both directions
//!   use the helpers here.
//!
//! The module also carries the trigamma function `ψ'` backing the Newton
//! step of the Gamma maximum-likelihood fit. `ln Γ` and `ψ` come from
//! `statrs`; trigamma is not exported there, so we keep the short
//! recurrence-plus-asymptotic-series form below.

#![forbid(unsafe_code)]

/// Additive identity of log-space probability: `ln 0`.
pub const LOG_ZERO: f64 = f64::NEG_INFINITY;

/// Stable log-sum-exp of two log-space values.
///
/// Computes `ln(exp(x) + exp(y))` as `max + log1p(exp(-|x - y|))`.
#[inline]
pub fn lse(x: f64, y: f64) -> f64 {
    if x == f64::INFINITY || y == f64::INFINITY {
        return f64::INFINITY;
    }
    if x == LOG_ZERO {
        return y;
    }
    if y == LOG_ZERO {
        return x;
    }
    let (hi, lo) = if x >= y { (x, y) } else { (y, x) };
    hi + (lo - hi).exp().ln_1p()
}

/// Log-sum-exp of an iterator of log-space values. Empty input is `LOG_ZERO`.
#[inline]
pub fn lse_iter(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().fold(LOG_ZERO, lse)
}

/// Natural log of a weight, mapping non-positive weights to [`LOG_ZERO`].
#[inline]
pub fn ln_weight(w: f64) -> f64 {
    if w > 0.0 {
        w.ln()
    } else {
        LOG_ZERO
    }
}

/// Round to 8 decimal places.
///
/// The baker uses this before deciding whether an outgoing row already sums
/// to one, so that accumulated float dust does not trigger renormalization.
#[inline]
pub fn round8(x: f64) -> f64 {
    (x * 1e8).round() / 1e8
}

/// Trigamma function `ψ'(x)` for `x > 0`.
///
/// Recurrence `ψ'(x) = ψ'(x + 1) + 1/x²` until the argument is large enough
/// for the asymptotic series
/// `ψ'(z) ≈ 1/z + 1/(2z²) + 1/(6z³) − 1/(30z⁵) + 1/(42z⁷) − 1/(30z⁹)`.
pub fn trigamma(x: f64) -> f64 {
    debug_assert!(x > 0.0, "trigamma domain is x > 0 (got {x})");
    let mut z = x;
    let mut acc = 0.0;
    while z < 6.0 {
        acc += 1.0 / (z * z);
        z += 1.0;
    }
    let y = 1.0 / (z * z);
    acc + 0.5 * y
        + (1.0 + y * (1.0 / 6.0 + y * (-1.0 / 30.0 + y * (1.0 / 42.0 + y * (-1.0 / 30.0))))) / z
}

// ============================================================================
// Tests
// ============================================================================
