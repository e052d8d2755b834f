//! Dynamic-programming kernels
//!
//! Forward, backward, Viterbi, forward–backward and MAP decoding over the
//! compiled model. All kernels are pure: they read the immutable model plus
//! one sequence, allocate private `ndarray` tables, and run to completion.
//!
//! ## Conventions
//! - Tables have `n + 1` rows; `f[t, k]` scores being in state `k` after
//!   consuming `t` symbols, `b[t, k]` scores the remaining suffix
//!   `x_t..x_{n-1}` from state `k`. Emissions are paid on the transition
//!   *into* an emitting state, so `f[t+1, l]` includes `e[t, l]` and
//!   `b[t+1, l]` does not.
//! - Silent states sit above `silent_start` in topological order, which lets
//!   each time step relax them in one ascending sweep (emitting sources
//!   first, then earlier silent states), and the backward pass in one
//!   descending sweep.
//! - Rows are rescaled by their log-sum during the recursion and the
//!   accumulated scale column is added back before a table is returned, so
//!   callers always see true log values.
//! - A finite model's sequence probability is read at `f[n, end]`; an
//!   infinite model's is the log-sum over emitting `f[n, i]`.

#![forbid(unsafe_code)]

use ndarray::Array2;
use thiserror::Error;

use crate::distribution::Symbol;
use crate::model::Model;
use crate::numerics::{lse, LOG_ZERO};
use crate::state::State;

/// Errors surfaced by the decoding kernels.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("sequence is impossible under model `{0}`")]
    ImpossibleSequence(String),
}

impl Model {
    /// Per-symbol, per-emitting-state log emission cache `e[t, i]`.
    pub(crate) fn emissions(&self, sequence: &[Symbol]) -> Array2<f64> {
        let n = sequence.len();
        let mut e = Array2::from_elem((n, self.silent_start), LOG_ZERO);
        for i in 0..self.silent_start {
            let dist = self.states[i]
                .distribution
                .as_ref()
                .expect("emitting state carries a distribution")
                .read()
                .expect("poisoned distribution lock");
            for (t, x) in sequence.iter().enumerate() {
                e[[t, i]] = dist.log_probability(x);
            }
        }
        e
    }

    /// Forward table `f[0..=n][0..m]` of true log values.
    pub fn forward(&self, sequence: &[Symbol]) -> Array2<f64> {
        let e = self.emissions(sequence);
        self.forward_with(sequence, &e)
    }

    pub(crate) fn forward_with(&self, sequence: &[Symbol], e: &Array2<f64>) -> Array2<f64> {
        let n = sequence.len();
        let m = self.n_states();
        let mut f = Array2::from_elem((n + 1, m), LOG_ZERO);
        let mut scale = vec![0.0; n + 1];

        f[[0, self.start_index]] = 0.0;
        // Silent relaxation before any emission: only silent-to-silent edges
        // below the target can contribute, in topological order.
        for l in self.silent_start..m {
            if l == self.start_index {
                continue;
            }
            let mut acc = LOG_ZERO;
            for (k, w, _) in self.in_edges(l) {
                if k >= self.silent_start && k < l {
                    acc = lse(acc, f[[0, k]] + w);
                }
            }
            f[[0, l]] = acc;
        }

        for t in 0..n {
            // Emitting targets consume x_t and read the fully relaxed row t.
            for l in 0..self.silent_start {
                let mut acc = LOG_ZERO;
                for (k, w, _) in self.in_edges(l) {
                    acc = lse(acc, f[[t, k]] + w);
                }
                f[[t + 1, l]] = if acc == LOG_ZERO { LOG_ZERO } else { e[[t, l]] + acc };
            }
            // Silent targets read row t+1: emitting sources, then silent
            // sources already relaxed this sweep.
            for l in self.silent_start..m {
                let mut acc = LOG_ZERO;
                for (k, w, _) in self.in_edges(l) {
                    if k < self.silent_start || k < l {
                        acc = lse(acc, f[[t + 1, k]] + w);
                    }
                }
                f[[t + 1, l]] = acc;
            }
            rescale_row(&mut f, t + 1, &mut scale, t);
        }

        restore_rows(&mut f, &scale);
        f
    }

    /// Backward table `b[0..=n][0..m]` of true log values.
    pub fn backward(&self, sequence: &[Symbol]) -> Array2<f64> {
        let e = self.emissions(sequence);
        self.backward_with(sequence, &e)
    }

    pub(crate) fn backward_with(&self, sequence: &[Symbol], e: &Array2<f64>) -> Array2<f64> {
        let n = sequence.len();
        let m = self.n_states();
        let mut b = Array2::from_elem((n + 1, m), LOG_ZERO);
        let mut scale = vec![0.0; n + 1];

        if self.finite {
            // Only suffixes reaching the end state without further symbols
            // are alive at row n: relax silent states in reverse order, then
            // score emitting states off their silent successors.
            b[[n, self.end_index]] = 0.0;
            for k in (self.silent_start..m).rev() {
                if k == self.end_index {
                    continue;
                }
                let mut acc = LOG_ZERO;
                for (l, w, _) in self.out_edges(k) {
                    if l >= self.silent_start && l > k {
                        acc = lse(acc, w + b[[n, l]]);
                    }
                }
                b[[n, k]] = acc;
            }
            for k in 0..self.silent_start {
                let mut acc = LOG_ZERO;
                for (l, w, _) in self.out_edges(k) {
                    if l >= self.silent_start {
                        acc = lse(acc, w + b[[n, l]]);
                    }
                }
                b[[n, k]] = acc;
            }
        } else {
            // Infinite models may stop in any emitting state.
            for i in 0..self.silent_start {
                b[[n, i]] = 0.0;
            }
        }

        for t in (0..n).rev() {
            for k in (self.silent_start..m).rev() {
                let mut acc = LOG_ZERO;
                for (l, w, _) in self.out_edges(k) {
                    if l < self.silent_start {
                        acc = lse(acc, w + e[[t, l]] + b[[t + 1, l]]);
                    } else if l > k {
                        acc = lse(acc, w + b[[t, l]]);
                    }
                }
                b[[t, k]] = acc;
            }
            for k in 0..self.silent_start {
                let mut acc = LOG_ZERO;
                for (l, w, _) in self.out_edges(k) {
                    if l < self.silent_start {
                        acc = lse(acc, w + e[[t, l]] + b[[t + 1, l]]);
                    } else {
                        acc = lse(acc, w + b[[t, l]]);
                    }
                }
                b[[t, k]] = acc;
            }
            rescale_row(&mut b, t, &mut scale, t + 1);
        }

        restore_rows(&mut b, &scale);
        b
    }

    /// `log P(x)` of a sequence under the model.
    pub fn log_probability(&self, sequence: &[Symbol]) -> f64 {
        let f = self.forward(sequence);
        self.log_probability_from_forward(&f)
    }

    pub(crate) fn log_probability_from_forward(&self, f: &Array2<f64>) -> f64 {
        let n = f.nrows() - 1;
        if self.finite {
            f[[n, self.end_index]]
        } else {
            (0..self.silent_start).fold(LOG_ZERO, |acc, i| lse(acc, f[[n, i]]))
        }
    }

    /// Joint log probability of a sequence and an explicit state path.
    ///
    /// The path may include silent states; a missing leading start or (on
    /// finite models) trailing end is implied. Transitions absent from the
    /// model, emission mismatches, or leftover symbols make it `ln 0`.
    pub fn path_log_probability(&self, sequence: &[Symbol], path: &[State]) -> f64 {
        let mut logp = 0.0;
        let mut prev = self.start_index;
        let mut consumed = 0usize;
        for (pos, state) in path.iter().enumerate() {
            let Some(idx) = self.index_of(state) else {
                return LOG_ZERO;
            };
            if pos == 0 && idx == self.start_index {
                continue;
            }
            logp += self.transition_log_probability(prev, idx);
            if idx < self.silent_start {
                if consumed >= sequence.len() {
                    return LOG_ZERO;
                }
                let dist = self.states[idx]
                    .distribution
                    .as_ref()
                    .expect("emitting state carries a distribution")
                    .read()
                    .expect("poisoned distribution lock");
                logp += dist.log_probability(&sequence[consumed]);
                consumed += 1;
            }
            prev = idx;
        }
        if consumed != sequence.len() {
            return LOG_ZERO;
        }
        if self.finite && prev != self.end_index {
            logp += self.transition_log_probability(prev, self.end_index);
        }
        logp
    }

    /// Most likely path: `(score, Some(path))` with the path as
    /// `(symbols consumed, state)` pairs including silent states, or
    /// `(ln 0, None)` when no path explains the sequence.
    ///
    /// Emitting steps add the state's decoding weight to the score; ties
    /// keep the first candidate in index order.
    pub fn viterbi(&self, sequence: &[Symbol]) -> (f64, Option<Vec<(usize, State)>>) {
        let n = sequence.len();
        let m = self.n_states();
        let e = self.emissions(sequence);
        let mut v = Array2::from_elem((n + 1, m), LOG_ZERO);
        let mut tb_row = Array2::from_elem((n + 1, m), usize::MAX);
        let mut tb_state = Array2::from_elem((n + 1, m), usize::MAX);

        v[[0, self.start_index]] = 0.0;
        for l in self.silent_start..m {
            if l == self.start_index {
                continue;
            }
            for (k, w, _) in self.in_edges(l) {
                if k >= self.silent_start && k < l {
                    let cand = v[[0, k]] + w;
                    if cand > v[[0, l]] {
                        v[[0, l]] = cand;
                        tb_row[[0, l]] = 0;
                        tb_state[[0, l]] = k;
                    }
                }
            }
        }

        for t in 0..n {
            for l in 0..self.silent_start {
                let mut best = LOG_ZERO;
                let (mut br, mut bs) = (usize::MAX, usize::MAX);
                for (k, w, _) in self.in_edges(l) {
                    let cand = v[[t, k]] + w;
                    if cand > best {
                        best = cand;
                        br = t;
                        bs = k;
                    }
                }
                if best != LOG_ZERO {
                    v[[t + 1, l]] = best + e[[t, l]] + self.state_log_weight[l];
                    tb_row[[t + 1, l]] = br;
                    tb_state[[t + 1, l]] = bs;
                }
            }
            for l in self.silent_start..m {
                for (k, w, _) in self.in_edges(l) {
                    if k < self.silent_start || k < l {
                        let cand = v[[t + 1, k]] + w;
                        if cand > v[[t + 1, l]] {
                            v[[t + 1, l]] = cand;
                            tb_row[[t + 1, l]] = t + 1;
                            tb_state[[t + 1, l]] = k;
                        }
                    }
                }
            }
        }

        let (score, last) = if self.finite {
            (v[[n, self.end_index]], (n, self.end_index))
        } else {
            let mut best = LOG_ZERO;
            let mut bi = usize::MAX;
            for i in 0..self.silent_start {
                if v[[n, i]] > best {
                    best = v[[n, i]];
                    bi = i;
                }
            }
            (best, (n, bi))
        };
        if score == LOG_ZERO || last.1 == usize::MAX {
            return (LOG_ZERO, None);
        }

        let mut cells = vec![last];
        let mut cell = last;
        while cell != (0, self.start_index) {
            let (r, s) = cell;
            let (pr, ps) = (tb_row[[r, s]], tb_state[[r, s]]);
            if ps == usize::MAX {
                break;
            }
            cell = (pr, ps);
            cells.push(cell);
        }
        cells.reverse();
        let path = cells.into_iter().map(|(r, s)| (r, self.states[s].clone())).collect();
        (score, Some(path))
    }

    /// Expected transition counts and posterior emission weights.
    ///
    /// `E[k, l]` is the expected number of `k → l` transitions given the
    /// sequence; `W[t, i]` the posterior weight that emitting state `i`
    /// produced `x_t`. With `tie` set, every member of a tie class receives
    /// the class total so parameter-shared states see one posterior.
    pub fn forward_backward(
        &self,
        sequence: &[Symbol],
        tie: bool,
    ) -> Result<(Array2<f64>, Array2<f64>), KernelError> {
        let n = sequence.len();
        let m = self.n_states();
        let e = self.emissions(sequence);
        let f = self.forward_with(sequence, &e);
        let b = self.backward_with(sequence, &e);
        let logp = self.log_probability_from_forward(&f);
        if logp == LOG_ZERO {
            return Err(KernelError::ImpossibleSequence(self.name.clone()));
        }

        let mut expected = Array2::zeros((m, m));
        for k in 0..m {
            for (l, w, _) in self.out_edges(k) {
                let mut acc = 0.0;
                if l < self.silent_start {
                    for t in 0..n {
                        acc += (f[[t, k]] + w + e[[t, l]] + b[[t + 1, l]] - logp).exp();
                    }
                } else {
                    for t in 0..=n {
                        acc += (f[[t, k]] + w + b[[t, l]] - logp).exp();
                    }
                }
                expected[[k, l]] = acc;
            }
        }

        let mut weights = Array2::zeros((n, self.silent_start));
        for t in 0..n {
            for i in 0..self.silent_start {
                weights[[t, i]] = (f[[t + 1, i]] + b[[t + 1, i]] - logp).exp();
            }
        }
        if tie {
            for class in self.tie_classes() {
                if class.len() < 2 {
                    continue;
                }
                for t in 0..n {
                    let total: f64 = class.iter().map(|&i| weights[[t, i]]).sum();
                    for &i in &class {
                        weights[[t, i]] = total;
                    }
                }
            }
        }
        Ok((expected, weights))
    }

    /// Posterior (MAP) decoding: per-symbol argmax of the posterior weights,
    /// prefixed by start and suffixed by end. The score is the sum of the
    /// winning log posteriors; the path may be transition-illegal.
    pub fn maximum_a_posteriori(
        &self,
        sequence: &[Symbol],
    ) -> Result<(f64, Vec<(usize, State)>), KernelError> {
        let n = sequence.len();
        let (_, weights) = self.forward_backward(sequence, false)?;
        let mut path = Vec::with_capacity(n + 2);
        path.push((0, self.states[self.start_index].clone()));
        let mut score = 0.0;
        for t in 0..n {
            let mut best = f64::NEG_INFINITY;
            let mut bi = 0;
            for i in 0..self.silent_start {
                if weights[[t, i]] > best {
                    best = weights[[t, i]];
                    bi = i;
                }
            }
            score += best.ln();
            path.push((t + 1, self.states[bi].clone()));
        }
        path.push((n, self.states[self.end_index].clone()));
        Ok((score, path))
    }
}

/// Subtract a row's log-sum and push it onto the running scale column.
fn rescale_row(table: &mut Array2<f64>, row: usize, scale: &mut [f64], carry_from: usize) {
    let m = table.ncols();
    let mut c = LOG_ZERO;
    for l in 0..m {
        c = lse(c, table[[row, l]]);
    }
    scale[row] = scale[carry_from];
    if c != LOG_ZERO {
        for l in 0..m {
            table[[row, l]] -= c;
        }
        scale[row] += c;
    }
}

/// Add each row's accumulated scale factor back in.
fn restore_rows(table: &mut Array2<f64>, scale: &[f64]) {
    for (row, &s) in scale.iter().enumerate() {
        if s != 0.0 {
            for l in 0..table.ncols() {
                table[[row, l]] += s;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
