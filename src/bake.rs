//! Baking: compiling the graph into the immutable model
//!
//! Deterministic pipeline from a [`ModelBuilder`] to a [`Model`]:
//!
//! 1. **Parallel-edge merge** — duplicate `a → b` edges sum probabilities
//!    and pseudocounts.
//! 2. **Orphan pruning** — iteratively drop states (other than start/end)
//!    with no incoming or no outgoing edges, to a fixed point.
//! 3. **Outgoing normalization** — each non-end row is scaled so its
//!    probabilities sum to one; the sum is rounded to 8 decimals first so
//!    float dust does not trigger a rescale.
//! 4. **Silent-state merge** — under [`MergePolicy::Partial`]/[`All`](MergePolicy::All),
//!    a unit-probability edge out of a silent state is contracted: edges
//!    into the source are redirected to the target (pseudocount becomes the
//!    max of the redirected edge's and the unit edge's), to a fixed point.
//! 5. **Ordering** — emitting states first (insertion order), then silent
//!    states in topological order, so silent-to-silent edges always go from
//!    lower to higher index. A silent cycle rejects the bake.
//! 6. **Tie discovery** — emitting states sharing one distribution handle
//!    form a tie class, stored as a CSR table of co-members.
//! 7. **Edge CSR construction** — both out- and in-edge stores, plus the
//!    out→in index map training uses to mirror updates.
//! 8. **State weights** — per-emitting-state `ln(weight)` for Viterbi.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::builder::ModelBuilder;
use crate::model::Model;
use crate::numerics::{ln_weight, round8};

/// How aggressively unit-probability edges out of silent states are
/// contracted during the bake.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Keep the graph as edited.
    None,
    /// Contract silent → silent unit edges only.
    Partial,
    /// Contract silent → anything unit edges.
    #[default]
    All,
}

/// Structural errors detected while baking.
#[derive(Debug, Error)]
pub enum BakeError {
    #[error("model `{0}` has no emitting states left after pruning")]
    Empty(String),
    #[error("silent states form a cycle (through `{0}`)")]
    SilentCycle(String),
    #[error("state `{0}` has non-positive weight {1}")]
    NonPositiveWeight(String, f64),
}

#[derive(Copy, Clone, Debug)]
struct MergedEdge {
    probability: f64,
    pseudocount: f64,
}

pub(crate) fn bake(builder: ModelBuilder, merge: MergePolicy) -> Result<Model, BakeError> {
    let ModelBuilder { name, states, edges: raw_edges, start, end } = builder;
    let n = states.len();

    let slot_of: HashMap<_, _> = states.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();
    let start_slot = slot_of[&start];
    let end_slot = slot_of[&end];

    for s in &states {
        if !(s.weight > 0.0) {
            return Err(BakeError::NonPositiveWeight(s.name.clone(), s.weight));
        }
    }

    // 1. Merge parallel edges.
    let mut edges: BTreeMap<(usize, usize), MergedEdge> = BTreeMap::new();
    for e in raw_edges {
        let key = (slot_of[&e.from], slot_of[&e.to]);
        let slot = edges
            .entry(key)
            .or_insert(MergedEdge { probability: 0.0, pseudocount: 0.0 });
        slot.probability += e.probability;
        slot.pseudocount += e.pseudocount;
    }

    // 2. Orphan pruning to a fixed point.
    let mut alive = vec![true; n];
    loop {
        let mut in_deg = vec![0usize; n];
        let mut out_deg = vec![0usize; n];
        for (&(f, t), _) in &edges {
            if alive[f] && alive[t] {
                out_deg[f] += 1;
                in_deg[t] += 1;
            }
        }
        let mut changed = false;
        for s in 0..n {
            if alive[s] && s != start_slot && s != end_slot && (in_deg[s] == 0 || out_deg[s] == 0) {
                debug!(state = %states[s].name, "pruning orphan state");
                alive[s] = false;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    edges.retain(|&(f, t), _| alive[f] && alive[t]);

    // 3. Outgoing normalization (end excluded).
    for s in 0..n {
        if !alive[s] || s == end_slot {
            continue;
        }
        let z: f64 = edges
            .iter()
            .filter(|(&(f, _), _)| f == s)
            .map(|(_, e)| e.probability)
            .sum();
        let z = round8(z);
        if z > 0.0 && z != 1.0 {
            debug!(state = %states[s].name, sum = z, "normalizing outgoing probabilities");
            for (_, e) in edges.iter_mut().filter(|(&(f, _), _)| f == s) {
                e.probability /= z;
            }
        }
    }

    // 4. Silent-state merge to a fixed point.
    if merge != MergePolicy::None {
        loop {
            let found = edges.iter().find_map(|(&(a, b), e)| {
                let contractible = a != b
                    && a != start_slot
                    && b != end_slot
                    && states[a].is_silent()
                    && (merge == MergePolicy::All || states[b].is_silent())
                    && round8(e.probability) == 1.0;
                contractible.then_some((a, b, e.pseudocount))
            });
            let Some((a, b, unit_pc)) = found else { break };
            debug!(from = %states[a].name, into = %states[b].name, "merging silent state");

            let incoming: Vec<(usize, MergedEdge)> = edges
                .iter()
                .filter(|(&(f, t), _)| t == a && f != a)
                .map(|(&(f, _), &e)| (f, e))
                .collect();
            for (x, e) in incoming {
                let slot = edges
                    .entry((x, b))
                    .or_insert(MergedEdge { probability: 0.0, pseudocount: 0.0 });
                slot.probability += e.probability;
                slot.pseudocount = slot.pseudocount.max(e.pseudocount.max(unit_pc));
            }
            alive[a] = false;
            edges.retain(|&(f, t), _| f != a && t != a);
        }
    }

    // 5. Partition and order: emitting first, then silent topologically.
    let emitting: Vec<usize> = (0..n).filter(|&s| alive[s] && !states[s].is_silent()).collect();
    let silent: Vec<usize> = (0..n).filter(|&s| alive[s] && states[s].is_silent()).collect();
    if emitting.is_empty() {
        return Err(BakeError::Empty(name));
    }

    let silent_order = topological_silent_order(&silent, &edges)
        .map_err(|slot| BakeError::SilentCycle(states[slot].name.clone()))?;

    let silent_start = emitting.len();
    let order: Vec<usize> = emitting.iter().chain(silent_order.iter()).copied().collect();
    let mut new_index = vec![usize::MAX; n];
    for (idx, &slot) in order.iter().enumerate() {
        new_index[slot] = idx;
    }
    let m = order.len();
    let start_index = new_index[start_slot];
    let end_index = new_index[end_slot];

    let baked_states: Vec<_> = order.iter().map(|&slot| states[slot].clone()).collect();

    // 6. Tie discovery over emitting states, CSR with self excluded.
    let mut tie_rows: Vec<Vec<usize>> = vec![Vec::new(); silent_start];
    for i in 0..silent_start {
        for j in (i + 1)..silent_start {
            let (Some(di), Some(dj)) =
                (&baked_states[i].distribution, &baked_states[j].distribution)
            else {
                continue;
            };
            if Arc::ptr_eq(di, dj) {
                tie_rows[i].push(j);
                tie_rows[j].push(i);
            }
        }
    }
    let mut tie_offset = Vec::with_capacity(silent_start + 1);
    let mut tie_member = Vec::new();
    tie_offset.push(0);
    for row in &tie_rows {
        tie_member.extend_from_slice(row);
        tie_offset.push(tie_member.len());
    }

    // 7. Edge CSR stores, out-major and in-major, plus the out→in map.
    let mut flat: Vec<(usize, usize, f64, f64)> = edges
        .iter()
        .map(|(&(f, t), e)| (new_index[f], new_index[t], e.probability.ln(), e.pseudocount))
        .collect();

    flat.sort_by_key(|&(f, t, _, _)| (f, t));
    let mut out_offset = vec![0usize; m + 1];
    let mut out_target = Vec::with_capacity(flat.len());
    let mut out_log_p = Vec::with_capacity(flat.len());
    let mut out_pc = Vec::with_capacity(flat.len());
    for &(f, t, lp, pc) in &flat {
        out_offset[f + 1] += 1;
        out_target.push(t);
        out_log_p.push(lp);
        out_pc.push(pc);
    }
    for k in 0..m {
        out_offset[k + 1] += out_offset[k];
    }

    let mut flat_in = flat.clone();
    flat_in.sort_by_key(|&(f, t, _, _)| (t, f));
    let mut in_offset = vec![0usize; m + 1];
    let mut in_source = Vec::with_capacity(flat_in.len());
    let mut in_log_p = Vec::with_capacity(flat_in.len());
    let mut in_pc = Vec::with_capacity(flat_in.len());
    let mut in_pos: HashMap<(usize, usize), usize> = HashMap::with_capacity(flat_in.len());
    for (pos, &(f, t, lp, pc)) in flat_in.iter().enumerate() {
        in_offset[t + 1] += 1;
        in_source.push(f);
        in_log_p.push(lp);
        in_pc.push(pc);
        in_pos.insert((f, t), pos);
    }
    for k in 0..m {
        in_offset[k + 1] += in_offset[k];
    }

    let out_to_in: Vec<usize> = flat.iter().map(|&(f, t, _, _)| in_pos[&(f, t)]).collect();

    // 8. Viterbi decoding weights for emitting states.
    let state_log_weight: Vec<f64> =
        baked_states[..silent_start].iter().map(|s| ln_weight(s.weight)).collect();

    let finite = in_offset[end_index + 1] > in_offset[end_index];
    let state_index: HashMap<_, _> =
        baked_states.iter().enumerate().map(|(i, s)| (s.id(), i)).collect();

    Ok(Model {
        name,
        states: baked_states,
        silent_start,
        start_index,
        end_index,
        finite,
        out_offset,
        out_target,
        out_log_p,
        out_pc,
        in_offset,
        in_source,
        in_log_p,
        in_pc,
        out_to_in,
        tie_offset,
        tie_member,
        state_log_weight,
        state_index,
    })
}

/// Kahn's algorithm over the silent-only subgraph, smallest slot first so
/// the order is deterministic. Returns a leftover slot on a cycle.
fn topological_silent_order(
    silent: &[usize],
    edges: &BTreeMap<(usize, usize), MergedEdge>,
) -> Result<Vec<usize>, usize> {
    let is_silent: HashMap<usize, ()> = silent.iter().map(|&s| (s, ())).collect();
    let mut in_deg: HashMap<usize, usize> = silent.iter().map(|&s| (s, 0)).collect();
    for &(f, t) in edges.keys() {
        if is_silent.contains_key(&f) && is_silent.contains_key(&t) {
            *in_deg.get_mut(&t).expect("silent target") += 1;
        }
    }

    let mut order = Vec::with_capacity(silent.len());
    let mut ready: Vec<usize> = silent.iter().copied().filter(|s| in_deg[s] == 0).collect();
    while !ready.is_empty() {
        ready.sort_unstable();
        let s = ready.remove(0);
        order.push(s);
        for (&(f, t), _) in edges {
            if f == s && is_silent.contains_key(&t) {
                let d = in_deg.get_mut(&t).expect("silent target");
                *d -= 1;
                if *d == 0 {
                    ready.push(t);
                }
            }
        }
    }

    if order.len() == silent.len() {
        Ok(order)
    } else {
        let leftover =
            silent.iter().copied().find(|s| !order.contains(s)).expect("cycle member");
        Err(leftover)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::Distribution;
    use crate::state::State;

    fn uniform01() -> Distribution {
        Distribution::uniform(0.0, 1.0).unwrap()
    }

    #[test]
    fn normalization_rescales_rows_to_one() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        let s2 = State::with_distribution("s2", uniform01());
        b.add_states([s1.clone(), s2.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 0.3, None).unwrap();
        b.add_transition(&start, &s2, 0.3, None).unwrap();
        b.add_transition(&s1, &s1, 0.2, None).unwrap();
        b.add_transition(&s1, &end, 0.2, None).unwrap();
        b.add_transition(&s2, &s2, 1.0, None).unwrap();
        b.add_transition(&s2, &end, 1.0, None).unwrap();

        let m = b.bake(MergePolicy::None).unwrap();
        for k in 0..m.n_states() {
            if k == m.end_index() {
                continue;
            }
            let total: f64 = m.out_edges(k).map(|(_, lp, _)| lp.exp()).sum();
            assert!((total - 1.0).abs() < 1e-8, "row {k} sums to {total}");
        }
        // start was rescaled from 0.6, s1 from 0.4, s2 from 2.0.
        let start_idx = m.start_index();
        let (_, lp, _) = m.out_edges(start_idx).next().unwrap();
        assert!((lp.exp() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn orphans_are_pruned_transitively() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        // d1 → d2 dangle off s1 and never reach end: both must go.
        let d1 = State::with_distribution("d1", uniform01());
        let d2 = State::with_distribution("d2", uniform01());
        b.add_states([s1.clone(), d1.clone(), d2.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &end, 0.5, None).unwrap();
        b.add_transition(&s1, &d1, 0.5, None).unwrap();
        b.add_transition(&d1, &d2, 1.0, None).unwrap();

        let m = b.bake(MergePolicy::None).unwrap();
        assert_eq!(m.silent_start(), 1, "only s1 survives among emitting states");
        // s1's dangling edge went with d1, so its row renormalized to end.
        let total: f64 = m.out_edges(0).map(|(_, lp, _)| lp.exp()).sum();
        assert!((total - 1.0).abs() < 1e-8);
    }

    #[test]
    fn everything_pruned_is_an_empty_model() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        b.add_state(s1.clone()).unwrap();
        let start = b.start().clone();
        // s1 never reaches end: pruned, leaving no emitting states.
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        assert!(matches!(b.bake(MergePolicy::None), Err(BakeError::Empty(_))));
    }

    #[test]
    fn silent_cycles_reject_the_bake() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        let a = State::silent("a");
        let c = State::silent("c");
        b.add_states([s1.clone(), a.clone(), c.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &a, 0.5, None).unwrap();
        b.add_transition(&s1, &end, 0.5, None).unwrap();
        b.add_transition(&a, &c, 0.5, None).unwrap();
        b.add_transition(&c, &a, 1.0, None).unwrap();
        b.add_transition(&a, &s1, 0.5, None).unwrap();

        assert!(matches!(b.bake(MergePolicy::None), Err(BakeError::SilentCycle(_))));
    }

    #[test]
    fn silent_edges_run_from_lower_to_higher_index() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        // Chain of silent states declared in reverse order.
        let c3 = State::silent("c3");
        let c2 = State::silent("c2");
        let c1 = State::silent("c1");
        b.add_states([s1.clone(), c3.clone(), c2.clone(), c1.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &c1, 0.5, None).unwrap();
        b.add_transition(&s1, &s1, 0.5, None).unwrap();
        b.add_transition(&c1, &c2, 1.0, Some(0.0)).unwrap();
        b.add_transition(&c2, &c3, 1.0, Some(0.0)).unwrap();
        b.add_transition(&c3, &end, 1.0, None).unwrap();

        let m = b.bake(MergePolicy::None).unwrap();
        for k in m.silent_start()..m.n_states() {
            for (l, _, _) in m.out_edges(k) {
                if l >= m.silent_start() {
                    assert!(l > k, "silent edge {k} → {l} violates topological order");
                }
            }
        }
    }

    #[test]
    fn partial_merge_contracts_silent_unit_chains() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        let c1 = State::silent("c1");
        let c2 = State::silent("c2");
        b.add_states([s1.clone(), c1.clone(), c2.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &c1, 1.0, None).unwrap();
        b.add_transition(&c1, &c2, 1.0, Some(0.25)).unwrap();
        b.add_transition(&c2, &end, 1.0, None).unwrap();

        let merged = b.clone().bake(MergePolicy::Partial).unwrap();
        // c1 collapses into c2 (c2 → end survives because end is excluded).
        assert_eq!(merged.n_states(), 4);
        let unmerged = b.bake(MergePolicy::None).unwrap();
        assert_eq!(unmerged.n_states(), 5);
    }

    #[test]
    fn all_merge_contracts_into_emitting_targets_too() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01());
        let c1 = State::silent("c1");
        b.add_states([s1.clone(), c1.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &c1, 1.0, None).unwrap();
        b.add_transition(&c1, &s1, 1.0, Some(0.75)).unwrap();
        b.add_transition(&s1, &end, 1.0, None).unwrap();

        let partial = b.clone().bake(MergePolicy::Partial).unwrap();
        assert_eq!(partial.n_states(), 4, "partial keeps the silent → emitting hop");

        let all = b.bake(MergePolicy::All).unwrap();
        assert_eq!(all.n_states(), 3, "all contracts c1 into s1");
        // start → s1 carries the max of the redirected and unit pseudocounts.
        let start_idx = all.start_index();
        let (_, lp, pc) = all.out_edges(start_idx).next().unwrap();
        assert!((lp.exp() - 1.0).abs() < 1e-12);
        assert_eq!(pc, 1.0, "max(pc(start→c1)=1, pc(c1→s1)=0.75)");
    }

    #[test]
    fn parallel_edges_merge_and_ties_are_symmetric() {
        let mut b = ModelBuilder::new("m");
        let shared = uniform01().shared();
        let s1 = State::emitting("s1", shared.clone());
        let s2 = State::emitting("s2", shared.clone());
        let s3 = State::with_distribution("s3", uniform01());
        b.add_states([s1.clone(), s2.clone(), s3.clone()]).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 0.25, None).unwrap();
        b.add_transition(&start, &s1, 0.25, None).unwrap();
        b.add_transition(&start, &s2, 0.25, None).unwrap();
        b.add_transition(&start, &s3, 0.25, None).unwrap();
        for s in [&s1, &s2, &s3] {
            b.add_transition(s, &end, 1.0, None).unwrap();
        }

        let m = b.bake(MergePolicy::None).unwrap();
        // The doubled start → s1 edge merged into one of probability 0.5.
        let to_s1: Vec<_> = m
            .out_edges(m.start_index())
            .filter(|&(t, _, _)| m.state(t).name == "s1")
            .collect();
        assert_eq!(to_s1.len(), 1);
        assert!((to_s1[0].1.exp() - 0.5).abs() < 1e-8);

        // Tie table: s1 and s2 list each other, s3 lists nobody.
        let classes = m.tie_classes();
        let sizes: Vec<usize> = classes.iter().map(Vec::len).collect();
        assert!(sizes.contains(&2) && sizes.contains(&1));
    }

    #[test]
    fn finiteness_follows_the_end_in_degree() {
        let mut b = ModelBuilder::new("finite");
        let s1 = State::with_distribution("s1", uniform01());
        b.add_state(s1.clone()).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &s1, 0.5, None).unwrap();
        b.add_transition(&s1, &end, 0.5, None).unwrap();
        assert!(b.bake(MergePolicy::None).unwrap().is_finite());

        let mut b = ModelBuilder::new("infinite");
        let s1 = State::with_distribution("s1", uniform01());
        b.add_state(s1.clone()).unwrap();
        let start = b.start().clone();
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &s1, 1.0, None).unwrap();
        assert!(!b.bake(MergePolicy::None).unwrap().is_finite());
    }

    #[test]
    fn non_positive_state_weight_is_rejected() {
        let mut b = ModelBuilder::new("m");
        let s1 = State::with_distribution("s1", uniform01()).weighted(0.0);
        b.add_state(s1.clone()).unwrap();
        let (start, end) = (b.start().clone(), b.end().clone());
        b.add_transition(&start, &s1, 1.0, None).unwrap();
        b.add_transition(&s1, &end, 1.0, None).unwrap();
        assert!(matches!(b.bake(MergePolicy::None), Err(BakeError::NonPositiveWeight(..))));
    }
}
