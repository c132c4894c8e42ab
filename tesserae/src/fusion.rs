//! Chain-based fusion. Short chains grow greedily one op at a time; longer
//! chains run a one-dimensional DP over cut points. A second pass merges
//! groups across chains when they share a large input tensor.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use itertools::Itertools;

use crate::cost::{detailed_latency, full_tensor_size, has_matmul, Residency};
use crate::graph::{Boundary, GraphInfo};
use crate::granularity::best_granularity;
use crate::problem::{Granularity, OpIdx, Problem, TensorIdx};
use crate::traversal::best_traversal;

/// Wall-clock budget for fusing a single chain. Tripping it forces the chain
/// into the no-fusion fallback so pathological inputs cannot stall the
/// pipeline.
pub const CHAIN_FUSION_BUDGET: Duration = Duration::from_secs(30);

/// Hard cap on DP segment length; bounds the quadratic work per chain.
const MAX_SEGMENT_OPS: usize = 6;

/// Cross-chain merges never exceed this many ops.
const CROSS_FUSION_MAX_OPS: usize = 8;

/// Ops costlier than this are "heavy": fusing them across chains constrains
/// the shared tile grid and usually loses more than the reuse wins.
const HEAVY_OP_COST: u64 = 2000;

/// Only tensors at least this large drive cross-chain merge proposals.
const SHARED_TENSOR_MIN_SIZE: u64 = 1024;

/// Reject merges whose fused tile overshoots the output by more than 5%.
const PADDING_SLACK: f64 = 1.05;

/// A merge must beat the separate schedules (bridge transfers included) by
/// at least this factor.
const CROSS_FUSION_IMPROVEMENT: f64 = 0.90;

/// Elapsed-time guard carried through one chain's fusion search.
pub struct FusionBudget {
    started: Instant,
    limit: Duration,
}

impl FusionBudget {
    pub fn new(limit: Duration) -> FusionBudget {
        FusionBudget {
            started: Instant::now(),
            limit,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.started.elapsed() > self.limit
    }
}

/// Outcome of attempting to run `ops` as one subgraph.
pub struct FusedCost {
    pub feasible: bool,
    pub granularity: Granularity,
    pub latency: f64,
}

/// Search a granularity for the fused op set and price it with the detailed
/// model. Infeasible fusions report infinite latency.
pub fn try_fuse(problem: &Problem, ops: &[OpIdx], resident: &Residency) -> FusedCost {
    let granularity = best_granularity(problem, ops, resident);
    let ws = crate::cost::working_set(problem, ops, granularity, resident);
    if ws > problem.fast_memory_capacity {
        return FusedCost {
            feasible: false,
            granularity,
            latency: f64::INFINITY,
        };
    }

    let traversal = best_traversal(problem, ops, granularity);
    match detailed_latency(problem, ops, granularity, &[], &traversal, resident) {
        Ok(latency) => FusedCost {
            feasible: true,
            granularity,
            latency,
        },
        Err(_) => FusedCost {
            feasible: false,
            granularity,
            latency: f64::INFINITY,
        },
    }
}

/// Cost of running `ops` one at a time, each at its own best granularity,
/// with an evict-and-reload transfer for every bridging tensor.
fn unfused_estimate(problem: &Problem, ops: &[OpIdx], resident: &Residency) -> f64 {
    let bandwidth = problem.slow_memory_bandwidth as f64;
    let mut total = 0.0;

    for (i, &op_idx) in ops.iter().enumerate() {
        let single = [op_idx];
        let cost = try_fuse(problem, &single, resident);
        total += cost.latency;

        if i < ops.len() - 1 {
            for &out in &problem.ops[op_idx].outputs {
                total += 2.0 * full_tensor_size(problem, out) as f64 / bandwidth;
            }
        }
    }
    total
}

/// Split every op of the chain into its own group.
fn no_fusion_fallback(chain: &[OpIdx]) -> Vec<Vec<OpIdx>> {
    chain.iter().map(|&op| vec![op]).collect()
}

/// Fuse one linear chain into groups: greedy extension for short chains,
/// segment DP for longer ones.
pub fn fuse_chain(
    problem: &Problem,
    chain: &[OpIdx],
    resident: &Residency,
    budget: &FusionBudget,
) -> Vec<Vec<OpIdx>> {
    if chain.len() <= 3 {
        fuse_chain_greedy(problem, chain, resident, budget)
    } else {
        fuse_chain_dp(problem, chain, resident, budget)
    }
}

fn fuse_chain_greedy(
    problem: &Problem,
    chain: &[OpIdx],
    resident: &Residency,
    budget: &FusionBudget,
) -> Vec<Vec<OpIdx>> {
    if chain.len() <= 1 {
        return vec![chain.to_vec()];
    }

    let bandwidth = problem.slow_memory_bandwidth as f64;
    let mut groups: Vec<Vec<OpIdx>> = Vec::new();
    let mut current = vec![chain[0]];

    for (i, &next) in chain.iter().enumerate().skip(1) {
        if budget.exhausted() {
            log::warn!("fusion budget exhausted, splitting chain of {} ops", chain.len());
            return no_fusion_fallback(chain);
        }

        let mut candidate = current.clone();
        candidate.push(next);
        let fused = try_fuse(problem, &candidate, resident);

        if !fused.feasible {
            groups.push(std::mem::replace(&mut current, vec![next]));
            continue;
        }

        let current_cost = try_fuse(problem, &current, resident);
        let next_cost = try_fuse(problem, &[next], &Residency::new());
        let mut separate = current_cost.latency + next_cost.latency;
        for &out in &problem.ops[chain[i - 1]].outputs {
            separate += 2.0 * full_tensor_size(problem, out) as f64 / bandwidth;
        }

        if fused.latency < separate {
            current = candidate;
        } else {
            groups.push(std::mem::replace(&mut current, vec![next]));
        }
    }

    groups.push(current);
    groups
}

/// dp[i] = min over j in [i-6, i) of dp[j] + cost(chain[j..i]), where cost is
/// the fused latency when feasible, otherwise the per-op sum plus bridge
/// transfers for the cut.
fn fuse_chain_dp(
    problem: &Problem,
    chain: &[OpIdx],
    resident: &Residency,
    budget: &FusionBudget,
) -> Vec<Vec<OpIdx>> {
    let n = chain.len();
    if n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![chain.to_vec()];
    }

    let bandwidth = problem.slow_memory_bandwidth as f64;
    let empty = Residency::new();

    let mut dp = vec![f64::INFINITY; n + 1];
    let mut split = vec![0usize; n + 1];
    dp[0] = 0.0;

    for i in 1..=n {
        if budget.exhausted() {
            log::warn!("fusion budget exhausted, splitting chain of {} ops", n);
            return no_fusion_fallback(chain);
        }

        for j in i.saturating_sub(MAX_SEGMENT_OPS)..i {
            let segment = &chain[j..i];
            let seg_resident = if j == 0 { resident } else { &empty };

            let fused = try_fuse(problem, segment, seg_resident);
            let seg_latency = if fused.feasible {
                fused.latency
            } else {
                unfused_estimate(problem, segment, seg_resident)
            };

            // Bridging tensors produced before the cut are evicted and
            // reloaded.
            let mut transfer = 0.0;
            if j > 0 {
                let boundary = Boundary::of(problem, segment);
                for &t in &boundary.inputs {
                    let produced_upstream = chain[..j]
                        .iter()
                        .any(|&prev| problem.ops[prev].outputs.contains(&t));
                    if produced_upstream {
                        transfer += 2.0 * full_tensor_size(problem, t) as f64 / bandwidth;
                    }
                }
            }

            let cost = dp[j] + seg_latency + transfer;
            if cost < dp[i] {
                dp[i] = cost;
                split[i] = j;
            }
        }
    }

    let mut segments = Vec::new();
    let mut i = n;
    while i > 0 {
        let j = split[i];
        segments.push(chain[j..i].to_vec());
        i = j;
    }
    segments.reverse();
    segments
}

/// Merge groups across chains when they share a large boundary input. Merge
/// proposals are visited in strictly descending shared-tensor size; an
/// absorbed group is locked out of further merges.
pub fn cross_chain_fusion(
    problem: &Problem,
    gi: &GraphInfo,
    mut groups: Vec<Vec<OpIdx>>,
) -> Vec<Vec<OpIdx>> {
    if groups.len() <= 1 {
        return groups;
    }

    let mut tensor_to_groups: BTreeMap<TensorIdx, Vec<usize>> = BTreeMap::new();
    for (g_idx, group) in groups.iter().enumerate() {
        let boundary = Boundary::of(problem, group);
        for &t in &boundary.inputs {
            tensor_to_groups.entry(t).or_default().push(g_idx);
        }
    }

    // (g1, g2, shared tensor size)
    let mut candidates: Vec<(usize, usize, u64)> = Vec::new();
    for (&t, g_idxs) in &tensor_to_groups {
        if g_idxs.len() < 2 {
            continue;
        }
        let size = full_tensor_size(problem, t);
        if size < SHARED_TENSOR_MIN_SIZE {
            continue;
        }
        for (&g1, &g2) in g_idxs.iter().tuple_combinations() {
            if gi.can_fuse(&groups[g1], &groups[g2]) {
                candidates.push((g1, g2, size));
            }
        }
    }
    candidates.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| (a.0, a.1).cmp(&(b.0, b.1))));

    let mut baselines: Vec<(f64, Granularity)> = groups
        .iter()
        .map(|group| {
            let cost = try_fuse(problem, group, &Residency::new());
            (cost.latency, cost.granularity)
        })
        .collect();

    let bandwidth = problem.slow_memory_bandwidth as f64;
    let mut merged = vec![false; groups.len()];

    for &(g1, g2, _) in &candidates {
        if merged[g1] || merged[g2] {
            continue;
        }
        if groups[g1].len() + groups[g2].len() > CROSS_FUSION_MAX_OPS {
            continue;
        }

        let heavy = groups[g1]
            .iter()
            .chain(groups[g2].iter())
            .any(|&op| problem.ops[op].base_cost > HEAVY_OP_COST);
        if heavy {
            continue;
        }

        let mut combined: Vec<OpIdx> =
            groups[g1].iter().chain(groups[g2].iter()).copied().collect();
        if !gi.is_topologically_valid(&combined) {
            continue;
        }
        combined = gi.sort_ops_topologically(&combined);

        let fused = try_fuse(problem, &combined, &Residency::new());
        if !fused.feasible {
            continue;
        }

        // Padding guard: the fused tile must not overshoot the output grid.
        let out = problem.tensors[crate::cost::primary_output(problem, &combined)];
        if f64::from(fused.granularity.w.get()) > f64::from(out.width.get()) * PADDING_SLACK {
            continue;
        }
        if f64::from(fused.granularity.h.get()) > f64::from(out.height.get()) * PADDING_SLACK {
            continue;
        }

        // Reduction-depth guard: don't let the merge halve the smaller
        // operand's pre-merge K more than 2×.
        let mut target_k = 0u32;
        if has_matmul(problem, &groups[g1]) {
            target_k = baselines[g1].1.k.get();
        }
        if has_matmul(problem, &groups[g2]) {
            let k2 = baselines[g2].1.k.get();
            if target_k == 0 || k2 < target_k {
                target_k = k2;
            }
        }
        if target_k > 1
            && f64::from(fused.granularity.k.get()) < f64::from(target_k) * 0.5
        {
            continue;
        }

        let mut separate = baselines[g1].0 + baselines[g2].0;
        let b1 = Boundary::of(problem, &groups[g1]);
        let b2 = Boundary::of(problem, &groups[g2]);
        for &t in b1.outputs.intersection(&b2.inputs) {
            separate += 2.0 * full_tensor_size(problem, t) as f64 / bandwidth;
        }
        for &t in b2.outputs.intersection(&b1.inputs) {
            separate += 2.0 * full_tensor_size(problem, t) as f64 / bandwidth;
        }

        if fused.latency < separate * CROSS_FUSION_IMPROVEMENT {
            log::debug!(
                "cross-chain merge: {:?} + {:?} ({:.1} -> {:.1})",
                groups[g1],
                groups[g2],
                separate,
                fused.latency
            );
            groups[g1] = combined;
            merged[g2] = true;
            baselines[g1] = (fused.latency, fused.granularity);
        }
    }

    groups
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !merged[*i])
        .map(|(_, g)| g)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphInfo;
    use crate::problem::testing::*;
    use crate::problem::Problem;

    fn budget() -> FusionBudget {
        FusionBudget::new(CHAIN_FUSION_BUDGET)
    }

    /// Two chained MatMuls whose bridge (t2) fits in capacity alongside both
    /// tile sets.
    fn matmul_pair() -> Problem {
        problem(
            vec![tensor(256, 256); 5],
            vec![matmul(0, 1, 2, 100), matmul(2, 3, 4, 100)],
            300_000,
            10,
            128,
        )
    }

    #[test]
    fn test_greedy_fuses_cheap_pair() {
        let p = matmul_pair();
        let groups = fuse_chain_greedy(&p, &[0, 1], &Residency::new(), &budget());
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn test_greedy_splits_when_infeasible() {
        // Capacity below even the unit working set of the fused pair (three
        // input units plus one output unit): each op stands alone.
        let mut p = matmul_pair();
        p.fast_memory_capacity = 2;
        let groups = fuse_chain_greedy(&p, &[0, 1], &Residency::new(), &budget());
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_exhausted_budget_forces_no_fusion() {
        let p = matmul_pair();
        let spent = FusionBudget::new(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(spent.exhausted());
        let groups = fuse_chain(&p, &[0, 1], &Residency::new(), &spent);
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_dp_matches_greedy_on_uniform_chain() {
        // A 5-op pointwise chain over small tensors: everything fuses.
        let p = problem(
            vec![tensor(128, 128); 6],
            vec![
                pointwise(&[0], 1, 10),
                pointwise(&[1], 2, 10),
                pointwise(&[2], 3, 10),
                pointwise(&[3], 4, 10),
                pointwise(&[4], 5, 10),
            ],
            100_000,
            10,
            128,
        );
        let chain = [0, 1, 2, 3, 4];
        let groups = fuse_chain_dp(&p, &chain, &Residency::new(), &budget());
        assert_eq!(groups, vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn test_dp_respects_segment_cap() {
        // An 8-op chain can never come back as a single 8-op segment.
        let p = problem(
            vec![tensor(128, 128); 9],
            vec![
                pointwise(&[0], 1, 10),
                pointwise(&[1], 2, 10),
                pointwise(&[2], 3, 10),
                pointwise(&[3], 4, 10),
                pointwise(&[4], 5, 10),
                pointwise(&[5], 6, 10),
                pointwise(&[6], 7, 10),
                pointwise(&[7], 8, 10),
            ],
            100_000,
            10,
            128,
        );
        let chain: Vec<usize> = (0..8).collect();
        let groups = fuse_chain_dp(&p, &chain, &Residency::new(), &budget());
        assert!(groups.iter().all(|g| g.len() <= MAX_SEGMENT_OPS));
        let flattened: Vec<usize> = groups.concat();
        assert_eq!(flattened, chain);
    }

    #[test]
    fn test_cross_chain_merges_shared_large_input() {
        // Two pointwise consumers of one large tensor: fusing loads it once.
        let p = problem(
            vec![tensor(1024, 1024); 3],
            vec![pointwise(&[0], 1, 10), pointwise(&[0], 2, 10)],
            60000,
            1,
            128,
        );
        let gi = GraphInfo::analyze(&p).unwrap();
        let groups = cross_chain_fusion(&p, &gi, vec![vec![0], vec![1]]);
        assert_eq!(groups, vec![vec![0, 1]]);
    }

    #[test]
    fn test_cross_chain_rejects_heavy_ops() {
        let p = problem(
            vec![tensor(1024, 1024); 3],
            vec![pointwise(&[0], 1, 5000), pointwise(&[0], 2, 5000)],
            60000,
            1,
            128,
        );
        let gi = GraphInfo::analyze(&p).unwrap();
        let groups = cross_chain_fusion(&p, &gi, vec![vec![0], vec![1]]);
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_cross_chain_ignores_small_shared_tensors() {
        // 16×16 = 256 units, below the sharing threshold.
        let p = problem(
            vec![tensor(16, 16); 3],
            vec![pointwise(&[0], 1, 10), pointwise(&[0], 2, 10)],
            60000,
            1,
            16,
        );
        let gi = GraphInfo::analyze(&p).unwrap();
        let groups = cross_chain_fusion(&p, &gi, vec![vec![0], vec![1]]);
        assert_eq!(groups, vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_cross_chain_rejects_cycle_forming_merge() {
        // All three ops consume the shared tensor t0, so every pair is
        // proposed, but merging {0, 2} would sandwich op 1 between them.
        let p = problem(
            vec![tensor(2048, 2048); 4],
            vec![
                pointwise(&[0], 1, 10),
                pointwise(&[1, 0], 2, 10),
                pointwise(&[2, 0], 3, 10),
            ],
            u64::MAX,
            1,
            128,
        );
        let gi = GraphInfo::analyze(&p).unwrap();
        let groups = cross_chain_fusion(&p, &gi, vec![vec![0], vec![1], vec![2]]);
        for g in &groups {
            assert!(gi.is_topologically_valid(g));
            assert!(
                !(g.contains(&0) && g.contains(&2) && !g.contains(&1)),
                "ops 0 and 2 merged around op 1: {g:?}"
            );
        }
    }
}
