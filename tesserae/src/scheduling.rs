//! Group-level scheduling: order fused groups by their dependencies, breaking
//! ties toward reuse of the previously scheduled group's tensors.

use std::collections::BTreeSet;

use crate::cost::full_tensor_size;
use crate::graph::{Boundary, GraphInfo};
use crate::problem::{Granularity, OpIdx, Problem, TensorIdx};

/// One scheduled subgraph under construction. Granularity, traversal,
/// retention and latency are filled in by the later pipeline phases.
#[derive(Clone, Debug)]
pub struct ScheduleEntry {
    pub ops: Vec<OpIdx>,
    pub granularity: Granularity,
    pub traversal: Vec<usize>,
    pub retain: Vec<TensorIdx>,
    pub latency: f64,
}

impl ScheduleEntry {
    fn new(ops: Vec<OpIdx>) -> ScheduleEntry {
        ScheduleEntry {
            ops,
            granularity: Granularity::UNIT,
            traversal: Vec::new(),
            retain: Vec::new(),
            latency: 0.0,
        }
    }
}

/// Kahn ordering over the group DAG. Whenever several groups are ready, the
/// one whose boundary inputs score highest against the last scheduled group
/// goes first. A cycle cannot occur for well-formed groups; defensively, the
/// remainder is scheduled in index order with a warning.
pub fn build_schedule(
    problem: &Problem,
    gi: &GraphInfo,
    groups: Vec<Vec<OpIdx>>,
) -> Vec<ScheduleEntry> {
    let num_groups = groups.len();

    let mut group_of = vec![0usize; problem.ops.len()];
    for (g_idx, group) in groups.iter().enumerate() {
        for &op in group {
            group_of[op] = g_idx;
        }
    }

    let mut group_deps: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); num_groups];
    let mut group_dependents: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); num_groups];
    for (g_idx, group) in groups.iter().enumerate() {
        for &op in group {
            for &dep_op in &gi.dependencies[op] {
                let dep_group = group_of[dep_op];
                if dep_group != g_idx {
                    group_deps[g_idx].insert(dep_group);
                    group_dependents[dep_group].insert(g_idx);
                }
            }
        }
    }

    let boundary_inputs: Vec<BTreeSet<TensorIdx>> = groups
        .iter()
        .map(|group| Boundary::of(problem, group).inputs)
        .collect();

    let mut in_degree: Vec<usize> = group_deps.iter().map(|d| d.len()).collect();
    let mut remaining: BTreeSet<usize> = (0..num_groups).collect();
    let mut order: Vec<usize> = Vec::with_capacity(num_groups);
    let mut last_scheduled: Option<usize> = None;

    while order.len() < num_groups {
        let mut ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&g| in_degree[g] == 0)
            .collect();

        if ready.is_empty() {
            log::warn!("cycle detected in group dependencies; scheduling remainder in order");
            ready.extend(remaining.iter().copied());
        }

        if let Some(last) = last_scheduled {
            if ready.len() > 1 {
                let last_outputs = Boundary::of(problem, &groups[last]).outputs;
                let last_inputs = &boundary_inputs[last];
                // Stable sort: equal scores keep ascending group order.
                ready.sort_by(|&a, &b| {
                    let score_a = affinity(problem, &boundary_inputs[a], &last_outputs, last_inputs);
                    let score_b = affinity(problem, &boundary_inputs[b], &last_outputs, last_inputs);
                    score_b.total_cmp(&score_a)
                });
            }
        }

        let chosen = ready[0];
        order.push(chosen);
        remaining.remove(&chosen);
        last_scheduled = Some(chosen);

        for &dep in &group_dependents[chosen] {
            in_degree[dep] = in_degree[dep].saturating_sub(1);
        }
    }

    let mut groups = groups;
    order
        .into_iter()
        .map(|g_idx| ScheduleEntry::new(std::mem::take(&mut groups[g_idx])))
        .collect()
}

/// Affinity of a candidate group toward the previous group's tensors: weight
/// 2 per unit for tensors the previous group produced, 1 for tensors it also
/// consumed.
fn affinity(
    problem: &Problem,
    next_inputs: &BTreeSet<TensorIdx>,
    last_outputs: &BTreeSet<TensorIdx>,
    last_inputs: &BTreeSet<TensorIdx>,
) -> f64 {
    let mut score = 0.0;
    for &t in next_inputs {
        if last_outputs.contains(&t) {
            score += full_tensor_size(problem, t) as f64 * 2.0;
        }
        if last_inputs.contains(&t) {
            score += full_tensor_size(problem, t) as f64;
        }
    }
    score
}
