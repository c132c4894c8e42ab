//! The optimization pipeline: analyze, fuse, schedule, pick granularities and
//! traversals, plan and prune retention, and validate the composed schedule,
//! with a recovery pass and a single-op baseline as safety nets.

use crate::cost::{
    detailed_latency, evaluate, working_set, working_set_with_retained, Residency,
};
use crate::fusion::{cross_chain_fusion, fuse_chain, FusionBudget, CHAIN_FUSION_BUDGET};
use crate::graph::GraphInfo;
use crate::granularity::{best_granularity, best_granularity_with_retained};
use crate::problem::{Problem, Solution, Subgraph, ValidationError};
use crate::retention::{plan_retention, plan_retention_simple, prune_retentions};
use crate::scheduling::{build_schedule, ScheduleEntry};
use crate::traversal::best_traversal;

/// Deterministic end-to-end optimization. Fails only on a structurally
/// invalid problem; every valid problem yields a valid schedule, in the worst
/// case the single-op baseline.
pub fn solve(problem: &Problem) -> Result<Solution, ValidationError> {
    problem.validate()?;
    let gi = GraphInfo::analyze(problem)?;
    log::info!(
        "graph: {} ops, {} inputs, {} outputs",
        problem.ops.len(),
        gi.graph_inputs.len(),
        gi.graph_outputs.len()
    );

    let solution = optimize_schedule(problem, &gi);

    match evaluate(problem, &solution) {
        Ok(total) => {
            log::info!("final latency: {total:.1}");
            Ok(solution)
        }
        Err(err) => {
            log::warn!("validation failed ({err}); attempting recovery");
            let recovered = recover_solution(problem, &gi, &solution);
            match evaluate(problem, &recovered) {
                Ok(total) => {
                    log::info!("recovered; final latency: {total:.1}");
                    Ok(recovered)
                }
                Err(err) => {
                    log::warn!("recovery failed ({err}); falling back to baseline");
                    Ok(baseline_solution(problem, &gi))
                }
            }
        }
    }
}

fn optimize_schedule(problem: &Problem, gi: &GraphInfo) -> Solution {
    // Phase 1: intra-chain fusion.
    let chains = gi.linear_chains(problem);
    log::info!("found {} linear chains", chains.len());

    let mut groups = Vec::new();
    for chain in &chains {
        let budget = FusionBudget::new(CHAIN_FUSION_BUDGET);
        groups.extend(fuse_chain(problem, chain, &Residency::new(), &budget));
    }
    log::info!("{} groups after chain fusion", groups.len());

    // Phase 2: merge across chains on shared large inputs.
    let groups = cross_chain_fusion(problem, gi, groups);
    log::info!("{} groups after cross-chain fusion", groups.len());

    // Phase 3: order the groups.
    let mut schedule = build_schedule(problem, gi, groups);

    // Phase 4: granularity and traversal per group under live residency.
    for i in 0..schedule.len() {
        let resident = resident_before(&schedule, i);
        let g = best_granularity(problem, &schedule[i].ops, &resident);
        let traversal = best_traversal(problem, &schedule[i].ops, g);
        schedule[i].granularity = g;
        schedule[i].traversal = traversal;
    }

    // Phase 5: plan retention along the schedule.
    for i in 0..schedule.len() {
        let resident = resident_before(&schedule, i);
        let retain = plan_retention(problem, i, &schedule, &resident);
        schedule[i].retain = retain;
    }

    // Phase 6: re-pick granularity where retention no longer fits, then pin
    // each group's latency.
    for i in 0..schedule.len() {
        let resident = resident_before(&schedule, i);
        let ws = working_set_with_retained(
            problem,
            &schedule[i].ops,
            schedule[i].granularity,
            &resident,
            &schedule[i].retain,
        );
        if ws > problem.fast_memory_capacity {
            let g = best_granularity_with_retained(
                problem,
                &schedule[i].ops,
                &resident,
                &schedule[i].retain,
            );
            let traversal = best_traversal(problem, &schedule[i].ops, g);
            schedule[i].granularity = g;
            schedule[i].traversal = traversal;
        }

        let latency = detailed_latency(
            problem,
            &schedule[i].ops,
            schedule[i].granularity,
            &schedule[i].retain,
            &schedule[i].traversal,
            &resident,
        )
        .unwrap_or(0.0);
        schedule[i].latency = latency;
    }

    // Phase 7: drop retentions that do not pay for themselves.
    prune_retentions(problem, &mut schedule);

    Solution {
        subgraphs: schedule.into_iter().map(entry_to_subgraph).collect(),
    }
}

fn resident_before(schedule: &[ScheduleEntry], i: usize) -> Residency {
    if i > 0 {
        schedule[i - 1].retain.iter().copied().collect()
    } else {
        Residency::new()
    }
}

fn entry_to_subgraph(entry: ScheduleEntry) -> Subgraph {
    Subgraph {
        ops: entry.ops,
        granularity: entry.granularity,
        tensors_to_retain: entry.retain,
        traversal_order: entry.traversal,
        latency: entry.latency,
    }
}

/// Keep the broken solution's grouping but recompute everything else
/// conservatively; groups that still cannot fit are split into single ops,
/// dropping prior retentions at that position.
fn recover_solution(problem: &Problem, gi: &GraphInfo, broken: &Solution) -> Solution {
    let mut subgraphs: Vec<Subgraph> = Vec::new();
    let mut resident = Residency::new();

    for (i, broken_sg) in broken.subgraphs.iter().enumerate() {
        let ops = gi.sort_ops_topologically(&broken_sg.ops);
        let g = best_granularity(problem, &ops, &resident);

        if working_set(problem, &ops, g, &resident) > problem.fast_memory_capacity {
            for &op_idx in &ops {
                let single = vec![op_idx];
                let mut single_g = best_granularity(problem, &single, &resident);
                if working_set(problem, &single, single_g, &resident)
                    > problem.fast_memory_capacity
                {
                    // Evict everything retained and retry.
                    resident.clear();
                    single_g = best_granularity(problem, &single, &resident);
                }

                let traversal = best_traversal(problem, &single, single_g);
                let latency =
                    detailed_latency(problem, &single, single_g, &[], &traversal, &resident)
                        .unwrap_or(0.0);
                subgraphs.push(Subgraph {
                    ops: single,
                    granularity: single_g,
                    tensors_to_retain: Vec::new(),
                    traversal_order: traversal,
                    latency,
                });
                resident.clear();
            }
            continue;
        }

        let traversal = best_traversal(problem, &ops, g);

        let mut retain = Vec::new();
        if i + 1 < broken.subgraphs.len() {
            let next_ops = gi.sort_ops_topologically(&broken.subgraphs[i + 1].ops);
            let next_g = best_granularity(problem, &next_ops, &Residency::new());
            let next_entry = ScheduleEntry {
                ops: next_ops,
                granularity: next_g,
                traversal: Vec::new(),
                retain: Vec::new(),
                latency: 0.0,
            };
            retain = plan_retention_simple(problem, &ops, &next_entry, &resident);

            if working_set_with_retained(problem, &ops, g, &resident, &retain)
                > problem.fast_memory_capacity
            {
                retain.clear();
            }
        }

        let latency = detailed_latency(problem, &ops, g, &retain, &traversal, &resident)
            .unwrap_or(0.0);
        subgraphs.push(Subgraph {
            ops,
            granularity: g,
            tensors_to_retain: retain.clone(),
            traversal_order: traversal,
            latency,
        });

        resident = retain.into_iter().collect();
    }

    Solution { subgraphs }
}

/// The safe fallback: one op per subgraph in topological order, no retention,
/// best single-op granularity and traversal.
pub fn baseline_solution(problem: &Problem, gi: &GraphInfo) -> Solution {
    let subgraphs = gi
        .topo_order
        .iter()
        .map(|&op_idx| {
            let ops = vec![op_idx];
            let g = best_granularity(problem, &ops, &Residency::new());
            let traversal = best_traversal(problem, &ops, g);
            let latency = detailed_latency(problem, &ops, g, &[], &traversal, &Residency::new())
                .unwrap_or(0.0);
            Subgraph {
                ops,
                granularity: g,
                tensors_to_retain: Vec::new(),
                traversal_order: traversal,
                latency,
            }
        })
        .collect();
    Solution { subgraphs }
}
