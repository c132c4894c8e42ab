//! The latency cost model: working sets, a closed-form quick estimate, and
//! the authoritative step-by-step latency with tile reuse. Every search
//! decision in the pipeline is priced through these functions.

use std::collections::BTreeSet;

use crate::graph::Boundary;
use crate::problem::{Granularity, OpIdx, OpKind, Problem, Solution, TensorIdx};
use crate::utils::ceil_div;

/// Tensors already resident in fast memory from earlier subgraphs.
pub type Residency = BTreeSet<TensorIdx>;

/// How a boundary input is consumed inside a subgraph. Derived from the
/// (kind, position) of the first op that consumes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputRole {
    MatMulLhs,
    MatMulRhs,
    Pointwise,
}

impl InputRole {
    /// Footprint of one tile of an input with this role.
    pub fn tile_size(self, g: Granularity) -> u64 {
        let (w, h, k) = (
            u64::from(g.w.get()),
            u64::from(g.h.get()),
            u64::from(g.k.get()),
        );
        match self {
            InputRole::MatMulLhs => k * h,
            InputRole::MatMulRhs => w * k,
            InputRole::Pointwise => w * h,
        }
    }
}

pub fn input_role(problem: &Problem, ops: &[OpIdx], tensor: TensorIdx) -> InputRole {
    for &op_idx in ops {
        let op = &problem.ops[op_idx];
        for (pos, &input) in op.inputs.iter().enumerate() {
            if input == tensor {
                return match (op.kind, pos) {
                    (OpKind::MatMul, 0) => InputRole::MatMulLhs,
                    (OpKind::MatMul, _) => InputRole::MatMulRhs,
                    (OpKind::Pointwise, _) => InputRole::Pointwise,
                };
            }
        }
    }
    InputRole::Pointwise
}

pub fn input_tile_size(
    problem: &Problem,
    ops: &[OpIdx],
    tensor: TensorIdx,
    g: Granularity,
) -> u64 {
    input_role(problem, ops, tensor).tile_size(g)
}

pub fn full_tensor_size(problem: &Problem, tensor: TensorIdx) -> u64 {
    problem.tensors[tensor].volume()
}

/// Largest reduction dimension (LHS width) across MatMuls in the subgraph, or
/// 1 if it has none.
pub fn max_reduction(problem: &Problem, ops: &[OpIdx]) -> u32 {
    let mut max_k = 1;
    for &op_idx in ops {
        let op = &problem.ops[op_idx];
        if op.kind == OpKind::MatMul {
            max_k = max_k.max(problem.tensors[op.inputs[0]].width.get());
        }
    }
    max_k
}

/// The primary output: first output of the subgraph's last op in topological
/// order. Its dimensions define the spatial tile grid.
pub fn primary_output(problem: &Problem, ops: &[OpIdx]) -> TensorIdx {
    let last = &problem.ops[ops[ops.len() - 1]];
    last.outputs[0]
}

pub fn has_matmul(problem: &Problem, ops: &[OpIdx]) -> bool {
    ops.iter()
        .any(|&op_idx| problem.ops[op_idx].kind == OpKind::MatMul)
}

pub fn compute_per_step(problem: &Problem, ops: &[OpIdx]) -> u64 {
    ops.iter().map(|&op_idx| problem.ops[op_idx].base_cost).sum()
}

/// Peak fast-memory occupancy for one step of a subgraph.
///
/// Resident boundary inputs occupy their full size; everything else enters at
/// tile size. Resident tensors the subgraph never touches still take space.
pub fn working_set(
    problem: &Problem,
    ops: &[OpIdx],
    g: Granularity,
    resident: &Residency,
) -> u64 {
    let boundary = Boundary::of(problem, ops);
    let mut ws = 0u64;

    for &t in &boundary.inputs {
        if resident.contains(&t) {
            ws += full_tensor_size(problem, t);
        } else {
            ws += input_tile_size(problem, ops, t, g);
        }
    }

    ws += boundary.outputs.len() as u64 * g.area();

    for &t in resident {
        if !boundary.inputs.contains(&t) && !boundary.all_produced.contains(&t) {
            ws += full_tensor_size(problem, t);
        }
    }

    ws
}

/// [working_set], then widen each boundary output scheduled for retention
/// from its tile to its full size.
pub fn working_set_with_retained(
    problem: &Problem,
    ops: &[OpIdx],
    g: Granularity,
    resident: &Residency,
    retained: &[TensorIdx],
) -> u64 {
    let mut ws = working_set(problem, ops, g, resident);
    let boundary = Boundary::of(problem, ops);
    for &t in retained {
        if boundary.outputs.contains(&t) {
            let full = full_tensor_size(problem, t);
            ws += full.saturating_sub(g.area());
        }
    }
    ws
}

/// Closed-form latency estimate assuming snake-order reuse. Used to rank
/// granularity candidates before the detailed model refines the front.
pub fn quick_estimate(
    problem: &Problem,
    ops: &[OpIdx],
    g: Granularity,
    resident: &Residency,
) -> f64 {
    if ops.is_empty() {
        return f64::INFINITY;
    }

    let boundary = Boundary::of(problem, ops);
    let out = problem.tensors[primary_output(problem, ops)];

    let n_cols = ceil_div(out.width.get().into(), g.w.get().into());
    let n_rows = ceil_div(out.height.get().into(), g.h.get().into());
    let n_spatial = n_cols * n_rows;
    let n_k = ceil_div(max_reduction(problem, ops).into(), g.k.get().into());

    let bandwidth = problem.slow_memory_bandwidth as f64;

    let mut total_memory = 0.0;
    for &t in &boundary.inputs {
        if resident.contains(&t) {
            continue;
        }
        let role = input_role(problem, ops, t);
        let tile = role.tile_size(g) as f64;
        total_memory += match role {
            // LHS reused across columns within a row; RHS across rows within
            // a column; pointwise inputs reload on every spatial tile.
            InputRole::MatMulLhs => tile * n_rows as f64 * n_k as f64,
            InputRole::MatMulRhs => tile * n_cols as f64 * n_k as f64,
            InputRole::Pointwise => tile * n_spatial as f64,
        };
    }
    total_memory += boundary.outputs.len() as f64 * (g.area() * n_spatial) as f64;

    let total_compute = compute_per_step(problem, ops) as f64 * (n_spatial * n_k) as f64;
    let total_mem_time = total_memory / bandwidth;
    total_compute.max(total_mem_time)
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum EvalError {
    #[error("subgraph has no ops")]
    EmptyGroup,
    #[error("op {0} is not covered by any subgraph")]
    UncoveredOp(OpIdx),
    #[error("op {0} appears in more than one subgraph")]
    DuplicatedOp(OpIdx),
    #[error("subgraph {index}: working set {working_set} exceeds capacity {capacity}")]
    CapacityExceeded {
        index: usize,
        working_set: u64,
        capacity: u64,
    },
}

/// Step-by-step latency of one subgraph: spatial tile by spatial tile in the
/// given traversal order, k-step by k-step within each tile.
///
/// Reuse rules per step:
/// - inputs fully resident from a prior subgraph are never reloaded;
/// - on k-step 0 of a later spatial tile, the LHS is reused when the tile
///   shares the previous tile's row, the RHS when it shares its column;
/// - on k-steps past the first, pointwise inputs are reused (they do not
///   vary with the reduction index) while MatMul operands are reloaded.
///
/// Boundary outputs not scheduled for retention are evicted on the last
/// k-step of each spatial tile. Each step pays the full per-step compute
/// regardless of tile padding.
pub fn detailed_latency(
    problem: &Problem,
    ops: &[OpIdx],
    g: Granularity,
    retained: &[TensorIdx],
    traversal: &[usize],
    resident: &Residency,
) -> Result<f64, EvalError> {
    if ops.is_empty() {
        return Err(EvalError::EmptyGroup);
    }

    let boundary = Boundary::of(problem, ops);
    let out = problem.tensors[primary_output(problem, ops)];

    let n_cols = ceil_div(out.width.get().into(), g.w.get().into()) as usize;
    let n_rows = ceil_div(out.height.get().into(), g.h.get().into()) as usize;
    let n_spatial = n_cols * n_rows;
    let n_k = ceil_div(max_reduction(problem, ops).into(), g.k.get().into()) as usize;

    let compute = compute_per_step(problem, ops) as f64;
    let bandwidth = problem.slow_memory_bandwidth as f64;

    let inputs: Vec<(TensorIdx, InputRole, u64)> = boundary
        .inputs
        .iter()
        .map(|&t| {
            let role = input_role(problem, ops, t);
            (t, role, role.tile_size(g))
        })
        .collect();
    let retain_set: BTreeSet<TensorIdx> = retained.iter().copied().collect();
    let eviction_bytes: u64 = boundary
        .outputs
        .iter()
        .filter(|t| !retain_set.contains(t))
        .count() as u64
        * g.area();

    let identity: Vec<usize>;
    let order: &[usize] = if traversal.len() == n_spatial {
        traversal
    } else {
        identity = (0..n_spatial).collect();
        &identity
    };

    let mut total = 0.0;
    let mut prev_tile: Option<(usize, usize)> = None;

    for step in 0..n_spatial {
        let tile_idx = order[step];
        let row = tile_idx / n_cols;
        let col = tile_idx % n_cols;

        for k_step in 0..n_k {
            let mut loaded = 0u64;

            for &(t, role, tile_size) in &inputs {
                if resident.contains(&t) {
                    continue;
                }

                let reuse = match (prev_tile, k_step) {
                    (Some((prev_row, prev_col)), 0) => match role {
                        InputRole::MatMulLhs => row == prev_row,
                        InputRole::MatMulRhs => col == prev_col,
                        // Pointwise data changes with every spatial tile.
                        InputRole::Pointwise => false,
                    },
                    // Within a spatial tile only the reduction index moves,
                    // which pointwise inputs do not depend on.
                    (_, k) if k > 0 => role == InputRole::Pointwise,
                    _ => false,
                };

                if !reuse {
                    loaded += tile_size;
                }
            }

            if k_step == n_k - 1 {
                loaded += eviction_bytes;
            }

            total += compute.max(loaded as f64 / bandwidth);
        }

        prev_tile = Some((row, col));
    }

    Ok(total)
}

/// The reference cost model: validates op coverage and per-subgraph capacity,
/// then sums detailed latencies along the schedule, threading residency from
/// each subgraph's retention set into the next.
pub fn evaluate(problem: &Problem, solution: &Solution) -> Result<f64, EvalError> {
    let mut covered = vec![false; problem.ops.len()];
    for sg in &solution.subgraphs {
        for &op_idx in &sg.ops {
            if covered[op_idx] {
                return Err(EvalError::DuplicatedOp(op_idx));
            }
            covered[op_idx] = true;
        }
    }
    if let Some(missing) = covered.iter().position(|&c| !c) {
        return Err(EvalError::UncoveredOp(missing));
    }

    let mut total = 0.0;
    let mut resident = Residency::new();

    for (i, sg) in solution.subgraphs.iter().enumerate() {
        let ws = working_set(problem, &sg.ops, sg.granularity, &resident);
        if ws > problem.fast_memory_capacity {
            return Err(EvalError::CapacityExceeded {
                index: i,
                working_set: ws,
                capacity: problem.fast_memory_capacity,
            });
        }

        total += detailed_latency(
            problem,
            &sg.ops,
            sg.granularity,
            &sg.tensors_to_retain,
            &sg.traversal_order,
            &resident,
        )?;

        resident = sg.tensors_to_retain.iter().copied().collect();
    }

    Ok(total)
}
