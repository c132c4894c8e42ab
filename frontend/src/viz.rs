//! Graphviz DOT artifacts for problems and solutions, with best-effort PNG
//! rendering through the `dot` binary.

use std::fmt::Write as _;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

use tesserae::graph::GraphInfo;
use tesserae::problem::{OpKind, Problem, Solution};

/// The problem DAG: tensor nodes (inputs green, outputs blue), op nodes with
/// kind and base cost, LHS/RHS labels on MatMul input edges.
pub fn problem_dot(problem: &Problem, gi: &GraphInfo) -> String {
    let mut dot = String::new();
    dot.push_str("digraph DAG {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [shape=box, style=rounded, fontname=\"Arial\"];\n");
    dot.push_str("  edge [fontname=\"Arial\", fontsize=10];\n\n");

    for (i, t) in problem.tensors.iter().enumerate() {
        let (color, suffix) = if gi.graph_inputs.contains(&i) {
            ("lightgreen", "\\n(input)")
        } else if gi.graph_outputs.contains(&i) {
            ("lightblue", "\\n(output)")
        } else {
            ("white", "")
        };
        let _ = writeln!(
            dot,
            "  T{i} [label=\"Tensor[{i}]\\n{}x{}{suffix}\", fillcolor=\"{color}\", \
             style=\"rounded,filled\"];",
            t.width, t.height
        );
    }
    dot.push('\n');

    for (i, op) in problem.ops.iter().enumerate() {
        let _ = writeln!(
            dot,
            "  Op{i} [label=\"Op[{i}]\\n{}\\ncost={}\", shape=box, \
             fillcolor=\"lightyellow\", style=\"filled\"];",
            op.kind, op.base_cost
        );
    }
    dot.push('\n');

    write_edges(&mut dot, problem, "  ");
    dot.push_str("}\n");
    dot
}

/// The scheduled solution: one cluster per subgraph labeled with its
/// granularity and latency; retained tensors outlined in red.
pub fn solution_dot(problem: &Problem, gi: &GraphInfo, solution: &Solution) -> String {
    let mut dot = String::new();
    dot.push_str("digraph Solution {\n");
    dot.push_str("  rankdir=TB;\n");
    dot.push_str("  node [fontname=\"Arial\"];\n");
    dot.push_str("  edge [fontname=\"Arial\", fontsize=10];\n\n");

    for (i, t) in problem.tensors.iter().enumerate() {
        let color = if gi.graph_inputs.contains(&i) {
            "lightgreen"
        } else if gi.graph_outputs.contains(&i) {
            "lightblue"
        } else {
            "white"
        };
        let _ = writeln!(
            dot,
            "  T{i} [label=\"T[{i}]\\n{}x{}\", shape=ellipse, fillcolor=\"{color}\", \
             style=\"filled\"];",
            t.width, t.height
        );
    }
    dot.push('\n');

    for (sg_idx, sg) in solution.subgraphs.iter().enumerate() {
        let _ = writeln!(dot, "  subgraph cluster_{sg_idx} {{");
        let _ = writeln!(
            dot,
            "    label=\"Subgraph {sg_idx}\\nGran={}\\nLatency={:.1}\";",
            sg.granularity, sg.latency
        );
        dot.push_str("    style=filled;\n");
        dot.push_str("    color=lightgrey;\n");
        dot.push_str("    node [style=filled, fillcolor=lightyellow];\n\n");
        for &op_idx in &sg.ops {
            let op = &problem.ops[op_idx];
            let _ = writeln!(
                dot,
                "    Op{op_idx} [label=\"Op[{op_idx}]\\n{}\\ncost={}\"];",
                op.kind, op.base_cost
            );
        }
        dot.push_str("  }\n\n");
    }

    write_edges(&mut dot, problem, "  ");

    let retained: std::collections::BTreeSet<usize> = solution
        .subgraphs
        .iter()
        .flat_map(|sg| sg.tensors_to_retain.iter().copied())
        .collect();
    if !retained.is_empty() {
        dot.push_str("\n  // Retained tensors\n");
        for t in retained {
            let _ = writeln!(dot, "  T{t} [penwidth=3, color=red];");
        }
    }

    dot.push_str("}\n");
    dot
}

fn write_edges(dot: &mut String, problem: &Problem, indent: &str) {
    for (i, op) in problem.ops.iter().enumerate() {
        for (pos, &t) in op.inputs.iter().enumerate() {
            let label = match (op.kind, pos) {
                (OpKind::MatMul, 0) => " [label=\"LHS\"]",
                (OpKind::MatMul, _) => " [label=\"RHS\"]",
                (OpKind::Pointwise, _) => "",
            };
            let _ = writeln!(dot, "{indent}T{t} -> Op{i}{label};");
        }
        for &t in &op.outputs {
            let _ = writeln!(dot, "{indent}Op{i} -> T{t};");
        }
    }
}

/// Render a DOT file to PNG with Graphviz. Fails when the `dot` binary is
/// missing or errors; callers treat that as non-fatal.
pub fn render_png(dot_file: &Path, png_file: &Path) -> Result<()> {
    let output = Command::new("dot")
        .arg("-Tpng")
        .arg(dot_file)
        .arg("-o")
        .arg(png_file)
        .output()
        .context("running graphviz `dot` (is graphviz installed?)")?;
    if !output.status.success() {
        bail!(
            "graphviz failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}
