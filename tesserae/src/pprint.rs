//! Human-readable schedule summaries.

use std::fmt::Write;

use crate::problem::Solution;
use crate::utils::join_into_string;

/// One line per subgraph (ops, granularity, retained tensors, latency) plus
/// the total.
pub fn solution_summary(solution: &Solution) -> String {
    let mut out = String::new();
    for (i, sg) in solution.subgraphs.iter().enumerate() {
        let _ = writeln!(
            out,
            "sg {i}: ops=[{}] gran={} retain=[{}] lat={:.1}",
            join_into_string(&sg.ops, ", "),
            sg.granularity,
            join_into_string(&sg.tensors_to_retain, ", "),
            sg.latency,
        );
    }
    let _ = writeln!(out, "total: {:.1}", solution.total_latency());
    out
}
