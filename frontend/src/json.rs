//! The on-disk exchange format: parallel arrays over tensors, ops, and
//! subgraphs. A null traversal order denotes the default row-major sweep;
//! empty arrays are written as `[]`, never null.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use tesserae::problem::{
    DimSize, Granularity, OpKind, Operation, Problem, Solution, Subgraph, Tensor,
};

#[derive(Debug, Deserialize, Serialize)]
pub struct ProblemJson {
    pub widths: Vec<u32>,
    pub heights: Vec<u32>,
    pub inputs: Vec<Vec<usize>>,
    pub outputs: Vec<Vec<usize>>,
    pub base_costs: Vec<u64>,
    pub op_types: Vec<String>,
    pub fast_memory_capacity: u64,
    pub slow_memory_bandwidth: u64,
    pub native_granularity: [u32; 2],
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SolutionJson {
    pub subgraphs: Vec<Vec<usize>>,
    pub granularities: Vec<[u32; 3]>,
    pub tensors_to_retain: Vec<Vec<usize>>,
    pub traversal_orders: Vec<Option<Vec<usize>>>,
    pub subgraph_latencies: Vec<f64>,
}

fn dim(v: u32, what: &str, idx: usize) -> Result<DimSize> {
    DimSize::new(v).with_context(|| format!("{what} {idx} must be positive, got {v}"))
}

impl ProblemJson {
    pub fn into_problem(self) -> Result<Problem> {
        if self.widths.len() != self.heights.len() {
            bail!(
                "widths ({}) and heights ({}) disagree",
                self.widths.len(),
                self.heights.len()
            );
        }
        let num_ops = self.inputs.len();
        if self.outputs.len() != num_ops
            || self.base_costs.len() != num_ops
            || self.op_types.len() != num_ops
        {
            bail!(
                "op arrays disagree: inputs={}, outputs={}, base_costs={}, op_types={}",
                num_ops,
                self.outputs.len(),
                self.base_costs.len(),
                self.op_types.len()
            );
        }

        let tensors = self
            .widths
            .iter()
            .zip(&self.heights)
            .enumerate()
            .map(|(i, (&w, &h))| {
                Ok(Tensor::new(
                    dim(w, "tensor width", i)?,
                    dim(h, "tensor height", i)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut ops = Vec::with_capacity(num_ops);
        for i in 0..num_ops {
            let kind: OpKind = self.op_types[i]
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))
                .with_context(|| format!("op {i}"))?;
            ops.push(Operation {
                kind,
                inputs: self.inputs[i].iter().copied().collect(),
                outputs: self.outputs[i].iter().copied().collect(),
                base_cost: self.base_costs[i],
            });
        }

        let problem = Problem {
            tensors,
            ops,
            fast_memory_capacity: self.fast_memory_capacity,
            slow_memory_bandwidth: self.slow_memory_bandwidth,
            native_granularity: [
                dim(self.native_granularity[0], "native granularity", 0)?,
                dim(self.native_granularity[1], "native granularity", 1)?,
            ],
        };
        problem.validate()?;
        Ok(problem)
    }
}

impl SolutionJson {
    pub fn from_solution(solution: &Solution) -> SolutionJson {
        let n = solution.subgraphs.len();
        let mut json = SolutionJson {
            subgraphs: Vec::with_capacity(n),
            granularities: Vec::with_capacity(n),
            tensors_to_retain: Vec::with_capacity(n),
            traversal_orders: Vec::with_capacity(n),
            subgraph_latencies: Vec::with_capacity(n),
        };
        for sg in &solution.subgraphs {
            json.subgraphs.push(sg.ops.clone());
            json.granularities.push([
                sg.granularity.w.get(),
                sg.granularity.h.get(),
                sg.granularity.k.get(),
            ]);
            json.tensors_to_retain.push(sg.tensors_to_retain.clone());
            json.traversal_orders.push(if sg.traversal_order.is_empty() {
                None
            } else {
                Some(sg.traversal_order.clone())
            });
            json.subgraph_latencies.push(sg.latency);
        }
        json
    }

    pub fn into_solution(self) -> Result<Solution> {
        let n = self.subgraphs.len();
        if self.granularities.len() != n
            || self.tensors_to_retain.len() != n
            || self.traversal_orders.len() != n
            || self.subgraph_latencies.len() != n
        {
            bail!("subgraph arrays disagree in length");
        }

        let mut subgraphs = Vec::with_capacity(n);
        for i in 0..n {
            let [w, h, k] = self.granularities[i];
            let granularity = Granularity::from_u32(w, h, k)
                .with_context(|| format!("subgraph {i}: granularity must be positive"))?;
            subgraphs.push(Subgraph {
                ops: self.subgraphs[i].clone(),
                granularity,
                tensors_to_retain: self.tensors_to_retain[i].clone(),
                traversal_order: self.traversal_orders[i].clone().unwrap_or_default(),
                latency: self.subgraph_latencies[i],
            });
        }
        Ok(Solution { subgraphs })
    }
}

pub fn read_problem(path: &Path) -> Result<Problem> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading problem file {}", path.display()))?;
    let json: ProblemJson = serde_json::from_str(&data)
        .with_context(|| format!("parsing problem JSON {}", path.display()))?;
    json.into_problem()
}

pub fn read_solution(path: &Path) -> Result<Solution> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading solution file {}", path.display()))?;
    let json: SolutionJson = serde_json::from_str(&data)
        .with_context(|| format!("parsing solution JSON {}", path.display()))?;
    json.into_solution()
}

pub fn write_solution(path: &Path, solution: &Solution) -> Result<()> {
    let json = SolutionJson::from_solution(solution);
    let data = serde_json::to_string_pretty(&json).context("serializing solution")?;
    std::fs::write(path, data)
        .with_context(|| format!("writing solution file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_problem_json() -> &'static str {
        r#"{
            "widths": [512, 512, 512],
            "heights": [512, 512, 512],
            "inputs": [[0, 1]],
            "outputs": [[2]],
            "base_costs": [1000],
            "op_types": ["MatMul"],
            "fast_memory_capacity": 60000,
            "slow_memory_bandwidth": 20,
            "native_granularity": [128, 128]
        }"#
    }

    #[test]
    fn test_parse_problem() {
        let json: ProblemJson = serde_json::from_str(sample_problem_json()).unwrap();
        let p = json.into_problem().unwrap();
        assert_eq!(p.tensors.len(), 3);
        assert_eq!(p.ops.len(), 1);
        assert_eq!(p.ops[0].kind, OpKind::MatMul);
        assert_eq!(p.native_granularity[0].get(), 128);
    }

    #[test]
    fn test_reject_inconsistent_arrays() {
        let mut json: ProblemJson = serde_json::from_str(sample_problem_json()).unwrap();
        json.base_costs.push(5);
        assert!(json.into_problem().is_err());
    }

    #[test]
    fn test_reject_zero_dimension() {
        let mut json: ProblemJson = serde_json::from_str(sample_problem_json()).unwrap();
        json.widths[0] = 0;
        assert!(json.into_problem().is_err());
    }

    #[test]
    fn test_reject_unknown_op_type() {
        let mut json: ProblemJson = serde_json::from_str(sample_problem_json()).unwrap();
        json.op_types[0] = "Conv".into();
        assert!(json.into_problem().is_err());
    }

    #[test]
    fn test_solution_round_trip() {
        let json: ProblemJson = serde_json::from_str(sample_problem_json()).unwrap();
        let p = json.into_problem().unwrap();
        let solution = tesserae::solve(&p).unwrap();

        let encoded = serde_json::to_string(&SolutionJson::from_solution(&solution)).unwrap();
        let decoded: SolutionJson = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.into_solution().unwrap(), solution);
    }

    #[test]
    fn test_default_traversal_serializes_as_null() {
        let solution = Solution {
            subgraphs: vec![Subgraph {
                ops: vec![0],
                granularity: Granularity::from_u32(128, 128, 1).unwrap(),
                tensors_to_retain: vec![],
                traversal_order: vec![],
                latency: 1.0,
            }],
        };
        let encoded =
            serde_json::to_string(&SolutionJson::from_solution(&solution)).unwrap();
        assert!(encoded.contains("\"traversal_orders\":[null]"));
        assert!(encoded.contains("\"tensors_to_retain\":[[]]"));
    }
}
