use std::fmt::{self, Display};
use std::num::NonZeroU32;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub type DimSize = NonZeroU32;
pub type TensorIdx = usize;
pub type OpIdx = usize;

/// A 2D matrix in the computation graph. Dimensions are in memory units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Tensor {
    pub width: DimSize,
    pub height: DimSize,
}

impl Tensor {
    pub fn new(width: DimSize, height: DimSize) -> Tensor {
        Tensor { width, height }
    }

    /// Memory units occupied by the whole tensor.
    pub fn volume(&self) -> u64 {
        u64::from(self.width.get()) * u64::from(self.height.get())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum OpKind {
    MatMul,
    Pointwise,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::MatMul => write!(f, "MatMul"),
            OpKind::Pointwise => write!(f, "Pointwise"),
        }
    }
}

impl FromStr for OpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MatMul" => Ok(OpKind::MatMul),
            "Pointwise" => Ok(OpKind::Pointwise),
            other => Err(format!("unknown op type: {other:?}")),
        }
    }
}

/// One operation in the DAG.
///
/// For [OpKind::MatMul], `inputs[0]` is the LHS (shape h×k) and `inputs[1]`
/// the RHS (shape k×w); the output is h×w. For [OpKind::Pointwise] every
/// input and output shares the output shape. `base_cost` is the compute cost
/// of producing one native-sized output tile; tiles smaller than native still
/// pay the full per-step cost.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Operation {
    pub kind: OpKind,
    pub inputs: SmallVec<[TensorIdx; 2]>,
    pub outputs: SmallVec<[TensorIdx; 1]>,
    pub base_cost: u64,
}

/// The full, immutable input to the scheduler.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Problem {
    pub tensors: Vec<Tensor>,
    pub ops: Vec<Operation>,
    pub fast_memory_capacity: u64,
    pub slow_memory_bandwidth: u64,
    pub native_granularity: [DimSize; 2],
}

/// A tile shape: output tile w×h plus the reduction chunk k for MatMuls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Granularity {
    pub w: DimSize,
    pub h: DimSize,
    pub k: DimSize,
}

impl Granularity {
    /// The 1×1×1 shape. Always feasible for a non-empty subgraph.
    pub const UNIT: Granularity = Granularity {
        w: DimSize::MIN,
        h: DimSize::MIN,
        k: DimSize::MIN,
    };

    /// Returns `None` when any component is zero.
    pub fn from_u32(w: u32, h: u32, k: u32) -> Option<Granularity> {
        Some(Granularity {
            w: DimSize::new(w)?,
            h: DimSize::new(h)?,
            k: DimSize::new(k)?,
        })
    }

    /// Output tile footprint, w·h.
    pub fn area(&self) -> u64 {
        u64::from(self.w.get()) * u64::from(self.h.get())
    }
}

impl Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},{},{}]", self.w, self.h, self.k)
    }
}

/// One step of the execution schedule: a set of ops run together under a
/// single tile shape.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Subgraph {
    pub ops: Vec<OpIdx>,
    pub granularity: Granularity,
    pub tensors_to_retain: Vec<TensorIdx>,
    /// Spatial visit order over the output grid; empty means the default
    /// row-major sweep.
    pub traversal_order: Vec<usize>,
    pub latency: f64,
}

/// An ordered schedule covering every op of a [Problem] exactly once.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct Solution {
    pub subgraphs: Vec<Subgraph>,
}

impl Solution {
    pub fn total_latency(&self) -> f64 {
        self.subgraphs.iter().map(|sg| sg.latency).sum()
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("op {op} references tensor {tensor}, but only {count} tensors exist")]
    TensorOutOfRange {
        op: OpIdx,
        tensor: TensorIdx,
        count: usize,
    },
    #[error("op {0}: MatMul takes exactly two inputs and one output")]
    MatMulArity(OpIdx),
    #[error("op {0}: Pointwise takes at least one input and one output")]
    PointwiseArity(OpIdx),
    #[error("op {0}: operand shapes are inconsistent")]
    ShapeMismatch(OpIdx),
    #[error("tensor {0} is produced by more than one op")]
    MultipleProducers(TensorIdx),
    #[error("slow memory bandwidth must be positive")]
    ZeroBandwidth,
    #[error("the operation graph contains a cycle")]
    CyclicGraph,
}

impl Problem {
    /// Structural validation, run before the optimization pipeline. Does not
    /// include the acyclicity check, which falls out of graph analysis.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.slow_memory_bandwidth == 0 {
            return Err(ValidationError::ZeroBandwidth);
        }

        let mut producer_seen = vec![false; self.tensors.len()];
        for (i, op) in self.ops.iter().enumerate() {
            for &t in op.inputs.iter().chain(op.outputs.iter()) {
                if t >= self.tensors.len() {
                    return Err(ValidationError::TensorOutOfRange {
                        op: i,
                        tensor: t,
                        count: self.tensors.len(),
                    });
                }
            }
            for &t in &op.outputs {
                if producer_seen[t] {
                    return Err(ValidationError::MultipleProducers(t));
                }
                producer_seen[t] = true;
            }
            match op.kind {
                OpKind::MatMul => {
                    if op.inputs.len() != 2 || op.outputs.len() != 1 {
                        return Err(ValidationError::MatMulArity(i));
                    }
                    let lhs = self.tensors[op.inputs[0]];
                    let rhs = self.tensors[op.inputs[1]];
                    let out = self.tensors[op.outputs[0]];
                    if lhs.width != rhs.height || out.height != lhs.height || out.width != rhs.width
                    {
                        return Err(ValidationError::ShapeMismatch(i));
                    }
                }
                OpKind::Pointwise => {
                    if op.inputs.is_empty() || op.outputs.is_empty() {
                        return Err(ValidationError::PointwiseArity(i));
                    }
                    let shape = self.tensors[op.outputs[0]];
                    let all = op.inputs.iter().chain(op.outputs.iter());
                    for &t in all {
                        if self.tensors[t] != shape {
                            return Err(ValidationError::ShapeMismatch(i));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use smallvec::smallvec;

    pub fn tensor(w: u32, h: u32) -> Tensor {
        Tensor {
            width: DimSize::new(w).unwrap(),
            height: DimSize::new(h).unwrap(),
        }
    }

    pub fn matmul(lhs: TensorIdx, rhs: TensorIdx, out: TensorIdx, base_cost: u64) -> Operation {
        Operation {
            kind: OpKind::MatMul,
            inputs: smallvec![lhs, rhs],
            outputs: smallvec![out],
            base_cost,
        }
    }

    pub fn pointwise(inputs: &[TensorIdx], out: TensorIdx, base_cost: u64) -> Operation {
        Operation {
            kind: OpKind::Pointwise,
            inputs: inputs.iter().copied().collect(),
            outputs: smallvec![out],
            base_cost,
        }
    }

    pub fn problem(
        tensors: Vec<Tensor>,
        ops: Vec<Operation>,
        capacity: u64,
        bandwidth: u64,
        native: u32,
    ) -> Problem {
        Problem {
            tensors,
            ops,
            fast_memory_capacity: capacity,
            slow_memory_bandwidth: bandwidth,
            native_granularity: [DimSize::new(native).unwrap(), DimSize::new(native).unwrap()],
        }
    }

    pub fn gran(w: u32, h: u32, k: u32) -> Granularity {
        Granularity::from_u32(w, h, k).unwrap()
    }
}
