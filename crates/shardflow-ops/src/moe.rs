//! Mixture-of-experts operators: topk, group-by, aggregate, aggregate-spec.
//!
//! Gate tensors are `[batch, k]` (+ replica); expert outputs are
//! `[rows, out_dim]` (+ replica).

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;
use shardflow_core::types::DataType;

use crate::util::logical_rank;

/// Attributes of top-k selection along the innermost logical dim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopKAttrs {
    /// Number of entries kept
    pub k: usize,
    /// Whether outputs are sorted
    pub sorted: bool,
}

impl TopKAttrs {
    /// Valid for one input whose innermost extent is at least `k`.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.k == 0 {
            return false;
        }
        let rank = logical_rank(&inputs[0]);
        rank >= 1 && inputs[0].dims[rank - 1].size >= self.k && inputs[0].dims[rank - 1].degree == 1
    }

    /// Two outputs: values (input type) and indices (int32), both with the
    /// innermost extent replaced by `k`.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid topk input", "topk"));
        }
        let rank = logical_rank(&inputs[0]);
        let mut values = inputs[0].clone();
        values.dims[rank - 1].size = self.k;
        let mut indices = values.clone();
        indices.data_type = DataType::Int32;
        Ok(vec![values, indices])
    }
}

/// Attributes of group-by: scatter rows to `n` expert buckets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupByAttrs {
    /// Number of expert buckets
    pub n: usize,
    /// Capacity factor: bucket rows are `alpha * k * batch / n`
    pub alpha: f32,
}

impl GroupByAttrs {
    /// Rows per expert bucket.
    pub fn rows_per_bucket(&self, batch: usize, k: usize) -> usize {
        ((self.alpha * (k * batch) as f32) / self.n as f32).ceil() as usize
    }

    /// Valid for `(data, assign)` with integer assignments of matching
    /// batch extent.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 2 || self.n == 0 || self.alpha <= 0.0 {
            return false;
        }
        let (data, assign) = (&inputs[0], &inputs[1]);
        logical_rank(data) == 2
            && logical_rank(assign) == 2
            && matches!(assign.data_type, DataType::Int32 | DataType::Int64)
            && data.dims[0].size == assign.dims[0].size
    }

    /// `n` outputs, each `[rows, d]` plus the data replica dims.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid group-by operands", "group-by"));
        }
        let (data, assign) = (&inputs[0], &inputs[1]);
        let batch = data.dims[0].size;
        let k = assign.dims[1].size;
        let rows = self.rows_per_bucket(batch, k);
        let mut bucket = data.clone();
        bucket.dims[0].size = rows;
        bucket.dims[0].degree = 1;
        bucket.dims[0].parallel_idx = None;
        Ok(vec![bucket; self.n])
    }
}

/// Attributes of aggregate: weighted recombination of expert outputs.
///
/// Inputs, in order: gate predictions `[batch, k]`, gate assignments
/// `[batch, k]`, ground-truth assignments `[batch, k]`, full gate
/// predictions `[batch, n]`, then `n` expert outputs `[rows, out_dim]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateAttrs {
    /// Number of experts
    pub n: usize,
    /// Load-balance loss weight
    pub lambda_bal: f32,
}

/// Upper bound on experts per aggregate, fixed by the kernel.
pub const AGGREGATE_MAX_N: usize = 128;
/// Upper bound on gate width, fixed by the kernel.
pub const AGGREGATE_MAX_K: usize = 4;
/// Upper bound on batch extent, fixed by the kernel.
pub const AGGREGATE_MAX_BATCH_SIZE: usize = 64;

fn aggregate_inputs_valid(n: usize, inputs: &[ParallelTensorShape]) -> bool {
    if n == 0 || inputs.len() != n + 4 {
        return false;
    }
    let gate_preds = &inputs[0];
    if logical_rank(gate_preds) != 2 {
        return false;
    }
    let batch = gate_preds.dims[0].size;
    let k = gate_preds.dims[1].size;
    if n > AGGREGATE_MAX_N || k > AGGREGATE_MAX_K || batch > AGGREGATE_MAX_BATCH_SIZE {
        return false;
    }
    // Assignments mirror the gate shape.
    if inputs[1].dims != gate_preds.dims || inputs[2].dims != gate_preds.dims {
        return false;
    }
    // Full gate predictions: one column per expert, same batch.
    if logical_rank(&inputs[3]) != 2
        || inputs[3].dims[0].size != batch
        || inputs[3].dims[1].size != n
    {
        return false;
    }
    // Expert outputs agree on rank and width.
    let first = &inputs[4];
    if logical_rank(first) != 2 {
        return false;
    }
    let out_dim = first.dims[1].size;
    inputs[4..]
        .iter()
        .all(|e| e.rank() == first.rank() && e.dims[1].size == out_dim)
}

fn aggregate_output(inputs: &[ParallelTensorShape]) -> ParallelTensorShape {
    let gate_preds = &inputs[0];
    let expert = &inputs[4];
    // Batch and replica dims come from the gate, the width from the experts.
    let mut out = gate_preds.clone();
    out.dims[1] = expert.dims[1];
    out.data_type = DataType::Float;
    out
}

impl AggregateAttrs {
    /// Validity per the kernel's structural constraints.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        aggregate_inputs_valid(self.n, inputs)
    }

    /// Output `[batch, out_dim]` plus the gate's replica dims.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid aggregate operands", "aggregate"));
        }
        Ok(vec![aggregate_output(inputs)])
    }
}

/// Attributes of aggregate-spec, the speculative variant that trains every
/// expert on every assigned row and replicates labels downstream.
///
/// Modeled as a distinct kind with its own constructor; shape rules match
/// aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpecAttrs {
    /// Number of experts
    pub n: usize,
    /// Load-balance loss weight
    pub lambda_bal: f32,
}

impl AggregateSpecAttrs {
    /// Validity per the kernel's structural constraints.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        aggregate_inputs_valid(self.n, inputs)
    }

    /// Output `[batch, out_dim]` plus the gate's replica dims.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "invalid aggregate-spec operands",
                "aggregate-spec",
            ));
        }
        Ok(vec![aggregate_output(inputs)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_replica(sizes: &[usize], data_type: DataType) -> ParallelTensorShape {
        let mut s = ParallelTensorShape::from_sizes(sizes, data_type);
        s.push_replica_dim();
        s
    }

    fn aggregate_inputs(n: usize, batch: usize, k: usize) -> Vec<ParallelTensorShape> {
        let mut inputs = vec![
            with_replica(&[batch, k], DataType::Float),
            with_replica(&[batch, k], DataType::Int32),
            with_replica(&[batch, k], DataType::Int32),
            with_replica(&[batch, n], DataType::Float),
        ];
        for _ in 0..n {
            inputs.push(with_replica(&[32, 16], DataType::Float));
        }
        inputs
    }

    #[test]
    fn test_topk_outputs() {
        let attrs = TopKAttrs { k: 4, sorted: true };
        let outs = attrs
            .output_shapes(&[with_replica(&[8, 10], DataType::Float)])
            .unwrap();
        assert_eq!(outs.len(), 2);
        assert_eq!(outs[0].logical().dims.as_slice(), &[8, 4]);
        assert_eq!(outs[1].data_type, DataType::Int32);
    }

    #[test]
    fn test_group_by_buckets() {
        let attrs = GroupByAttrs { n: 4, alpha: 1.0 };
        let data = with_replica(&[8, 16], DataType::Float);
        let assign = with_replica(&[8, 2], DataType::Int32);
        let outs = attrs.output_shapes(&[data, assign]).unwrap();
        assert_eq!(outs.len(), 4);
        // 2*8/4 rows per bucket at alpha = 1.
        assert_eq!(outs[0].logical().dims.as_slice(), &[4, 16]);
    }

    #[test]
    fn test_aggregate_output_shape() {
        // Three experts of width 16, gate of width k=4 over batch 8.
        let attrs = AggregateAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        let inputs = aggregate_inputs(3, 8, 4);
        let outs = attrs.output_shapes(&inputs).unwrap();
        assert_eq!(outs[0].logical().dims.as_slice(), &[8, 16]);
        assert_eq!(outs[0].rank(), 3);
        assert_eq!(outs[0].data_type, DataType::Float);
    }

    #[test]
    fn test_aggregate_attrs_equality() {
        let attrs = AggregateAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        let rebuilt = AggregateAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        assert_eq!(attrs, rebuilt);
        assert_ne!(
            attrs,
            AggregateAttrs {
                n: 4,
                lambda_bal: 0.1
            }
        );
    }

    #[test]
    fn test_aggregate_rejects_wrong_arity() {
        let attrs = AggregateAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        let mut inputs = aggregate_inputs(3, 8, 4);
        inputs.pop();
        assert!(!attrs.is_valid(&inputs));
    }

    #[test]
    fn test_aggregate_spec_is_distinct_but_agrees_on_shape() {
        let agg = AggregateAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        let spec = AggregateSpecAttrs {
            n: 3,
            lambda_bal: 0.1,
        };
        let inputs = aggregate_inputs(3, 8, 4);
        assert_eq!(
            agg.output_shapes(&inputs).unwrap(),
            spec.output_shapes(&inputs).unwrap()
        );
    }
}
