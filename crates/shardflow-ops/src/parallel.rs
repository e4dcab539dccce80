//! Data-movement (parallel) operators: repartition, replicate, reduction,
//! combine, and their fusion into a single fused-parallel operator.
//!
//! These operators never compute; they re-describe how a tensor is laid
//! out across devices. Each one's shape rule is a pure transform of the
//! partition descriptor.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;

use crate::util::replica_dim;

/// Attributes of repartition: split one dimension `degree` more ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepartitionAttrs {
    /// Dimension being split
    pub dim: usize,
    /// Additional split factor
    pub degree: usize,
}

impl RepartitionAttrs {
    /// Valid when the new degree tiles the dimension.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.degree == 0 {
            return false;
        }
        let input = &inputs[0];
        let Some(d) = input.dims.get(self.dim) else {
            return false;
        };
        !d.is_replica && d.size % (d.degree * self.degree) == 0
    }

    /// Output: same sizes, target dimension degree multiplied.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "repartition degree does not tile the dimension",
                "repartition",
            ));
        }
        let mut out = inputs[0].clone();
        out.dims[self.dim].degree *= self.degree;
        out.dims[self.dim].parallel_idx = Some(self.dim);
        Ok(vec![out])
    }
}

/// Attributes of replicate: raise the replica-dimension degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateAttrs {
    /// Replication factor
    pub degree: usize,
}

impl ReplicateAttrs {
    /// Valid when the input carries a replica dimension.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1 && self.degree > 0 && replica_dim(&inputs[0]).is_some()
    }

    /// Output: replica degree multiplied.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "replicate requires a replica dimension",
                "replicate",
            ));
        }
        let mut out = inputs[0].clone();
        let r = replica_dim(&out).expect("validated above");
        out.dims[r].degree *= self.degree;
        out.dims[r].parallel_idx = Some(r);
        Ok(vec![out])
    }
}

/// Attributes of reduction: collapse replicas by summation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReductionAttrs {
    /// Factor by which replicas are reduced
    pub degree: usize,
}

impl ReductionAttrs {
    /// Valid when the replica degree is divisible by the factor.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.degree == 0 {
            return false;
        }
        match replica_dim(&inputs[0]) {
            Some(r) => inputs[0].dims[r].degree % self.degree == 0,
            None => false,
        }
    }

    /// Output: replica degree divided.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "reduction degree does not divide the replica degree",
                "reduction",
            ));
        }
        let mut out = inputs[0].clone();
        let r = replica_dim(&out).expect("validated above");
        out.dims[r].degree /= self.degree;
        if out.dims[r].degree == 1 {
            out.dims[r].parallel_idx = None;
        }
        Ok(vec![out])
    }
}

/// Attributes of combine: gather a split dimension back together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineAttrs {
    /// Dimension being gathered
    pub dim: usize,
    /// Factor by which the split is lowered
    pub degree: usize,
}

impl CombineAttrs {
    /// Valid when the dimension's degree is divisible by the factor.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.degree == 0 {
            return false;
        }
        match inputs[0].dims.get(self.dim) {
            Some(d) => d.degree % self.degree == 0,
            None => false,
        }
    }

    /// Output: target dimension degree divided.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "combine degree does not divide the dimension degree",
                "combine",
            ));
        }
        let mut out = inputs[0].clone();
        out.dims[self.dim].degree /= self.degree;
        if out.dims[self.dim].degree == 1 {
            out.dims[self.dim].parallel_idx = None;
        }
        Ok(vec![out])
    }
}

/// One step of a fused parallel operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum ParallelOpSpec {
    /// Repartition step
    Repartition {
        /// Dimension being split
        dim: usize,
        /// Additional split factor
        degree: usize,
    },
    /// Replicate step
    Replicate {
        /// Replication factor
        degree: usize,
    },
    /// Reduction step
    Reduction {
        /// Reduction factor
        degree: usize,
    },
    /// Combine step
    Combine {
        /// Dimension being gathered
        dim: usize,
        /// Gather factor
        degree: usize,
    },
}

impl ParallelOpSpec {
    fn apply(&self, shape: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        match *self {
            ParallelOpSpec::Repartition { dim, degree } => {
                RepartitionAttrs { dim, degree }.output_shapes(shape)
            }
            ParallelOpSpec::Replicate { degree } => ReplicateAttrs { degree }.output_shapes(shape),
            ParallelOpSpec::Reduction { degree } => ReductionAttrs { degree }.output_shapes(shape),
            ParallelOpSpec::Combine { dim, degree } => {
                CombineAttrs { dim, degree }.output_shapes(shape)
            }
        }
    }
}

/// Attributes of a fused parallel operator: several data-movement steps
/// executed as one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusedParallelAttrs {
    /// Steps applied in order
    pub ops: Vec<ParallelOpSpec>,
}

impl FusedParallelAttrs {
    /// Valid when every step accepts its predecessor's output.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        !self.ops.is_empty() && self.output_shapes(inputs).is_ok()
    }

    /// Output: the steps folded over the input shape.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if inputs.len() != 1 || self.ops.is_empty() {
            return Err(Error::structural_in(
                "fused-parallel takes one input and at least one step",
                "fused-parallel",
            ));
        }
        let mut current = vec![inputs[0].clone()];
        for op in &self.ops {
            current = op.apply(&current)?;
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::types::DataType;

    fn shape(sizes: &[usize]) -> ParallelTensorShape {
        let mut s = ParallelTensorShape::from_sizes(sizes, DataType::Float);
        s.push_replica_dim();
        s
    }

    #[test]
    fn test_repartition_splits_batch() {
        let attrs = RepartitionAttrs { dim: 0, degree: 4 };
        let outs = attrs.output_shapes(&[shape(&[64, 128])]).unwrap();
        assert_eq!(outs[0].dims[0].degree, 4);
        assert_eq!(outs[0].dims[0].parallel_idx, Some(0));
        assert!(outs[0].check_valid().is_ok());
    }

    #[test]
    fn test_repartition_rejects_non_divisible() {
        // Degree 3 cannot tile a dimension of size 8.
        let attrs = RepartitionAttrs { dim: 0, degree: 3 };
        assert!(!attrs.is_valid(&[shape(&[8, 16])]));
        assert!(attrs.output_shapes(&[shape(&[8, 16])]).is_err());
    }

    #[test]
    fn test_replicate_reduction_inverse() {
        let replicated = ReplicateAttrs { degree: 4 }
            .output_shapes(&[shape(&[8, 16])])
            .unwrap();
        assert_eq!(replicated[0].dims[2].degree, 4);

        let reduced = ReductionAttrs { degree: 4 }
            .output_shapes(&replicated)
            .unwrap();
        assert_eq!(reduced[0].dims[2].degree, 1);
        assert_eq!(reduced[0].dims[2].parallel_idx, None);
    }

    #[test]
    fn test_combine_lowers_degree() {
        let split = RepartitionAttrs { dim: 0, degree: 4 }
            .output_shapes(&[shape(&[64, 128])])
            .unwrap();
        let combined = CombineAttrs { dim: 0, degree: 2 }
            .output_shapes(&split)
            .unwrap();
        assert_eq!(combined[0].dims[0].degree, 2);
    }

    #[test]
    fn test_fused_parallel_chain() {
        let attrs = FusedParallelAttrs {
            ops: vec![
                ParallelOpSpec::Repartition { dim: 0, degree: 2 },
                ParallelOpSpec::Replicate { degree: 2 },
            ],
        };
        let outs = attrs.output_shapes(&[shape(&[64, 128])]).unwrap();
        assert_eq!(outs[0].dims[0].degree, 2);
        assert_eq!(outs[0].dims[2].degree, 2);
        assert_eq!(outs[0].total_degree(), 4);
    }
}
