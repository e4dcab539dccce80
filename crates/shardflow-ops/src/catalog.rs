//! The operator catalog: a single sum-typed entry point over every
//! operator kind.
//!
//! Given an operator's attributes and its input shapes, the catalog checks
//! validity, infers output and weight shapes, and extracts the value-typed
//! parameter record used by rewrites and memoization. Dispatch is
//! exhaustive; there is no open extension at runtime.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::machine::ParallelConfig;
use shardflow_core::tensor::ParallelTensorShape;

use crate::attention::AttentionAttrs;
use crate::conv::{Conv2dAttrs, FlatAttrs, Pool2dAttrs};
use crate::elementwise::{CastAttrs, DropoutAttrs, ElementBinaryAttrs, ElementUnaryAttrs};
use crate::fused::FusedAttrs;
use crate::kind::OperatorKind;
use crate::linear::{EmbeddingAttrs, LinearAttrs};
use crate::matmul::BatchMatmulAttrs;
use crate::moe::{AggregateAttrs, AggregateSpecAttrs, GroupByAttrs, TopKAttrs};
use crate::norm::{LayerNormAttrs, SoftmaxAttrs};
use crate::parallel::{
    CombineAttrs, FusedParallelAttrs, RepartitionAttrs, ReplicateAttrs, ReductionAttrs,
};
use crate::shape::{
    ConcatAttrs, GatherAttrs, ReduceAttrs, ReshapeAttrs, SplitAttrs, TransposeAttrs,
};

/// Marker attributes of a synthetic input anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InputAttrs {}

/// Marker attributes of a synthetic weight anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeightAttrs {}

/// Marker attributes of a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NoopAttrs {}

/// Inferred operator signature: output shapes plus weight shapes.
#[derive(Debug, Clone, PartialEq)]
pub struct OpSignature {
    /// Output shapes, one per output slot
    pub outputs: Vec<ParallelTensorShape>,
    /// Weight shapes, one per weight slot
    pub weights: Vec<ParallelTensorShape>,
}

impl OpSignature {
    fn outputs_only(outputs: Vec<ParallelTensorShape>) -> Self {
        Self {
            outputs,
            weights: Vec::new(),
        }
    }
}

/// The kind-specific attribute record of an operator.
///
/// Records are value-typed and equality-comparable; equal records imply
/// operator equivalence for memoization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum OperatorAttrs {
    Input(InputAttrs),
    Weight(WeightAttrs),
    Noop(NoopAttrs),
    Linear(LinearAttrs),
    Conv2d(Conv2dAttrs),
    Pool2d(Pool2dAttrs),
    Flat(FlatAttrs),
    ElementBinary(ElementBinaryAttrs),
    ElementUnary(ElementUnaryAttrs),
    Cast(CastAttrs),
    Dropout(DropoutAttrs),
    Embedding(EmbeddingAttrs),
    Gather(GatherAttrs),
    MultiHeadAttention(AttentionAttrs),
    LayerNorm(LayerNormAttrs),
    ReduceSum(ReduceAttrs),
    Reshape(ReshapeAttrs),
    Softmax(SoftmaxAttrs),
    Transpose(TransposeAttrs),
    BatchMatmul(BatchMatmulAttrs),
    Split(SplitAttrs),
    Concat(ConcatAttrs),
    TopK(TopKAttrs),
    GroupBy(GroupByAttrs),
    Aggregate(AggregateAttrs),
    AggregateSpec(AggregateSpecAttrs),
    Repartition(RepartitionAttrs),
    Replicate(ReplicateAttrs),
    Reduction(ReductionAttrs),
    Combine(CombineAttrs),
    FusedParallel(FusedParallelAttrs),
    Fused(FusedAttrs),
}

impl OperatorAttrs {
    /// The kind tag of these attributes.
    pub fn kind(&self) -> OperatorKind {
        match self {
            OperatorAttrs::Input(_) => OperatorKind::Input,
            OperatorAttrs::Weight(_) => OperatorKind::Weight,
            OperatorAttrs::Noop(_) => OperatorKind::Noop,
            OperatorAttrs::Linear(_) => OperatorKind::Linear,
            OperatorAttrs::Conv2d(_) => OperatorKind::Conv2d,
            OperatorAttrs::Pool2d(_) => OperatorKind::Pool2d,
            OperatorAttrs::Flat(_) => OperatorKind::Flat,
            OperatorAttrs::ElementBinary(attrs) => attrs.op,
            OperatorAttrs::ElementUnary(attrs) => attrs.op,
            OperatorAttrs::Cast(_) => OperatorKind::Cast,
            OperatorAttrs::Dropout(_) => OperatorKind::Dropout,
            OperatorAttrs::Embedding(_) => OperatorKind::Embedding,
            OperatorAttrs::Gather(_) => OperatorKind::Gather,
            OperatorAttrs::MultiHeadAttention(_) => OperatorKind::MultiHeadAttention,
            OperatorAttrs::LayerNorm(_) => OperatorKind::LayerNorm,
            OperatorAttrs::ReduceSum(_) => OperatorKind::ReduceSum,
            OperatorAttrs::Reshape(_) => OperatorKind::Reshape,
            OperatorAttrs::Softmax(_) => OperatorKind::Softmax,
            OperatorAttrs::Transpose(_) => OperatorKind::Transpose,
            OperatorAttrs::BatchMatmul(_) => OperatorKind::BatchMatmul,
            OperatorAttrs::Split(_) => OperatorKind::Split,
            OperatorAttrs::Concat(_) => OperatorKind::Concat,
            OperatorAttrs::TopK(_) => OperatorKind::TopK,
            OperatorAttrs::GroupBy(_) => OperatorKind::GroupBy,
            OperatorAttrs::Aggregate(_) => OperatorKind::Aggregate,
            OperatorAttrs::AggregateSpec(_) => OperatorKind::AggregateSpec,
            OperatorAttrs::Repartition(_) => OperatorKind::Repartition,
            OperatorAttrs::Replicate(_) => OperatorKind::Replicate,
            OperatorAttrs::Reduction(_) => OperatorKind::Reduction,
            OperatorAttrs::Combine(_) => OperatorKind::Combine,
            OperatorAttrs::FusedParallel(_) => OperatorKind::FusedParallel,
            OperatorAttrs::Fused(_) => OperatorKind::Fused,
        }
    }

    /// Cheap validity predicate: whether the operator can accept these
    /// input shapes at all.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        match self {
            OperatorAttrs::Input(_) | OperatorAttrs::Weight(_) => inputs.is_empty(),
            OperatorAttrs::Noop(_) => inputs.len() == 1,
            OperatorAttrs::Linear(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Conv2d(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Pool2d(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Flat(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::ElementBinary(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::ElementUnary(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Cast(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Dropout(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Embedding(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Gather(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::MultiHeadAttention(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::LayerNorm(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::ReduceSum(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Reshape(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Softmax(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Transpose(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::BatchMatmul(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Split(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Concat(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::TopK(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::GroupBy(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Aggregate(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::AggregateSpec(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Repartition(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Replicate(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Reduction(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Combine(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::FusedParallel(attrs) => attrs.is_valid(inputs),
            OperatorAttrs::Fused(_) => false,
        }
    }

    /// Deterministic shape inference: output and weight shapes for these
    /// inputs. Input, weight, and fused operators are assembled by the
    /// lifter and the fusion pass respectively, never inferred.
    pub fn infer(&self, inputs: &[ParallelTensorShape]) -> Result<OpSignature> {
        match self {
            OperatorAttrs::Input(_) | OperatorAttrs::Weight(_) => Err(Error::structural_in(
                "anchor operators are assembled by the lifter",
                self.kind().to_string(),
            )),
            OperatorAttrs::Fused(_) => Err(Error::structural_in(
                "fused operators are assembled by the fusion pass",
                "fused",
            )),
            OperatorAttrs::Noop(_) => {
                if inputs.len() != 1 {
                    return Err(Error::structural_in("noop takes exactly one input", "noop"));
                }
                Ok(OpSignature::outputs_only(vec![inputs[0].clone()]))
            }
            OperatorAttrs::Linear(attrs) => Ok(OpSignature {
                outputs: attrs.output_shapes(inputs)?,
                weights: attrs.weight_shapes(inputs)?,
            }),
            OperatorAttrs::Conv2d(attrs) => Ok(OpSignature {
                outputs: attrs.output_shapes(inputs)?,
                weights: attrs.weight_shapes(inputs)?,
            }),
            OperatorAttrs::Pool2d(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Flat(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::ElementBinary(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::ElementUnary(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Cast(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Dropout(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Embedding(attrs) => Ok(OpSignature {
                outputs: attrs.output_shapes(inputs)?,
                weights: attrs.weight_shapes(inputs)?,
            }),
            OperatorAttrs::Gather(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::MultiHeadAttention(attrs) => Ok(OpSignature {
                outputs: attrs.output_shapes(inputs)?,
                weights: attrs.weight_shapes(inputs)?,
            }),
            OperatorAttrs::LayerNorm(attrs) => Ok(OpSignature {
                outputs: attrs.output_shapes(inputs)?,
                weights: attrs.weight_shapes(inputs)?,
            }),
            OperatorAttrs::ReduceSum(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Reshape(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Softmax(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Transpose(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::BatchMatmul(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Split(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Concat(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::TopK(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::GroupBy(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Aggregate(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::AggregateSpec(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Repartition(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Replicate(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Reduction(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::Combine(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
            OperatorAttrs::FusedParallel(attrs) => {
                Ok(OpSignature::outputs_only(attrs.output_shapes(inputs)?))
            }
        }
    }

    /// The value-typed parameter record used by graph rewrites and
    /// memoization, or `None` for kinds that do not participate (`input`,
    /// `weight`, `noop`, `fused`).
    pub fn rewrite_params(&self) -> Option<OperatorAttrs> {
        match self {
            OperatorAttrs::Input(_)
            | OperatorAttrs::Weight(_)
            | OperatorAttrs::Noop(_)
            | OperatorAttrs::Fused(_) => None,
            other => Some(other.clone()),
        }
    }

    /// Whether the operator accepts `config` for an output of the given
    /// shape: matching arity, degrees that tile every non-replica
    /// dimension, a device list matching the part count, and any per-kind
    /// constraint (conv2d cannot split its channel axis).
    pub fn supports_config(&self, config: &ParallelConfig, output: &ParallelTensorShape) -> bool {
        if config.ndims() != output.rank() {
            return false;
        }
        if config.device_ids.len() != config.num_parts() || config.num_parts() == 0 {
            return false;
        }
        for (dim, d) in output.dims.iter().enumerate() {
            let degree = config.dims[dim];
            if degree == 0 {
                return false;
            }
            if !d.is_replica && d.size % degree != 0 {
                return false;
            }
        }
        match self {
            OperatorAttrs::Conv2d(_) | OperatorAttrs::Pool2d(_) => config.dims[1] == 1,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::machine::DeviceId;
    use shardflow_core::types::{Activation, DataType};

    fn linear_attrs() -> OperatorAttrs {
        OperatorAttrs::Linear(LinearAttrs {
            out_channels: 64,
            use_bias: true,
            activation: Activation::Relu,
        })
    }

    fn input_shape() -> ParallelTensorShape {
        let mut s = ParallelTensorShape::from_sizes(&[64, 128], DataType::Float);
        s.push_replica_dim();
        s
    }

    #[test]
    fn test_catalog_infer_linear() {
        let sig = linear_attrs().infer(&[input_shape()]).unwrap();
        assert_eq!(sig.outputs.len(), 1);
        assert_eq!(sig.weights.len(), 2);
        assert_eq!(sig.outputs[0].logical().dims.as_slice(), &[64, 64]);
    }

    #[test]
    fn test_rewrite_params_round_trip() {
        // construct(params_of(o)) produces an equal attribute record.
        let attrs = linear_attrs();
        let params = attrs.rewrite_params().unwrap();
        assert_eq!(params, attrs);
        assert_eq!(params.kind(), OperatorKind::Linear);
    }

    #[test]
    fn test_rewrite_params_omissions() {
        assert!(OperatorAttrs::Noop(NoopAttrs {}).rewrite_params().is_none());
        assert!(OperatorAttrs::Input(InputAttrs {}).rewrite_params().is_none());
        assert!(OperatorAttrs::Weight(WeightAttrs {})
            .rewrite_params()
            .is_none());
        assert!(OperatorAttrs::Fused(FusedAttrs::default())
            .rewrite_params()
            .is_none());
    }

    #[test]
    fn test_supports_config_divisibility() {
        let attrs = linear_attrs();
        let output = attrs.infer(&[input_shape()]).unwrap().outputs.remove(0);

        let good = ParallelConfig::new([4, 1, 1], (0..4).map(DeviceId).collect());
        assert!(attrs.supports_config(&good, &output));

        // Degree 3 does not tile a batch of 64.
        let bad = ParallelConfig::new([3, 1, 1], (0..3).map(DeviceId).collect());
        assert!(!attrs.supports_config(&bad, &output));

        // Wrong arity.
        let short = ParallelConfig::new([4, 1], (0..4).map(DeviceId).collect());
        assert!(!attrs.supports_config(&short, &output));
    }

    #[test]
    fn test_conv_config_forbids_channel_split() {
        let attrs = OperatorAttrs::Conv2d(Conv2dAttrs {
            out_channels: 16,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            padding_h: 1,
            padding_w: 1,
            groups: 1,
            activation: Activation::None,
            use_bias: false,
        });
        let mut nchw = ParallelTensorShape::from_sizes(&[8, 16, 32, 32], DataType::Float);
        nchw.push_replica_dim();

        let channel_split = ParallelConfig::new([1, 2, 1, 1, 1], (0..2).map(DeviceId).collect());
        assert!(!attrs.supports_config(&channel_split, &nchw));

        let sample_split = ParallelConfig::new([2, 1, 1, 1, 1], (0..2).map(DeviceId).collect());
        assert!(attrs.supports_config(&sample_split, &nchw));
    }

    #[test]
    fn test_kind_dispatch_for_elementwise() {
        let add = OperatorAttrs::ElementBinary(ElementBinaryAttrs::new(OperatorKind::EwAdd));
        assert_eq!(add.kind(), OperatorKind::EwAdd);
        let relu = OperatorAttrs::ElementUnary(ElementUnaryAttrs::new(OperatorKind::Relu));
        assert_eq!(relu.kind(), OperatorKind::Relu);
    }
}
