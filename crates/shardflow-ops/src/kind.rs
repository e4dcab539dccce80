//! The closed enumeration of operator kinds.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind tag of an operator. The set is closed; rewrite passes dispatch
/// exhaustively on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum OperatorKind {
    // Synthetic graph anchors
    Input,
    Weight,
    Noop,

    // Compute operators
    Linear,
    Conv2d,
    Pool2d,
    EwAdd,
    EwSub,
    EwMul,
    EwDiv,
    EwMax,
    EwMin,
    Exp,
    Sin,
    Cos,
    ScalarMultiply,
    ScalarAdd,
    ScalarSub,
    ScalarTrueDiv,
    Relu,
    Sigmoid,
    Tanh,
    Identity,
    Gelu,
    Elu,
    Cast,
    Dropout,
    Embedding,
    Flat,
    Gather,
    MultiHeadAttention,
    LayerNorm,
    ReduceSum,
    Reshape,
    Softmax,
    Transpose,
    BatchMatmul,
    Split,
    Concat,
    TopK,
    GroupBy,
    Aggregate,
    AggregateSpec,

    // Data-movement (parallel) operators
    Repartition,
    Replicate,
    Reduction,
    Combine,
    FusedParallel,

    // Synthetic fusion product
    Fused,
}

impl OperatorKind {
    /// Whether this kind exists purely to move or rearrange data between
    /// parallelization layouts.
    pub const fn is_parallel_op(&self) -> bool {
        matches!(
            self,
            OperatorKind::Repartition
                | OperatorKind::Replicate
                | OperatorKind::Reduction
                | OperatorKind::Combine
                | OperatorKind::FusedParallel
        )
    }

    /// Whether this kind is a synthetic input or weight anchor with no
    /// forward/backward task launches.
    pub const fn is_input_or_weight(&self) -> bool {
        matches!(self, OperatorKind::Input | OperatorKind::Weight)
    }

    /// Whether this kind is an element-wise binary operator.
    pub const fn is_elementwise_binary(&self) -> bool {
        matches!(
            self,
            OperatorKind::EwAdd
                | OperatorKind::EwSub
                | OperatorKind::EwMul
                | OperatorKind::EwDiv
                | OperatorKind::EwMax
                | OperatorKind::EwMin
        )
    }

    /// Whether this kind is an element-wise unary operator.
    pub const fn is_elementwise_unary(&self) -> bool {
        matches!(
            self,
            OperatorKind::Exp
                | OperatorKind::Sin
                | OperatorKind::Cos
                | OperatorKind::ScalarMultiply
                | OperatorKind::ScalarAdd
                | OperatorKind::ScalarSub
                | OperatorKind::ScalarTrueDiv
                | OperatorKind::Relu
                | OperatorKind::Sigmoid
                | OperatorKind::Tanh
                | OperatorKind::Identity
                | OperatorKind::Gelu
                | OperatorKind::Elu
        )
    }

    /// Whether the unary kind carries a scalar operand.
    pub const fn takes_scalar(&self) -> bool {
        matches!(
            self,
            OperatorKind::ScalarMultiply
                | OperatorKind::ScalarAdd
                | OperatorKind::ScalarSub
                | OperatorKind::ScalarTrueDiv
        )
    }

    /// Whether operators of this kind carry weight slots.
    pub const fn has_weights(&self) -> bool {
        matches!(
            self,
            OperatorKind::Linear
                | OperatorKind::Conv2d
                | OperatorKind::Embedding
                | OperatorKind::MultiHeadAttention
                | OperatorKind::LayerNorm
        )
    }

    /// Stable numeric tag used by the graph serializer.
    pub const fn tag(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Input => "input",
            OperatorKind::Weight => "weight",
            OperatorKind::Noop => "noop",
            OperatorKind::Linear => "linear",
            OperatorKind::Conv2d => "conv2d",
            OperatorKind::Pool2d => "pool2d",
            OperatorKind::EwAdd => "element-binary-add",
            OperatorKind::EwSub => "element-binary-sub",
            OperatorKind::EwMul => "element-binary-mul",
            OperatorKind::EwDiv => "element-binary-div",
            OperatorKind::EwMax => "element-binary-max",
            OperatorKind::EwMin => "element-binary-min",
            OperatorKind::Exp => "element-unary-exp",
            OperatorKind::Sin => "element-unary-sin",
            OperatorKind::Cos => "element-unary-cos",
            OperatorKind::ScalarMultiply => "element-unary-scalar-multiply",
            OperatorKind::ScalarAdd => "element-unary-scalar-add",
            OperatorKind::ScalarSub => "element-unary-scalar-sub",
            OperatorKind::ScalarTrueDiv => "element-unary-scalar-true-div",
            OperatorKind::Relu => "element-unary-relu",
            OperatorKind::Sigmoid => "element-unary-sigmoid",
            OperatorKind::Tanh => "element-unary-tanh",
            OperatorKind::Identity => "element-unary-identity",
            OperatorKind::Gelu => "element-unary-gelu",
            OperatorKind::Elu => "element-unary-elu",
            OperatorKind::Cast => "cast",
            OperatorKind::Dropout => "dropout",
            OperatorKind::Embedding => "embedding",
            OperatorKind::Flat => "flat",
            OperatorKind::Gather => "gather",
            OperatorKind::MultiHeadAttention => "multi-head-attention",
            OperatorKind::LayerNorm => "layer-norm",
            OperatorKind::ReduceSum => "reduce-sum",
            OperatorKind::Reshape => "reshape",
            OperatorKind::Softmax => "softmax",
            OperatorKind::Transpose => "transpose",
            OperatorKind::BatchMatmul => "batch-matmul",
            OperatorKind::Split => "split",
            OperatorKind::Concat => "concat",
            OperatorKind::TopK => "topk",
            OperatorKind::GroupBy => "group-by",
            OperatorKind::Aggregate => "aggregate",
            OperatorKind::AggregateSpec => "aggregate-spec",
            OperatorKind::Repartition => "repartition",
            OperatorKind::Replicate => "replicate",
            OperatorKind::Reduction => "reduction",
            OperatorKind::Combine => "combine",
            OperatorKind::FusedParallel => "fused-parallel",
            OperatorKind::Fused => "fused",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classes() {
        assert!(OperatorKind::Repartition.is_parallel_op());
        assert!(!OperatorKind::Linear.is_parallel_op());
        assert!(OperatorKind::EwMax.is_elementwise_binary());
        assert!(OperatorKind::Gelu.is_elementwise_unary());
        assert!(OperatorKind::ScalarAdd.takes_scalar());
        assert!(!OperatorKind::Relu.takes_scalar());
        assert!(OperatorKind::Weight.is_input_or_weight());
        assert!(OperatorKind::Conv2d.has_weights());
    }

    #[test]
    fn test_tags_are_distinct() {
        assert_ne!(OperatorKind::Linear.tag(), OperatorKind::Conv2d.tag());
        assert_ne!(OperatorKind::Fused.tag(), OperatorKind::FusedParallel.tag());
    }
}
