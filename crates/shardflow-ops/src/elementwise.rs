//! Element-wise operators: binary arithmetic, unary maps, cast, dropout.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;
use shardflow_core::types::DataType;

use crate::kind::OperatorKind;
use crate::util::same_partitioned_shape;

/// Attributes of an element-wise binary operator. The arithmetic flavor is
/// the kind tag itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementBinaryAttrs {
    /// One of the `Ew*` kinds
    pub op: OperatorKind,
}

impl ElementBinaryAttrs {
    /// Create attrs; `op` must be an element-wise binary kind.
    pub fn new(op: OperatorKind) -> Self {
        debug_assert!(op.is_elementwise_binary());
        Self { op }
    }

    /// Valid for two inputs with identical partitioned shapes.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        self.op.is_elementwise_binary()
            && inputs.len() == 2
            && same_partitioned_shape(&inputs[0], &inputs[1])
            && inputs[0].data_type == inputs[1].data_type
    }

    /// Output matches either input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "element-binary inputs must share a shape",
                self.op.to_string(),
            ));
        }
        Ok(vec![inputs[0].clone()])
    }
}

/// Attributes of an element-wise unary operator. Scalar flavors carry the
/// scalar operand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementUnaryAttrs {
    /// One of the unary kinds
    pub op: OperatorKind,
    /// Scalar operand for the `scalar-*` flavors
    pub scalar: Option<f32>,
}

impl ElementUnaryAttrs {
    /// Create non-scalar unary attrs.
    pub fn new(op: OperatorKind) -> Self {
        debug_assert!(op.is_elementwise_unary() && !op.takes_scalar());
        Self { op, scalar: None }
    }

    /// Create scalar unary attrs.
    pub fn with_scalar(op: OperatorKind, scalar: f32) -> Self {
        debug_assert!(op.takes_scalar());
        Self {
            op,
            scalar: Some(scalar),
        }
    }

    /// Valid for one input; scalar flavors must carry their operand.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        self.op.is_elementwise_unary()
            && inputs.len() == 1
            && (self.scalar.is_some() == self.op.takes_scalar())
    }

    /// Output matches the input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "element-unary takes exactly one input",
                self.op.to_string(),
            ));
        }
        Ok(vec![inputs[0].clone()])
    }
}

/// Attributes of a cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastAttrs {
    /// Target element type
    pub to: DataType,
}

impl CastAttrs {
    /// Valid for one input.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1
    }

    /// Output keeps the partition descriptor, changes the element type.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("cast takes exactly one input", "cast"));
        }
        let mut out = inputs[0].clone();
        out.data_type = self.to;
        Ok(vec![out])
    }
}

/// Attributes of dropout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropoutAttrs {
    /// Drop probability
    pub rate: f32,
    /// RNG seed
    pub seed: u64,
}

impl DropoutAttrs {
    /// Valid for one input with a rate in `[0, 1)`.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1 && (0.0..1.0).contains(&self.rate)
    }

    /// Output matches the input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid dropout input", "dropout"));
        }
        Ok(vec![inputs[0].clone()])
    }
}
