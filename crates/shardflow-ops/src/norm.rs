//! Normalization and softmax operators.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;

use crate::util::logical_rank;

/// Attributes of layer normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNormAttrs {
    /// Logical axes normalized over
    pub axes: Vec<usize>,
    /// Whether learnable gain/bias weights exist
    pub elementwise_affine: bool,
    /// Numerical-stability epsilon
    pub eps: f32,
}

impl LayerNormAttrs {
    /// Valid for one input whose normalized axes are in range and unsplit.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.axes.is_empty() {
            return false;
        }
        let rank = logical_rank(&inputs[0]);
        self.axes
            .iter()
            .all(|&a| a < rank && inputs[0].dims[a].degree == 1)
    }

    /// Output matches the input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid layer-norm axes", "layer-norm"));
        }
        Ok(vec![inputs[0].clone()])
    }

    /// With affine weights: gain and bias, each sized to the product of the
    /// normalized extents.
    pub fn weight_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid layer-norm axes", "layer-norm"));
        }
        if !self.elementwise_affine {
            return Ok(vec![]);
        }
        let m: usize = self.axes.iter().map(|&a| inputs[0].dims[a].size).product();
        let gain = ParallelTensorShape::from_sizes(&[m], inputs[0].data_type);
        Ok(vec![gain.clone(), gain])
    }
}

/// Attributes of softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftmaxAttrs {
    /// Logical axis the distribution lives on
    pub axis: usize,
}

impl SoftmaxAttrs {
    /// Valid for one input with the axis in range and unsplit.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1
            && self.axis < logical_rank(&inputs[0])
            && inputs[0].dims[self.axis].degree == 1
    }

    /// Output matches the input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid softmax axis", "softmax"));
        }
        Ok(vec![inputs[0].clone()])
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
    fn test_layer_norm_weights() {
        let attrs = LayerNormAttrs {
            axes: vec![1],
            elementwise_affine: true,
            eps: 1e-5,
        };
        let ws = attrs.weight_shapes(&[shape(&[8, 64])]).unwrap();
        assert_eq!(ws.len(), 2);
        assert_eq!(ws[0].sizes(), vec![64]);

        let no_affine = LayerNormAttrs {
            elementwise_affine: false,
            ..attrs
        };
        assert!(no_affine.weight_shapes(&[shape(&[8, 64])]).unwrap().is_empty());
    }

    #[test]
    fn test_layer_norm_rejects_split_axis() {
        let mut input = shape(&[8, 64]);
        input.dims[1].degree = 2;
        input.dims[1].parallel_idx = Some(1);
        let attrs = LayerNormAttrs {
            axes: vec![1],
            elementwise_affine: false,
            eps: 1e-5,
        };
        assert!(!attrs.is_valid(std::slice::from_ref(&input)));
    }

    #[test]
    fn test_softmax_axis_bounds() {
        let attrs = SoftmaxAttrs { axis: 1 };
        assert!(attrs.is_valid(&[shape(&[8, 10])]));
        let out_of_range = SoftmaxAttrs { axis: 2 };
        assert!(!out_of_range.is_valid(&[shape(&[8, 10])]));
    }
}
