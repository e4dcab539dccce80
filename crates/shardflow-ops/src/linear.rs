//! Dense (fully-connected) layer attributes and shape rules.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;
use shardflow_core::types::{Activation, DataType};

use crate::util::innermost_logical;

/// Attributes of a linear operator.
///
/// Together with the input shape these fully determine the output: the
/// innermost non-replica dimension is replaced by `out_channels`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearAttrs {
    /// Output feature count
    pub out_channels: usize,
    /// Whether a bias weight exists
    pub use_bias: bool,
    /// Activation fused into the kernel
    pub activation: Activation,
}

impl LinearAttrs {
    /// Cheap validity predicate over the single input shape.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if self.out_channels == 0 || inputs.len() != 1 {
            return false;
        }
        let input = &inputs[0];
        let Some(channel) = innermost_logical(input) else {
            return false;
        };
        // The output channel dimension inherits the input channel split, so
        // its degree must divide the new extent.
        self.out_channels % input.dims[channel].degree == 0
    }

    /// Output shape: input dims with the channel extent replaced.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid linear input", "linear"));
        }
        let mut out = inputs[0].clone();
        let channel = innermost_logical(&out).expect("validated above");
        out.dims[channel].size = self.out_channels;
        Ok(vec![out])
    }

    /// Weight shapes: kernel `[out_channels, in_channels]` and, when
    /// `use_bias`, a bias `[out_channels]`. Weights start unsplit; the
    /// region mapper applies the linear-weight partitioning.
    pub fn weight_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid linear input", "linear"));
        }
        let input = &inputs[0];
        let channel = innermost_logical(input).expect("validated above");
        let in_channels = input.dims[channel].size;
        let data_type = input.data_type;
        let mut weights = vec![ParallelTensorShape::from_sizes(
            &[self.out_channels, in_channels],
            data_type,
        )];
        if self.use_bias {
            weights.push(ParallelTensorShape::from_sizes(
                &[self.out_channels],
                data_type,
            ));
        }
        Ok(weights)
    }
}

/// Attributes of an embedding lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingAttrs {
    /// Vocabulary size
    pub num_entries: usize,
    /// Embedding width
    pub out_dim: usize,
    /// Aggregation over the lookup dimension
    pub aggr: shardflow_core::types::AggrMode,
}

impl EmbeddingAttrs {
    /// Valid for a single integer-typed input.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        self.num_entries > 0
            && self.out_dim > 0
            && inputs.len() == 1
            && matches!(inputs[0].data_type, DataType::Int32 | DataType::Int64)
            && innermost_logical(&inputs[0]).is_some()
    }

    /// Output: index dims with the innermost extent replaced by `out_dim`
    /// and a float element type.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid embedding input", "embedding"));
        }
        let mut out = inputs[0].clone();
        let channel = innermost_logical(&out).expect("validated above");
        out.dims[channel].size = self.out_dim;
        out.dims[channel].degree = 1;
        out.dims[channel].parallel_idx = None;
        out.data_type = DataType::Float;
        Ok(vec![out])
    }

    /// One lookup table `[num_entries, out_dim]`.
    pub fn weight_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid embedding input", "embedding"));
        }
        Ok(vec![ParallelTensorShape::from_sizes(
            &[self.num_entries, self.out_dim],
            DataType::Float,
        )])
    }
}
