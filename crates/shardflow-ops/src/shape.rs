//! Shape-rearranging operators: reshape, transpose, split, concat, gather,
//! reduce-sum.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::{ParallelDim, ParallelTensorShape};
use shardflow_core::types::DataType;

use crate::util::logical_rank;

/// Attributes of reshape. The target shape is logical; replica dims of the
/// input survive at the tail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeAttrs {
    /// Target logical extents
    pub shape: Vec<usize>,
}

impl ReshapeAttrs {
    /// Valid when the target volume matches and no logical dim is split.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.shape.is_empty() {
            return false;
        }
        let input = &inputs[0];
        let logical_volume: usize = input
            .dims
            .iter()
            .filter(|d| !d.is_replica)
            .map(|d| d.size)
            .product();
        input
            .dims
            .iter()
            .filter(|d| !d.is_replica)
            .all(|d| d.degree == 1)
            && self.shape.iter().product::<usize>() == logical_volume
    }

    /// Output: target extents, unsplit, replica dims preserved.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid reshape target", "reshape"));
        }
        let input = &inputs[0];
        let mut dims: Vec<ParallelDim> =
            self.shape.iter().map(|&s| ParallelDim::new(s)).collect();
        dims.extend(input.dims.iter().filter(|d| d.is_replica).copied());
        Ok(vec![ParallelTensorShape::new(dims, input.data_type)])
    }
}

/// Attributes of transpose: a permutation of the logical dims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeAttrs {
    /// Permutation of `0..logical_rank`
    pub perm: Vec<usize>,
}

impl TransposeAttrs {
    /// Valid when `perm` is a permutation of the logical dims.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 {
            return false;
        }
        let rank = logical_rank(&inputs[0]);
        if self.perm.len() != rank {
            return false;
        }
        let mut seen = vec![false; rank];
        for &p in &self.perm {
            if p >= rank || seen[p] {
                return false;
            }
            seen[p] = true;
        }
        true
    }

    /// Output: permuted logical dims, each carrying its partition
    /// descriptor; replica dims stay at the tail.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid transpose permutation", "transpose"));
        }
        let input = &inputs[0];
        let mut dims: Vec<ParallelDim> = self.perm.iter().map(|&p| input.dims[p]).collect();
        dims.extend(input.dims.iter().filter(|d| d.is_replica).copied());
        Ok(vec![ParallelTensorShape::new(dims, input.data_type)])
    }
}

/// Attributes of split along one logical axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAttrs {
    /// Axis being split
    pub axis: usize,
    /// Output extents along the axis; must sum to the input extent
    pub sizes: Vec<usize>,
}

impl SplitAttrs {
    /// Valid when the axis is in range, unsplit, and extents sum up.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.sizes.is_empty() {
            return false;
        }
        let input = &inputs[0];
        self.axis < logical_rank(input)
            && input.dims[self.axis].degree == 1
            && self.sizes.iter().sum::<usize>() == input.dims[self.axis].size
    }

    /// One output per entry in `sizes`.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid split sizes", "split"));
        }
        let input = &inputs[0];
        Ok(self
            .sizes
            .iter()
            .map(|&s| {
                let mut out = input.clone();
                out.dims[self.axis].size = s;
                out
            })
            .collect())
    }
}

/// Attributes of concat along one logical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatAttrs {
    /// Axis being concatenated
    pub axis: usize,
}

impl ConcatAttrs {
    /// Valid for two or more inputs agreeing everywhere but the axis.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() < 2 {
            return false;
        }
        let first = &inputs[0];
        if self.axis >= logical_rank(first) || first.dims[self.axis].degree != 1 {
            return false;
        }
        inputs.iter().skip(1).all(|s| {
            s.rank() == first.rank()
                && s.data_type == first.data_type
                && s.dims
                    .iter()
                    .zip(first.dims.iter())
                    .enumerate()
                    .all(|(i, (a, b))| i == self.axis || a == b)
                && s.dims[self.axis].degree == 1
        })
    }

    /// Output: axis extent is the sum of input extents.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("mismatched concat inputs", "concat"));
        }
        let mut out = inputs[0].clone();
        out.dims[self.axis].size = inputs.iter().map(|s| s.dims[self.axis].size).sum();
        Ok(vec![out])
    }
}

/// Attributes of gather along one logical axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherAttrs {
    /// Axis being gathered over
    pub dim: usize,
}

impl GatherAttrs {
    /// Valid for `(input, index)` with integer indices of equal rank.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 2
            && matches!(inputs[1].data_type, DataType::Int32 | DataType::Int64)
            && inputs[0].rank() == inputs[1].rank()
            && self.dim < logical_rank(&inputs[0])
    }

    /// Output: the index shape carrying the input's element type.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid gather operands", "gather"));
        }
        let mut out = inputs[1].clone();
        out.data_type = inputs[0].data_type;
        Ok(vec![out])
    }
}

/// Attributes of reduce-sum over a set of logical axes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceAttrs {
    /// Axes reduced over
    pub axes: Vec<usize>,
    /// Keep reduced axes with extent 1
    pub keepdims: bool,
}

impl ReduceAttrs {
    /// Valid when the axes are in range and unsplit.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.axes.is_empty() {
            return false;
        }
        let rank = logical_rank(&inputs[0]);
        self.axes
            .iter()
            .all(|&a| a < rank && inputs[0].dims[a].degree == 1)
    }

    /// Output: reduced axes dropped, or kept with extent 1.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid reduce axes", "reduce-sum"));
        }
        let input = &inputs[0];
        let mut dims = Vec::new();
        for (i, d) in input.dims.iter().enumerate() {
            if !d.is_replica && self.axes.contains(&i) {
                if self.keepdims {
                    dims.push(ParallelDim::new(1));
                }
            } else {
                dims.push(*d);
            }
        }
        Ok(vec![ParallelTensorShape::new(dims, input.data_type)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(sizes: &[usize]) -> ParallelTensorShape {
        ParallelTensorShape::from_sizes(sizes, DataType::Float)
    }

    #[test]
    fn test_reshape_volume_check() {
        let attrs = ReshapeAttrs {
            shape: vec![4, 16],
        };
        assert!(attrs.is_valid(&[shape(&[8, 8])]));
        let outs = attrs.output_shapes(&[shape(&[8, 8])]).unwrap();
        assert_eq!(outs[0].sizes(), vec![4, 16]);

        let bad = ReshapeAttrs {
            shape: vec![4, 15],
        };
        assert!(!bad.is_valid(&[shape(&[8, 8])]));
    }

    #[test]
    fn test_transpose_moves_degrees() {
        let mut input = shape(&[8, 16]);
        input.dims[0].degree = 2;
        input.dims[0].parallel_idx = Some(0);
        let attrs = TransposeAttrs { perm: vec![1, 0] };
        let outs = attrs.output_shapes(std::slice::from_ref(&input)).unwrap();
        assert_eq!(outs[0].sizes(), vec![16, 8]);
        assert_eq!(outs[0].dims[1].degree, 2);
    }

    #[test]
    fn test_split_outputs() {
        let attrs = SplitAttrs {
            axis: 1,
            sizes: vec![4, 4, 8],
        };
        let outs = attrs.output_shapes(&[shape(&[8, 16])]).unwrap();
        assert_eq!(outs.len(), 3);
        assert_eq!(outs[2].sizes(), vec![8, 8]);

        let bad = SplitAttrs {
            axis: 1,
            sizes: vec![4, 4],
        };
        assert!(!bad.is_valid(&[shape(&[8, 16])]));
    }

    #[test]
    fn test_concat_sums_axis() {
        let attrs = ConcatAttrs { axis: 1 };
        let outs = attrs
            .output_shapes(&[shape(&[8, 4]), shape(&[8, 12])])
            .unwrap();
        assert_eq!(outs[0].sizes(), vec![8, 16]);
        assert!(!attrs.is_valid(&[shape(&[8, 4]), shape(&[4, 4])]));
    }

    #[test]
    fn test_gather_takes_index_shape() {
        let index = ParallelTensorShape::from_sizes(&[8, 3], DataType::Int64);
        let attrs = GatherAttrs { dim: 1 };
        let outs = attrs
            .output_shapes(&[shape(&[8, 16]), index])
            .unwrap();
        assert_eq!(outs[0].sizes(), vec![8, 3]);
        assert_eq!(outs[0].data_type, DataType::Float);
    }

    #[test]
    fn test_reduce_axes() {
        let attrs = ReduceAttrs {
            axes: vec![1],
            keepdims: false,
        };
        let outs = attrs.output_shapes(&[shape(&[8, 16])]).unwrap();
        assert_eq!(outs[0].sizes(), vec![8]);

        let keep = ReduceAttrs {
            axes: vec![1],
            keepdims: true,
        };
        let outs = keep.output_shapes(&[shape(&[8, 16])]).unwrap();
        assert_eq!(outs[0].sizes(), vec![8, 1]);
    }
}
