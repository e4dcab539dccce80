//! Spatial (NCHW) operators: conv2d, pool2d, flat.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::{ParallelDim, ParallelTensorShape};
use shardflow_core::types::{Activation, PoolKind};

use crate::util::logical_rank;

/// Spatial output extent for one axis.
fn conv_extent(size: usize, kernel: usize, stride: usize, padding: usize) -> Option<usize> {
    let padded = size + 2 * padding;
    if padded < kernel || stride == 0 {
        return None;
    }
    Some((padded - kernel) / stride + 1)
}

/// Attributes of a 2-D convolution over `[N, C, H, W]` inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conv2dAttrs {
    /// Output channel count
    pub out_channels: usize,
    /// Kernel height
    pub kernel_h: usize,
    /// Kernel width
    pub kernel_w: usize,
    /// Stride along H
    pub stride_h: usize,
    /// Stride along W
    pub stride_w: usize,
    /// Zero padding along H
    pub padding_h: usize,
    /// Zero padding along W
    pub padding_w: usize,
    /// Channel groups
    pub groups: usize,
    /// Activation fused into the kernel
    pub activation: Activation,
    /// Whether a bias weight exists
    pub use_bias: bool,
}

impl Conv2dAttrs {
    /// Valid for one 4-D logical input whose channel dimension is unsplit
    /// (channel partitioning of conv weights is unsupported) and whose
    /// channels divide into `groups`.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 1 || self.out_channels == 0 || self.groups == 0 {
            return false;
        }
        let input = &inputs[0];
        if logical_rank(input) != 4 {
            return false;
        }
        let c = &input.dims[1];
        if c.degree != 1 || c.size % self.groups != 0 || self.out_channels % self.groups != 0 {
            return false;
        }
        conv_extent(input.dims[2].size, self.kernel_h, self.stride_h, self.padding_h).is_some()
            && conv_extent(input.dims[3].size, self.kernel_w, self.stride_w, self.padding_w)
                .is_some()
    }

    /// Output `[N, out_channels, H', W']`, preserving the sample and
    /// spatial partition degrees.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid conv2d input", "conv2d"));
        }
        let input = &inputs[0];
        let mut out = input.clone();
        out.dims[1] = ParallelDim::new(self.out_channels);
        out.dims[2].size =
            conv_extent(input.dims[2].size, self.kernel_h, self.stride_h, self.padding_h)
                .expect("validated above");
        out.dims[3].size =
            conv_extent(input.dims[3].size, self.kernel_w, self.stride_w, self.padding_w)
                .expect("validated above");
        Ok(vec![out])
    }

    /// Kernel `[out_channels, in_channels / groups, kernel_h, kernel_w]`
    /// and, when `use_bias`, a bias `[out_channels]`.
    pub fn weight_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid conv2d input", "conv2d"));
        }
        let input = &inputs[0];
        let in_channels = input.dims[1].size;
        let data_type = input.data_type;
        let mut weights = vec![ParallelTensorShape::from_sizes(
            &[
                self.out_channels,
                in_channels / self.groups,
                self.kernel_h,
                self.kernel_w,
            ],
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

/// Attributes of 2-D pooling over `[N, C, H, W]` inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool2dAttrs {
    /// Kernel height
    pub kernel_h: usize,
    /// Kernel width
    pub kernel_w: usize,
    /// Stride along H
    pub stride_h: usize,
    /// Stride along W
    pub stride_w: usize,
    /// Zero padding along H
    pub padding_h: usize,
    /// Zero padding along W
    pub padding_w: usize,
    /// Pooling flavor
    pub pool: PoolKind,
    /// Activation fused into the kernel
    pub activation: Activation,
}

impl Pool2dAttrs {
    /// Valid for one 4-D logical input.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1
            && logical_rank(&inputs[0]) == 4
            && conv_extent(
                inputs[0].dims[2].size,
                self.kernel_h,
                self.stride_h,
                self.padding_h,
            )
            .is_some()
            && conv_extent(
                inputs[0].dims[3].size,
                self.kernel_w,
                self.stride_w,
                self.padding_w,
            )
            .is_some()
    }

    /// Output `[N, C, H', W']`.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid pool2d input", "pool2d"));
        }
        let input = &inputs[0];
        let mut out = input.clone();
        out.dims[2].size =
            conv_extent(input.dims[2].size, self.kernel_h, self.stride_h, self.padding_h)
                .expect("validated above");
        out.dims[3].size =
            conv_extent(input.dims[3].size, self.kernel_w, self.stride_w, self.padding_w)
                .expect("validated above");
        Ok(vec![out])
    }
}

/// Attributes of flat: collapse `[N, C, H, W]` into `[N, C*H*W]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlatAttrs {}

impl FlatAttrs {
    /// Valid for one 4-D logical input with unsplit non-sample dims.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        inputs.len() == 1
            && logical_rank(&inputs[0]) == 4
            && inputs[0].dims[1..4].iter().all(|d| d.degree == 1)
    }

    /// Output `[N, C*H*W]` plus any replica dims of the input.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in("invalid flat input", "flat"));
        }
        let input = &inputs[0];
        let flattened = input.dims[1].size * input.dims[2].size * input.dims[3].size;
        let mut dims = vec![input.dims[0], ParallelDim::new(flattened)];
        dims.extend(input.dims.iter().skip(4).copied());
        Ok(vec![ParallelTensorShape::new(dims, input.data_type)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::types::DataType;

    fn nchw(n: usize, c: usize, h: usize, w: usize) -> ParallelTensorShape {
        let mut shape = ParallelTensorShape::from_sizes(&[n, c, h, w], DataType::Float);
        shape.push_replica_dim();
        shape
    }

    #[test]
    fn test_conv_output_shape() {
        let attrs = Conv2dAttrs {
            out_channels: 16,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            padding_h: 1,
            padding_w: 1,
            groups: 1,
            activation: Activation::Relu,
            use_bias: true,
        };
        let outs = attrs.output_shapes(&[nchw(8, 3, 32, 32)]).unwrap();
        assert_eq!(outs[0].logical().dims.as_slice(), &[8, 16, 32, 32]);

        let ws = attrs.weight_shapes(&[nchw(8, 3, 32, 32)]).unwrap();
        assert_eq!(ws[0].sizes(), vec![16, 3, 3, 3]);
        assert_eq!(ws[1].sizes(), vec![16]);
    }

    #[test]
    fn test_conv_rejects_split_channels() {
        let mut input = nchw(8, 4, 16, 16);
        input.dims[1].degree = 2;
        input.dims[1].parallel_idx = Some(1);
        let attrs = Conv2dAttrs {
            out_channels: 8,
            kernel_h: 3,
            kernel_w: 3,
            stride_h: 1,
            stride_w: 1,
            padding_h: 1,
            padding_w: 1,
            groups: 1,
            activation: Activation::None,
            use_bias: false,
        };
        assert!(!attrs.is_valid(std::slice::from_ref(&input)));
    }

    #[test]
    fn test_pool_output_shape() {
        let attrs = Pool2dAttrs {
            kernel_h: 2,
            kernel_w: 2,
            stride_h: 2,
            stride_w: 2,
            padding_h: 0,
            padding_w: 0,
            pool: PoolKind::Max,
            activation: Activation::None,
        };
        let outs = attrs.output_shapes(&[nchw(8, 16, 32, 32)]).unwrap();
        assert_eq!(outs[0].logical().dims.as_slice(), &[8, 16, 16, 16]);
    }

    #[test]
    fn test_flat_output_shape() {
        let attrs = FlatAttrs::default();
        let outs = attrs.output_shapes(&[nchw(8, 16, 4, 4)]).unwrap();
        assert_eq!(outs[0].logical().dims.as_slice(), &[8, 256]);
        assert_eq!(outs[0].rank(), 3);
    }
}
