//! Multi-head attention.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;

use crate::util::{innermost_logical, logical_rank};

/// Attributes of multi-head attention over `(query, key, value)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionAttrs {
    /// Model embedding width
    pub embed_dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Total key projection width
    pub kdim: usize,
    /// Total value projection width
    pub vdim: usize,
    /// Attention dropout rate
    pub dropout: f32,
    /// Whether projections carry biases
    pub bias: bool,
    /// Learnable bias rows appended to key/value
    pub add_bias_kv: bool,
    /// Zero row appended to key/value
    pub add_zero_attn: bool,
}

impl AttentionAttrs {
    fn proj_sizes(&self) -> (usize, usize, usize) {
        (
            self.kdim / self.num_heads,
            self.vdim / self.num_heads,
            self.embed_dim / self.num_heads,
        )
    }

    /// Valid for three inputs of equal rank and batch extent, with head
    /// counts dividing each projection width.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 3 || self.num_heads == 0 {
            return false;
        }
        if self.embed_dim % self.num_heads != 0
            || self.kdim % self.num_heads != 0
            || self.vdim % self.num_heads != 0
        {
            return false;
        }
        let rank = logical_rank(&inputs[0]);
        rank >= 3
            && inputs.iter().all(|s| logical_rank(s) == rank)
            && inputs.iter().all(|s| s.dims[0] == inputs[0].dims[0])
            && inputs.iter().all(|s| innermost_logical(s).is_some())
    }

    /// Output: query dims with the feature extent replaced by `embed_dim`.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "invalid attention operands",
                "multi-head-attention",
            ));
        }
        let mut out = inputs[0].clone();
        let feature = innermost_logical(&out).expect("validated above");
        out.dims[feature].size = self.embed_dim;
        out.dims[feature].degree = 1;
        out.dims[feature].parallel_idx = None;
        Ok(vec![out])
    }

    /// One packed projection weight `[num_heads, weights_per_head]`: query,
    /// key, value, and output projection parameters for one head.
    pub fn weight_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "invalid attention operands",
                "multi-head-attention",
            ));
        }
        let q_size = inputs[0].dims[innermost_logical(&inputs[0]).expect("validated")].size;
        let k_size = inputs[1].dims[innermost_logical(&inputs[1]).expect("validated")].size;
        let v_size = inputs[2].dims[innermost_logical(&inputs[2]).expect("validated")].size;
        let (k_proj, v_proj, o_proj) = self.proj_sizes();
        let q_paras = k_proj * q_size;
        let k_paras = k_proj * k_size;
        let v_paras = v_proj * v_size;
        let o_paras = o_proj * v_proj * self.num_heads;
        Ok(vec![ParallelTensorShape::from_sizes(
            &[self.num_heads, q_paras + k_paras + v_paras + o_paras],
            inputs[0].data_type,
        )])
    }
}
