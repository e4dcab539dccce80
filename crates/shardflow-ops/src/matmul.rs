//! Batched matrix multiplication.

use serde::{Deserialize, Serialize};
use shardflow_core::error::{Error, Result};
use shardflow_core::tensor::ParallelTensorShape;

use crate::util::logical_rank;

/// Attributes of batch-matmul over `A [batch.., m, k]` and `B [batch.., k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMatmulAttrs {
    /// Logical dim of A that iteration-time `seq_length` truncates, if any
    pub a_seq_length_dim: Option<usize>,
    /// Logical dim of B that iteration-time `seq_length` truncates, if any
    pub b_seq_length_dim: Option<usize>,
}

impl BatchMatmulAttrs {
    /// Valid for two inputs of equal rank (at least 2 logical dims) whose
    /// batch dims agree and whose inner extents match.
    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        if inputs.len() != 2 {
            return false;
        }
        let (a, b) = (&inputs[0], &inputs[1]);
        let rank = logical_rank(a);
        if rank < 2 || logical_rank(b) != rank || a.data_type != b.data_type {
            return false;
        }
        let batch_match = (0..rank - 2).all(|i| a.dims[i] == b.dims[i]);
        // k of A is its innermost logical dim; k of B is its second-innermost.
        batch_match && a.dims[rank - 1].size == b.dims[rank - 2].size
    }

    /// Output `[batch.., m, n]`, inheriting A's partition on batch and m.
    pub fn output_shapes(&self, inputs: &[ParallelTensorShape]) -> Result<Vec<ParallelTensorShape>> {
        if !self.is_valid(inputs) {
            return Err(Error::structural_in(
                "incompatible batch-matmul operands",
                "batch-matmul",
            ));
        }
        let (a, b) = (&inputs[0], &inputs[1]);
        let rank = logical_rank(a);
        let mut out = a.clone();
        out.dims[rank - 1] = b.dims[rank - 1];
        Ok(vec![out])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::types::DataType;

    fn shape(sizes: &[usize]) -> ParallelTensorShape {
        ParallelTensorShape::from_sizes(sizes, DataType::Float)
    }

    #[test]
    fn test_batch_matmul_shape() {
        let attrs = BatchMatmulAttrs {
            a_seq_length_dim: None,
            b_seq_length_dim: None,
        };
        let outs = attrs
            .output_shapes(&[shape(&[4, 8, 16]), shape(&[4, 16, 32])])
            .unwrap();
        assert_eq!(outs[0].sizes(), vec![4, 8, 32]);
    }

    #[test]
    fn test_batch_matmul_rejects_mismatch() {
        let attrs = BatchMatmulAttrs {
            a_seq_length_dim: None,
            b_seq_length_dim: None,
        };
        // Inner extents differ.
        assert!(!attrs.is_valid(&[shape(&[4, 8, 16]), shape(&[4, 8, 32])]));
        // Batch extents differ.
        assert!(!attrs.is_valid(&[shape(&[4, 8, 16]), shape(&[2, 16, 32])]));
    }
}
