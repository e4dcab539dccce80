//! Shared shape helpers for the operator catalog.

use shardflow_core::tensor::ParallelTensorShape;

/// Index of the innermost non-replica dimension, if any.
pub(crate) fn innermost_logical(shape: &ParallelTensorShape) -> Option<usize> {
    shape.dims.iter().rposition(|d| !d.is_replica)
}

/// Index of the trailing replica dimension, if any.
pub(crate) fn replica_dim(shape: &ParallelTensorShape) -> Option<usize> {
    shape.dims.iter().position(|d| d.is_replica)
}

/// Number of non-replica dimensions.
pub(crate) fn logical_rank(shape: &ParallelTensorShape) -> usize {
    shape.dims.iter().filter(|d| !d.is_replica).count()
}

/// Whether two shapes have identical dims (sizes, degrees, and axes).
pub(crate) fn same_partitioned_shape(a: &ParallelTensorShape, b: &ParallelTensorShape) -> bool {
    a.dims == b.dims
}
