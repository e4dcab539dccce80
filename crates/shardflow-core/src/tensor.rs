//! Logical and parallel tensor shapes.
//!
//! Dimensions are stored row-major (outermost first), so the batch
//! dimension of an activation tensor is dimension 0. Input lifting appends
//! one replica dimension of logical size 1 at the tail; pure replication is
//! modeled by raising that dimension's degree.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::machine::MachineView;
use crate::types::{
    DataType, InitializerKind, OperatorId, ParamSync, ParallelTensorId, PartitionHandle,
    RegionHandle,
};

/// Maximum tensor rank, including the trailing replica dimension.
pub const MAX_TENSOR_DIMS: usize = 5;

/// A logical tensor shape: ordered positive extents plus an element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    /// Dimension sizes, outermost first
    pub dims: SmallVec<[usize; MAX_TENSOR_DIMS]>,
    /// Element type
    pub data_type: DataType,
}

impl TensorShape {
    /// Create a shape from sizes.
    pub fn new(dims: impl IntoIterator<Item = usize>, data_type: DataType) -> Self {
        Self {
            dims: dims.into_iter().collect(),
            data_type,
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements.
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }
}

/// One dimension of a parallel tensor shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelDim {
    /// Logical extent
    pub size: usize,
    /// How many ways this dimension is split across devices
    pub degree: usize,
    /// Machine-view axis this dimension is split along, if split
    pub parallel_idx: Option<usize>,
    /// Marks a redundant replication dimension of logical size 1
    pub is_replica: bool,
}

impl ParallelDim {
    /// An unsplit dimension of the given size.
    pub fn new(size: usize) -> Self {
        Self {
            size,
            degree: 1,
            parallel_idx: None,
            is_replica: false,
        }
    }

    /// A fresh replica dimension (logical size 1, unsplit).
    pub fn replica() -> Self {
        Self {
            size: 1,
            degree: 1,
            parallel_idx: None,
            is_replica: true,
        }
    }

    /// Whether this dimension is split across more than one shard.
    pub fn is_partitioned(&self) -> bool {
        self.degree > 1
    }

    /// Per-shard extent, rounding up.
    pub fn tile_size(&self) -> usize {
        self.size.div_ceil(self.degree)
    }
}

/// A parallel tensor shape: parallel dimensions plus an element type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelTensorShape {
    /// Parallel dimensions, outermost first
    pub dims: SmallVec<[ParallelDim; MAX_TENSOR_DIMS]>,
    /// Element type
    pub data_type: DataType,
}

impl ParallelTensorShape {
    /// Create a shape from parallel dims.
    pub fn new(dims: impl IntoIterator<Item = ParallelDim>, data_type: DataType) -> Self {
        Self {
            dims: dims.into_iter().collect(),
            data_type,
        }
    }

    /// Create an unsplit shape from logical sizes.
    pub fn from_sizes(sizes: &[usize], data_type: DataType) -> Self {
        Self::new(sizes.iter().map(|&s| ParallelDim::new(s)), data_type)
    }

    /// Lift a logical shape into an unsplit parallel shape.
    pub fn from_logical(shape: &TensorShape) -> Self {
        Self::from_sizes(&shape.dims, shape.data_type)
    }

    /// Append a trailing replica dimension.
    pub fn push_replica_dim(&mut self) {
        self.dims.push(ParallelDim::replica());
    }

    /// Number of dimensions, including any replica dimension.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of logical elements (replica dims have size 1).
    pub fn volume(&self) -> usize {
        self.dims.iter().map(|d| d.size).product()
    }

    /// Product of partition degrees across all dimensions.
    pub fn total_degree(&self) -> usize {
        self.dims.iter().map(|d| d.degree).product()
    }

    /// The logical shape, with replica dimensions stripped.
    pub fn logical(&self) -> TensorShape {
        TensorShape::new(
            self.dims.iter().filter(|d| !d.is_replica).map(|d| d.size),
            self.data_type,
        )
    }

    /// Logical sizes including replica dims, for error reporting.
    pub fn sizes(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.size).collect()
    }

    /// The machine view induced by the partition descriptor: one axis per
    /// dimension, carrying that dimension's degree.
    pub fn machine_view(&self) -> MachineView {
        MachineView::new(self.dims.iter().map(|d| d.degree))
    }

    /// Check the shape invariants:
    ///
    /// - every split dimension names a machine-view axis;
    /// - no machine-view axis is named by two dimensions;
    /// - `degree` divides `size` unless the dimension is a replica.
    pub fn check_valid(&self) -> Result<()> {
        let mut seen_axes: SmallVec<[usize; MAX_TENSOR_DIMS]> = SmallVec::new();
        for (i, d) in self.dims.iter().enumerate() {
            if d.size == 0 || d.degree == 0 {
                return Err(Error::shape(format!(
                    "dimension {i} has zero size or degree"
                )));
            }
            if d.degree > 1 && d.parallel_idx.is_none() {
                return Err(Error::shape(format!(
                    "dimension {i} is split {} ways but names no machine axis",
                    d.degree
                )));
            }
            if let Some(axis) = d.parallel_idx {
                if seen_axes.contains(&axis) {
                    return Err(Error::shape(format!(
                        "machine axis {axis} is named by more than one dimension"
                    )));
                }
                seen_axes.push(axis);
            }
            if !d.is_replica && d.size % d.degree != 0 {
                return Err(Error::shape(format!(
                    "dimension {i} size {} is not divisible by degree {}",
                    d.size, d.degree
                )));
            }
        }
        Ok(())
    }

    /// Whether the partition fits within `total_devices` devices.
    pub fn fits_within(&self, total_devices: usize) -> bool {
        self.total_degree() <= total_devices.max(1)
    }
}

/// A reference to a parallel tensor through its owning operator and output
/// slot. Inputs are modeled as weak lookups into the graph's operator
/// table; only the owner holds the tensor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorRef {
    /// Operator that owns the tensor
    pub owner: OperatorId,
    /// Output slot within the owner
    pub slot: usize,
}

impl TensorRef {
    /// Create a reference.
    pub fn new(owner: OperatorId, slot: usize) -> Self {
        Self { owner, slot }
    }
}

/// A parallel tensor: shape, ownership, and (after mapping) region and
/// partition handles.
#[derive(Debug, Clone)]
pub struct ParallelTensor {
    /// Globally unique id
    pub id: ParallelTensorId,
    /// Shape with partition descriptor
    pub shape: ParallelTensorShape,
    /// Owning operator
    pub owner: OperatorId,
    /// Output slot within the owner
    pub owner_slot: usize,
    /// Whether a gradient shadow is materialized when training
    pub create_gradients: bool,
    /// Machine view the tensor's shards are launched over
    pub machine_view: MachineView,
    /// Region handle, populated by the region mapper
    pub region: Option<RegionHandle>,
    /// Partition handle, populated by the region mapper
    pub partition: Option<PartitionHandle>,
    /// Gradient region shadow
    pub region_grad: Option<RegionHandle>,
    /// Gradient partition shadow
    pub partition_grad: Option<PartitionHandle>,
    /// Initializer descriptor, weights only
    pub initializer: Option<InitializerKind>,
    /// Synchronization mode, weights only
    pub sync_kind: Option<ParamSync>,
}

impl ParallelTensor {
    /// Create an unmapped tensor owned by `owner` at `owner_slot`.
    pub fn new(
        id: ParallelTensorId,
        shape: ParallelTensorShape,
        owner: OperatorId,
        owner_slot: usize,
        create_gradients: bool,
    ) -> Self {
        let machine_view = shape.machine_view();
        Self {
            id,
            shape,
            owner,
            owner_slot,
            create_gradients,
            machine_view,
            region: None,
            partition: None,
            region_grad: None,
            partition_grad: None,
            initializer: None,
            sync_kind: None,
        }
    }

    /// Mark this tensor as a weight with the given initializer and sync
    /// mode.
    pub fn into_weight(mut self, initializer: InitializerKind, sync: ParamSync) -> Self {
        self.initializer = Some(initializer);
        self.sync_kind = Some(sync);
        self
    }

    /// Element type.
    pub fn data_type(&self) -> DataType {
        self.shape.data_type
    }

    /// Number of logical elements.
    pub fn volume(&self) -> usize {
        self.shape.volume()
    }

    /// A reference to this tensor through its owner.
    pub fn as_ref(&self) -> TensorRef {
        TensorRef::new(self.owner, self.owner_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logical_strips_replica() {
        let mut shape = ParallelTensorShape::from_sizes(&[64, 128], DataType::Float);
        shape.push_replica_dim();
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.logical().dims.as_slice(), &[64, 128]);
        assert_eq!(shape.volume(), 64 * 128);
    }

    #[test]
    fn test_check_valid_divisibility() {
        let mut shape = ParallelTensorShape::from_sizes(&[8, 16], DataType::Float);
        shape.dims[0].degree = 3;
        shape.dims[0].parallel_idx = Some(0);
        assert!(shape.check_valid().is_err());

        shape.dims[0].degree = 4;
        assert!(shape.check_valid().is_ok());
    }

    #[test]
    fn test_check_valid_axis_rules() {
        let mut shape = ParallelTensorShape::from_sizes(&[8, 16], DataType::Float);
        // Split without naming an axis is invalid.
        shape.dims[1].degree = 2;
        assert!(shape.check_valid().is_err());

        shape.dims[1].parallel_idx = Some(1);
        assert!(shape.check_valid().is_ok());

        // Duplicate axis is invalid.
        shape.dims[0].degree = 2;
        shape.dims[0].parallel_idx = Some(1);
        assert!(shape.check_valid().is_err());
    }

    #[test]
    fn test_replica_degree_exempt_from_divisibility() {
        let mut shape = ParallelTensorShape::from_sizes(&[8], DataType::Float);
        shape.push_replica_dim();
        shape.dims[1].degree = 4;
        shape.dims[1].parallel_idx = Some(1);
        assert!(shape.check_valid().is_ok());
        assert_eq!(shape.total_degree(), 4);
        assert!(shape.fits_within(4));
        assert!(!shape.fits_within(2));
    }

    #[test]
    fn test_machine_view_derivation() {
        let mut shape = ParallelTensorShape::from_sizes(&[16, 8], DataType::Float);
        shape.dims[0].degree = 4;
        shape.dims[0].parallel_idx = Some(0);
        shape.dims[1].degree = 2;
        shape.dims[1].parallel_idx = Some(1);
        assert_eq!(shape.machine_view(), MachineView::new([4, 2]));
    }
}
