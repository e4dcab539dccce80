//! Machine model: device resources, machine views, and parallel configs.
//!
//! A machine view is an ordered list of axis extents locating a tensor's
//! shards on devices; a parallel config additionally pins concrete device
//! ids. Views are dense: one axis per output tensor dimension, degree-1
//! axes included, so two operators are co-located exactly when their views
//! compare equal.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::tensor::MAX_TENSOR_DIMS;

/// A physical device (worker) id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub usize);

/// The devices available to a compiled model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineResource {
    /// Number of nodes in the cluster
    pub num_nodes: usize,
    /// Accelerators per node
    pub workers_per_node: usize,
    /// Host CPUs per node
    pub cpus_per_node: usize,
}

impl MachineResource {
    /// Total number of accelerators.
    pub fn available_workers(&self) -> usize {
        self.num_nodes * self.workers_per_node
    }
}

/// An ordered tuple of axis extents addressing a subset of devices.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineView {
    dims: SmallVec<[usize; MAX_TENSOR_DIMS]>,
}

impl MachineView {
    /// Create a view from axis extents. Every extent must be positive.
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        let dims: SmallVec<[usize; MAX_TENSOR_DIMS]> = dims.into_iter().collect();
        debug_assert!(dims.iter().all(|&d| d > 0));
        Self { dims }
    }

    /// The single-device view of the given rank.
    pub fn trivial(ndims: usize) -> Self {
        Self::new(std::iter::repeat(1).take(ndims.max(1)))
    }

    /// Number of axes.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Extent of axis `i`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Axis extents.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Total number of addressed devices.
    pub fn num_devices(&self) -> usize {
        self.dims.iter().product()
    }

    /// Stable-within-process hash, used to key per-point argument maps and
    /// the communicator cache.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.dims.len().hash(&mut hasher);
        for d in &self.dims {
            d.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl fmt::Display for MachineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, "x")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

/// Per-operator assignment of partition degrees and device ids.
///
/// `dims` has the same arity as the owning operator's output rank; `dims[i]`
/// is the number of ways output dimension `i` is split. `device_ids` holds
/// one device per task point, `dims.iter().product()` in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Partition degree per output dimension
    pub dims: SmallVec<[usize; MAX_TENSOR_DIMS]>,
    /// Device assignment, one per task point
    pub device_ids: Vec<DeviceId>,
}

impl ParallelConfig {
    /// Create a config; `device_ids` must have `dims` product entries.
    pub fn new(dims: impl IntoIterator<Item = usize>, device_ids: Vec<DeviceId>) -> Self {
        let dims: SmallVec<[usize; MAX_TENSOR_DIMS]> = dims.into_iter().collect();
        debug_assert_eq!(device_ids.len(), dims.iter().product::<usize>());
        Self { dims, device_ids }
    }

    /// The pure data-parallel config of the given rank: dimension 0 split
    /// `workers` ways, devices `0..workers`.
    pub fn data_parallel(ndims: usize, workers: usize) -> Self {
        let mut dims: SmallVec<[usize; MAX_TENSOR_DIMS]> = SmallVec::new();
        dims.push(workers.max(1));
        dims.extend(std::iter::repeat(1).take(ndims.saturating_sub(1)));
        let device_ids = (0..workers.max(1)).map(DeviceId).collect();
        Self { dims, device_ids }
    }

    /// Number of dimensions.
    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    /// Number of task points (product of degrees).
    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }

    /// Whether this config only splits the batch (outermost) dimension.
    pub fn is_data_parallel(&self) -> bool {
        self.dims.iter().skip(1).all(|&d| d == 1)
    }

    /// Reshape a data-parallel config to a different rank, keeping the
    /// batch degree and device ids. Used by the propagation rewrite when a
    /// neighbor has a different output rank.
    pub fn change_data_parallel_dimensionality(&self, ndims: usize) -> Self {
        debug_assert!(self.is_data_parallel());
        let mut dims: SmallVec<[usize; MAX_TENSOR_DIMS]> = SmallVec::new();
        dims.push(self.dims[0]);
        dims.extend(std::iter::repeat(1).take(ndims.saturating_sub(1)));
        Self {
            dims,
            device_ids: self.device_ids.clone(),
        }
    }

    /// The machine view induced by this config.
    pub fn view(&self) -> MachineView {
        MachineView::new(self.dims.iter().copied())
    }
}

impl fmt::Display for ParallelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "] on {} devices", self.device_ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_devices_and_hash() {
        let a = MachineView::new([2, 2]);
        let b = MachineView::new([2, 2]);
        let c = MachineView::new([4, 1]);
        assert_eq!(a.num_devices(), 4);
        assert_eq!(a, b);
        assert_eq!(a.hash_key(), b.hash_key());
        assert_ne!(a, c);
    }

    #[test]
    fn test_data_parallel_config() {
        let pc = ParallelConfig::data_parallel(3, 4);
        assert_eq!(pc.dims.as_slice(), &[4, 1, 1]);
        assert_eq!(pc.num_parts(), 4);
        assert!(pc.is_data_parallel());
        assert_eq!(pc.view(), MachineView::new([4, 1, 1]));
    }

    #[test]
    fn test_change_dimensionality() {
        let pc = ParallelConfig::data_parallel(3, 2);
        let pc2 = pc.change_data_parallel_dimensionality(5);
        assert_eq!(pc2.dims.as_slice(), &[2, 1, 1, 1, 1]);
        assert_eq!(pc2.device_ids, pc.device_ids);
    }

    #[test]
    fn test_machine_resource() {
        let m = MachineResource {
            num_nodes: 2,
            workers_per_node: 4,
            cpus_per_node: 1,
        };
        assert_eq!(m.available_workers(), 8);
    }
}
