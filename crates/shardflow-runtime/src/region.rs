//! Region store and the mapper from parallel tensors to partitioned
//! regions.
//!
//! The task runtime proper is an external collaborator, so the crate
//! carries its own registry of index spaces, regions, and restriction
//! partitions, with exact disjointness and completeness verification.
//! Every transform the mapper builds is separable: each tensor dimension
//! is driven by at most one task axis, so completeness factors into
//! per-dimension interval coverage while disjointness is checked pairwise
//! over task points.

use std::collections::HashMap;

use shardflow_core::error::{Error, Result};
use shardflow_core::machine::MachineView;
use shardflow_core::tensor::{ParallelTensor, MAX_TENSOR_DIMS};
use shardflow_core::types::{CompMode, IndexSpaceHandle, ParamSync, PartitionHandle, RegionHandle};
use smallvec::SmallVec;
use tracing::debug;

/// An inclusive axis-aligned box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rect {
    /// Inclusive lower corner
    pub lo: SmallVec<[i64; MAX_TENSOR_DIMS]>,
    /// Inclusive upper corner
    pub hi: SmallVec<[i64; MAX_TENSOR_DIMS]>,
}

impl Rect {
    /// The box `[0, extent_i)` for each axis.
    pub fn from_extents(extents: &[usize]) -> Self {
        Self {
            lo: extents.iter().map(|_| 0).collect(),
            hi: extents.iter().map(|&e| e as i64 - 1).collect(),
        }
    }

    /// Number of axes.
    pub fn ndims(&self) -> usize {
        self.lo.len()
    }

    /// Number of points; zero when empty.
    pub fn volume(&self) -> usize {
        let mut v = 1usize;
        for (lo, hi) in self.lo.iter().zip(self.hi.iter()) {
            if hi < lo {
                return 0;
            }
            v *= (hi - lo + 1) as usize;
        }
        v
    }

    /// Axis-wise intersection.
    pub fn intersection(&self, other: &Rect) -> Rect {
        Rect {
            lo: self
                .lo
                .iter()
                .zip(other.lo.iter())
                .map(|(a, b)| *a.max(b))
                .collect(),
            hi: self
                .hi
                .iter()
                .zip(other.hi.iter())
                .map(|(a, b)| *a.min(b))
                .collect(),
        }
    }

    /// All points of the box, lexicographically.
    fn points(&self) -> Vec<SmallVec<[i64; MAX_TENSOR_DIMS]>> {
        let mut points = vec![SmallVec::new()];
        for (lo, hi) in self.lo.iter().zip(self.hi.iter()) {
            let mut next = Vec::with_capacity(points.len() * ((hi - lo + 1).max(0) as usize));
            for p in &points {
                for v in *lo..=*hi {
                    let mut q = p.clone();
                    q.push(v);
                    next.push(q);
                }
            }
            points = next;
        }
        points
    }
}

/// A logical region: an index space plus a field size.
#[derive(Debug, Clone)]
pub struct Region {
    /// Backing index space
    pub index_space: IndexSpaceHandle,
    /// Bytes per element
    pub field_bytes: usize,
}

/// A restriction partition of a region.
#[derive(Debug, Clone)]
pub struct Partition {
    /// Partitioned region
    pub region: RegionHandle,
    /// Task (color) space
    pub color_space: IndexSpaceHandle,
    /// N x T stride matrix
    pub transform: Vec<Vec<i64>>,
    /// Tile extent
    pub extent: Rect,
    /// Whether no two tiles overlap
    pub disjoint: bool,
    /// Whether the tiles cover the region
    pub complete: bool,
}

/// Registry of index spaces, regions, and partitions.
#[derive(Debug, Default)]
pub struct RegionStore {
    index_spaces: Vec<Rect>,
    regions: Vec<Region>,
    partitions: Vec<Partition>,
    task_spaces: HashMap<u64, IndexSpaceHandle>,
}

impl RegionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an index space.
    pub fn create_index_space(&mut self, rect: Rect) -> IndexSpaceHandle {
        self.index_spaces.push(rect);
        IndexSpaceHandle(self.index_spaces.len() as u64 - 1)
    }

    /// The task index space of a machine view, created on first use.
    pub fn get_or_create_task_space(&mut self, view: &MachineView) -> IndexSpaceHandle {
        if let Some(&handle) = self.task_spaces.get(&view.hash_key()) {
            return handle;
        }
        let rect = Rect::from_extents(view.dims());
        let handle = self.create_index_space(rect);
        self.task_spaces.insert(view.hash_key(), handle);
        handle
    }

    /// Register a region over an index space.
    pub fn create_region(&mut self, index_space: IndexSpaceHandle, field_bytes: usize) -> RegionHandle {
        self.regions.push(Region {
            index_space,
            field_bytes,
        });
        RegionHandle(self.regions.len() as u64 - 1)
    }

    /// The rect of an index space.
    pub fn index_space_rect(&self, handle: IndexSpaceHandle) -> &Rect {
        &self.index_spaces[handle.0 as usize]
    }

    /// Look up a region.
    pub fn region(&self, handle: RegionHandle) -> &Region {
        &self.regions[handle.0 as usize]
    }

    /// Look up a partition.
    pub fn partition(&self, handle: PartitionHandle) -> &Partition {
        &self.partitions[handle.0 as usize]
    }

    /// The tile of `partition` at a task point, clipped to the region.
    pub fn subrect(&self, partition: &Partition, point: &[i64]) -> Rect {
        let region_rect = self.index_space_rect(self.region(partition.region).index_space);
        let mut tile = partition.extent.clone();
        for i in 0..tile.ndims() {
            let offset: i64 = partition.transform[i]
                .iter()
                .zip(point.iter())
                .map(|(t, p)| t * p)
                .sum();
            tile.lo[i] += offset;
            tile.hi[i] += offset;
        }
        tile.intersection(region_rect)
    }

    /// Create a restriction partition and verify its structure.
    /// Completeness is always required; disjointness only when
    /// `require_disjoint` (the aliased variant relaxes it).
    pub fn create_partition_by_restriction(
        &mut self,
        region: RegionHandle,
        color_space: IndexSpaceHandle,
        transform: Vec<Vec<i64>>,
        extent: Rect,
        require_disjoint: bool,
    ) -> Result<PartitionHandle> {
        let region_rect = self
            .index_space_rect(self.region(region).index_space)
            .clone();
        if transform.len() != region_rect.ndims() {
            return Err(Error::partition(format!(
                "transform has {} rows for a {}-d region",
                transform.len(),
                region_rect.ndims()
            )));
        }
        let partition = Partition {
            region,
            color_space,
            transform,
            extent,
            disjoint: false,
            complete: false,
        };

        let colors = self.index_space_rect(color_space).points();
        let tiles: Vec<Rect> = colors
            .iter()
            .map(|p| self.subrect(&partition, p))
            .collect();

        let mut disjoint = true;
        for a in 0..tiles.len() {
            if tiles[a].volume() == 0 {
                continue;
            }
            for b in (a + 1)..tiles.len() {
                if tiles[a].intersection(&tiles[b]).volume() > 0 {
                    disjoint = false;
                    break;
                }
            }
            if !disjoint {
                break;
            }
        }

        // Separable transforms make coverage factor per dimension.
        let mut complete = true;
        for dim in 0..region_rect.ndims() {
            let mut intervals: Vec<(i64, i64)> = tiles
                .iter()
                .filter(|t| t.volume() > 0)
                .map(|t| (t.lo[dim], t.hi[dim]))
                .collect();
            intervals.sort_unstable();
            let mut covered = region_rect.lo[dim] - 1;
            for (lo, hi) in intervals {
                if lo > covered + 1 {
                    break;
                }
                covered = covered.max(hi);
            }
            if covered < region_rect.hi[dim] {
                complete = false;
                break;
            }
        }
        if tiles.iter().all(|t| t.volume() == 0) {
            complete = false;
        }

        if !complete {
            return Err(Error::partition(
                "restriction partition does not cover its region",
            ));
        }
        if require_disjoint && !disjoint {
            return Err(Error::partition(
                "restriction partition is not disjoint",
            ));
        }

        self.partitions.push(Partition {
            disjoint,
            complete,
            ..partition
        });
        Ok(PartitionHandle(self.partitions.len() as u64 - 1))
    }
}

/// Maps parallel tensors onto partitioned regions.
pub struct RegionMapper<'a> {
    store: &'a mut RegionStore,
    mode: CompMode,
}

/// Physical extent of one tensor dimension: replica dims materialize one
/// copy per shard.
fn physical_extent(tensor: &ParallelTensor, dim: usize) -> usize {
    let d = &tensor.shape.dims[dim];
    if d.is_replica {
        d.degree.max(1)
    } else {
        d.size
    }
}

impl<'a> RegionMapper<'a> {
    /// Create a mapper over a store.
    pub fn new(store: &'a mut RegionStore, mode: CompMode) -> Self {
        Self { store, mode }
    }

    fn tensor_rect(&self, tensor: &ParallelTensor) -> Rect {
        let extents: Vec<usize> = (0..tensor.shape.rank())
            .map(|i| physical_extent(tensor, i))
            .collect();
        Rect::from_extents(&extents)
    }

    /// Generic mapping: one field of the element type, a tile per task
    /// point derived from the partition descriptor, disjoint and
    /// complete. Training tensors with gradients get a shadow region on
    /// the same index space.
    pub fn map_tensor(&mut self, tensor: &mut ParallelTensor) -> Result<()> {
        let rect = self.tensor_rect(tensor);
        let index_space = self.store.create_index_space(rect.clone());
        let field_bytes = tensor.data_type().size_in_bytes();
        let region = self.store.create_region(index_space, field_bytes);

        let task_space = self.store.get_or_create_task_space(&tensor.machine_view);
        let tdim = tensor.machine_view.ndims();

        let mut extent_dims = Vec::with_capacity(tensor.shape.rank());
        for i in 0..tensor.shape.rank() {
            let degree = tensor.shape.dims[i].degree.max(1);
            extent_dims.push(physical_extent(tensor, i).div_ceil(degree));
        }
        let extent = Rect::from_extents(&extent_dims);

        let mut transform = vec![vec![0i64; tdim]; tensor.shape.rank()];
        for (i, d) in tensor.shape.dims.iter().enumerate() {
            if let Some(axis) = d.parallel_idx {
                if axis >= tdim {
                    return Err(Error::partition(format!(
                        "dimension {i} names machine axis {axis} outside the task space"
                    )));
                }
                transform[i][axis] = extent_dims[i] as i64;
            }
        }

        let partition = self.store.create_partition_by_restriction(
            region,
            task_space,
            transform.clone(),
            extent.clone(),
            true,
        )?;
        tensor.region = Some(region);
        tensor.partition = Some(partition);

        if tensor.create_gradients && self.mode == CompMode::Training {
            let grad_space = self.store.create_index_space(rect);
            let grad_region = self.store.create_region(grad_space, field_bytes);
            let grad_partition = self.store.create_partition_by_restriction(
                grad_region,
                task_space,
                transform,
                extent,
                true,
            )?;
            tensor.region_grad = Some(grad_region);
            tensor.partition_grad = Some(grad_partition);
        }
        debug!(tensor = %tensor.id, "mapped tensor");
        Ok(())
    }

    /// Aliased variant: completeness is required but tiles may overlap
    /// along `aliased_dim`, whose transform row is zeroed and whose tile
    /// extent covers the whole dimension.
    pub fn create_aliased_partition(
        &mut self,
        tensor: &ParallelTensor,
        aliased_dim: usize,
    ) -> Result<PartitionHandle> {
        let region = tensor
            .region
            .ok_or_else(|| Error::partition("tensor has no mapped region"))?;
        let task_space = self.store.get_or_create_task_space(&tensor.machine_view);
        let tdim = tensor.machine_view.ndims();

        let mut extent_dims = Vec::with_capacity(tensor.shape.rank());
        for i in 0..tensor.shape.rank() {
            let degree = if i == aliased_dim {
                1
            } else {
                tensor.shape.dims[i].degree.max(1)
            };
            extent_dims.push(physical_extent(tensor, i).div_ceil(degree));
        }
        let extent = Rect::from_extents(&extent_dims);

        let mut transform = vec![vec![0i64; tdim]; tensor.shape.rank()];
        for (i, d) in tensor.shape.dims.iter().enumerate() {
            if i == aliased_dim {
                continue;
            }
            if let Some(axis) = d.parallel_idx {
                transform[i][axis] = extent_dims[i] as i64;
            }
        }
        self.store
            .create_partition_by_restriction(region, task_space, transform, extent, false)
    }

    /// Linear-weight mapping: the output-channel dimension (dim 0) splits
    /// across the first task axis. Under collective sync the region holds
    /// one private copy per remaining task point, encoded by stride rows;
    /// parameter-server sync keeps one shared copy whose tiles alias.
    pub fn map_linear_weight(
        &mut self,
        weight: &mut ParallelTensor,
        consumer_view: &MachineView,
    ) -> Result<()> {
        let sync = weight.sync_kind.unwrap_or(ParamSync::ParameterServer);
        let out_channels = weight.shape.dims[0].size;
        let tdim = consumer_view.ndims();
        let num_parts: Vec<usize> = consumer_view.dims().to_vec();
        if out_channels % num_parts[0] != 0 {
            return Err(Error::partition(format!(
                "out channels {out_channels} do not tile across {} shards",
                num_parts[0]
            )));
        }
        let replicas: usize = num_parts.iter().skip(1).product();
        let field_bytes = weight.data_type().size_in_bytes();
        let task_space = self.store.get_or_create_task_space(consumer_view);

        let mut sizes: Vec<usize> = weight.shape.dims.iter().map(|d| d.size).collect();
        let mut extent_dims = sizes.clone();
        extent_dims[0] = out_channels / num_parts[0];

        let mut transform = vec![vec![0i64; tdim]; sizes.len()];
        transform[0][0] = (out_channels / num_parts[0]) as i64;

        let (region, partition) = match sync {
            ParamSync::ParameterServer => {
                let index_space = self.store.create_index_space(Rect::from_extents(&sizes));
                let region = self.store.create_region(index_space, field_bytes);
                let partition = self.store.create_partition_by_restriction(
                    region,
                    task_space,
                    transform.clone(),
                    Rect::from_extents(&extent_dims),
                    false,
                )?;
                (region, partition)
            }
            ParamSync::Collective => {
                sizes[0] = replicas * out_channels;
                for j in 1..tdim {
                    transform[0][j] = transform[0][j - 1] * num_parts[j - 1] as i64;
                }
                let index_space = self.store.create_index_space(Rect::from_extents(&sizes));
                let region = self.store.create_region(index_space, field_bytes);
                let partition = self.store.create_partition_by_restriction(
                    region,
                    task_space,
                    transform.clone(),
                    Rect::from_extents(&extent_dims),
                    true,
                )?;
                (region, partition)
            }
        };
        weight.region = Some(region);
        weight.partition = Some(partition);

        // Gradients accumulate per shard before synchronization, so the
        // shadow is always the enlarged stride layout.
        if weight.create_gradients && self.mode == CompMode::Training {
            let mut grad_sizes: Vec<usize> = weight.shape.dims.iter().map(|d| d.size).collect();
            grad_sizes[0] = replicas * out_channels;
            let mut grad_transform = vec![vec![0i64; tdim]; grad_sizes.len()];
            grad_transform[0][0] = (out_channels / num_parts[0]) as i64;
            for j in 1..tdim {
                grad_transform[0][j] = grad_transform[0][j - 1] * num_parts[j - 1] as i64;
            }
            let grad_space = self
                .store
                .create_index_space(Rect::from_extents(&grad_sizes));
            let grad_region = self.store.create_region(grad_space, field_bytes);
            let grad_partition = self.store.create_partition_by_restriction(
                grad_region,
                task_space,
                grad_transform,
                Rect::from_extents(&extent_dims),
                true,
            )?;
            weight.region_grad = Some(grad_region);
            weight.partition_grad = Some(grad_partition);
        }
        Ok(())
    }

    /// Conv-weight mapping over a `(N, C, H, W)`-shaped task space.
    /// Splitting the channel axis is unsupported; under collective sync a
    /// private copy exists per `(N, H, W)` task point.
    pub fn map_conv_weight(
        &mut self,
        weight: &mut ParallelTensor,
        consumer_view: &MachineView,
    ) -> Result<()> {
        let sync = weight.sync_kind.unwrap_or(ParamSync::ParameterServer);
        if consumer_view.ndims() < 4 {
            return Err(Error::partition(
                "conv weights need a 4-d task space",
            ));
        }
        let num_par_n = consumer_view.dim(0);
        let num_par_c = consumer_view.dim(1);
        let num_par_h = consumer_view.dim(2);
        let num_par_w = consumer_view.dim(3);
        if num_par_c != 1 {
            return Err(Error::partition(
                "conv weights cannot split the channel axis",
            ));
        }
        let tdim = consumer_view.ndims();
        let out_channels = weight.shape.dims[0].size;
        let field_bytes = weight.data_type().size_in_bytes();
        let task_space = self.store.get_or_create_task_space(consumer_view);

        let base_sizes: Vec<usize> = weight.shape.dims.iter().map(|d| d.size).collect();
        let replicated = |sizes: &mut Vec<usize>| {
            sizes[0] = num_par_n * num_par_h * num_par_w * out_channels;
        };
        let stride_rows = |transform: &mut Vec<Vec<i64>>| {
            // One full copy per (N, H, W) shard, strided along dim 0.
            transform[0][3] = out_channels as i64;
            transform[0][2] = (out_channels * num_par_w) as i64;
            transform[0][1] = (out_channels * num_par_w * num_par_h) as i64;
            transform[0][0] = (out_channels * num_par_w * num_par_h * num_par_c) as i64;
        };

        let (region, partition) = match sync {
            ParamSync::ParameterServer => {
                let index_space = self
                    .store
                    .create_index_space(Rect::from_extents(&base_sizes));
                let region = self.store.create_region(index_space, field_bytes);
                // Every task point sees the whole weight.
                let transform = vec![vec![0i64; tdim]; base_sizes.len()];
                let partition = self.store.create_partition_by_restriction(
                    region,
                    task_space,
                    transform,
                    Rect::from_extents(&base_sizes),
                    false,
                )?;
                (region, partition)
            }
            ParamSync::Collective => {
                let mut sizes = base_sizes.clone();
                replicated(&mut sizes);
                let mut extent_dims = base_sizes.clone();
                extent_dims[0] = out_channels;
                let mut transform = vec![vec![0i64; tdim]; sizes.len()];
                stride_rows(&mut transform);
                // The transform addresses only the first four axes; any
                // trailing replica axis must be unsplit.
                let index_space = self.store.create_index_space(Rect::from_extents(&sizes));
                let region = self.store.create_region(index_space, field_bytes);
                let partition = self.store.create_partition_by_restriction(
                    region,
                    task_space,
                    transform,
                    Rect::from_extents(&extent_dims),
                    true,
                )?;
                (region, partition)
            }
        };
        weight.region = Some(region);
        weight.partition = Some(partition);

        if weight.create_gradients && self.mode == CompMode::Training {
            let mut sizes = base_sizes.clone();
            replicated(&mut sizes);
            let mut extent_dims = base_sizes.clone();
            extent_dims[0] = out_channels;
            let mut transform = vec![vec![0i64; tdim]; sizes.len()];
            stride_rows(&mut transform);
            let grad_space = self.store.create_index_space(Rect::from_extents(&sizes));
            let grad_region = self.store.create_region(grad_space, field_bytes);
            let grad_partition = self.store.create_partition_by_restriction(
                grad_region,
                task_space,
                transform,
                Rect::from_extents(&extent_dims),
                true,
            )?;
            weight.region_grad = Some(grad_region);
            weight.partition_grad = Some(grad_partition);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::tensor::ParallelTensorShape;
    use shardflow_core::types::{DataType, InitializerKind, OperatorId, ParallelTensorId};

    fn tensor_with_dims(dims: &[(usize, usize, Option<usize>)]) -> ParallelTensor {
        let mut shape = ParallelTensorShape::from_sizes(
            &dims.iter().map(|d| d.0).collect::<Vec<_>>(),
            DataType::Float,
        );
        for (i, (_, degree, idx)) in dims.iter().enumerate() {
            shape.dims[i].degree = *degree;
            shape.dims[i].parallel_idx = *idx;
        }
        ParallelTensor::new(ParallelTensorId(0), shape, OperatorId(0), 0, true)
    }

    #[test]
    fn test_map_tensor_disjoint_complete() {
        // [(size=16, degree=4, axis 0), (size=8, degree=2, axis 1)] on a
        // 4x2 task space: eight tiles of volume 16.
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut tensor = tensor_with_dims(&[(16, 4, Some(0)), (8, 2, Some(1))]);
        mapper.map_tensor(&mut tensor).unwrap();

        let partition = store.partition(tensor.partition.unwrap()).clone();
        assert!(partition.disjoint);
        assert!(partition.complete);
        for point in [[0i64, 0], [3, 1], [2, 0]] {
            let tile = store.subrect(&partition, &point);
            assert_eq!(tile.volume(), 16);
        }
    }

    #[test]
    fn test_map_tensor_creates_gradient_shadow_when_training() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Training);
        let mut tensor = tensor_with_dims(&[(8, 2, Some(0))]);
        mapper.map_tensor(&mut tensor).unwrap();
        assert!(tensor.region.is_some());
        assert!(tensor.region_grad.is_some());
        assert_ne!(tensor.region, tensor.region_grad);

        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut tensor = tensor_with_dims(&[(8, 2, Some(0))]);
        mapper.map_tensor(&mut tensor).unwrap();
        assert!(tensor.region_grad.is_none());
    }

    #[test]
    fn test_replica_dim_materializes_copies() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut tensor = tensor_with_dims(&[(8, 2, Some(0)), (1, 4, Some(1))]);
        tensor.shape.dims[1].is_replica = true;
        mapper.map_tensor(&mut tensor).unwrap();

        let partition = store.partition(tensor.partition.unwrap()).clone();
        assert!(partition.disjoint);
        assert!(partition.complete);
        // The region physically holds four copies along the replica dim.
        let rect = store
            .index_space_rect(store.region(tensor.region.unwrap()).index_space)
            .clone();
        assert_eq!(rect.volume(), 8 * 4);
    }

    #[test]
    fn test_aliased_partition_overlaps_one_dim() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut tensor = tensor_with_dims(&[(16, 4, Some(0)), (8, 2, Some(1))]);
        mapper.map_tensor(&mut tensor).unwrap();

        let aliased = mapper.create_aliased_partition(&tensor, 0).unwrap();
        let partition = store.partition(aliased).clone();
        assert!(partition.complete);
        assert!(!partition.disjoint);
        // Tiles keep the full extent along the aliased dimension.
        let tile = store.subrect(&partition, &[0, 0]);
        assert_eq!(tile.volume(), 16 * 4);
    }

    fn weight(sizes: &[usize], sync: ParamSync) -> ParallelTensor {
        let shape = ParallelTensorShape::from_sizes(sizes, DataType::Float);
        ParallelTensor::new(ParallelTensorId(1), shape, OperatorId(1), 0, true)
            .into_weight(InitializerKind::GlorotUniform { seed: 0 }, sync)
    }

    #[test]
    fn test_linear_weight_collective_enlargement() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Training);
        let mut w = weight(&[32, 16], ParamSync::Collective);
        // 2-way channel split on axis 0, 3 remaining shards on axis 1.
        let view = MachineView::new([2, 3]);
        mapper.map_linear_weight(&mut w, &view).unwrap();

        let rect = store
            .index_space_rect(store.region(w.region.unwrap()).index_space)
            .clone();
        // dim 0 enlarged by the product of the remaining axis degrees.
        assert_eq!(rect.hi[0] + 1, (3 * 32) as i64);
        let partition = store.partition(w.partition.unwrap()).clone();
        assert!(partition.disjoint);
        assert!(partition.complete);
        assert!(w.region_grad.is_some());
    }

    #[test]
    fn test_linear_weight_parameter_server_aliases() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut w = weight(&[32, 16], ParamSync::ParameterServer);
        let view = MachineView::new([2, 3]);
        mapper.map_linear_weight(&mut w, &view).unwrap();

        let rect = store
            .index_space_rect(store.region(w.region.unwrap()).index_space)
            .clone();
        // One shared copy.
        assert_eq!(rect.hi[0] + 1, 32);
        let partition = store.partition(w.partition.unwrap()).clone();
        assert!(partition.complete);
        // Shards along axis 1 alias the same channel tile.
        assert!(!partition.disjoint);
    }

    #[test]
    fn test_conv_weight_rejects_channel_split() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut w = weight(&[16, 3, 3, 3], ParamSync::Collective);
        let view = MachineView::new([2, 2, 1, 1]);
        assert!(mapper.map_conv_weight(&mut w, &view).is_err());
    }

    #[test]
    fn test_conv_weight_collective_replicas() {
        let mut store = RegionStore::new();
        let mut mapper = RegionMapper::new(&mut store, CompMode::Inference);
        let mut w = weight(&[16, 3, 3, 3], ParamSync::Collective);
        // 2 sample shards, 2 width shards: 4 private copies.
        let view = MachineView::new([2, 1, 1, 2]);
        mapper.map_conv_weight(&mut w, &view).unwrap();

        let rect = store
            .index_space_rect(store.region(w.region.unwrap()).index_space)
            .clone();
        assert_eq!(rect.hi[0] + 1, (2 * 1 * 2 * 16) as i64);
        let partition = store.partition(w.partition.unwrap()).clone();
        assert!(partition.disjoint);
        assert!(partition.complete);
    }
}
