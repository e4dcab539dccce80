//! The model aggregate: graph construction, the compile pipeline, and
//! iteration-time operations.
//!
//! `compile` runs lifting, strategy search, in-place marking, region
//! mapping, fusion, communicator setup, and optimizer registration, in
//! that order. Iteration-time calls (`forward`, `backward`, `update`,
//! `zero_gradients`) only describe indexed task launches; the kernels and
//! the scheduler live behind the [`TaskBackend`] boundary.

use std::collections::HashMap;

use parking_lot::RwLock;
use shardflow_core::config::Config;
use shardflow_core::error::{Error, Result};
use shardflow_core::machine::MachineView;
use shardflow_core::tensor::{TensorRef, TensorShape};
use shardflow_core::types::{
    CommunicatorHandle, CompMode, GuidAllocator, LossKind, MetricKind, OperatorId, OptimizerKind,
    ParamSync, TensorId,
};
use shardflow_ops::{OperatorAttrs, OperatorKind};
use shardflow_pcg::{apply_fusion, lift, mark_inplace_operators, LayerGraph, Pcg};
use shardflow_search::{
    apply_assignment, AnalyticCostModel, Assignment, CostEstimator, McmcSearcher, SearchConfig,
};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::launch::{
    IndexLaunch, Privilege, RegionRequirement, RecordingBackend, TaskBackend, TaskKind,
};
use crate::region::{RegionMapper, RegionStore};
use crate::serialize::serialize_pcg;

/// A compiled-model aggregate over an external task backend.
pub struct Model<B: TaskBackend> {
    config: Config,
    guids: GuidAllocator,
    layers: LayerGraph,
    backend: B,
    store: RegionStore,
    pcg: Option<Pcg>,
    assignment: Option<Assignment>,
    input_partitions: HashMap<OperatorId, shardflow_core::types::PartitionHandle>,
    parameters: Vec<TensorRef>,
    communicators: RwLock<HashMap<u64, CommunicatorHandle>>,
    next_communicator: u64,
    optimizer: Option<OptimizerKind>,
    loss: Option<LossKind>,
    metrics: Vec<MetricKind>,
    replicate_labels: bool,
    metrics_position: Option<usize>,
    mode: CompMode,
}

impl Model<RecordingBackend> {
    /// A model over the recording backend, for tests and dry runs.
    pub fn recording(config: Config) -> Result<Self> {
        Model::new(config, RecordingBackend::new())
    }
}

impl<B: TaskBackend> Model<B> {
    /// Create a model; the configuration is validated up front.
    pub fn new(config: Config, backend: B) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mode: config.computation_mode,
            config,
            guids: GuidAllocator::new(),
            layers: LayerGraph::new(),
            backend,
            store: RegionStore::new(),
            pcg: None,
            assignment: None,
            input_partitions: HashMap::new(),
            parameters: Vec::new(),
            communicators: RwLock::new(HashMap::new()),
            next_communicator: 0,
            optimizer: None,
            loss: None,
            metrics: Vec::new(),
            replicate_labels: false,
            metrics_position: None,
        })
    }

    /// Add an input layer.
    pub fn add_input(&mut self, shape: TensorShape) -> TensorId {
        self.layers.add_input(&mut self.guids, shape)
    }

    /// Add a layer over earlier tensors.
    pub fn add_layer(
        &mut self,
        attrs: OperatorAttrs,
        inputs: &[TensorId],
        name: Option<&str>,
    ) -> Result<SmallVec<[TensorId; 2]>> {
        self.layers.add_layer(&mut self.guids, attrs, inputs, name)
    }

    /// The compiled graph.
    pub fn pcg(&self) -> Result<&Pcg> {
        self.pcg
            .as_ref()
            .ok_or_else(|| Error::structural("model is not compiled"))
    }

    /// The chosen assignment.
    pub fn assignment(&self) -> Result<&Assignment> {
        self.assignment
            .as_ref()
            .ok_or_else(|| Error::structural("model is not compiled"))
    }

    /// The backend, for inspection.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The region store, for inspection.
    pub fn store(&self) -> &RegionStore {
        &self.store
    }

    /// Registered parameters, in operator order.
    pub fn parameters(&self) -> &[TensorRef] {
        &self.parameters
    }

    /// The loss recorded at compile time.
    pub fn loss(&self) -> Option<LossKind> {
        self.loss
    }

    /// The metric kinds recorded at compile time.
    pub fn metrics(&self) -> &[MetricKind] {
        &self.metrics
    }

    /// The optimizer recorded at compile time.
    pub fn optimizer(&self) -> Option<OptimizerKind> {
        self.optimizer
    }

    /// Position of the operator feeding the metrics computation.
    pub fn metrics_position(&self) -> Option<usize> {
        self.metrics_position
    }

    /// Input partition of a parallel operator, if one was created.
    pub fn input_partition(
        &self,
        op: OperatorId,
    ) -> Option<shardflow_core::types::PartitionHandle> {
        self.input_partitions.get(&op).copied()
    }

    /// Number of collective communicators created during compile.
    pub fn communicator_count(&self) -> usize {
        self.communicators.read().len()
    }

    /// Compile with the built-in analytic cost model.
    pub fn compile(
        &mut self,
        optimizer: OptimizerKind,
        loss: LossKind,
        metrics: &[MetricKind],
        mode: CompMode,
    ) -> Result<()> {
        let estimator = AnalyticCostModel::default();
        self.compile_with_estimator(optimizer, loss, metrics, mode, &estimator)
    }

    /// Compile against a caller-supplied cost estimator.
    pub fn compile_with_estimator(
        &mut self,
        optimizer: OptimizerKind,
        loss: LossKind,
        metrics: &[MetricKind],
        mode: CompMode,
        estimator: &dyn CostEstimator,
    ) -> Result<()> {
        self.mode = mode;
        self.config.computation_mode = mode;
        if self.config.only_data_parallel {
            info!("only_data_parallel is set; compiling a data-parallel PCG");
        }

        let mut pcg = lift(&self.layers, &self.config, &mut self.guids)?;
        let workers = self.config.total_workers();
        let mut assignment = Assignment::data_parallel(&pcg, workers);

        if let Some(budget) = self.config.search_budget {
            if budget > 0 && !self.config.only_data_parallel {
                let mut searcher = McmcSearcher::new(
                    &self.config,
                    SearchConfig {
                        budget,
                        alpha: self.config.search_alpha,
                        use_propagation: true,
                        seed: 0,
                    },
                );
                let stop = std::sync::atomic::AtomicBool::new(false);
                let result = searcher.optimize(&pcg, assignment, estimator, mode, &stop)?;
                info!(best_cost = result.best_cost, "strategy search complete");
                assignment = result.best;
            }
        }
        apply_assignment(&mut pcg, &assignment)?;

        if self.config.enable_inplace_optimizations {
            let marked = mark_inplace_operators(&mut pcg);
            debug!(marked, "in-place pass complete");
        }

        self.map_regions(&mut pcg)?;
        self.replicate_labels = pcg
            .final_operator()
            .map(|op| op.kind() == OperatorKind::AggregateSpec)
            .unwrap_or(false);

        if self.config.perform_fusion {
            apply_fusion(&mut pcg, &mut self.guids)?;
        }

        pcg.check_invariants()?;

        self.parameters = pcg
            .operators()
            .iter()
            .flat_map(|op| op.weights.iter().copied())
            .collect();

        if mode == CompMode::Training {
            self.init_communicators(&pcg)?;
        }

        if self.metrics_position.is_none() {
            self.metrics_position = Some(pcg.len().saturating_sub(1));
        }
        self.optimizer = Some(optimizer);
        self.loss = Some(loss);
        self.metrics = metrics.to_vec();
        info!(operators = pcg.len(), "model compiled");
        self.assignment = Some(assignment);
        self.pcg = Some(pcg);
        Ok(())
    }

    /// Materialize every tensor's region and partition.
    fn map_regions(&mut self, pcg: &mut Pcg) -> Result<()> {
        let mode = self.mode;
        let ids: Vec<OperatorId> = pcg.operators().iter().map(|op| op.id).collect();

        for id in &ids {
            let (kind, weight_refs, view) = {
                let op = pcg.get(*id).expect("operator exists");
                (op.kind(), op.weights.clone(), op.machine_view())
            };
            if kind == OperatorKind::Weight {
                // Mapped through the consumer's specialized path.
                continue;
            }
            {
                let mut mapper = RegionMapper::new(&mut self.store, mode);
                let op = pcg.get_mut(*id).expect("operator exists");
                for tensor in op.outputs.iter_mut() {
                    mapper.map_tensor(tensor)?;
                }
            }
            for weight_ref in weight_refs {
                let mut mapper = RegionMapper::new(&mut self.store, mode);
                let anchor = pcg.get_mut(weight_ref.owner).ok_or_else(|| {
                    Error::structural(format!("missing weight anchor {}", weight_ref.owner))
                })?;
                let tensor = anchor
                    .outputs
                    .get_mut(weight_ref.slot)
                    .ok_or_else(|| Error::structural("weight slot out of range"))?;
                match kind {
                    OperatorKind::Linear
                    | OperatorKind::Embedding
                    | OperatorKind::MultiHeadAttention => {
                        mapper.map_linear_weight(tensor, &view)?;
                    }
                    OperatorKind::Conv2d => {
                        mapper.map_conv_weight(tensor, &view)?;
                    }
                    _ => {
                        mapper.map_tensor(tensor)?;
                    }
                }
            }
        }

        // Parallel operators view their input through a partition shaped
        // by their own layout: disjoint when re-tiling, aliased when
        // shards legitimately reuse the same data.
        for id in &ids {
            let op = pcg.get(*id).expect("operator exists");
            if !op.is_parallel_op() {
                continue;
            }
            let Some(&input_ref) = op.inputs.first() else {
                continue;
            };
            let aliased_dim = match &op.attrs {
                OperatorAttrs::Combine(attrs) => Some(attrs.dim),
                OperatorAttrs::Replicate(_) => {
                    let input = pcg.resolve(input_ref)?;
                    input.shape.dims.iter().position(|d| d.is_replica)
                }
                _ => None,
            };
            let input = pcg.resolve(input_ref)?.clone();
            let mut mapper = RegionMapper::new(&mut self.store, mode);
            let partition = match aliased_dim {
                Some(dim) => mapper.create_aliased_partition(&input, dim)?,
                None => input
                    .partition
                    .ok_or_else(|| Error::partition("parallel-op input is unmapped"))?,
            };
            self.input_partitions.insert(*id, partition);
        }
        Ok(())
    }

    /// One communicator per distinct machine view, weight operators only.
    /// Entries are created once and never evicted.
    fn init_communicators(&mut self, pcg: &Pcg) -> Result<()> {
        let views: Vec<MachineView> = pcg
            .operators()
            .iter()
            .filter(|op| op.kind() == OperatorKind::Weight)
            .filter(|op| {
                op.outputs
                    .first()
                    .and_then(|t| t.sync_kind)
                    .map(|s| s == ParamSync::Collective)
                    .unwrap_or(false)
            })
            .map(|op| op.machine_view())
            .collect();
        for view in views {
            let key = view.hash_key();
            if self.communicators.read().contains_key(&key) {
                continue;
            }
            let handle = CommunicatorHandle(self.next_communicator);
            self.next_communicator += 1;
            let index_space = self.store.get_or_create_task_space(&view);
            self.backend.execute_index_space(IndexLaunch {
                task: TaskKind::InitCommunicator,
                operator: None,
                kind: None,
                index_space,
                argmap_key: key,
                requirements: vec![],
                seq_length: None,
            })?;
            self.communicators.write().insert(key, handle);
            debug!(view = %view, "created communicator");
        }
        Ok(())
    }

    fn launchable(op: &shardflow_pcg::Operator) -> bool {
        !op.kind().is_input_or_weight()
    }

    fn forward_requirements(
        pcg: &Pcg,
        op: &shardflow_pcg::Operator,
    ) -> Result<Vec<RegionRequirement>> {
        let mut requirements = Vec::new();
        for slot in op.inputs.iter().chain(op.weights.iter()) {
            let tensor = pcg.resolve(*slot)?;
            let (partition, region) = mapped(tensor)?;
            requirements.push(RegionRequirement::new(partition, Privilege::ReadOnly, region));
        }
        for tensor in &op.outputs {
            let (partition, region) = mapped(tensor)?;
            let privilege = if op.inplace_output {
                Privilege::ReadWrite
            } else {
                Privilege::WriteOnly
            };
            requirements.push(RegionRequirement::new(partition, privilege, region));
        }
        Ok(requirements)
    }

    fn launch_for(
        &mut self,
        op: &shardflow_pcg::Operator,
        task: TaskKind,
        requirements: Vec<RegionRequirement>,
        seq_length: Option<usize>,
    ) -> Result<()> {
        let view = op.machine_view();
        let index_space = self.store.get_or_create_task_space(&view);
        self.backend.execute_index_space(IndexLaunch {
            task,
            operator: Some(op.id),
            kind: Some(op.kind()),
            index_space,
            argmap_key: view.hash_key(),
            requirements,
            seq_length,
        })
    }

    /// Launch every operator's forward task, in topological order.
    pub fn forward(&mut self, seq_length: Option<usize>) -> Result<()> {
        let pcg = self
            .pcg
            .take()
            .ok_or_else(|| Error::structural("model is not compiled"))?;
        let result = (|| {
            for op in pcg.operators() {
                if !Self::launchable(op) {
                    continue;
                }
                let requirements = Self::forward_requirements(&pcg, op)?;
                self.launch_for(op, TaskKind::Forward, requirements, seq_length)?;
            }
            Ok(())
        })();
        self.pcg = Some(pcg);
        result
    }

    /// Seed the loss gradient and launch backward tasks in reverse order.
    pub fn backward(&mut self, seq_length: Option<usize>) -> Result<()> {
        if self.mode != CompMode::Training {
            return Err(Error::structural("backward requires a training compile"));
        }
        let pcg = self
            .pcg
            .take()
            .ok_or_else(|| Error::structural("model is not compiled"))?;
        let result = (|| {
            let terminal = pcg
                .final_operator()
                .ok_or_else(|| Error::structural("graph has no terminal operator"))?;
            let output = terminal
                .outputs
                .first()
                .ok_or_else(|| Error::structural("terminal operator has no output"))?;
            let (partition, region) = mapped_grad(output)?;
            let requirements =
                vec![RegionRequirement::new(partition, Privilege::ReadWrite, region)];
            self.launch_for(terminal, TaskKind::LossGradient, requirements, seq_length)?;

            for op in pcg.operators().iter().rev() {
                if !Self::launchable(op) {
                    continue;
                }
                let mut requirements = Self::forward_requirements(&pcg, op)?;
                for (slot, input) in op.inputs.iter().enumerate() {
                    if !op.needs_input_grad.get(slot).copied().unwrap_or(false) {
                        continue;
                    }
                    let tensor = pcg.resolve(*input)?;
                    if let Ok((partition, region)) = mapped_grad(tensor) {
                        requirements.push(RegionRequirement::new(
                            partition,
                            Privilege::ReadWrite,
                            region,
                        ));
                    }
                }
                for weight in &op.weights {
                    let tensor = pcg.resolve(*weight)?;
                    let (partition, region) = mapped_grad(tensor)?;
                    requirements.push(RegionRequirement::new(
                        partition,
                        Privilege::ReadWrite,
                        region,
                    ));
                }
                for tensor in &op.outputs {
                    if let Ok((partition, region)) = mapped_grad(tensor) {
                        requirements.push(RegionRequirement::new(
                            partition,
                            Privilege::ReadOnly,
                            region,
                        ));
                    }
                }
                self.launch_for(op, TaskKind::Backward, requirements, seq_length)?;
            }
            Ok(())
        })();
        self.pcg = Some(pcg);
        result
    }

    /// Launch one optimizer update per parameter.
    pub fn update(&mut self) -> Result<()> {
        if self.optimizer.is_none() {
            return Err(Error::structural("model has no optimizer"));
        }
        let pcg = self
            .pcg
            .take()
            .ok_or_else(|| Error::structural("model is not compiled"))?;
        let result = (|| {
            for parameter in self.parameters.clone() {
                let tensor = pcg.resolve(parameter)?;
                let (partition, region) = mapped(tensor)?;
                let (grad_partition, grad_region) = mapped_grad(tensor)?;
                let owner = pcg
                    .get(parameter.owner)
                    .ok_or_else(|| Error::structural("parameter owner disappeared"))?;
                let requirements = vec![
                    RegionRequirement::new(partition, Privilege::ReadWrite, region),
                    RegionRequirement::new(grad_partition, Privilege::ReadOnly, grad_region),
                ];
                self.launch_for(owner, TaskKind::UpdateWeights, requirements, None)?;
            }
            Ok(())
        })();
        self.pcg = Some(pcg);
        result
    }

    /// Zero every gradient shadow, in reverse operator order.
    pub fn zero_gradients(&mut self) -> Result<()> {
        let pcg = self
            .pcg
            .take()
            .ok_or_else(|| Error::structural("model is not compiled"))?;
        let result = (|| {
            for op in pcg.operators().iter().rev() {
                let mut requirements = Vec::new();
                for tensor in &op.outputs {
                    if let Ok((partition, region)) = mapped_grad(tensor) {
                        requirements.push(RegionRequirement::new(
                            partition,
                            Privilege::WriteOnly,
                            region,
                        ));
                    }
                }
                if requirements.is_empty() {
                    continue;
                }
                self.launch_for(op, TaskKind::ZeroGradients, requirements, None)?;
            }
            Ok(())
        })();
        self.pcg = Some(pcg);
        result
    }

    /// Reset the metrics accumulator.
    pub fn reset_metrics(&mut self) -> Result<()> {
        let pcg = self
            .pcg
            .take()
            .ok_or_else(|| Error::structural("model is not compiled"))?;
        let result = (|| {
            let terminal = pcg
                .final_operator()
                .ok_or_else(|| Error::structural("graph has no terminal operator"))?;
            self.launch_for(terminal, TaskKind::UpdateMetrics, vec![], None)
        })();
        self.pcg = Some(pcg);
        result
    }

    /// Record which operator feeds the metrics computation.
    pub fn get_metrics(&mut self) -> Result<usize> {
        let pcg = self.pcg()?;
        let position = pcg.len().saturating_sub(1);
        self.metrics_position = Some(position);
        Ok(position)
    }

    /// Whether the terminal operator replicates labels downstream.
    pub fn replicate_labels(&self) -> bool {
        self.replicate_labels
    }

    /// Serialize the optimized graph for the task runtime.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize_pcg(self.pcg()?)
    }
}

fn mapped(
    tensor: &shardflow_core::tensor::ParallelTensor,
) -> Result<(shardflow_core::types::PartitionHandle, shardflow_core::types::RegionHandle)> {
    match (tensor.partition, tensor.region) {
        (Some(partition), Some(region)) => Ok((partition, region)),
        _ => Err(Error::partition(format!("tensor {} is unmapped", tensor.id))),
    }
}

fn mapped_grad(
    tensor: &shardflow_core::tensor::ParallelTensor,
) -> Result<(shardflow_core::types::PartitionHandle, shardflow_core::types::RegionHandle)> {
    match (tensor.partition_grad, tensor.region_grad) {
        (Some(partition), Some(region)) => Ok((partition, region)),
        _ => Err(Error::partition(format!(
            "tensor {} has no gradient shadow",
            tensor.id
        ))),
    }
}
