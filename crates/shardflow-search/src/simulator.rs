//! The cost-simulator interface and an analytic reference estimator.
//!
//! The simulator is a pure oracle: the same `(pcg, assignment, mode)`
//! triple always yields the same cost, and the search driver caches
//! nothing. Out-of-memory candidates are reported through the
//! [`MAXIMUM_TASK_RUN_TIME`] sentinel so annealing rejects them naturally.

use shardflow_core::machine::MachineView;
use shardflow_core::types::CompMode;
use shardflow_ops::{OperatorAttrs, OperatorKind};
use shardflow_pcg::{Operator, Pcg};

use crate::assignment::Assignment;

/// Sentinel cost for candidates that cannot run (out of memory).
pub const MAXIMUM_TASK_RUN_TIME: f32 = 1.0e7;

/// Per-operator cost measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostMetrics {
    /// Estimated forward time in seconds
    pub forward_time: f32,
    /// Estimated backward time in seconds
    pub backward_time: f32,
    /// Bytes of input tiles resident during the task
    pub inputs_memory: usize,
    /// Bytes of output tiles resident during the task
    pub outputs_memory: usize,
    /// Bytes of weights resident during the task
    pub weights_memory: usize,
}

/// Estimates end-to-end runtime for a `(pcg, assignment)` pair.
pub trait CostEstimator {
    /// Estimated wall time of one iteration; non-negative, larger is
    /// worse, [`MAXIMUM_TASK_RUN_TIME`] on out-of-memory.
    fn simulate_runtime(&self, pcg: &Pcg, assignment: &Assignment, mode: CompMode) -> f32;

    /// Per-operator cost under a machine view, or `None` when the shape
    /// cannot be tiled onto the view or the tiles do not fit in memory.
    fn measure_operator_cost(&self, op: &Operator, view: &MachineView) -> Option<CostMetrics>;
}

/// Analytic machine model: per-device throughput, interconnect bandwidth,
/// and per-device memory.
#[derive(Debug, Clone)]
pub struct AnalyticCostModel {
    /// Per-device floating-point throughput, flop/s
    pub device_flops: f64,
    /// Point-to-point interconnect bandwidth, bytes/s
    pub interconnect_bandwidth: f64,
    /// Per-device memory capacity, bytes
    pub memory_capacity: usize,
}

impl Default for AnalyticCostModel {
    fn default() -> Self {
        Self {
            device_flops: 1.0e12,
            interconnect_bandwidth: 16.0e9,
            memory_capacity: 16 << 30,
        }
    }
}

/// Rough flop count of one forward invocation over the full tensors.
fn operator_flops(op: &Operator, pcg: &Pcg) -> f64 {
    let out_volume: f64 = op
        .outputs
        .iter()
        .map(|t| t.volume() as f64)
        .sum();
    match &op.attrs {
        OperatorAttrs::Linear(attrs) => {
            let in_channels = op
                .inputs
                .first()
                .and_then(|r| pcg.resolve(*r).ok())
                .and_then(|t| t.shape.dims.iter().rfind(|d| !d.is_replica).map(|d| d.size))
                .unwrap_or(1);
            2.0 * out_volume * in_channels as f64 + if attrs.use_bias { out_volume } else { 0.0 }
        }
        OperatorAttrs::Conv2d(attrs) => {
            let in_channels = op
                .inputs
                .first()
                .and_then(|r| pcg.resolve(*r).ok())
                .map(|t| t.shape.dims[1].size)
                .unwrap_or(1);
            out_volume
                * 2.0
                * (in_channels / attrs.groups) as f64
                * (attrs.kernel_h * attrs.kernel_w) as f64
        }
        OperatorAttrs::BatchMatmul(_) => {
            let k = op
                .inputs
                .first()
                .and_then(|r| pcg.resolve(*r).ok())
                .and_then(|t| t.shape.dims.iter().rfind(|d| !d.is_replica).map(|d| d.size))
                .unwrap_or(1);
            2.0 * out_volume * k as f64
        }
        OperatorAttrs::MultiHeadAttention(attrs) => {
            4.0 * out_volume * attrs.embed_dim as f64
        }
        // Data movement has no arithmetic.
        _ if op.is_parallel_op() => 0.0,
        _ => out_volume,
    }
}

fn transfer_bytes(pcg: &Pcg, op: &Operator, assignment: &Assignment) -> f64 {
    let my_view = assignment.get(op.id).map(|c| c.view());
    let mut bytes = 0.0;
    for slot in &op.inputs {
        let Ok(tensor) = pcg.resolve(*slot) else {
            continue;
        };
        let producer_view = assignment.get(slot.owner).map(|c| c.view());
        let moved = match (&my_view, &producer_view) {
            (Some(a), Some(b)) => a != b,
            // Anchors hold their lifted layout; mismatch is possible
            // only when the consumer re-tiles.
            (Some(a), None) => *a != tensor.machine_view,
            _ => false,
        };
        if moved {
            bytes += (tensor.volume() * tensor.data_type().size_in_bytes()) as f64;
        }
    }
    bytes
}

impl AnalyticCostModel {
    fn memory_per_device(&self, op: &Operator, pcg: &Pcg, parts: usize) -> usize {
        let parts = parts.max(1);
        let outputs: usize = op
            .outputs
            .iter()
            .map(|t| t.volume() * t.data_type().size_in_bytes() / parts)
            .sum();
        let inputs: usize = op
            .inputs
            .iter()
            .filter_map(|r| pcg.resolve(*r).ok())
            .map(|t| t.volume() * t.data_type().size_in_bytes() / parts)
            .sum();
        // Collective weights hold a full copy per device.
        let weights: usize = op
            .weights
            .iter()
            .filter_map(|r| pcg.resolve(*r).ok())
            .map(|t| t.volume() * t.data_type().size_in_bytes())
            .sum();
        outputs + inputs + weights
    }
}

impl CostEstimator for AnalyticCostModel {
    fn simulate_runtime(&self, pcg: &Pcg, assignment: &Assignment, mode: CompMode) -> f32 {
        let mut total = 0.0f64;
        for op in pcg.operators() {
            if op.kind().is_input_or_weight() {
                continue;
            }
            let parts = assignment.get(op.id).map(|c| c.num_parts()).unwrap_or(1);
            if self.memory_per_device(op, pcg, parts) > self.memory_capacity {
                return MAXIMUM_TASK_RUN_TIME;
            }
            let compute = operator_flops(op, pcg) / parts as f64 / self.device_flops;
            let forward = compute;
            // Backward revisits activations and weights; aggregate's
            // backward cost is a known under-estimate of zero.
            let backward = if mode == CompMode::Training
                && op.kind() != OperatorKind::Aggregate
            {
                2.0 * compute
            } else {
                0.0
            };
            let transfer = transfer_bytes(pcg, op, assignment) / self.interconnect_bandwidth;
            total += forward + backward + transfer;
        }
        total as f32
    }

    fn measure_operator_cost(&self, op: &Operator, view: &MachineView) -> Option<CostMetrics> {
        let output = op.outputs.first()?;
        if view.ndims() != output.shape.rank() {
            return None;
        }
        for (dim, d) in output.shape.dims.iter().enumerate() {
            if !d.is_replica && d.size % view.dim(dim) != 0 {
                return None;
            }
        }
        let parts = view.num_devices().max(1);
        let outputs_memory: usize = op
            .outputs
            .iter()
            .map(|t| t.volume() * t.data_type().size_in_bytes() / parts)
            .sum();
        if outputs_memory > self.memory_capacity {
            return None;
        }
        let forward = 1.0f32.max(output.volume() as f32 / parts as f32) / self.device_flops as f32;
        let backward = if op.kind() == OperatorKind::Aggregate {
            0.0
        } else {
            2.0 * forward
        };
        Some(CostMetrics {
            forward_time: forward,
            backward_time: backward,
            inputs_memory: 0,
            outputs_memory,
            weights_memory: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardflow_core::config::Config;
    use shardflow_core::tensor::TensorShape;
    use shardflow_core::types::{Activation, DataType, GuidAllocator};
    use shardflow_ops::LinearAttrs;
    use shardflow_pcg::{lift, LayerGraph};

    fn mlp(workers: usize) -> (Pcg, Config) {
        let mut guids = GuidAllocator::new();
        let mut layers = LayerGraph::new();
        let x = layers.add_input(&mut guids, TensorShape::new([64, 128], DataType::Float));
        let h = layers
            .add_layer(
                &mut guids,
                OperatorAttrs::Linear(LinearAttrs {
                    out_channels: 64,
                    use_bias: true,
                    activation: Activation::Relu,
                }),
                &[x],
                None,
            )
            .unwrap();
        layers
            .add_layer(
                &mut guids,
                OperatorAttrs::Linear(LinearAttrs {
                    out_channels: 16,
                    use_bias: true,
                    activation: Activation::None,
                }),
                &[h[0]],
                None,
            )
            .unwrap();
        let mut config = Config::with_machine(1, workers);
        config.only_data_parallel = true;
        let pcg = lift(&layers, &config, &mut guids).unwrap();
        (pcg, config)
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let (pcg, config) = mlp(4);
        let assignment = Assignment::data_parallel(&pcg, config.total_workers());
        let model = AnalyticCostModel::default();
        let a = model.simulate_runtime(&pcg, &assignment, CompMode::Training);
        let b = model.simulate_runtime(&pcg, &assignment, CompMode::Training);
        assert_eq!(a, b);
        assert!(a > 0.0);
    }

    #[test]
    fn test_more_workers_run_faster() {
        let (pcg, config) = mlp(4);
        let model = AnalyticCostModel::default();
        let wide = Assignment::data_parallel(&pcg, config.total_workers());
        let narrow = Assignment::data_parallel(&pcg, 1);
        let fast = model.simulate_runtime(&pcg, &wide, CompMode::Training);
        let slow = model.simulate_runtime(&pcg, &narrow, CompMode::Training);
        assert!(fast < slow);
    }

    #[test]
    fn test_oom_returns_sentinel() {
        let (pcg, config) = mlp(2);
        let assignment = Assignment::data_parallel(&pcg, config.total_workers());
        let model = AnalyticCostModel {
            memory_capacity: 1,
            ..AnalyticCostModel::default()
        };
        assert_eq!(
            model.simulate_runtime(&pcg, &assignment, CompMode::Training),
            MAXIMUM_TASK_RUN_TIME
        );
    }

    #[test]
    fn test_measure_operator_cost_untilable() {
        let (pcg, _config) = mlp(2);
        let linear = pcg
            .operators()
            .iter()
            .find(|op| op.kind() == OperatorKind::Linear)
            .unwrap();
        let model = AnalyticCostModel::default();

        let ok = model.measure_operator_cost(linear, &MachineView::new([2, 1, 1]));
        assert!(ok.is_some());
        // Batch 64 cannot tile 5 ways.
        let bad = model.measure_operator_cost(linear, &MachineView::new([5, 1, 1]));
        assert!(bad.is_none());
    }

    #[test]
    fn test_inference_skips_backward() {
        let (pcg, config) = mlp(2);
        let assignment = Assignment::data_parallel(&pcg, config.total_workers());
        let model = AnalyticCostModel::default();
        let train = model.simulate_runtime(&pcg, &assignment, CompMode::Training);
        let infer = model.simulate_runtime(&pcg, &assignment, CompMode::Inference);
        assert!(infer < train);
    }
}
