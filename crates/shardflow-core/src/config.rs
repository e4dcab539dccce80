//! Compiler configuration.
//!
//! Every recognized option of the compile pipeline lives here with its
//! default. Fields deserialize individually so partial config files work.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::machine::MachineResource;
use crate::types::CompMode;

/// Default number of training epochs.
pub const DEFAULT_EPOCHS: usize = 1;
/// Default global batch size.
pub const DEFAULT_BATCH_SIZE: usize = 64;
/// Default learning rate.
pub const DEFAULT_LEARNING_RATE: f32 = 0.01;
/// Default weight decay.
pub const DEFAULT_WEIGHT_DECAY: f32 = 1e-4;
/// Default per-worker kernel workspace, 1 GiB.
pub const DEFAULT_WORK_SPACE_SIZE: usize = 1 << 30;
/// Default simulator workspace, 2 GiB.
pub const DEFAULT_SIMULATOR_WORK_SPACE_SIZE: usize = 2 << 30;
/// Default annealing temperature parameter.
pub const DEFAULT_SEARCH_ALPHA: f32 = 1.2;
/// Default simulator segment size, 16 MiB.
pub const DEFAULT_SIMULATOR_SEGMENT_SIZE: usize = 16 << 20;
/// Default threshold for base graph optimization.
pub const DEFAULT_BASE_OPTIMIZE_THRESHOLD: usize = 10;

/// Configuration of a compiled model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of training epochs.
    pub epochs: usize,

    /// Global batch size.
    pub batch_size: usize,

    /// Enable per-operator profiling.
    pub profiling: bool,

    /// Optimizer learning rate.
    pub learning_rate: f32,

    /// Optimizer weight decay.
    pub weight_decay: f32,

    /// Per-worker kernel workspace in bytes.
    pub work_space_size: usize,

    /// Number of nodes in the cluster.
    pub num_nodes: usize,

    /// Accelerators per node.
    pub workers_per_node: usize,

    /// Host CPUs per node.
    pub cpus_per_node: usize,

    /// Simulator scratch space in bytes.
    pub simulator_work_space_size: usize,

    /// MCMC iteration budget; `None` skips the search and keeps the
    /// data-parallel assignment.
    pub search_budget: Option<u64>,

    /// Annealing temperature parameter.
    pub search_alpha: f32,

    /// Let the simulator overlap backward with parameter updates.
    pub search_overlap_backward_update: bool,

    /// Training or inference compilation.
    pub computation_mode: CompMode,

    /// Restrict the lifter to a pure data-parallel PCG.
    pub only_data_parallel: bool,

    /// Allow splitting the sample (batch) dimension.
    pub enable_sample_parallel: bool,

    /// Allow splitting weight (parameter) dimensions.
    pub enable_parameter_parallel: bool,

    /// Allow splitting attribute (feature/spatial) dimensions.
    pub enable_attribute_parallel: bool,

    /// Mark eligible operators in-place before fusion.
    pub enable_inplace_optimizations: bool,

    /// Allow tensor-op math conversions in kernels.
    pub allow_tensor_op_math_conversion: bool,

    /// Run the vertical fusion pass.
    pub perform_fusion: bool,

    /// Enable control replication in the task runtime.
    pub enable_control_replication: bool,

    /// Minimum operator count before base graph optimization triggers.
    pub base_optimize_threshold: usize,

    /// Machine model version for the simulator.
    pub machine_model_version: usize,

    /// Simulator transfer segment size in bytes.
    pub simulator_segment_size: usize,

    /// Maximum number of simulator transfer segments.
    pub simulator_max_num_segments: usize,

    /// Python-side data loader flavor.
    pub python_data_loader_type: usize,

    /// Machine model description file for the simulator.
    pub machine_model_file: Option<PathBuf>,

    /// Strategy file to import instead of searching.
    pub import_strategy_file: Option<PathBuf>,

    /// Where to export the discovered strategy.
    pub export_strategy_file: Option<PathBuf>,

    /// Where to export the simulator's task graph.
    pub export_strategy_task_graph_file: Option<PathBuf>,

    /// Where to export the computation graph.
    pub export_strategy_computation_graph_file: Option<PathBuf>,

    /// Include estimated costs in exported dot graphs.
    pub include_costs_dot_graph: bool,

    /// Training dataset location.
    pub dataset_path: Option<PathBuf>,

    /// Substitution rule file for graph optimization.
    pub substitution_json_path: Option<PathBuf>,

    /// Feed synthetic input data.
    pub synthetic_input: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            epochs: DEFAULT_EPOCHS,
            batch_size: DEFAULT_BATCH_SIZE,
            profiling: false,
            learning_rate: DEFAULT_LEARNING_RATE,
            weight_decay: DEFAULT_WEIGHT_DECAY,
            work_space_size: DEFAULT_WORK_SPACE_SIZE,
            num_nodes: 1,
            workers_per_node: 0,
            cpus_per_node: 0,
            simulator_work_space_size: DEFAULT_SIMULATOR_WORK_SPACE_SIZE,
            search_budget: None,
            search_alpha: DEFAULT_SEARCH_ALPHA,
            search_overlap_backward_update: false,
            computation_mode: CompMode::Training,
            only_data_parallel: false,
            enable_sample_parallel: true,
            enable_parameter_parallel: false,
            enable_attribute_parallel: false,
            enable_inplace_optimizations: false,
            allow_tensor_op_math_conversion: false,
            perform_fusion: false,
            enable_control_replication: true,
            base_optimize_threshold: DEFAULT_BASE_OPTIMIZE_THRESHOLD,
            machine_model_version: 0,
            simulator_segment_size: DEFAULT_SIMULATOR_SEGMENT_SIZE,
            simulator_max_num_segments: 1,
            python_data_loader_type: 2,
            machine_model_file: None,
            import_strategy_file: None,
            export_strategy_file: None,
            export_strategy_task_graph_file: None,
            export_strategy_computation_graph_file: None,
            include_costs_dot_graph: false,
            dataset_path: None,
            substitution_json_path: None,
            synthetic_input: false,
        }
    }
}

impl Config {
    /// Create a config for an `num_nodes` x `workers_per_node` machine.
    pub fn with_machine(num_nodes: usize, workers_per_node: usize) -> Self {
        Self {
            num_nodes,
            workers_per_node,
            ..Default::default()
        }
    }

    /// The machine described by this config.
    pub fn machine(&self) -> MachineResource {
        MachineResource {
            num_nodes: self.num_nodes,
            workers_per_node: self.workers_per_node,
            cpus_per_node: self.cpus_per_node,
        }
    }

    /// Total accelerators across the cluster.
    pub fn total_workers(&self) -> usize {
        self.num_nodes * self.workers_per_node
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.num_nodes == 0 {
            return Err(Error::config("num_nodes must be at least 1"));
        }
        if self.workers_per_node == 0 {
            return Err(Error::config("workers_per_node must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.learning_rate <= 0.0 {
            return Err(Error::config("learning_rate must be positive"));
        }
        if self.search_alpha <= 0.0 {
            return Err(Error::config("search_alpha must be positive"));
        }
        if self.simulator_max_num_segments == 0 {
            return Err(Error::config(
                "simulator_max_num_segments must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.epochs, 1);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.work_space_size, 1 << 30);
        assert_eq!(config.simulator_work_space_size, 2 << 30);
        assert!((config.search_alpha - 1.2).abs() < f32::EPSILON);
        assert!(config.enable_sample_parallel);
        assert!(!config.perform_fusion);
        assert!(config.enable_control_replication);
        assert_eq!(config.python_data_loader_type, 2);
    }

    #[test]
    fn test_validate_rejects_empty_machine() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let config = Config::with_machine(1, 4);
        assert!(config.validate().is_ok());
        assert_eq!(config.total_workers(), 4);
    }

    #[test]
    fn test_partial_deserialization() {
        let config: Config = serde_json::from_str(r#"{"batch_size": 32}"#).unwrap();
        assert_eq!(config.batch_size, 32);
        assert_eq!(config.epochs, DEFAULT_EPOCHS);
    }
}
