//! Per-operator parallel-config assignments and their mutation
//! primitives.
//!
//! An assignment maps every mutable operator to a [`ParallelConfig`]. The
//! initial assignment is data-parallel over the batch dimension; the
//! search driver perturbs it through [`random_parallel_config`] and the
//! propagation walk, both of which only ever produce configs the operator
//! accepts.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::Rng;
use shardflow_core::config::Config;
use shardflow_core::error::{Error, Result};
use shardflow_core::machine::{DeviceId, ParallelConfig};
use shardflow_core::types::OperatorId;
use shardflow_pcg::{Operator, Pcg};

/// A map from operator to its chosen parallel config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    configs: HashMap<OperatorId, ParallelConfig>,
}

impl Assignment {
    /// The pure data-parallel assignment: every mutable operator splits
    /// its batch dimension across all workers when the batch tiles, and
    /// runs on one device otherwise.
    pub fn data_parallel(pcg: &Pcg, workers: usize) -> Self {
        let mut configs = HashMap::new();
        for op in pcg.operators() {
            if op.kind().is_input_or_weight() || op.outputs.is_empty() {
                continue;
            }
            let rank = op.outputs[0].shape.rank();
            let dp = ParallelConfig::data_parallel(rank, workers);
            let config = if op.attrs.supports_config(&dp, &op.outputs[0].shape) {
                dp
            } else {
                ParallelConfig::data_parallel(rank, 1)
            };
            configs.insert(op.id, config);
        }
        Self { configs }
    }

    /// Config chosen for an operator, if any.
    pub fn get(&self, id: OperatorId) -> Option<&ParallelConfig> {
        self.configs.get(&id)
    }

    /// Set an operator's config.
    pub fn insert(&mut self, id: OperatorId, config: ParallelConfig) {
        self.configs.insert(id, config);
    }

    /// Number of assigned operators.
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether no operator is assigned.
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Iterate over `(operator, config)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&OperatorId, &ParallelConfig)> {
        self.configs.iter()
    }
}

/// Divisors of `n`, ascending.
fn divisors(n: usize) -> Vec<usize> {
    (1..=n).filter(|d| n % d == 0).collect()
}

/// Draw a random valid parallel config for `op`, honoring the machine
/// size and the per-dimension parallelism gates. Returns `None` when no
/// valid candidate was found within the sampling budget.
pub fn random_parallel_config(
    op: &Operator,
    config: &Config,
    rng: &mut StdRng,
) -> Option<ParallelConfig> {
    let output = op.outputs.first()?;
    let workers = config.total_workers().max(1);

    const ATTEMPTS: usize = 64;
    for _ in 0..ATTEMPTS {
        let mut dims = Vec::with_capacity(output.shape.rank());
        let mut parts = 1usize;
        for (i, d) in output.shape.dims.iter().enumerate() {
            let enabled = if d.is_replica {
                config.enable_parameter_parallel
            } else if i == 0 {
                config.enable_sample_parallel
            } else {
                config.enable_attribute_parallel
            };
            let degree = if !enabled {
                1
            } else if d.is_replica {
                // Replication degree is bounded by the machine, not the
                // (size-1) dimension extent.
                let budget = workers / parts;
                rng.gen_range(1..=budget.max(1))
            } else {
                let budget = workers / parts;
                let candidates: Vec<usize> = divisors(d.size)
                    .into_iter()
                    .filter(|&deg| deg <= budget.max(1))
                    .collect();
                candidates[rng.gen_range(0..candidates.len())]
            };
            parts *= degree;
            dims.push(degree);
        }
        if parts > workers {
            continue;
        }
        let start = rng.gen_range(0..=(workers - parts));
        let device_ids: Vec<DeviceId> = (start..start + parts).map(DeviceId).collect();
        let candidate = ParallelConfig::new(dims, device_ids);
        if op.attrs.supports_config(&candidate, &output.shape) {
            return Some(candidate);
        }
    }
    None
}

/// Whether `op` can adopt `config` from a neighbor: the config must be
/// data-parallel, and its rank-adjusted form must be acceptable.
pub fn adoptable_config(op: &Operator, config: &ParallelConfig) -> Option<ParallelConfig> {
    if !config.is_data_parallel() {
        return None;
    }
    let output = op.outputs.first()?;
    let adjusted = config.change_data_parallel_dimensionality(output.shape.rank());
    op.attrs
        .supports_config(&adjusted, &output.shape)
        .then_some(adjusted)
}

/// Materialize an assignment into the graph's tensor descriptors: each
/// assigned operator's outputs take their degrees and machine view from
/// the chosen config, and weight anchors adopt their consumer's view so
/// the communicator cache can key on it.
pub fn apply_assignment(pcg: &mut Pcg, assignment: &Assignment) -> Result<()> {
    let mut weight_views = Vec::new();
    for op in pcg.operators() {
        let Some(config) = assignment.get(op.id) else {
            continue;
        };
        let Some(output) = op.outputs.first() else {
            continue;
        };
        if !op.attrs.supports_config(config, &output.shape) {
            return Err(Error::search(format!(
                "assignment holds an invalid config for {}",
                op.id
            )));
        }
        for weight in &op.weights {
            weight_views.push((weight.owner, config.view()));
        }
    }

    let assigned: Vec<(OperatorId, ParallelConfig)> = assignment
        .iter()
        .map(|(id, config)| (*id, config.clone()))
        .collect();
    for (id, config) in assigned {
        if let Some(op) = pcg.get_mut(id) {
            let view = config.view();
            for tensor in op.outputs.iter_mut() {
                // Secondary outputs of a different rank keep their lifted
                // descriptor.
                if tensor.shape.rank() != config.ndims() {
                    continue;
                }
                for (i, dim) in tensor.shape.dims.iter_mut().enumerate() {
                    dim.degree = config.dims[i];
                    dim.parallel_idx = (dim.degree > 1).then_some(i);
                }
                tensor.machine_view = view.clone();
            }
        }
    }
    for (owner, view) in weight_views {
        if let Some(op) = pcg.get_mut(owner) {
            for tensor in op.outputs.iter_mut() {
                tensor.machine_view = view.clone();
            }
        }
    }
    Ok(())
}
