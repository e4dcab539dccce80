//! # Shardflow Search
//!
//! Parallelization-strategy search: per-operator parallel-config
//! assignments, their mutation primitives, the cost-simulator interface,
//! and the MCMC (simulated-annealing) driver.
//!
//! The driver treats the simulator as a pure oracle and caches nothing;
//! `best` decreases monotonically and rewrites never propose an invalid
//! assignment.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod assignment;
pub mod mcmc;
pub mod simulator;

pub use assignment::{
    adoptable_config, apply_assignment, random_parallel_config, Assignment,
};
pub use mcmc::{McmcSearcher, SearchConfig, SearchResult};
pub use simulator::{AnalyticCostModel, CostEstimator, CostMetrics, MAXIMUM_TASK_RUN_TIME};
