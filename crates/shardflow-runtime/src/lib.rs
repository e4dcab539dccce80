//! # Shardflow Runtime
//!
//! Region mapping, graph serialization, the task-backend boundary, and
//! the [`Model`] aggregate that drives the whole compile pipeline:
//! lifting, strategy search, in-place marking, region mapping, fusion,
//! communicator setup, and serialization, followed by iteration-time
//! task launches.
//!
//! ## Example
//!
//! ```rust
//! use shardflow_core::config::Config;
//! use shardflow_core::tensor::TensorShape;
//! use shardflow_core::types::*;
//! use shardflow_ops::{LinearAttrs, OperatorAttrs};
//! use shardflow_runtime::Model;
//!
//! let mut config = Config::with_machine(1, 4);
//! config.only_data_parallel = true;
//! let mut model = Model::recording(config).unwrap();
//! let x = model.add_input(TensorShape::new([64, 128], DataType::Float));
//! model.add_layer(
//!     OperatorAttrs::Linear(LinearAttrs {
//!         out_channels: 64,
//!         use_bias: true,
//!         activation: Activation::Relu,
//!     }),
//!     &[x],
//!     Some("dense1"),
//! ).unwrap();
//! let sgd = OptimizerKind::Sgd {
//!     learning_rate: 0.01,
//!     momentum: 0.0,
//!     nesterov: false,
//!     weight_decay: 1e-4,
//! };
//! model
//!     .compile(sgd, LossKind::SparseCategoricalCrossentropy, &[], CompMode::Training)
//!     .unwrap();
//! model.forward(None).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod launch;
pub mod model;
pub mod region;
pub mod serialize;

pub use launch::{
    Coherence, IndexLaunch, Privilege, RecordingBackend, RegionRequirement, TaskBackend, TaskKind,
};
pub use model::Model;
pub use region::{Partition, Rect, Region, RegionMapper, RegionStore};
pub use serialize::{serialize_pcg, GRAPH_MAGIC, GRAPH_VERSION};
