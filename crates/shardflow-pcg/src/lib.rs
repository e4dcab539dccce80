//! # Shardflow PCG
//!
//! Parallel computation graph construction and rewriting.
//!
//! The user program builds a [`LayerGraph`] of logical layers; the
//! [`lifter`] realizes it as a [`Pcg`] of operators over parallel tensors
//! with an initial data-parallel layout. Two rewrites operate on the PCG:
//!
//! - [`inplace`]: marks operators whose output may alias their input;
//! - [`fusion`]: greedy vertical fusion of compatible adjacent operators,
//!   preserving every boundary region identity.
//!
//! ## Example
//!
//! ```rust
//! use shardflow_core::config::Config;
//! use shardflow_core::tensor::TensorShape;
//! use shardflow_core::types::{Activation, DataType, GuidAllocator};
//! use shardflow_ops::{LinearAttrs, OperatorAttrs};
//! use shardflow_pcg::{lift, LayerGraph};
//!
//! let mut guids = GuidAllocator::new();
//! let mut layers = LayerGraph::new();
//! let x = layers.add_input(&mut guids, TensorShape::new([64, 128], DataType::Float));
//! layers.add_layer(
//!     &mut guids,
//!     OperatorAttrs::Linear(LinearAttrs {
//!         out_channels: 64,
//!         use_bias: true,
//!         activation: Activation::Relu,
//!     }),
//!     &[x],
//!     None,
//! ).unwrap();
//!
//! let config = Config::with_machine(1, 4);
//! let pcg = lift(&layers, &config, &mut guids).unwrap();
//! assert!(pcg.check_invariants().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod fusion;
pub mod graph;
pub mod inplace;
pub mod layer;
pub mod lifter;

pub use fusion::apply_fusion;
pub use graph::{Operator, Pcg};
pub use inplace::mark_inplace_operators;
pub use layer::{Layer, LayerGraph, LogicalTensor};
pub use lifter::lift;
