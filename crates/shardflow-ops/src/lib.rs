//! # Shardflow Ops
//!
//! The operator catalog of the Shardflow parallelization compiler.
//!
//! For every operator kind this crate supplies four things:
//!
//! - an **attribute record**: the minimal scalar parameters that, together
//!   with input shapes, fully determine outputs;
//! - a **validity predicate** that cheaply rejects unacceptable shapes;
//! - a deterministic **output-shape function** (plus weight shapes for
//!   weighted kinds);
//! - **parameter extraction** for graph rewrites and memoization.
//!
//! The entry point is [`OperatorAttrs`], a tagged variant with exhaustive
//! dispatch over the closed [`OperatorKind`] enumeration.
//!
//! ## Example
//!
//! ```rust
//! use shardflow_ops::{LinearAttrs, OperatorAttrs};
//! use shardflow_core::tensor::ParallelTensorShape;
//! use shardflow_core::types::{Activation, DataType};
//!
//! let attrs = OperatorAttrs::Linear(LinearAttrs {
//!     out_channels: 64,
//!     use_bias: true,
//!     activation: Activation::Relu,
//! });
//! let input = ParallelTensorShape::from_sizes(&[64, 128], DataType::Float);
//! let sig = attrs.infer(std::slice::from_ref(&input)).unwrap();
//! assert_eq!(sig.outputs[0].sizes(), vec![64, 64]);
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod attention;
pub mod catalog;
pub mod conv;
pub mod elementwise;
pub mod fused;
pub mod kind;
pub mod linear;
pub mod matmul;
pub mod moe;
pub mod norm;
pub mod parallel;
pub mod shape;
mod util;

pub use attention::AttentionAttrs;
pub use catalog::{InputAttrs, NoopAttrs, OpSignature, OperatorAttrs, WeightAttrs};
pub use conv::{Conv2dAttrs, FlatAttrs, Pool2dAttrs};
pub use elementwise::{CastAttrs, DropoutAttrs, ElementBinaryAttrs, ElementUnaryAttrs};
pub use fused::{FusedAttrs, SlotSource, SubOpSlots};
pub use kind::OperatorKind;
pub use linear::{EmbeddingAttrs, LinearAttrs};
pub use matmul::BatchMatmulAttrs;
pub use moe::{AggregateAttrs, AggregateSpecAttrs, GroupByAttrs, TopKAttrs};
pub use norm::{LayerNormAttrs, SoftmaxAttrs};
pub use parallel::{
    CombineAttrs, FusedParallelAttrs, ParallelOpSpec, RepartitionAttrs, ReplicateAttrs,
    ReductionAttrs,
};
pub use shape::{ConcatAttrs, GatherAttrs, ReduceAttrs, ReshapeAttrs, SplitAttrs, TransposeAttrs};
