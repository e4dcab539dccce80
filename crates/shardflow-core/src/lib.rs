//! # Shardflow Core
//!
//! Core types for the Shardflow parallelization compiler.
//!
//! This crate provides the foundational abstractions shared by every stage
//! of the compilation pipeline:
//!
//! - **Error handling**: compile-time error types with shape context
//! - **Configuration**: the full set of recognized compiler options
//! - **Machine model**: machine views, parallel configs, device resources
//! - **Parallel tensors**: partition descriptors and region handles
//!
//! ## Example
//!
//! ```rust
//! use shardflow_core::tensor::ParallelTensorShape;
//! use shardflow_core::types::DataType;
//!
//! let mut shape = ParallelTensorShape::from_sizes(&[64, 128], DataType::Float);
//! shape.push_replica_dim();
//! assert_eq!(shape.rank(), 3);
//! assert!(shape.check_valid().is_ok());
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod machine;
pub mod tensor;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use machine::{DeviceId, MachineResource, MachineView, ParallelConfig};
pub use tensor::{ParallelDim, ParallelTensor, ParallelTensorShape, TensorRef, TensorShape};
pub use types::*;

/// Re-export commonly used external types.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::machine::{DeviceId, MachineResource, MachineView, ParallelConfig};
    pub use crate::tensor::{
        ParallelDim, ParallelTensor, ParallelTensorShape, TensorRef, TensorShape,
    };
    pub use crate::types::*;

    pub use smallvec::SmallVec;
}
