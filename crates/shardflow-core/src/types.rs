//! Core types used throughout Shardflow.
//!
//! This module contains fundamental type definitions shared across all
//! stages of the compilation pipeline: element types, id newtypes, the
//! monotonic id allocator owned by the model aggregate, and small closed
//! enums for modes and descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 16-bit IEEE float
    Half,
    /// 32-bit IEEE float
    Float,
    /// 64-bit IEEE float
    Double,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Half => std::mem::size_of::<half::f16>(),
            DataType::Float => std::mem::size_of::<f32>(),
            DataType::Double => std::mem::size_of::<f64>(),
            DataType::Int32 => std::mem::size_of::<i32>(),
            DataType::Int64 => std::mem::size_of::<i64>(),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Half => write!(f, "half"),
            DataType::Float => write!(f, "float"),
            DataType::Double => write!(f, "double"),
            DataType::Int32 => write!(f, "int32"),
            DataType::Int64 => write!(f, "int64"),
        }
    }
}

/// A unique identifier for a logical layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LayerId(pub u64);

/// A unique identifier for a logical tensor (a layer output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TensorId(pub u64);

/// A unique identifier for an operator in the parallel computation graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperatorId(pub u64);

/// A unique identifier for a parallel tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParallelTensorId(pub u64);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layer_{}", self.0)
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op_{}", self.0)
    }
}

impl fmt::Display for ParallelTensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pt_{}", self.0)
    }
}

/// Handle to a logical region created by the region mapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionHandle(pub u64);

/// Handle to a logical partition of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionHandle(pub u64);

/// Handle to a task index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSpaceHandle(pub u64);

/// Handle to a pre-created collective communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommunicatorHandle(pub u64);

/// Monotonic id allocator owned by the model aggregate.
///
/// Ids are allocated only from the compilation thread; the allocator is
/// threaded through every constructor rather than living in a process-wide
/// static.
#[derive(Debug, Default, Clone)]
pub struct GuidAllocator {
    next_layer: u64,
    next_tensor: u64,
    next_operator: u64,
    next_parallel_tensor: u64,
}

impl GuidAllocator {
    /// Create a fresh allocator with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a layer id.
    pub fn fresh_layer(&mut self) -> LayerId {
        let id = LayerId(self.next_layer);
        self.next_layer += 1;
        id
    }

    /// Allocate a logical tensor id.
    pub fn fresh_tensor(&mut self) -> TensorId {
        let id = TensorId(self.next_tensor);
        self.next_tensor += 1;
        id
    }

    /// Allocate an operator id.
    pub fn fresh_operator(&mut self) -> OperatorId {
        let id = OperatorId(self.next_operator);
        self.next_operator += 1;
        id
    }

    /// Allocate a parallel tensor id.
    pub fn fresh_parallel_tensor(&mut self) -> ParallelTensorId {
        let id = ParallelTensorId(self.next_parallel_tensor);
        self.next_parallel_tensor += 1;
        id
    }
}

/// Computation mode of a compiled model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompMode {
    /// Forward and backward passes; gradients and their regions exist.
    Training,
    /// Forward pass only.
    Inference,
}

/// Synchronization mode for a weight tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamSync {
    /// Parameter-server style synchronization: one shared copy.
    ParameterServer,
    /// Collective (all-reduce) synchronization: one private copy per shard.
    Collective,
}

/// Activation fused into a compute operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// No activation
    None,
    /// Rectified linear unit
    Relu,
    /// Logistic sigmoid
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// Gaussian error linear unit
    Gelu,
}

/// Pooling flavor for pool2d.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Max pooling
    Max,
    /// Average pooling
    Avg,
}

/// Aggregation mode for embedding lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggrMode {
    /// One output row per index
    None,
    /// Sum over the index dimension
    Sum,
    /// Average over the index dimension
    Avg,
}

/// Loss attached to the terminal operator at compile time.
///
/// The loss computation itself is an external collaborator; the compiler
/// only records the kind and whether labels must be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Categorical cross-entropy over one-hot labels
    CategoricalCrossentropy,
    /// Categorical cross-entropy over integer labels
    SparseCategoricalCrossentropy,
    /// Mean squared error
    MeanSquaredError,
}

/// Metric kinds tracked by the external metrics collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// Classification accuracy
    Accuracy,
    /// Categorical cross-entropy
    CategoricalCrossentropy,
    /// Sparse categorical cross-entropy
    SparseCategoricalCrossentropy,
    /// Mean squared error
    MeanSquaredError,
    /// Mean absolute error
    MeanAbsoluteError,
}

/// Descriptor for a weight initializer. The initialization kernel is an
/// external collaborator; the compiler only carries the description.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializerKind {
    /// All zeros
    Zero,
    /// A constant value
    Constant {
        /// Fill value
        value: f32,
    },
    /// Uniform distribution over `[min, max)`
    Uniform {
        /// Lower bound
        min: f32,
        /// Upper bound
        max: f32,
        /// RNG seed
        seed: u64,
    },
    /// Normal distribution
    Normal {
        /// Mean
        mean: f32,
        /// Standard deviation
        stddev: f32,
        /// RNG seed
        seed: u64,
    },
    /// Glorot (Xavier) uniform
    GlorotUniform {
        /// RNG seed
        seed: u64,
    },
}

/// Optimizer descriptor recorded at compile time. Update numerics are an
/// external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Stochastic gradient descent
    Sgd {
        /// Learning rate
        learning_rate: f32,
        /// Momentum factor
        momentum: f32,
        /// Use Nesterov momentum
        nesterov: bool,
        /// L2 weight decay
        weight_decay: f32,
    },
    /// Adam
    Adam {
        /// Learning rate
        learning_rate: f32,
        /// First-moment decay
        beta1: f32,
        /// Second-moment decay
        beta2: f32,
        /// Numerical-stability epsilon
        epsilon: f32,
        /// L2 weight decay
        weight_decay: f32,
    },
}
