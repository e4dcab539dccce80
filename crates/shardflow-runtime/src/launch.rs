//! The boundary with the external task runtime.
//!
//! The core never executes kernels; it describes indexed task launches
//! over a parallel index space with region requirements, and hands them
//! to a [`TaskBackend`]. Per-point arguments are keyed by the machine
//! view's hash.

use shardflow_core::error::Result;
use shardflow_core::types::{IndexSpaceHandle, OperatorId, PartitionHandle, RegionHandle};
use shardflow_ops::OperatorKind;

/// Access privilege of a region requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Read-only
    ReadOnly,
    /// Write-only (discard previous contents)
    WriteOnly,
    /// Read-write
    ReadWrite,
}

/// Coherence of a region requirement. The core only launches exclusive
/// tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coherence {
    /// Exclusive access
    Exclusive,
}

/// One region argument of an indexed launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionRequirement {
    /// Partition projected onto the launch's index space
    pub partition: PartitionHandle,
    /// Projection functor id; always zero here
    pub projection: u32,
    /// Access privilege
    pub privilege: Privilege,
    /// Coherence mode
    pub coherence: Coherence,
    /// Parent region
    pub region: RegionHandle,
}

impl RegionRequirement {
    /// Build a requirement with projection 0 and exclusive coherence.
    pub fn new(partition: PartitionHandle, privilege: Privilege, region: RegionHandle) -> Self {
        Self {
            partition,
            projection: 0,
            privilege,
            coherence: Coherence::Exclusive,
            region,
        }
    }
}

/// What a launched task computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Operator initialization
    Init,
    /// Operator forward pass
    Forward,
    /// Operator backward pass
    Backward,
    /// Loss gradient seeding against the terminal output
    LossGradient,
    /// Per-parameter optimizer step
    UpdateWeights,
    /// Gradient zeroing
    ZeroGradients,
    /// Metrics aggregation
    UpdateMetrics,
    /// Collective communicator setup
    InitCommunicator,
}

/// An indexed task launch over a parallel index space.
#[derive(Debug, Clone)]
pub struct IndexLaunch {
    /// What the task computes
    pub task: TaskKind,
    /// Operator being launched, when applicable
    pub operator: Option<OperatorId>,
    /// Operator kind, when applicable
    pub kind: Option<OperatorKind>,
    /// Launch index space
    pub index_space: IndexSpaceHandle,
    /// Key of the per-point argument map: the machine view's hash
    pub argmap_key: u64,
    /// Region arguments, in slot order
    pub requirements: Vec<RegionRequirement>,
    /// Iteration-time sequence length, when bounded
    pub seq_length: Option<usize>,
}

/// The external task runtime.
pub trait TaskBackend {
    /// Execute an indexed task launch. The call is synchronous from the
    /// core's point of view; overlap is the runtime's business.
    fn execute_index_space(&mut self, launch: IndexLaunch) -> Result<()>;
}

/// A backend that records launches, for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    /// Every launch received, in order
    pub launches: Vec<IndexLaunch>,
}

impl RecordingBackend {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launches of one task kind.
    pub fn of_kind(&self, task: TaskKind) -> impl Iterator<Item = &IndexLaunch> {
        self.launches.iter().filter(move |l| l.task == task)
    }
}

impl TaskBackend for RecordingBackend {
    fn execute_index_space(&mut self, launch: IndexLaunch) -> Result<()> {
        self.launches.push(launch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_backend_orders_launches() {
        let mut backend = RecordingBackend::new();
        for task in [TaskKind::Init, TaskKind::Forward, TaskKind::Backward] {
            backend
                .execute_index_space(IndexLaunch {
                    task,
                    operator: None,
                    kind: None,
                    index_space: IndexSpaceHandle(0),
                    argmap_key: 0,
                    requirements: vec![],
                    seq_length: None,
                })
                .unwrap();
        }
        assert_eq!(backend.launches.len(), 3);
        assert_eq!(backend.of_kind(TaskKind::Forward).count(), 1);
    }

    #[test]
    fn test_requirement_defaults() {
        let req = RegionRequirement::new(
            PartitionHandle(1),
            Privilege::ReadOnly,
            RegionHandle(2),
        );
        assert_eq!(req.projection, 0);
        assert_eq!(req.coherence, Coherence::Exclusive);
    }
}
