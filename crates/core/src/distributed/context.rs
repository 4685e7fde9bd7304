//! Bundled sharding context threaded through layer constructors.

use std::sync::Arc;

use candle_core::Tensor;

use crate::error::Result;

use super::communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
use super::process_group::{LocalProcessGroup, ProcessGroup};

/// Process group plus communicator for one rank, shared by every sharded
/// layer of a model replica.
#[derive(Clone)]
pub struct ShardContext {
    group: Arc<dyn ProcessGroup>,
    comm: Arc<dyn DeviceCommunicator>,
}

impl ShardContext {
    pub fn new(group: Arc<dyn ProcessGroup>, comm: Arc<dyn DeviceCommunicator>) -> Self {
        Self { group, comm }
    }

    /// Single-rank context where every collective is identity.
    pub fn single() -> Self {
        let group = LocalProcessGroup::new();
        Self {
            group: Arc::new(group.clone()),
            comm: Arc::new(MockCommunicator::new(group)),
        }
    }

    /// Simulated multi-rank context backed by the mock communicator.
    ///
    /// Lets sharding arithmetic run for an arbitrary rank without real
    /// inter-process communication.
    pub fn mock_rank(rank: usize, world_size: usize) -> Self {
        let group = LocalProcessGroup::with_rank(rank, world_size);
        Self {
            group: Arc::new(group.clone()),
            comm: Arc::new(MockCommunicator::new(group)),
        }
    }

    pub fn group(&self) -> &dyn ProcessGroup {
        self.group.as_ref()
    }

    pub fn comm(&self) -> &dyn DeviceCommunicator {
        self.comm.as_ref()
    }

    pub fn rank(&self) -> usize {
        self.group.rank()
    }

    pub fn world_size(&self) -> usize {
        self.group.world_size()
    }

    pub fn is_single(&self) -> bool {
        self.group.is_single()
    }

    pub fn all_reduce_sum(&self, tensor: &Tensor) -> Result<Tensor> {
        self.comm.all_reduce(tensor, ReduceOp::Sum)
    }
}

impl std::fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardContext")
            .field("rank", &self.group.rank())
            .field("world_size", &self.group.world_size())
            .finish()
    }
}
