//! Device communicator for collective operations.
//!
//! The forward pass touches collectives at exactly three points: the
//! all-reduce closing a row-parallel matmul, the all-reduce combining
//! expert outputs, and the all-gather assembling column-parallel logits.
//! Everything else is rank-local.

use candle_core::Tensor;

use crate::error::Result;

use super::process_group::ProcessGroup;

/// Reduction operations for collective primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    /// Element-wise sum.
    Sum,
    /// Element-wise product.
    Product,
    /// Element-wise minimum.
    Min,
    /// Element-wise maximum.
    Max,
    /// Average (sum / world_size).
    Average,
}

/// Trait for device-to-device communication.
///
/// Implementations can wrap a real collective library for multi-accelerator
/// runs, or be identity for a single rank.
pub trait DeviceCommunicator: Send + Sync {
    /// Get the underlying process group.
    fn process_group(&self) -> &dyn ProcessGroup;

    /// All-reduce: apply reduction across all ranks, result on all ranks.
    ///
    /// For a single rank this is identity.
    fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor>;

    /// All-gather: gather tensors from all ranks along `gather_dim`.
    ///
    /// Input shape `[.., n, ..]` becomes `[.., n * world_size, ..]` along
    /// the gather dimension. For a single rank this is identity.
    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor>;

    /// Barrier: synchronize all ranks.
    fn barrier(&self) -> Result<()>;
}

/// Mock communicator for single-rank execution and sharding tests.
///
/// All collectives are identity (world_size == 1 bypass). With a simulated
/// multi-rank group, all_gather repeats the local shard so shape flow can
/// still be exercised in one process.
pub struct MockCommunicator<P: ProcessGroup> {
    process_group: P,
}

impl<P: ProcessGroup> MockCommunicator<P> {
    pub fn new(process_group: P) -> Self {
        Self { process_group }
    }
}

impl<P: ProcessGroup + Send + Sync> DeviceCommunicator for MockCommunicator<P> {
    fn process_group(&self) -> &dyn ProcessGroup {
        &self.process_group
    }

    fn all_reduce(&self, tensor: &Tensor, _op: ReduceOp) -> Result<Tensor> {
        // One rank holds the complete partial sum, so identity is exact.
        Ok(tensor.clone())
    }

    fn all_gather(&self, tensor: &Tensor, gather_dim: usize) -> Result<Tensor> {
        if self.process_group.is_single() {
            return Ok(tensor.clone());
        }
        let world_size = self.process_group.world_size();
        let tensors: Vec<Tensor> = (0..world_size).map(|_| tensor.clone()).collect();
        Ok(Tensor::cat(&tensors, gather_dim)?)
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}
