//! Sharded execution abstractions for tensor parallelism.
//!
//! - [`ProcessGroup`] - rank assignment and world size
//! - [`DeviceCommunicator`] - collective operations (all_reduce, all_gather)
//! - [`ShardContext`] - the pair of them, threaded through constructors
//! - parallel layers - column/row sharded linears and the vocab embedding
//!
//! A single rank bypasses every collective (world_size == 1 identity), so
//! the same model code runs unsharded and sharded.

mod communicator;
mod context;
mod parallel_layers;
mod process_group;

pub use communicator::{DeviceCommunicator, MockCommunicator, ReduceOp};
pub use context::ShardContext;
pub use parallel_layers::{
    ColumnParallelLinear, GateUpLinear, QkvLinear, RowParallelLinear, VocabParallelEmbedding,
};
pub use process_group::{LocalProcessGroup, ProcessGroup};
