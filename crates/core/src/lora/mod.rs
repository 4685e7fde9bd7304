//! Low-rank adapter (LoRA) deltas, applied additively inside the sharded
//! linear layers with per-request selection.
//!
//! Adapter weights are loaded by an external collaborator after the base
//! weights; this module holds the registry and the arithmetic.

mod adapter;

pub use adapter::{AdapterSelection, AdapterStore, LowRankAdapter};
