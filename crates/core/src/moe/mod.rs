//! Mixture-of-experts feed-forward blocks.
//!
//! Routing is computed identically on every rank; expert weights are
//! tensor-parallel shards combined through a single per-layer all-reduce.

mod layer;
mod router;

pub use layer::MoeLayer;
pub use router::{Router, RoutingTable};
