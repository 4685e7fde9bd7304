//! Shared test fixtures for strata-core.
//!
//! Tiny model configurations and random checkpoint maps, small enough to
//! run full forward passes on CPU inside unit and integration tests.

mod tiny_config;
mod weights;

pub use tiny_config::{tiny_config, tiny_moe_config, tiny_multimodal_config};
pub use weights::{random_var_builder, random_weight_map};
