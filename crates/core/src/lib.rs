pub mod config;
pub mod distributed;
pub mod error;
pub mod kv_cache;
pub mod layers;
pub mod lora;
pub mod model;
pub mod moe;
pub mod multimodal;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::{CoreError, Result};
