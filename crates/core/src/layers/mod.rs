pub mod attention;
pub mod mask;
pub mod mlp;
pub mod normalization;
pub mod rotary;

pub use attention::{AttentionCapabilities, AttentionDispatcher, CacheWindowing, ForwardBatch};
pub use mask::causal_mask;
pub use mlp::ShardedMlp;
pub use normalization::ResidualNorm;
pub use rotary::RotaryEncoder;
