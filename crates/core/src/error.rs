use thiserror::Error;

/// Fatal error classes raised by the forward-pass core.
///
/// Every variant aborts the current request or batch. Nothing here is
/// retried internally; retry policy belongs to the serving layer. No error
/// is downgraded to a default value on the way up.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid model or parallelism configuration, detected at construction
    /// time (e.g. head counts not divisible by the shard count).
    #[error("invalid configuration: {reason}")]
    Configuration { reason: String },

    /// Tensor dimension mismatch detected at call time.
    #[error("shape mismatch in {context}: expected {expected}, got {actual}")]
    Shape {
        context: String,
        expected: String,
        actual: String,
    },

    /// Cache slot index outside the allocated slot range.
    #[error("cache slot {slot} out of bounds (capacity {capacity})")]
    CacheIndex { slot: usize, capacity: usize },

    /// A requested feature combination is structurally impossible and must
    /// be rejected before any forward call runs.
    #[error("unsupported feature: {reason}")]
    UnsupportedFeature { reason: String },

    /// Tensor backend failure.
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl CoreError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn shape(
        context: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Self::Shape {
            context: context.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::UnsupportedFeature {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
