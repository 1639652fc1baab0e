//! Error types for lora-compose.

use thiserror::Error;

/// Result type alias for lora-compose operations.
pub type Result<T> = std::result::Result<T, ComposeError>;

/// Errors that can occur while loading or composing adapters.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ComposeError {
    /// No adapter file resolves for the requested name.
    #[error("adapter not found: {name}")]
    NotFound {
        /// Requested adapter name
        name: String,
    },

    /// Stored factors cannot be decoded into matrices of consistent rank.
    #[error("corrupt adapter factors: {0}")]
    CorruptFactors(String),

    /// Shape mismatch.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape
        expected: Vec<usize>,
        /// Actual shape
        actual: Vec<usize>,
    },

    /// Quantized merge requested on a target that is not quantized.
    #[error("quantization mismatch: {0}")]
    QuantizationMismatch(String),

    /// Invalid quantized data or scale.
    #[error("quantization error: {0}")]
    Quantization(String),

    /// Invalid configuration or argument.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Candle error.
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),
}
