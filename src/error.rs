// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for candle-tune.

/// Errors that can occur during tuning and export operations.
#[derive(Debug, thiserror::Error)]
pub enum TuneError {
    /// Tensor operation error (wraps candle).
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// The expected layer container could not be located on the model.
    #[error("structure error: {0}")]
    Structure(String),

    /// Taxonomy or tuner configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Checkpoint assembly or serialization error during export.
    #[error("export error: {0}")]
    Export(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type alias for candle-tune operations.
pub type Result<T> = std::result::Result<T, TuneError>;
