// THEORY:
// Every failure in the engine falls into one of three families, and each family
// has its own propagation rule:
//
// 1.  **Config**: an invalid or contradictory option combination. Fatal, and always
//     raised by `InspectConfig::validate` before any computation starts.
// 2.  **NumericalFailure**: a non-finite value appeared mid-trajectory or in a map.
//     Caught per sample; the sample is marked failed and the batch carries on.
// 3.  **Data**: a missing or malformed input (undecodable file, wrong channel count,
//     wrong spatial size). Also per sample, excluded from aggregates and counted.
//
// Library code returns `Result<T>`; only the binary edge converts to `anyhow`.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, InspectError>;

#[derive(Debug, Error)]
pub enum InspectError {
    /// Invalid configuration, detected at load time.
    #[error("config error: {0}")]
    Config(String),

    /// A non-finite value was produced while scoring a sample.
    #[error("numerical failure at step {step}: {reason}")]
    NumericalFailure { step: usize, reason: String },

    /// Missing or malformed input for a single sample.
    #[error("data error: {0}")]
    Data(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl InspectError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config(reason.into())
    }

    pub fn data(reason: impl Into<String>) -> Self {
        Self::Data(reason.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the failure kinds that are suppressed per sample instead of aborting a run.
    pub fn is_per_sample(&self) -> bool {
        matches!(
            self,
            Self::NumericalFailure { .. } | Self::Data(_) | Self::Image(_)
        )
    }
}
