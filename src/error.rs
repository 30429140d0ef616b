//! Error types for the staged sampler.

use thiserror::Error;

/// Errors surfaced by the sampler and its estimators.
///
/// A point rejected by the objective is *not* an error: the objective returns
/// `None` and the engine records a rejected proposal.
#[derive(Error, Debug)]
pub enum McmcError {
    /// The sampler was driven with missing inputs (no objective, no data, no free parameters).
    #[error("usage error: {0}")]
    Usage(String),

    /// A covariance matrix could not be estimated from the supplied chain.
    #[error("covariance estimation failed: {0}")]
    Estimation(String),

    /// The adaptation loop hit its retry cap without a converged chain.
    #[error("chain did not converge after {attempts} attempts (last acceptance {acceptance:.4})")]
    NonConvergence { attempts: usize, acceptance: f64 },

    /// The cooperative cancel check asked the engine to stop.
    #[error("chain cancelled at step {step}")]
    Cancelled { step: usize },

    /// Invalid sampler configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[cfg(feature = "csv")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, McmcError>;
