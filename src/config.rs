/*!
# Sampler configuration.

[`SamplerConfig`] collects every tunable of a sampling run. It derives `serde`
traits so it can be embedded in a larger configuration file, and can be read on its own
from TOML:

```rust
use staged_mcmc::config::SamplerConfig;

let cfg = SamplerConfig::from_toml_str(r#"
    num_iters = 5000
    num_burn_in = 500
    norm = 2.0
    seed = 42

    [acceptance]
    min = 0.2
    max = 0.35
    target = 0.25
"#).unwrap();
assert_eq!(cfg.num_iters, 5000);
assert_eq!(cfg.max_attempts, 50);
```

Missing keys take their defaults.
*/

use serde::{Deserialize, Serialize};

use crate::covariance::CovarianceEstimator;
use crate::error::{McmcError, Result};

/// Acceptance window of the adapted phases and the rate the norm adaptation aims for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceptanceWindow {
    pub min: f64,
    pub max: f64,
    pub target: f64,
}

impl Default for AcceptanceWindow {
    fn default() -> Self {
        Self {
            min: 0.15,
            max: 0.30,
            target: 0.234,
        }
    }
}

impl AcceptanceWindow {
    /// Window `[min, max]`. Without an explicit target it is set to `(max - min) / 2`.
    pub fn from_range(min: f64, max: f64, target: Option<f64>) -> Self {
        Self {
            min,
            max,
            target: target.unwrap_or((max - min) / 2.0),
        }
    }

    pub fn contains(&self, rate: f64) -> bool {
        (self.min..=self.max).contains(&rate)
    }
}

/// Settings of the covariance-seeded phase of
/// [`crate::controller::RunPolicy::SequentialThenCovariance`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThenCovConfig {
    pub num_iters: usize,
    pub num_burn_in: usize,
    pub norm: f64,
}

impl Default for ThenCovConfig {
    fn default() -> Self {
        Self {
            num_iters: 100,
            num_burn_in: 10,
            norm: 1.0,
        }
    }
}

/// Every tunable of a sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Engine steps of the main chain.
    pub num_iters: usize,
    /// Chain samples dropped before summaries and covariance estimation.
    pub num_burn_in: usize,
    /// Divisor of the proposal width (or covariance).
    pub norm: f64,
    /// Start from the current parameter values instead of a random point.
    pub keep_start: bool,
    pub acceptance: AcceptanceWindow,
    /// Cap on adaptation attempts before giving up with a non-convergence error.
    pub max_attempts: usize,
    pub seed: Option<u64>,
    /// Scale the objective by `Σw / Σw²` for non-uniformly weighted data.
    pub correct_for_weights: bool,
    /// Use the non-yield covariance estimator in the staged covariance policy.
    pub uncorrelate_yields: bool,
    /// Estimator for a covariance taken from an earlier chain.
    pub estimator: CovarianceEstimator,
    /// Proposals between mean-cache rebuilds of a covariance-seeded proposal.
    pub cache_size: usize,
    /// Steps between cancellation checks; zero disables them.
    pub cancel_check_every: usize,
    pub show_progress: bool,
    pub then_cov: ThenCovConfig,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_iters: 100,
            num_burn_in: 10,
            norm: 0.1,
            keep_start: false,
            acceptance: AcceptanceWindow::default(),
            max_attempts: 50,
            seed: None,
            correct_for_weights: true,
            uncorrelate_yields: false,
            estimator: CovarianceEstimator::Robust,
            cache_size: 1,
            cancel_check_every: 1000,
            show_progress: false,
            then_cov: ThenCovConfig::default(),
        }
    }
}

impl SamplerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| McmcError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if !positive(self.norm) {
            return Err(McmcError::Config(format!("norm must be positive, got {}", self.norm)));
        }
        if !positive(self.then_cov.norm) {
            return Err(McmcError::Config(format!(
                "then_cov.norm must be positive, got {}",
                self.then_cov.norm
            )));
        }
        let w = &self.acceptance;
        if !(0.0..=1.0).contains(&w.min) || !(0.0..=1.0).contains(&w.max) || w.min > w.max {
            return Err(McmcError::Config(format!(
                "acceptance window [{}, {}] is not a sub-range of [0, 1]",
                w.min, w.max
            )));
        }
        if !(w.target > 0.0 && w.target <= 1.0) {
            return Err(McmcError::Config(format!(
                "acceptance target {} must lie in (0, 1]",
                w.target
            )));
        }
        if self.max_attempts == 0 {
            return Err(McmcError::Config("max_attempts must be at least 1".into()));
        }
        if self.num_iters == 0 || self.then_cov.num_iters == 0 {
            return Err(McmcError::Config("iteration counts must be positive".into()));
        }
        Ok(())
    }
}
