//! Posterior summaries of a finished chain.
//!
//! [`summarize`] computes the weighted mean and standard deviation of every chain parameter
//! over the samples `[burn_in, len)` and writes them back into the [`ParameterSet`]
//! (value ← mean, error ← std). [`evaluate_derived`] evaluates parameter-only
//! [`DerivedQuantity`]s once per retained sample.

use std::fmt;

use crate::chain::Chain;
use crate::error::{McmcError, Result};
use crate::objective::{DerivedQuantity, Objective};
use crate::params::ParameterSet;
use crate::stats::weighted_mean_std;

/// Posterior mean and standard deviation of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEstimate {
    pub name: String,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSummary {
    pub estimates: Vec<ParameterEstimate>,
    pub burn_in: usize,
    /// Distinct samples retained after burn-in.
    pub n_samples: usize,
    /// Iterations represented by the retained samples.
    pub total_weight: f64,
    /// Objective re-evaluated at the posterior mean, if an objective was given and accepted
    /// the point.
    pub nll_at_mean: Option<f64>,
    /// Lowest objective value among the retained samples.
    pub best_nll: Option<f64>,
}

impl PosteriorSummary {
    pub fn get(&self, name: &str) -> Option<&ParameterEstimate> {
        self.estimates.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for PosteriorSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} samples ({} iterations) after burn-in {}",
            self.n_samples, self.total_weight, self.burn_in
        )?;
        for e in &self.estimates {
            writeln!(f, "  {:<16} {:>14.6} ± {:<12.6}", e.name, e.mean, e.std)?;
        }
        if let Some(nll) = self.nll_at_mean {
            writeln!(f, "  nll at mean      {nll:.6}")?;
        }
        if let Some(nll) = self.best_nll {
            write!(f, "  best nll         {nll:.6}")?;
        }
        Ok(())
    }
}

/// Computes posterior mean/std over `[burn_in, len)` and writes them into `params`.
///
/// Chain parameters unknown to `params` are summarised but not written back. If
/// `objective` is given it is evaluated at the posterior mean.
///
/// # Errors
///
/// [`McmcError::Estimation`] if the burn-in leaves no samples.
pub fn summarize(
    chain: &Chain,
    burn_in: usize,
    params: &mut ParameterSet,
    objective: Option<&dyn Objective>,
) -> Result<PosteriorSummary> {
    let rows = chain.post_burn_in(burn_in);
    if rows.is_empty() {
        return Err(McmcError::Estimation(format!(
            "burn-in {burn_in} leaves no samples of a chain of length {}",
            chain.len()
        )));
    }
    let weights = chain.weights(burn_in);
    let mut estimates = Vec::with_capacity(chain.dim());
    for (idx, name) in chain.names().iter().enumerate() {
        let (mean, std) = weighted_mean_std(&chain.column(idx, burn_in), &weights).ok_or_else(
            || McmcError::Estimation(format!("non-positive total weight for '{name}'")),
        )?;
        if let Some(p) = params.get_mut(name) {
            p.value = mean;
            p.error = Some(std);
        }
        estimates.push(ParameterEstimate {
            name: name.clone(),
            mean,
            std,
        });
    }
    let nll_at_mean = objective.and_then(|o| o.evaluate(params));
    let best_nll = rows
        .iter()
        .map(|s| s.nll)
        .filter(|v| !v.is_nan())
        .min_by(|a, b| a.total_cmp(b));
    let summary = PosteriorSummary {
        estimates,
        burn_in,
        n_samples: rows.len(),
        total_weight: weights.iter().sum(),
        nll_at_mean,
        best_nll,
    };
    log::info!("posterior summary:\n{summary}");
    Ok(summary)
}

/// Values of one derived quantity, one per retained sample.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedSeries {
    pub name: String,
    pub values: Vec<f64>,
    /// Multiplicity of the sample each value was computed at.
    pub weights: Vec<f64>,
}

impl DerivedSeries {
    /// Weighted mean and standard deviation of the series.
    pub fn mean_std(&self) -> Option<(f64, f64)> {
        weighted_mean_std(&self.values, &self.weights)
    }
}

/// Evaluates every quantity at every sample in `[burn_in, len)`.
///
/// Before each evaluation the chain parameters are set to that sample's values; the
/// remaining parameters keep their current values. `params` is restored afterwards.
pub fn evaluate_derived(
    chain: &Chain,
    burn_in: usize,
    params: &mut ParameterSet,
    quantities: &[DerivedQuantity],
) -> Vec<DerivedSeries> {
    let snapshot = params.snapshot();
    let rows = chain.post_burn_in(burn_in);
    let mut series: Vec<DerivedSeries> = quantities
        .iter()
        .map(|q| DerivedSeries {
            name: q.name.clone(),
            values: Vec::with_capacity(rows.len()),
            weights: Vec::with_capacity(rows.len()),
        })
        .collect();
    for sample in rows {
        params.set_named_values(chain.names(), &sample.values);
        for (q, s) in quantities.iter().zip(series.iter_mut()) {
            s.values.push(q.eval(params));
            s.weights.push(sample.weight);
        }
    }
    params.restore(&snapshot);
    series
}
