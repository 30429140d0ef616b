/*!
# Adaptive controller.

A [`Sampler`] binds an objective and a dataset, then executes a [`RunPolicy`]: a
composition of engine runs, norm adaptation and covariance estimation.

## Norm adaptation

Every adapted phase repeats engine runs until one converges (its acceptance lands in the
configured window):

```text
attempt := run chain with proposal(norm)
converged        -> done
acceptance > 0   -> norm *= target / acceptance
acceptance == 0  -> restore the parameters held at phase start, norm *= 5
```

The norm divides the proposal width (or covariance), so a low acceptance grows the norm and
shrinks the steps. The loop is bounded by `max_attempts`; running out of attempts yields
[`McmcError::NonConvergence`].

## Policies

| Policy | Phases |
|--------|--------|
| [`RunPolicy::Plain`] | one uniform-proposal run |
| [`RunPolicy::Sequential`] | one sequential run from the current values |
| [`RunPolicy::SequentialAdaptive`] | adapted sequential run |
| [`RunPolicy::Gaussian`] | adapted per-parameter Gaussian run |
| [`RunPolicy::CovarianceFromChain`] | sequential burn-in, then adapted covariance-seeded run using a covariance estimated from a given chain |
| [`RunPolicy::SequentialThenCovariance`] | sequential burn-in, adapted sequential run, covariance from that chain, adapted covariance-seeded run with the mean cache rebuilt every step |
| [`RunPolicy::UniformThenSequential`] | `2 · n_free` uniform steps, then a sequential run |
*/

use indexmap::IndexMap;
use rand::Rng;

use crate::chain::Chain;
use crate::config::{AcceptanceWindow, SamplerConfig};
use crate::covariance::{CovarianceEstimator, CovarianceMatrix};
use crate::error::{McmcError, Result};
use crate::metropolis_hastings::{ChainAttempt, EngineConfig, MetropolisHastings};
use crate::objective::{DerivedQuantity, Objective, ObjectiveAdapter, WeightedData};
use crate::params::ParameterSet;
use crate::proposals::{
    CovarianceGaussian, GaussianProposal, Proposal, ProposalStrategy, SequentialProposal,
    UniformProposal,
};
use crate::stats::effective_sample_size;
use crate::summary::{evaluate_derived, summarize, DerivedSeries, PosteriorSummary};

/// Composite run variants.
#[derive(Debug, Clone, PartialEq)]
pub enum RunPolicy {
    Plain,
    Sequential,
    SequentialAdaptive,
    Gaussian,
    /// Covariance-seeded run using a covariance estimated from an earlier chain.
    CovarianceFromChain { chain: Chain, burn_in: usize },
    SequentialThenCovariance,
    UniformThenSequential,
}

impl RunPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Sequential => "sequential",
            Self::SequentialAdaptive => "sequential-adaptive",
            Self::Gaussian => "gaussian",
            Self::CovarianceFromChain { .. } => "covariance-from-chain",
            Self::SequentialThenCovariance => "sequential-then-covariance",
            Self::UniformThenSequential => "uniform-then-sequential",
        }
    }
}

/// Result of an adapted phase.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptedRun {
    pub chain: Chain,
    pub acceptance: f64,
    pub attempts: usize,
}

/// The acceptance-targeted norm adaptation loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormAdaptation {
    pub target: f64,
    pub max_attempts: usize,
}

impl NormAdaptation {
    /**
    Calls `attempt(params, norm, attempt_number)` until it returns a chain.

    `norm` is updated in place and holds the norm of the converged attempt on success.
    An attempt that accepted nothing restores the parameters held when `run` was called.
    Errors returned by `attempt` abort the loop.

    # Errors

    [`McmcError::NonConvergence`] once `max_attempts` attempts failed.
    */
    pub fn run<F>(&self, params: &mut ParameterSet, norm: &mut f64, mut attempt: F) -> Result<AdaptedRun>
    where
        F: FnMut(&mut ParameterSet, f64, usize) -> Result<ChainAttempt>,
    {
        let phase_start = params.snapshot();
        let mut last_rate = 0.0;
        for n in 1..=self.max_attempts {
            let result = attempt(params, *norm, n)?;
            last_rate = result.acceptance.rate();
            if let Some(chain) = result.chain {
                return Ok(AdaptedRun {
                    chain,
                    acceptance: last_rate,
                    attempts: n,
                });
            }
            if last_rate > 0.0 {
                *norm *= self.target / last_rate;
                log::info!(
                    "attempt {n}: acceptance {last_rate:.3} outside window, norm -> {:.5}",
                    *norm
                );
            } else {
                params.restore(&phase_start);
                *norm *= 5.0;
                log::warn!(
                    "attempt {n}: nothing accepted, restored phase-start parameters, norm -> {:.5}",
                    *norm
                );
            }
        }
        Err(McmcError::NonConvergence {
            attempts: self.max_attempts,
            acceptance: last_rate,
        })
    }
}

/// What a [`Sampler`] run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub policy: &'static str,
    /// The final chain, burn-in included.
    pub chain: Chain,
    /// Burn-in to drop from `chain` for summaries.
    pub burn_in: usize,
    /// False when the chain was too short for the requested burn-in.
    pub burn_in_applied: bool,
    /// Acceptance rate of the last engine run.
    pub acceptance: f64,
    /// Engine steps over every phase and attempt.
    pub steps: u64,
    /// Engine runs over every phase.
    pub attempts: usize,
    /// Norm of the final phase.
    pub norm: f64,
    /// Effective sample size per parameter of the post-burn-in chain.
    pub ess: IndexMap<String, f64>,
    /// Covariance used by a covariance-seeded phase, before division by the norm.
    pub covariance: Option<CovarianceMatrix>,
    pub weight_correction: f64,
}

/// Burn-in to use on `chain`: the requested one if at least two samples remain.
fn effective_burn_in(chain: &Chain, requested: usize) -> (usize, bool) {
    if requested == 0 || chain.len() >= requested + 2 {
        (requested, true)
    } else {
        log::warn!(
            "chain of {} samples too short for burn-in {requested}, keeping every sample",
            chain.len()
        );
        (0, false)
    }
}

/// Drives staged Metropolis–Hastings runs over a [`ParameterSet`].
pub struct Sampler<'a> {
    config: SamplerConfig,
    objective: Option<&'a dyn Objective>,
    data: Option<&'a dyn WeightedData>,
    cancel: Option<&'a dyn Fn(usize) -> bool>,
}

impl<'a> Sampler<'a> {
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            objective: None,
            data: None,
            cancel: None,
        }
    }

    pub fn with_objective(mut self, objective: &'a dyn Objective) -> Self {
        self.objective = Some(objective);
        self
    }

    pub fn with_data(mut self, data: &'a dyn WeightedData) -> Self {
        self.data = Some(data);
        self
    }

    /// See [`MetropolisHastings::with_cancel_check`].
    pub fn with_cancel_check(mut self, cancel: &'a dyn Fn(usize) -> bool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    fn bound(&self) -> Result<(&'a dyn Objective, &'a dyn WeightedData)> {
        let objective = self
            .objective
            .ok_or_else(|| McmcError::Usage("no objective bound to the sampler".into()))?;
        let data = self
            .data
            .ok_or_else(|| McmcError::Usage("no data bound to the sampler".into()))?;
        Ok((objective, data))
    }

    fn adapter(&self) -> Result<ObjectiveAdapter<'a>> {
        let (objective, data) = self.bound()?;
        Ok(if self.config.correct_for_weights {
            ObjectiveAdapter::with_weight_correction(objective, data)
        } else {
            ObjectiveAdapter::new(objective)
        })
    }

    /**
    Executes `policy`, leaving `params` on the last state of the final chain.

    # Errors

    * [`McmcError::Config`] for an invalid configuration.
    * [`McmcError::Usage`] without objective, data or free parameters, or for a policy
      that needs finite bounds on unbounded parameters.
    * [`McmcError::NonConvergence`] when a phase ran out of attempts.
    * [`McmcError::Estimation`] when a covariance could not be estimated.
    * [`McmcError::Cancelled`] when the cancel check fired.
    */
    pub fn run(&self, policy: &RunPolicy, params: &mut ParameterSet) -> Result<RunReport> {
        self.config.validate()?;
        let adapter = self.adapter()?;
        if params.n_free() == 0 {
            return Err(McmcError::Usage("no free parameters to sample".into()));
        }
        let seed = self
            .config
            .seed
            .unwrap_or_else(|| rand::rng().random::<u64>());
        log::info!(
            "running {} policy over {} free parameters (seed {seed})",
            policy.name(),
            params.n_free()
        );
        let mut runner = Runner {
            config: &self.config,
            objective: &adapter,
            cancel: self.cancel,
            seed,
            runs: 0,
            steps: 0,
            last_acceptance: 0.0,
        };
        let cfg = &self.config;
        let names = params.free_names();
        let (lower, upper) = params.free_bounds();
        let mut norm = cfg.norm;
        let mut burn_in = cfg.num_burn_in;
        let mut covariance = None;

        let chain = match policy {
            RunPolicy::Plain => {
                let proposal = UniformProposal::new(lower, upper)?;
                runner.single(params, ProposalStrategy::Uniform(proposal), cfg.keep_start)?
            }
            RunPolicy::Sequential => {
                runner.single(params, sequential(&lower, &upper, norm)?, true)?
            }
            RunPolicy::SequentialAdaptive => {
                runner.adaptive(params, &mut norm, cfg.num_iters, cfg.keep_start, |n| {
                    sequential(&lower, &upper, n)
                })?
            }
            RunPolicy::Gaussian => {
                runner.adaptive(params, &mut norm, cfg.num_iters, cfg.keep_start, |n| {
                    GaussianProposal::from_bounds(&lower, &upper, n).map(ProposalStrategy::Gaussian)
                })?
            }
            RunPolicy::CovarianceFromChain {
                chain: seed_chain,
                burn_in: seed_burn_in,
            } => {
                let cov = cfg.estimator.estimate(seed_chain, *seed_burn_in, params)?;
                runner.burn_in(params, sequential(&lower, &upper, norm)?, cfg.num_burn_in, true)?;
                let chain = runner.adaptive(params, &mut norm, cfg.num_iters, true, |n| {
                    covariance_proposal(&names, &cov, n, cfg.cache_size)
                })?;
                covariance = Some(cov);
                chain
            }
            RunPolicy::SequentialThenCovariance => {
                runner.burn_in(params, sequential(&lower, &upper, norm)?, cfg.num_burn_in, true)?;
                let first = runner.adaptive(params, &mut norm, cfg.num_iters, true, |n| {
                    sequential(&lower, &upper, n)
                })?;
                let estimator = if cfg.uncorrelate_yields {
                    CovarianceEstimator::NonYield
                } else {
                    CovarianceEstimator::Robust
                };
                let (first_burn_in, _) = effective_burn_in(&first, cfg.num_burn_in);
                let cov = estimator.estimate(&first, first_burn_in, params)?;
                norm = cfg.then_cov.norm;
                burn_in = cfg.then_cov.num_burn_in;
                let chain =
                    runner.adaptive(params, &mut norm, cfg.then_cov.num_iters, true, |n| {
                        covariance_proposal(&names, &cov, n, 1)
                    })?;
                covariance = Some(cov);
                chain
            }
            RunPolicy::UniformThenSequential => {
                let uniform = UniformProposal::new(lower.clone(), upper.clone())?;
                runner.burn_in(
                    params,
                    ProposalStrategy::Uniform(uniform),
                    2 * names.len(),
                    cfg.keep_start,
                )?;
                runner.single(params, sequential(&lower, &upper, norm)?, true)?
            }
        };

        let (burn_in, burn_in_applied) = effective_burn_in(&chain, burn_in);
        let ess_values = effective_sample_size(chain.to_iteration_array(burn_in).view());
        let ess = chain
            .names()
            .iter()
            .cloned()
            .zip(ess_values.iter().copied())
            .collect();
        let report = RunReport {
            policy: policy.name(),
            chain,
            burn_in,
            burn_in_applied,
            acceptance: runner.last_acceptance,
            steps: runner.steps,
            attempts: runner.runs as usize,
            norm,
            ess,
            covariance,
            weight_correction: adapter.factor(),
        };
        log::info!(
            "{} finished: {} runs, {} steps, acceptance {:.3}, norm {:.5}",
            report.policy,
            report.attempts,
            report.steps,
            report.acceptance,
            report.norm
        );
        Ok(report)
    }

    /// Summarises the post-burn-in chain of `report` into `params`, re-evaluating the
    /// (corrected) objective at the posterior mean.
    pub fn summarize(&self, report: &RunReport, params: &mut ParameterSet) -> Result<PosteriorSummary> {
        let adapter = self.adapter()?;
        summarize(&report.chain, report.burn_in, params, Some(&adapter as &dyn Objective))
    }

    /// Evaluates `quantities` at every post-burn-in sample of `report`.
    pub fn derived(
        &self,
        report: &RunReport,
        params: &mut ParameterSet,
        quantities: &[DerivedQuantity],
    ) -> Vec<DerivedSeries> {
        evaluate_derived(&report.chain, report.burn_in, params, quantities)
    }
}

fn sequential(lower: &[f64], upper: &[f64], norm: f64) -> Result<ProposalStrategy> {
    SequentialProposal::new(lower.to_vec(), upper.to_vec(), norm).map(ProposalStrategy::Sequential)
}

fn covariance_proposal(
    names: &[String],
    cov: &CovarianceMatrix,
    norm: f64,
    cache_size: usize,
) -> Result<ProposalStrategy> {
    let proposal = CovarianceGaussian::new(names.to_vec(), cov.scaled(1.0 / norm))?;
    Ok(ProposalStrategy::CovarianceGaussian(proposal.cache_size(cache_size)))
}

/// Engine runs of one [`Sampler::run`] call with shared seeding and bookkeeping.
struct Runner<'r> {
    config: &'r SamplerConfig,
    objective: &'r dyn Objective,
    cancel: Option<&'r dyn Fn(usize) -> bool>,
    seed: u64,
    runs: u64,
    steps: u64,
    last_acceptance: f64,
}

impl Runner<'_> {
    fn run_once(
        &mut self,
        params: &mut ParameterSet,
        proposal: ProposalStrategy,
        num_steps: usize,
        keep_start: bool,
        window: Option<AcceptanceWindow>,
    ) -> Result<ChainAttempt> {
        let chain_seed = self.seed.wrapping_add(self.runs);
        self.runs += 1;
        let mut proposal = proposal.set_seed(chain_seed.wrapping_add(0x9E3779B97F4A7C15));
        let config = EngineConfig {
            num_steps,
            keep_start,
            window,
            cancel_check_every: self.config.cancel_check_every,
            show_progress: self.config.show_progress,
        };
        log::debug!(
            "engine run {} with {} proposal, {num_steps} steps",
            self.runs,
            proposal.name()
        );
        let mut mh = MetropolisHastings::new(self.objective, config).seed(chain_seed);
        if let Some(cancel) = self.cancel {
            mh = mh.with_cancel_check(cancel);
        }
        let attempt = mh.run_chain(params, &mut proposal)?;
        self.steps += attempt.acceptance.proposed;
        self.last_acceptance = attempt.acceptance.rate();
        Ok(attempt)
    }

    /// One run without acceptance window; a missing chain is a non-convergence.
    fn single(
        &mut self,
        params: &mut ParameterSet,
        proposal: ProposalStrategy,
        keep_start: bool,
    ) -> Result<Chain> {
        let attempt = self.run_once(params, proposal, self.config.num_iters, keep_start, None)?;
        attempt.chain.ok_or(McmcError::NonConvergence {
            attempts: 1,
            acceptance: attempt.acceptance.rate(),
        })
    }

    /// A run whose chain is discarded; only the parameters move.
    fn burn_in(
        &mut self,
        params: &mut ParameterSet,
        proposal: ProposalStrategy,
        num_steps: usize,
        keep_start: bool,
    ) -> Result<()> {
        if num_steps == 0 {
            return Ok(());
        }
        let attempt = self.run_once(params, proposal, num_steps, keep_start, None)?;
        if attempt.chain.is_none() {
            log::warn!("burn-in produced no chain ({})", attempt.acceptance);
        } else {
            log::info!("burn-in done: {}", attempt.acceptance);
        }
        Ok(())
    }

    fn adaptive<B>(
        &mut self,
        params: &mut ParameterSet,
        norm: &mut f64,
        num_steps: usize,
        keep_start: bool,
        mut build: B,
    ) -> Result<Chain>
    where
        B: FnMut(f64) -> Result<ProposalStrategy>,
    {
        let adaptation = NormAdaptation {
            target: self.config.acceptance.target,
            max_attempts: self.config.max_attempts,
        };
        let window = Some(self.config.acceptance);
        let run = adaptation.run(params, norm, |params, norm, attempt| {
            let proposal = build(norm)?;
            self.run_once(params, proposal, num_steps, keep_start || attempt > 1, window)
        })?;
        log::info!(
            "adapted run converged after {} attempts with acceptance {:.3}",
            run.attempts,
            run.acceptance
        );
        Ok(run.chain)
    }
}
