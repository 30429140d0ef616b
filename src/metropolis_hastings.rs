/*!
# Metropolis–Hastings engine.

[`MetropolisHastings`] runs a single chain over the free parameters of a [`ParameterSet`],
minimising a negative log objective. One call to [`MetropolisHastings::run_chain`] takes
the engine through

```text
Idle ──run_chain──▶ Running ──▶ Converged   (chain returned)
                           └──▶ Stalled     (no chain: usage error or non-convergence)
```

## Acceptance rule

With `a` the current and `b` the candidate value of the negative log objective,

```text
log α = (a - b) + [log q(current | candidate) - log q(candidate | current)]
```

where the bracket is only present for non-symmetric proposals. The candidate is accepted
if `log α > 0`, and with probability `exp(log α)` if `log α < 0`. Ties and NaN values
always reject. A candidate the objective refuses (`None`) is rejected as well.

Rejections do not append to the chain; they bump the multiplicity of the current sample.

## Example

```rust
use staged_mcmc::metropolis_hastings::{EngineConfig, MetropolisHastings};
use staged_mcmc::params::{Parameter, ParameterSet};
use staged_mcmc::proposals::{Proposal, ProposalStrategy, SequentialProposal};

let mut params = ParameterSet::new()
    .with("x", Parameter::new(0.0, -5.0, 5.0))
    .unwrap();
let objective = |p: &ParameterSet| p.value("x").map(|x| 0.5 * x * x);
let mut proposal = ProposalStrategy::Sequential(
    SequentialProposal::new(vec![-5.0], vec![5.0], 5.0).unwrap().set_seed(1),
);
let config = EngineConfig { num_steps: 500, keep_start: true, ..Default::default() };
let mut mh = MetropolisHastings::new(&objective, config).seed(1);
let attempt = mh.run_chain(&mut params, &mut proposal).unwrap();
assert!(attempt.chain.is_some());
```
*/

use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::chain::Chain;
use crate::config::AcceptanceWindow;
use crate::error::{McmcError, Result};
use crate::objective::Objective;
use crate::params::ParameterSet;
use crate::proposals::Proposal;
use crate::stats::AcceptanceStatistic;

const MAX_START_DRAWS: usize = 100;

/// Lifecycle of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    #[default]
    Idle,
    Running,
    /// The last run produced a chain.
    Converged,
    /// The last run ended without a chain.
    Stalled,
}

/// Per-run settings of the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub num_steps: usize,
    pub keep_start: bool,
    /// When set, a run only converges if its acceptance rate lies inside the window.
    pub window: Option<AcceptanceWindow>,
    /// Steps between cancellation checks; zero disables them.
    pub cancel_check_every: usize,
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_steps: 100,
            keep_start: false,
            window: None,
            cancel_check_every: 1000,
            show_progress: false,
        }
    }
}

/// Outcome of one engine run. `chain` is `None` when the run did not converge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainAttempt {
    pub chain: Option<Chain>,
    pub acceptance: AcceptanceStatistic,
}

impl ChainAttempt {
    fn failed(acceptance: AcceptanceStatistic) -> Self {
        Self {
            chain: None,
            acceptance,
        }
    }
}

/// Metropolis acceptance on negative log values.
///
/// `log_q_correction` is `log q(current | candidate) - log q(candidate | current)`, zero for
/// symmetric proposals. `u` is a uniform draw in `[0, 1)`.
pub fn metropolis_accept(current: f64, candidate: f64, log_q_correction: f64, u: f64) -> bool {
    let log_alpha = (current - candidate) + log_q_correction;
    if log_alpha.is_nan() {
        return false;
    }
    log_alpha > 0.0 || (log_alpha < 0.0 && u.ln() < log_alpha)
}

/// Single-chain Metropolis–Hastings sampler over a [`ParameterSet`].
pub struct MetropolisHastings<'a> {
    objective: &'a dyn Objective,
    config: EngineConfig,
    rng: SmallRng,
    state: EngineState,
    cancel: Option<&'a dyn Fn(usize) -> bool>,
}

impl<'a> MetropolisHastings<'a> {
    pub fn new(objective: &'a dyn Objective, config: EngineConfig) -> Self {
        Self {
            objective,
            config,
            rng: SmallRng::seed_from_u64(rand::rng().random::<u64>()),
            state: EngineState::Idle,
            cancel: None,
        }
    }

    /// Seeds the engine's accept/reject and start-point draws.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Installs a callback polled every `cancel_check_every` steps with the current step.
    /// Returning `true` aborts the run with [`McmcError::Cancelled`].
    pub fn with_cancel_check(mut self, cancel: &'a dyn Fn(usize) -> bool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /**
    Runs `num_steps` Metropolis–Hastings steps with `proposal`.

    On return `params` holds the last state of the chain, or its values on entry if no
    starting point was accepted.

    # Errors

    * [`McmcError::Usage`] if `params` has no free parameters.
    * [`McmcError::Cancelled`] if the cancel callback asked to stop.

    Non-convergence is not an error: it is reported as a [`ChainAttempt`] without chain.
    */
    pub fn run_chain<P>(&mut self, params: &mut ParameterSet, proposal: &mut P) -> Result<ChainAttempt>
    where
        P: Proposal + ?Sized,
    {
        let mut acceptance = AcceptanceStatistic::new();
        if params.n_free() == 0 {
            self.state = EngineState::Stalled;
            return Err(McmcError::Usage("no free parameters to sample".into()));
        }
        self.state = EngineState::Running;

        let Some((mut current, mut current_nll)) = self.starting_point(params)? else {
            log::warn!("objective rejects every starting point");
            self.state = EngineState::Stalled;
            return Ok(ChainAttempt::failed(acceptance));
        };
        log::debug!("chain starts at {current:?} with nll {current_nll}");

        let mut chain = Chain::new(params.free_names());
        chain.push(current.clone(), current_nll, 0);

        let pb = self.progress_bar();
        for step in 1..=self.config.num_steps {
            if let Some(cancel) = self.cancel {
                let every = self.config.cancel_check_every;
                if every > 0 && step % every == 0 && cancel(step) {
                    params.set_free_values(&current)?;
                    pb.abandon_with_message("cancelled");
                    self.state = EngineState::Idle;
                    return Err(McmcError::Cancelled { step });
                }
            }

            let candidate = proposal.propose(&current);
            params.set_free_values(&candidate)?;
            let accepted = match self.objective.evaluate(params) {
                Some(nll) => {
                    let correction = if proposal.is_symmetric() {
                        0.0
                    } else {
                        proposal.log_q(&candidate, &current) - proposal.log_q(&current, &candidate)
                    };
                    let u: f64 = self.rng.random();
                    metropolis_accept(current_nll, nll, correction, u).then_some(nll)
                }
                None => None,
            };
            acceptance.record(accepted.is_some());

            match accepted {
                Some(nll) => {
                    chain.push(candidate.clone(), nll, step);
                    current = candidate;
                    current_nll = nll;
                    proposal.accepted(&current);
                }
                None => chain.repeat_last(),
            }

            pb.inc(1);
            if step % 100 == 0 {
                pb.set_message(format!("p(accept)≈{:.2}", acceptance.rate()));
            }
        }
        params.set_free_values(&current)?;
        pb.finish_with_message(format!("p(accept)≈{:.2}", acceptance.rate()));

        let in_window = self
            .config
            .window
            .map_or(true, |w| w.contains(acceptance.rate()));
        if acceptance.proposed > 0 && in_window {
            log::info!("chain converged: {acceptance}, {} distinct samples", chain.len());
            self.state = EngineState::Converged;
            Ok(ChainAttempt {
                chain: Some(chain),
                acceptance,
            })
        } else {
            log::info!("chain did not converge: {acceptance}");
            self.state = EngineState::Stalled;
            Ok(ChainAttempt::failed(acceptance))
        }
    }

    /// Current values (keep-start) or up to [`MAX_START_DRAWS`] uniform draws in the bounds.
    fn starting_point(&mut self, params: &mut ParameterSet) -> Result<Option<(Vec<f64>, f64)>> {
        if self.config.keep_start {
            let start = params.free_values();
            return Ok(self.objective.evaluate(params).map(|nll| (start, nll)));
        }
        let (lower, upper) = params.free_bounds();
        if lower.iter().chain(&upper).any(|b| !b.is_finite()) {
            log::debug!("unbounded parameters, starting from current values");
            let start = params.free_values();
            return Ok(self.objective.evaluate(params).map(|nll| (start, nll)));
        }
        let original = params.free_values();
        for _ in 0..MAX_START_DRAWS {
            let start: Vec<f64> = lower
                .iter()
                .zip(&upper)
                .map(|(lo, hi)| lo + (hi - lo) * self.rng.random::<f64>())
                .collect();
            params.set_free_values(&start)?;
            if let Some(nll) = self.objective.evaluate(params) {
                return Ok(Some((start, nll)));
            }
        }
        params.set_free_values(&original)?;
        Ok(None)
    }

    fn progress_bar(&self) -> ProgressBar {
        if !self.config.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(self.config.num_steps as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{prefix:8} {bar:40.cyan/blue} {pos}/{len} ({eta}) | {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_prefix("MH");
        pb
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameter;
    use crate::proposals::{GaussianProposal, ProposalStrategy, SequentialProposal};
    use approx::assert_abs_diff_eq;
    use std::cell::Cell;

    fn two_params() -> ParameterSet {
        ParameterSet::new()
            .with("x", Parameter::new(0.5, -10.0, 10.0))
            .unwrap()
            .with("y", Parameter::new(-0.5, -10.0, 10.0))
            .unwrap()
    }

    fn gaussian_nll(p: &ParameterSet) -> Option<f64> {
        let x = p.value("x")?;
        let y = p.value("y")?;
        Some(0.5 * (x * x + y * y))
    }

    #[test]
    fn better_candidates_always_accepted() {
        let mut rng = SmallRng::seed_from_u64(0);
        for _ in 0..10_000 {
            let u: f64 = rng.random();
            assert!(metropolis_accept(5.0, 4.999, 0.0, u));
        }
    }

    #[test]
    fn ties_and_nan_reject() {
        for u in [0.0, 1e-300, 0.5, 0.999_999] {
            assert!(!metropolis_accept(1.0, 1.0, 0.0, u));
            assert!(!metropolis_accept(1.0, f64::NAN, 0.0, u));
            assert!(!metropolis_accept(f64::NAN, 1.0, 0.0, u));
        }
    }

    #[test]
    fn worse_candidates_accepted_at_exp_rate() {
        let mut rng = SmallRng::seed_from_u64(123);
        let (a, b) = (1.0, 1.7);
        let trials = 200_000;
        let hits = (0..trials)
            .filter(|_| metropolis_accept(a, b, 0.0, rng.random()))
            .count();
        let freq = hits as f64 / trials as f64;
        let expected = f64::exp(a - b);
        let sigma = (expected * (1.0 - expected) / trials as f64).sqrt();
        assert!(
            (freq - expected).abs() < 5.0 * sigma,
            "acceptance frequency {freq} vs exp(a-b) = {expected}"
        );
    }

    #[test]
    fn chain_weights_cover_every_step() {
        let mut params = two_params();
        let config = EngineConfig {
            num_steps: 2000,
            keep_start: true,
            ..Default::default()
        };
        let mut proposal = ProposalStrategy::Sequential(
            SequentialProposal::new(vec![-10.0; 2], vec![10.0; 2], 8.0)
                .unwrap()
                .set_seed(4),
        );
        let mut mh = MetropolisHastings::new(&gaussian_nll, config).seed(4);
        let attempt = mh.run_chain(&mut params, &mut proposal).unwrap();
        let chain = attempt.chain.unwrap();
        assert_eq!(mh.state(), EngineState::Converged);
        assert_eq!(attempt.acceptance.proposed, 2000);
        assert_eq!(chain.len() as u64, attempt.acceptance.accepted + 1);
        assert_abs_diff_eq!(chain.total_weight(), 2001.0);
        assert_eq!(chain.samples()[0].values, vec![0.5, -0.5]);
        // params are left on the last state of the chain
        let last = chain.last().unwrap();
        assert_eq!(params.free_values(), last.values);
        assert!(chain.samples().windows(2).all(|w| w[0].step < w[1].step));
    }

    #[test]
    fn window_decides_convergence() {
        let window = AcceptanceWindow::default();
        let config = EngineConfig {
            num_steps: 1000,
            keep_start: true,
            window: Some(window),
            ..Default::default()
        };
        // tiny steps: acceptance close to one, outside the window
        let mut params = two_params();
        let mut proposal = GaussianProposal::new(vec![1e-4, 1e-4]).set_seed(8);
        let mut mh = MetropolisHastings::new(&gaussian_nll, config).seed(8);
        let attempt = mh.run_chain(&mut params, &mut proposal).unwrap();
        assert!(attempt.chain.is_none());
        assert!(attempt.acceptance.rate() > 0.9);
        assert_eq!(mh.state(), EngineState::Stalled);
    }

    #[test]
    fn refusing_objective_gives_failed_attempt() {
        let refuse = |_: &ParameterSet| None::<f64>;
        let mut params = two_params();
        let mut proposal = GaussianProposal::new(vec![1.0, 1.0]);
        let mut mh = MetropolisHastings::new(&refuse, EngineConfig::default()).seed(1);
        let attempt = mh.run_chain(&mut params, &mut proposal).unwrap();
        assert!(attempt.chain.is_none());
        assert_eq!(attempt.acceptance.accepted, 0);
        assert_eq!(mh.state(), EngineState::Stalled);
        assert_eq!(params, two_params(), "rejected start draws must not leak into params");
    }

    #[test]
    fn random_start_retries_rejected_points() {
        // only the positive half-plane in x is allowed
        let half = |p: &ParameterSet| {
            let x = p.value("x")?;
            (x > 0.0).then(|| 0.5 * x * x)
        };
        let mut params = two_params();
        let mut proposal = GaussianProposal::new(vec![0.1, 0.1]).set_seed(2);
        let config = EngineConfig {
            num_steps: 10,
            ..Default::default()
        };
        let mut mh = MetropolisHastings::new(&half, config).seed(2);
        let chain = mh.run_chain(&mut params, &mut proposal).unwrap().chain.unwrap();
        assert!(chain.samples()[0].values[0] > 0.0);
    }

    #[test]
    fn zero_free_parameters_is_usage_error() {
        let mut params = ParameterSet::new()
            .with("c", Parameter::new(1.0, 0.0, 2.0).fixed())
            .unwrap();
        let mut proposal = GaussianProposal::new(vec![]);
        let mut mh = MetropolisHastings::new(&gaussian_nll, EngineConfig::default());
        assert!(matches!(
            mh.run_chain(&mut params, &mut proposal),
            Err(McmcError::Usage(_))
        ));
        assert_eq!(mh.state(), EngineState::Stalled);
    }

    #[test]
    fn cancel_check_stops_the_run() {
        let calls = Cell::new(0);
        let cancel = |step: usize| {
            calls.set(calls.get() + 1);
            step >= 300
        };
        let config = EngineConfig {
            num_steps: 10_000,
            keep_start: true,
            cancel_check_every: 100,
            ..Default::default()
        };
        let mut params = two_params();
        let mut proposal = GaussianProposal::new(vec![0.5, 0.5]);
        let mut mh = MetropolisHastings::new(&gaussian_nll, config).with_cancel_check(&cancel);
        let res = mh.run_chain(&mut params, &mut proposal);
        assert!(matches!(res, Err(McmcError::Cancelled { step: 300 })));
        assert_eq!(calls.get(), 3);
        assert_eq!(mh.state(), EngineState::Idle);
    }

    #[test]
    fn samples_target_distribution() {
        let mut params = two_params();
        let config = EngineConfig {
            num_steps: 40_000,
            keep_start: true,
            ..Default::default()
        };
        let mut proposal = GaussianProposal::new(vec![2.4 / 2f64.sqrt(); 2]).set_seed(21);
        let mut mh = MetropolisHastings::new(&gaussian_nll, config).seed(21);
        let chain = mh.run_chain(&mut params, &mut proposal).unwrap().chain.unwrap();
        let (mx, sx) =
            crate::stats::weighted_mean_std(&chain.column(0, 100), &chain.weights(100)).unwrap();
        assert_abs_diff_eq!(mx, 0.0, epsilon = 0.1);
        assert_abs_diff_eq!(sx, 1.0, epsilon = 0.1);
    }
}
