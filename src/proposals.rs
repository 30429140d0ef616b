/*!
# Proposal strategies.

A proposal generates a candidate vector of free-parameter values from the current one.
All proposals own a [`SmallRng`] and can be reseeded through [`Proposal::set_seed`].

- [`UniformProposal`] draws every free parameter uniformly within its bounds (an
  independence sampler, so the proposal density cancels in the acceptance ratio).
- [`SequentialProposal`] moves a single randomly chosen parameter by
  `N(0, 1) · (upper - lower) / norm` and wraps the result periodically into the bounds.
- [`GaussianProposal`] moves every parameter by an independent normal step with a
  per-parameter width.
- [`CovarianceGaussian`] draws `mean + L z` where `L L^T` is the proposal covariance. The
  means come from a name-keyed cache refreshed every `cache_size` proposals, or every time
  the chain moves when `update_means` is set.

[`ProposalStrategy`] is the tagged union the controller builds for each run phase.

## Example

```rust
use staged_mcmc::proposals::{Proposal, SequentialProposal};

let mut proposal = SequentialProposal::new(vec![-5.0, 0.0], vec![5.0, 1.0], 10.0)
    .unwrap()
    .set_seed(42);
let candidate = proposal.propose(&[0.0, 0.5]);
assert_eq!(candidate.len(), 2);
```
*/

use indexmap::IndexMap;
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::covariance::CovarianceMatrix;
use crate::error::{McmcError, Result};

/// A mechanism generating candidate states for Metropolis-Hastings.
pub trait Proposal {
    /// Samples a candidate from `q(x' | current)`.
    fn propose(&mut self, current: &[f64]) -> Vec<f64>;

    /// True if `q(x' | x) = q(x | x')` for every pair the proposal can currently produce.
    fn is_symmetric(&self) -> bool {
        true
    }

    /// Evaluates `log q(to | from)` up to a constant. Only consulted when
    /// [`Proposal::is_symmetric`] is false.
    fn log_q(&self, _from: &[f64], _to: &[f64]) -> f64 {
        0.0
    }

    /// Called by the engine after the chain moved to `state`.
    fn accepted(&mut self, _state: &[f64]) {}

    /// Returns the proposal seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self
    where
        Self: Sized;
}

fn fresh_rng() -> SmallRng {
    SmallRng::seed_from_u64(rand::rng().random::<u64>())
}

/// Maps `x` periodically into `[lower, upper)`.
fn wrap(x: f64, lower: f64, upper: f64) -> f64 {
    let range = upper - lower;
    if !(range > 0.0) || !range.is_finite() || (lower..upper).contains(&x) {
        return x;
    }
    lower + (x - lower).rem_euclid(range)
}

/// Fails unless `lower` and `upper` have equal length and every pair is finite and ordered.
fn check_bounds(lower: &[f64], upper: &[f64], what: &str) -> Result<()> {
    if lower.len() != upper.len() {
        return Err(McmcError::Usage("bound vectors differ in length".into()));
    }
    if let Some(i) = (0..lower.len())
        .find(|&i| !lower[i].is_finite() || !upper[i].is_finite() || lower[i] > upper[i])
    {
        return Err(McmcError::Usage(format!(
            "{what} proposal needs finite ordered bounds, parameter {i} has [{}, {}]",
            lower[i], upper[i]
        )));
    }
    Ok(())
}

/// Independent uniform draws inside the parameter bounds.
#[derive(Debug, Clone)]
pub struct UniformProposal {
    lower: Vec<f64>,
    upper: Vec<f64>,
    rng: SmallRng,
}

impl UniformProposal {
    /// Fails if any bound is infinite or the bounds are inverted.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>) -> Result<Self> {
        check_bounds(&lower, &upper, "uniform")?;
        Ok(Self {
            lower,
            upper,
            rng: fresh_rng(),
        })
    }
}

impl Proposal for UniformProposal {
    fn propose(&mut self, _current: &[f64]) -> Vec<f64> {
        self.lower
            .iter()
            .zip(&self.upper)
            .map(|(lo, hi)| lo + (hi - lo) * self.rng.random::<f64>())
            .collect()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/// Single-parameter random walk with periodic wrapping into the bounds.
#[derive(Debug, Clone)]
pub struct SequentialProposal {
    lower: Vec<f64>,
    upper: Vec<f64>,
    norm: f64,
    rng: SmallRng,
}

impl SequentialProposal {
    /// `norm` divides the parameter range to give the step width. Fails for infinite or
    /// inverted bounds.
    pub fn new(lower: Vec<f64>, upper: Vec<f64>, norm: f64) -> Result<Self> {
        check_bounds(&lower, &upper, "sequential")?;
        Ok(Self {
            lower,
            upper,
            norm,
            rng: fresh_rng(),
        })
    }

    pub fn norm(&self) -> f64 {
        self.norm
    }
}

impl Proposal for SequentialProposal {
    fn propose(&mut self, current: &[f64]) -> Vec<f64> {
        let mut candidate = current.to_vec();
        if candidate.is_empty() {
            return candidate;
        }
        let i = self.rng.random_range(0..candidate.len());
        let (lo, hi) = (self.lower[i], self.upper[i]);
        let z: f64 = self.rng.sample(StandardNormal);
        candidate[i] = wrap(candidate[i] + z * (hi - lo) / self.norm, lo, hi);
        candidate
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/// Independent normal steps on every parameter.
#[derive(Debug, Clone)]
pub struct GaussianProposal {
    widths: Vec<f64>,
    rng: SmallRng,
}

impl GaussianProposal {
    pub fn new(widths: Vec<f64>) -> Self {
        Self {
            widths,
            rng: fresh_rng(),
        }
    }

    /// Widths `(upper - lower) / norm`. Fails for infinite or inverted bounds.
    pub fn from_bounds(lower: &[f64], upper: &[f64], norm: f64) -> Result<Self> {
        check_bounds(lower, upper, "gaussian")?;
        Ok(Self::new(
            lower
                .iter()
                .zip(upper)
                .map(|(lo, hi)| (hi - lo) / norm)
                .collect(),
        ))
    }

    pub fn widths(&self) -> &[f64] {
        &self.widths
    }
}

impl Proposal for GaussianProposal {
    fn propose(&mut self, current: &[f64]) -> Vec<f64> {
        current
            .iter()
            .zip(&self.widths)
            .map(|(x, w)| {
                let z: f64 = self.rng.sample(StandardNormal);
                x + z * w
            })
            .collect()
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/**
Multivariate normal proposal from a [`CovarianceMatrix`].

The state vector is laid out as `state_names`; the covariance may cover a subset of those
names in any order. Parameters absent from the covariance are never moved.

The proposal mean for each covariance parameter is read from a name-keyed cache. With
`cache_size == 1` (the default) the cache is rebuilt from the current state before every
proposal, which makes the proposal a symmetric random walk. With a larger cache and
`update_means` off, the cached mean can lag behind the chain; the proposal then reports
itself as non-symmetric and supplies `log q` so the engine can apply the Hastings
correction.
*/
#[derive(Debug, Clone)]
pub struct CovarianceGaussian {
    covariance: CovarianceMatrix,
    factor: DMatrix<f64>,
    /// Position of each covariance parameter in the state vector.
    slots: Vec<usize>,
    state_names: Vec<String>,
    means: IndexMap<String, f64>,
    cache_size: usize,
    since_refresh: usize,
    update_means: bool,
    rng: SmallRng,
}

impl CovarianceGaussian {
    /// Fails if a covariance parameter is missing from `state_names` or the matrix is not
    /// symmetric positive semi-definite.
    pub fn new(state_names: Vec<String>, covariance: CovarianceMatrix) -> Result<Self> {
        let slots = Self::slots_for(&state_names, &covariance)?;
        covariance.validate()?;
        let factor = covariance.sqrt_factor();
        Ok(Self {
            covariance,
            factor,
            slots,
            state_names,
            means: IndexMap::new(),
            cache_size: 1,
            since_refresh: 0,
            update_means: false,
            rng: fresh_rng(),
        })
    }

    /// Number of proposals between mean-cache rebuilds (at least one).
    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size.max(1);
        self
    }

    /// Refresh the cached means whenever the chain moves.
    pub fn update_means(mut self, update: bool) -> Self {
        self.update_means = update;
        self
    }

    pub fn covariance(&self) -> &CovarianceMatrix {
        &self.covariance
    }

    /// Replaces the proposal covariance. The names must match the current covariance.
    pub fn set_scale(&mut self, covariance: CovarianceMatrix) -> Result<()> {
        if covariance.names() != self.covariance.names() {
            return Err(McmcError::Usage(format!(
                "covariance over {:?} cannot replace one over {:?}",
                covariance.names(),
                self.covariance.names()
            )));
        }
        covariance.validate()?;
        self.factor = covariance.sqrt_factor();
        self.covariance = covariance;
        Ok(())
    }

    /// Drops every cached mean and adopts a new state layout.
    pub fn rebuild_mean_cache(&mut self, state_names: Vec<String>) -> Result<()> {
        self.slots = Self::slots_for(&state_names, &self.covariance)?;
        self.state_names = state_names;
        self.means.clear();
        self.since_refresh = 0;
        Ok(())
    }

    /// Cached proposal mean of `name`, if any.
    pub fn cached_mean(&self, name: &str) -> Option<f64> {
        self.means.get(name).copied()
    }

    fn slots_for(state_names: &[String], covariance: &CovarianceMatrix) -> Result<Vec<usize>> {
        covariance
            .names()
            .iter()
            .map(|name| {
                state_names.iter().position(|s| s == name).ok_or_else(|| {
                    McmcError::Usage(format!("covariance parameter '{name}' is not in the state"))
                })
            })
            .collect()
    }

    fn refresh_means(&mut self, state: &[f64]) {
        self.means.clear();
        for (name, slot) in self.covariance.names().iter().zip(&self.slots) {
            self.means.insert(name.clone(), state[*slot]);
        }
        self.since_refresh = 0;
    }

    fn mean_vector(&self, fallback: &[f64]) -> DVector<f64> {
        DVector::from_iterator(
            self.slots.len(),
            self.covariance
                .names()
                .iter()
                .zip(&self.slots)
                .map(|(name, slot)| self.means.get(name).copied().unwrap_or(fallback[*slot])),
        )
    }
}

impl Proposal for CovarianceGaussian {
    fn propose(&mut self, current: &[f64]) -> Vec<f64> {
        if self.means.is_empty() || self.since_refresh >= self.cache_size {
            self.refresh_means(current);
        }
        self.since_refresh += 1;
        let z = DVector::from_iterator(
            self.slots.len(),
            (0..self.slots.len()).map(|_| self.rng.sample::<f64, _>(StandardNormal)),
        );
        let step = &self.factor * z;
        let mean = self.mean_vector(current);
        let mut candidate = current.to_vec();
        for (k, slot) in self.slots.iter().enumerate() {
            candidate[*slot] = mean[k] + step[k];
        }
        candidate
    }

    fn is_symmetric(&self) -> bool {
        self.cache_size == 1 || self.update_means
    }

    fn log_q(&self, from: &[f64], to: &[f64]) -> f64 {
        let mean = self.mean_vector(from);
        let diff = DVector::from_iterator(
            self.slots.len(),
            self.slots.iter().enumerate().map(|(k, slot)| to[*slot] - mean[k]),
        );
        match self.covariance.matrix().clone().cholesky() {
            Some(chol) => -0.5 * diff.dot(&chol.solve(&diff)),
            None => 0.0,
        }
    }

    fn accepted(&mut self, state: &[f64]) {
        if self.update_means {
            self.refresh_means(state);
        }
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

/// The proposal used by one run phase.
#[derive(Debug, Clone)]
pub enum ProposalStrategy {
    Uniform(UniformProposal),
    Sequential(SequentialProposal),
    Gaussian(GaussianProposal),
    CovarianceGaussian(CovarianceGaussian),
}

impl ProposalStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uniform(_) => "uniform",
            Self::Sequential(_) => "sequential",
            Self::Gaussian(_) => "gaussian",
            Self::CovarianceGaussian(_) => "covariance-gaussian",
        }
    }
}

impl Proposal for ProposalStrategy {
    fn propose(&mut self, current: &[f64]) -> Vec<f64> {
        match self {
            Self::Uniform(p) => p.propose(current),
            Self::Sequential(p) => p.propose(current),
            Self::Gaussian(p) => p.propose(current),
            Self::CovarianceGaussian(p) => p.propose(current),
        }
    }

    fn is_symmetric(&self) -> bool {
        match self {
            Self::Uniform(p) => p.is_symmetric(),
            Self::Sequential(p) => p.is_symmetric(),
            Self::Gaussian(p) => p.is_symmetric(),
            Self::CovarianceGaussian(p) => p.is_symmetric(),
        }
    }

    fn log_q(&self, from: &[f64], to: &[f64]) -> f64 {
        match self {
            Self::Uniform(p) => p.log_q(from, to),
            Self::Sequential(p) => p.log_q(from, to),
            Self::Gaussian(p) => p.log_q(from, to),
            Self::CovarianceGaussian(p) => p.log_q(from, to),
        }
    }

    fn accepted(&mut self, state: &[f64]) {
        if let Self::CovarianceGaussian(p) = self {
            p.accepted(state);
        }
    }

    fn set_seed(self, seed: u64) -> Self {
        match self {
            Self::Uniform(p) => Self::Uniform(p.set_seed(seed)),
            Self::Sequential(p) => Self::Sequential(p.set_seed(seed)),
            Self::Gaussian(p) => Self::Gaussian(p.set_seed(seed)),
            Self::CovarianceGaussian(p) => Self::CovarianceGaussian(p.set_seed(seed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn names(n: &[&str]) -> Vec<String> {
        n.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let mut p = UniformProposal::new(vec![-1.0, 10.0], vec![1.0, 20.0])
            .unwrap()
            .set_seed(1);
        for _ in 0..1000 {
            let c = p.propose(&[0.0, 15.0]);
            assert!((-1.0..=1.0).contains(&c[0]));
            assert!((10.0..=20.0).contains(&c[1]));
        }
        assert!(UniformProposal::new(vec![f64::NEG_INFINITY], vec![0.0]).is_err());
    }

    #[test]
    fn sequential_moves_one_parameter_and_wraps() {
        let mut p = SequentialProposal::new(vec![0.0, 0.0, 0.0], vec![1.0, 1.0, 1.0], 0.5)
            .unwrap()
            .set_seed(3);
        let current = [0.5, 0.5, 0.5];
        for _ in 0..500 {
            let c = p.propose(&current);
            let moved = c.iter().zip(&current).filter(|(a, b)| a != b).count();
            assert!(moved <= 1, "sequential proposal moved {moved} parameters");
            assert!(c.iter().all(|v| (0.0..1.0).contains(v)), "{c:?} left the bounds");
        }
    }

    #[test]
    fn width_proposals_need_finite_bounds() {
        let inf = f64::INFINITY;
        for (lower, upper) in [
            (vec![-inf, 0.0], vec![inf, 1.0]),
            (vec![0.0, 0.0], vec![1.0, inf]),
            (vec![2.0], vec![1.0]),
        ] {
            assert!(matches!(
                SequentialProposal::new(lower.clone(), upper.clone(), 2.0),
                Err(McmcError::Usage(_))
            ));
            assert!(matches!(
                GaussianProposal::from_bounds(&lower, &upper, 2.0),
                Err(McmcError::Usage(_))
            ));
        }
        assert!(SequentialProposal::new(vec![0.0], vec![1.0, 2.0], 2.0).is_err());
    }

    #[test]
    fn wrap_is_periodic() {
        assert_abs_diff_eq!(wrap(1.25, 0.0, 1.0), 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(wrap(-0.25, 0.0, 1.0), 0.75, epsilon = 1e-12);
        assert_eq!(wrap(0.5, 0.0, 1.0), 0.5);
        assert_eq!(wrap(3.0, 1.0, 1.0), 3.0);
    }

    #[test]
    fn gaussian_step_has_requested_width() {
        let mut p = GaussianProposal::from_bounds(&[0.0, -10.0], &[2.0, 10.0], 4.0)
            .unwrap()
            .set_seed(11);
        assert_eq!(p.widths(), &[0.5, 5.0]);
        let n = 20_000;
        let mut sq = [0.0, 0.0];
        for _ in 0..n {
            let c = p.propose(&[0.0, 0.0]);
            sq[0] += c[0] * c[0];
            sq[1] += c[1] * c[1];
        }
        assert_abs_diff_eq!((sq[0] / n as f64).sqrt(), 0.5, epsilon = 0.02);
        assert_abs_diff_eq!((sq[1] / n as f64).sqrt(), 5.0, epsilon = 0.2);
    }

    #[test]
    fn covariance_gaussian_reproduces_covariance() {
        let cov = CovarianceMatrix::new(
            names(&["b", "a"]),
            DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 1.0]),
        )
        .unwrap();
        // state has an extra parameter "c" that the covariance does not cover
        let mut p = CovarianceGaussian::new(names(&["a", "b", "c"]), cov)
            .unwrap()
            .set_seed(5);
        let n = 40_000;
        let (mut saa, mut sbb, mut sab) = (0.0, 0.0, 0.0);
        for _ in 0..n {
            let c = p.propose(&[0.0, 0.0, 7.0]);
            assert_eq!(c[2], 7.0);
            saa += c[0] * c[0];
            sbb += c[1] * c[1];
            sab += c[0] * c[1];
        }
        let n = n as f64;
        assert_abs_diff_eq!(sbb / n, 4.0, epsilon = 0.15);
        assert_abs_diff_eq!(saa / n, 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(sab / n, 1.0, epsilon = 0.07);
    }

    #[test]
    fn mean_cache_follows_refresh_policy() {
        let cov = CovarianceMatrix::diagonal(names(&["a"]), &[1.0]).unwrap();
        let mut stale = CovarianceGaussian::new(names(&["a"]), cov.clone())
            .unwrap()
            .cache_size(10)
            .set_seed(2);
        stale.propose(&[3.0]);
        stale.propose(&[-8.0]);
        assert_eq!(stale.cached_mean("a"), Some(3.0));
        assert!(!stale.is_symmetric());

        let mut following = CovarianceGaussian::new(names(&["a"]), cov)
            .unwrap()
            .cache_size(10)
            .update_means(true);
        following.propose(&[3.0]);
        following.accepted(&[1.5]);
        assert_eq!(following.cached_mean("a"), Some(1.5));
        assert!(following.is_symmetric());

        following.rebuild_mean_cache(names(&["z", "a"])).unwrap();
        assert_eq!(following.cached_mean("a"), None);
        assert!(following.rebuild_mean_cache(names(&["z"])).is_err());
    }

    #[test]
    fn set_scale_rejects_invalid_matrices() {
        let cov = CovarianceMatrix::diagonal(names(&["a", "b"]), &[1.0, 1.0]).unwrap();
        let mut p = CovarianceGaussian::new(names(&["a", "b"]), cov).unwrap();
        let negative = CovarianceMatrix::new(
            names(&["a", "b"]),
            DMatrix::from_row_slice(2, 2, &[1.0, 3.0, 3.0, 1.0]),
        )
        .unwrap();
        assert!(matches!(p.set_scale(negative), Err(McmcError::Estimation(_))));
        let other = CovarianceMatrix::diagonal(names(&["x", "y"]), &[1.0, 1.0]).unwrap();
        assert!(p.set_scale(other).is_err());
        let bigger = CovarianceMatrix::diagonal(names(&["a", "b"]), &[2.0, 3.0]).unwrap();
        p.set_scale(bigger).unwrap();
        assert_eq!(p.covariance().get(1, 1), 3.0);
    }

    #[test]
    fn seeded_strategies_are_reproducible() {
        let make = || {
            ProposalStrategy::Sequential(
                SequentialProposal::new(vec![0.0; 3], vec![1.0; 3], 2.0).unwrap(),
            )
            .set_seed(99)
        };
        let (mut a, mut b) = (make(), make());
        for _ in 0..10 {
            assert_eq!(a.propose(&[0.5; 3]), b.propose(&[0.5; 3]));
        }
        assert_eq!(a.name(), "sequential");
    }
}
