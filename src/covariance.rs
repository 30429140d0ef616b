/*!
# Covariance estimation from chain history.

A [`CovarianceEstimator`] turns the post-burn-in part of a [`Chain`] into a
[`CovarianceMatrix`] that can seed a [`crate::proposals::CovarianceGaussian`] proposal.
Sample multiplicities are honoured as frequency weights.

| Variant                         | Method                                                     |
|---------------------------------|------------------------------------------------------------|
| [`CovarianceEstimator::Robust`]    | minimum covariance determinant (FAST-MCD C-steps) with a reweighting pass, so unconverged excursions do not inflate the matrix |
| [`CovarianceEstimator::Empirical`] | plain weighted sample covariance                          |
| [`CovarianceEstimator::NonYield`]  | robust estimate over shape parameters only; yields get an independent diagonal entry |
| [`CovarianceEstimator::Principal`] | streaming lower-triangle accumulation, symmetrised as `M + Mᵗ` with the transpose diagonal zeroed |

Every estimator checks its input (at least two samples, no zero-variance column) and its
output (finite, symmetric, positive semi-definite) and reports [`McmcError::Estimation`]
instead of handing back a matrix that would break a Gaussian proposal.

The non-yield variant deliberately forces every yield/shape cross term to zero. This is an
approximation for models where yields correlate with shape parameters; it is kept as is.
*/

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::rngs::SmallRng;
use rand::seq::index::sample as sample_indices;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::chain::{Chain, Sample};
use crate::error::{McmcError, Result};
use crate::params::ParameterSet;
use crate::stats::KahanSum;

const MCD_STARTS: usize = 20;
const MCD_MAX_CSTEPS: usize = 100;
/// C-steps applied to every start before the candidates are ranked.
const MCD_INITIAL_CSTEPS: usize = 2;
/// Candidates iterated to convergence after ranking.
const MCD_KEEP: usize = 10;
const PSD_TOLERANCE: f64 = 1e-10;

/// A symmetric covariance matrix labelled by parameter name.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceMatrix {
    names: Vec<String>,
    matrix: DMatrix<f64>,
}

impl CovarianceMatrix {
    /// Wraps `matrix`, copying its lower triangle onto the upper one.
    pub fn new(names: Vec<String>, matrix: DMatrix<f64>) -> Result<Self> {
        if matrix.nrows() != names.len() || matrix.ncols() != names.len() {
            return Err(McmcError::Estimation(format!(
                "matrix is {}x{} but {} names were given",
                matrix.nrows(),
                matrix.ncols(),
                names.len()
            )));
        }
        Ok(Self {
            names,
            matrix: mirror_lower(matrix),
        })
    }

    /// Diagonal matrix with the given variances.
    pub fn diagonal(names: Vec<String>, variances: &[f64]) -> Result<Self> {
        let matrix = DMatrix::from_diagonal(&DVector::from_column_slice(variances));
        Self::new(names, matrix)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.matrix[(i, j)]
    }

    /// Variance of parameter `name`.
    pub fn variance(&self, name: &str) -> Option<f64> {
        let i = self.names.iter().position(|n| n == name)?;
        Some(self.matrix[(i, i)])
    }

    /// Copy with every element multiplied by `factor`.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            names: self.names.clone(),
            matrix: &self.matrix * factor,
        }
    }

    /// Exact element-wise symmetry.
    pub fn is_symmetric(&self) -> bool {
        let n = self.dim();
        (0..n).all(|i| (0..i).all(|j| self.matrix[(i, j)].to_bits() == self.matrix[(j, i)].to_bits()))
    }

    /// Eigenvalues in ascending order.
    pub fn eigenvalues(&self) -> Vec<f64> {
        let mut ev: Vec<f64> = SymmetricEigen::new(self.matrix.clone())
            .eigenvalues
            .iter()
            .copied()
            .collect();
        ev.sort_by(|a, b| a.total_cmp(b));
        ev
    }

    /// True if every eigenvalue is above `-tol · max|λ|`.
    pub fn is_positive_semi_definite(&self, tol: f64) -> bool {
        let ev = self.eigenvalues();
        let scale = ev.iter().fold(0.0_f64, |m, v| m.max(v.abs())).max(f64::MIN_POSITIVE);
        ev.iter().all(|v| v.is_finite() && *v >= -tol * scale)
    }

    /// A square root `A` with `A Aᵗ = Σ`.
    ///
    /// The Cholesky factor when the matrix is positive definite; otherwise `V √Λ` with
    /// negative eigenvalues clipped to zero.
    pub fn sqrt_factor(&self) -> DMatrix<f64> {
        if let Some(chol) = self.matrix.clone().cholesky() {
            return chol.l();
        }
        let eig = SymmetricEigen::new(self.matrix.clone());
        let mut factor = eig.eigenvectors.clone();
        for (j, lambda) in eig.eigenvalues.iter().enumerate() {
            let s = lambda.max(0.0).sqrt();
            factor.column_mut(j).scale_mut(s);
        }
        factor
    }

    /// Checks finiteness, symmetry and positive semi-definiteness.
    pub fn validate(&self) -> Result<()> {
        if self.matrix.iter().any(|v| !v.is_finite()) {
            return Err(McmcError::Estimation("matrix has non-finite entries".into()));
        }
        if !self.is_symmetric() {
            return Err(McmcError::Estimation("matrix is not symmetric".into()));
        }
        if !self.is_positive_semi_definite(PSD_TOLERANCE) {
            return Err(McmcError::Estimation(format!(
                "matrix is not positive semi-definite (eigenvalues {:?})",
                self.eigenvalues()
            )));
        }
        Ok(())
    }
}

/// Available covariance estimators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovarianceEstimator {
    #[default]
    Robust,
    Empirical,
    NonYield,
    Principal,
}

impl CovarianceEstimator {
    /// Estimates the covariance of the free parameters of `params` over samples
    /// `[burn_in, len)` of `chain`.
    pub fn estimate(
        &self,
        chain: &Chain,
        burn_in: usize,
        params: &ParameterSet,
    ) -> Result<CovarianceMatrix> {
        let rows = chain.post_burn_in(burn_in);
        if rows.len() < 2 {
            return Err(McmcError::Estimation(format!(
                "need at least 2 post-burn-in samples, chain has {} after burn-in {burn_in}",
                rows.len()
            )));
        }
        let cov = match self {
            Self::Robust => {
                let cols = select_columns(chain, params, |_| true)?;
                let data = Columns::gather(rows, &cols)?;
                CovarianceMatrix::new(data.names.clone(), robust_covariance(&data)?)?
            }
            Self::Empirical => {
                let cols = select_columns(chain, params, |_| true)?;
                let data = Columns::gather(rows, &cols)?;
                let all: Vec<bool> = vec![true; data.n_rows()];
                let (_, cov) = weighted_moments(&data, &all);
                CovarianceMatrix::new(data.names.clone(), cov)?
            }
            Self::NonYield => non_yield_covariance(chain, rows, params)?,
            Self::Principal => {
                let cols = select_columns(chain, params, |_| true)?;
                let data = Columns::gather(rows, &cols)?;
                CovarianceMatrix::new(data.names.clone(), principal_covariance(&data))?
            }
        };
        cov.validate()?;
        log::info!(
            "{self:?} covariance over {} samples (burn-in {burn_in}): {}",
            rows.len(),
            cov.matrix
        );
        Ok(cov)
    }
}

/// Column-major view of the chain restricted to selected parameters.
struct Columns {
    names: Vec<String>,
    rows: Vec<Vec<f64>>,
    weights: Vec<f64>,
}

impl Columns {
    fn gather(samples: &[Sample], cols: &[(usize, String)]) -> Result<Self> {
        let rows: Vec<Vec<f64>> = samples
            .iter()
            .map(|s| cols.iter().map(|(idx, _)| s.values[*idx]).collect())
            .collect();
        let weights: Vec<f64> = samples.iter().map(|s| s.weight).collect();
        let data = Self {
            names: cols.iter().map(|(_, n)| n.clone()).collect(),
            rows,
            weights,
        };
        data.check_degenerate()?;
        Ok(data)
    }

    fn n_rows(&self) -> usize {
        self.rows.len()
    }

    fn dim(&self) -> usize {
        self.names.len()
    }

    fn row(&self, i: usize) -> DVector<f64> {
        DVector::from_column_slice(&self.rows[i])
    }

    fn check_degenerate(&self) -> Result<()> {
        for (c, name) in self.names.iter().enumerate() {
            let first = self.rows[0][c];
            if self.rows.iter().all(|r| r[c] == first) {
                return Err(McmcError::Estimation(format!(
                    "parameter '{name}' is constant over the chain"
                )));
            }
        }
        Ok(())
    }
}

/// Chain columns of the free parameters of `params` that satisfy `keep`.
///
/// Chain parameters unknown to `params` are treated as free shape parameters.
fn select_columns(
    chain: &Chain,
    params: &ParameterSet,
    keep: impl Fn(bool) -> bool,
) -> Result<Vec<(usize, String)>> {
    let cols: Vec<(usize, String)> = chain
        .names()
        .iter()
        .enumerate()
        .filter(|(_, name)| match params.get(name) {
            Some(p) => !p.constant && keep(p.is_yield),
            None => keep(false),
        })
        .map(|(i, n)| (i, n.clone()))
        .collect();
    if cols.is_empty() {
        return Err(McmcError::Estimation("no free parameters in chain".into()));
    }
    Ok(cols)
}

/// Copies the strict lower triangle onto the upper triangle.
fn mirror_lower(mut m: DMatrix<f64>) -> DMatrix<f64> {
    let n = m.nrows();
    for i in 0..n {
        for j in 0..i {
            m[(j, i)] = m[(i, j)];
        }
    }
    m
}

/// Weighted mean and unbiased (frequency-weight) covariance of the rows where `mask` is set.
fn weighted_moments(data: &Columns, mask: &[bool]) -> (DVector<f64>, DMatrix<f64>) {
    let p = data.dim();
    let mut sum_w = KahanSum::new();
    let mut mean = DVector::<f64>::zeros(p);
    for i in (0..data.n_rows()).filter(|i| mask[*i]) {
        sum_w.add(data.weights[i]);
    }
    let total = sum_w.value();
    for c in 0..p {
        let s: KahanSum = (0..data.n_rows())
            .filter(|i| mask[*i])
            .map(|i| data.weights[i] * data.rows[i][c])
            .collect();
        mean[c] = s.value() / total;
    }
    let mut cov = DMatrix::<f64>::zeros(p, p);
    let denom = if total > 1.0 { total - 1.0 } else { total };
    for a in 0..p {
        for b in 0..=a {
            let s: KahanSum = (0..data.n_rows())
                .filter(|i| mask[*i])
                .map(|i| {
                    let r = &data.rows[i];
                    data.weights[i] * (r[a] - mean[a]) * (r[b] - mean[b])
                })
                .collect();
            cov[(a, b)] = s.value() / denom;
        }
    }
    (mean, mirror_lower(cov))
}

/// Squared Mahalanobis distance of every row, or `None` for a singular covariance.
fn mahalanobis(data: &Columns, mean: &DVector<f64>, cov: &DMatrix<f64>) -> Option<Vec<f64>> {
    let chol = cov.clone().cholesky()?;
    Some(
        (0..data.n_rows())
            .map(|i| {
                let diff = data.row(i) - mean;
                let sol = chol.solve(&diff);
                diff.dot(&sol)
            })
            .collect(),
    )
}

fn log_det(cov: &DMatrix<f64>) -> Option<f64> {
    let chol = cov.clone().cholesky()?;
    let l = chol.l();
    Some(2.0 * (0..l.nrows()).map(|i| l[(i, i)].ln()).sum::<f64>())
}

/// Mask of the rows with the smallest distances whose weights reach `h`.
fn smallest_weight_mask(dist: &[f64], weights: &[f64], h: f64) -> Vec<bool> {
    let mut order: Vec<usize> = (0..dist.len()).collect();
    order.sort_by(|a, b| dist[*a].total_cmp(&dist[*b]));
    let mut mask = vec![false; dist.len()];
    let mut acc = 0.0;
    for i in order {
        if acc >= h {
            break;
        }
        mask[i] = true;
        acc += weights[i];
    }
    mask
}

/// Runs at most `max_steps` C-steps from `mask`, stopping early once the covariance
/// determinant stops decreasing.
fn c_steps(
    data: &Columns,
    mut mask: Vec<bool>,
    h: f64,
    max_steps: usize,
) -> Option<(f64, Vec<bool>)> {
    let (mut mean, mut cov) = weighted_moments(data, &mask);
    let mut best = log_det(&cov)?;
    for _ in 0..max_steps {
        let dist = mahalanobis(data, &mean, &cov)?;
        let next = smallest_weight_mask(&dist, &data.weights, h);
        if next == mask {
            break;
        }
        let (m, c) = weighted_moments(data, &next);
        let Some(det) = log_det(&c) else { break };
        if det >= best {
            break;
        }
        best = det;
        mask = next;
        mean = m;
        cov = c;
    }
    Some((best, mask))
}

fn chi2_quantile(dof: usize, prob: f64) -> f64 {
    ChiSquared::new(dof as f64)
        .map(|d| d.inverse_cdf(prob))
        .unwrap_or(dof as f64)
}

/// Weighted FAST-MCD estimate with consistency correction and a reweighting pass.
///
/// Falls back to the empirical covariance when the chain has too few distinct points for a
/// half-sample subset to be non-singular.
fn robust_covariance(data: &Columns) -> Result<DMatrix<f64>> {
    let n = data.n_rows();
    let p = data.dim();
    let all = vec![true; n];
    if n < 2 * (p + 1) {
        log::debug!("robust covariance: {n} distinct samples for {p} parameters, using empirical");
        return Ok(weighted_moments(data, &all).1);
    }
    let total: f64 = data.weights.iter().sum();
    let h = ((total + p as f64 + 1.0) / 2.0).floor();

    let mut rng = SmallRng::seed_from_u64(0x5eed_c0de);
    let mut best: Option<(f64, Vec<bool>)> = None;
    let mut starts: Vec<Vec<bool>> = Vec::with_capacity(MCD_STARTS + 1);
    if let Some(dist) = {
        let (m, c) = weighted_moments(data, &all);
        mahalanobis(data, &m, &c)
    } {
        starts.push(smallest_weight_mask(&dist, &data.weights, h));
    }
    for _ in 0..MCD_STARTS {
        let mut mask = vec![false; n];
        for i in sample_indices(&mut rng, n, p + 1).iter() {
            mask[i] = true;
        }
        let (m, c) = weighted_moments(data, &mask);
        if let Some(dist) = mahalanobis(data, &m, &c) {
            starts.push(smallest_weight_mask(&dist, &data.weights, h));
        }
    }
    let mut candidates: Vec<(f64, Vec<bool>)> = starts
        .into_iter()
        .filter_map(|start| c_steps(data, start, h, MCD_INITIAL_CSTEPS))
        .collect();
    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
    candidates.truncate(MCD_KEEP);
    for (_, mask) in candidates {
        if let Some((det, mask)) = c_steps(data, mask, h, MCD_MAX_CSTEPS) {
            if best.as_ref().map_or(true, |(b, _)| det < *b) {
                best = Some((det, mask));
            }
        }
    }
    let Some((_, mask)) = best else {
        log::warn!("robust covariance: every subset was singular, using empirical");
        return Ok(weighted_moments(data, &all).1);
    };

    // Consistency correction for the raw MCD estimate.
    let (mean, raw) = weighted_moments(data, &mask);
    let Some(dist) = mahalanobis(data, &mean, &raw) else {
        return Ok(raw);
    };
    let median = weighted_median(&dist, &data.weights);
    let factor = median / chi2_quantile(p, 0.5);
    let raw = if factor.is_finite() && factor > 0.0 { raw * factor } else { raw };

    // Reweighting: keep points inside the 97.5% tolerance ellipsoid.
    let cut = chi2_quantile(p, 0.975);
    let Some(dist) = mahalanobis(data, &mean, &raw) else {
        return Ok(raw);
    };
    let keep: Vec<bool> = dist.iter().map(|d| *d <= cut).collect();
    let kept: f64 = data
        .weights
        .iter()
        .zip(&keep)
        .filter(|(_, k)| **k)
        .map(|(w, _)| *w)
        .sum();
    if kept < (p + 1) as f64 {
        return Ok(raw);
    }
    Ok(weighted_moments(data, &keep).1)
}

fn weighted_median(values: &[f64], weights: &[f64]) -> f64 {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let half = weights.iter().sum::<f64>() / 2.0;
    let mut acc = 0.0;
    for i in order {
        acc += weights[i];
        if acc >= half {
            return values[i];
        }
    }
    f64::NAN
}

/// Streaming weighted covariance accumulated into the lower triangle only, then
/// symmetrised as `M + Mᵗ` with the diagonal of the transpose zeroed.
fn principal_covariance(data: &Columns) -> DMatrix<f64> {
    let p = data.dim();
    let mut mean = vec![0.0; p];
    let mut m2 = DMatrix::<f64>::zeros(p, p);
    let mut total = 0.0;
    for (row, w) in data.rows.iter().zip(&data.weights) {
        total += w;
        let delta: Vec<f64> = row.iter().zip(&mean).map(|(x, m)| x - m).collect();
        for (m, d) in mean.iter_mut().zip(&delta) {
            *m += w / total * d;
        }
        for i in 0..p {
            for j in 0..=i {
                m2[(i, j)] += w * delta[i] * (row[j] - mean[j]);
            }
        }
    }
    let lower = m2 / (total - 1.0);
    let mut upper = lower.transpose();
    upper.fill_diagonal(0.0);
    lower + upper
}

/// Robust covariance over shape parameters; yields enter as uncorrelated diagonal
/// entries holding their own (population) variance over the chain.
fn non_yield_covariance(
    chain: &Chain,
    rows: &[Sample],
    params: &ParameterSet,
) -> Result<CovarianceMatrix> {
    let shape_cols = select_columns(chain, params, |is_yield| !is_yield).ok();
    let yield_cols = select_columns(chain, params, |is_yield| is_yield).ok();
    let n_shape = shape_cols.as_ref().map_or(0, |c| c.len());
    let n_yield = yield_cols.as_ref().map_or(0, |c| c.len());
    if n_shape + n_yield == 0 {
        return Err(McmcError::Estimation("no free parameters in chain".into()));
    }

    let mut names = Vec::with_capacity(n_shape + n_yield);
    let mut matrix = DMatrix::<f64>::zeros(n_shape + n_yield, n_shape + n_yield);
    if let Some(cols) = shape_cols.as_ref() {
        let data = Columns::gather(rows, cols)?;
        let shape = robust_covariance(&data)?;
        matrix.view_mut((0, 0), (n_shape, n_shape)).copy_from(&shape);
        names.extend(data.names);
    }
    if let Some(cols) = yield_cols.as_ref() {
        let data = Columns::gather(rows, cols)?;
        for (k, name) in data.names.iter().enumerate() {
            let values: Vec<f64> = data.rows.iter().map(|r| r[k]).collect();
            let var = population_variance(&values, &data.weights);
            log::debug!("uncorrelated yield '{name}' variance {var}");
            matrix[(n_shape + k, n_shape + k)] = var;
        }
        names.extend(data.names);
    }
    CovarianceMatrix::new(names, matrix)
}

fn population_variance(values: &[f64], weights: &[f64]) -> f64 {
    let total: KahanSum = weights.iter().copied().collect();
    let total = total.value();
    let sum: KahanSum = values.iter().zip(weights).map(|(v, w)| v * w).collect();
    let mean = sum.value() / total;
    let sq: KahanSum = values
        .iter()
        .zip(weights)
        .map(|(v, w)| w * (v - mean) * (v - mean))
        .collect();
    sq.value() / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Parameter;
    use approx::assert_abs_diff_eq;
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn params() -> ParameterSet {
        ParameterSet::new()
            .with("x", Parameter::new(0.0, -10.0, 10.0))
            .unwrap()
            .with("y", Parameter::new(0.0, -10.0, 10.0))
            .unwrap()
            .with("n_sig", Parameter::new(100.0, 0.0, 1000.0).as_yield())
            .unwrap()
            .with("c", Parameter::new(3.0, 0.0, 10.0).fixed())
            .unwrap()
    }

    /// Correlated (x, y) with var 1 and 4, covariance 1.2, plus an independent yield.
    fn correlated_chain(n: usize, seed: u64) -> Chain {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut chain = Chain::new(vec!["x".into(), "y".into(), "n_sig".into()]);
        for step in 0..n {
            let z1: f64 = rng.sample(StandardNormal);
            let z2: f64 = rng.sample(StandardNormal);
            let z3: f64 = rng.sample(StandardNormal);
            let x = z1;
            let y = 1.2 * z1 + 1.6 * z2;
            chain.push(vec![x, y, 100.0 + 5.0 * z3], 0.0, step);
        }
        chain
    }

    fn assert_valid(cov: &CovarianceMatrix) {
        assert!(cov.is_symmetric());
        assert!(cov.is_positive_semi_definite(1e-12));
    }

    #[test]
    fn empirical_recovers_known_covariance() {
        let chain = correlated_chain(20_000, 1);
        let cov = CovarianceEstimator::Empirical
            .estimate(&chain, 0, &params())
            .unwrap();
        assert_eq!(cov.names(), &["x", "y", "n_sig"]);
        assert_valid(&cov);
        assert_abs_diff_eq!(cov.get(0, 0), 1.0, epsilon = 0.05);
        assert_abs_diff_eq!(cov.get(1, 1), 4.0, epsilon = 0.15);
        assert_abs_diff_eq!(cov.get(0, 1), 1.2, epsilon = 0.08);
        assert_abs_diff_eq!(cov.get(2, 2), 25.0, epsilon = 1.0);
    }

    #[test]
    fn robust_ignores_outlier_excursion() {
        let mut chain = correlated_chain(2_000, 2);
        for step in 0..60 {
            chain.push(vec![40.0, -40.0, 100.0], 0.0, 2_000 + step);
        }
        let robust = CovarianceEstimator::Robust
            .estimate(&chain, 0, &params())
            .unwrap();
        let empirical = CovarianceEstimator::Empirical
            .estimate(&chain, 0, &params())
            .unwrap();
        assert_valid(&robust);
        assert!(empirical.get(0, 0) > 10.0);
        assert!(robust.get(0, 0) < 2.0, "robust var(x) = {}", robust.get(0, 0));
        assert!(robust.get(1, 1) < 6.0, "robust var(y) = {}", robust.get(1, 1));
    }

    #[test]
    fn c_steps_respect_their_budget() {
        let mut chain = correlated_chain(500, 6);
        for step in 0..40 {
            chain.push(vec![25.0, 25.0, 100.0], 0.0, 500 + step);
        }
        let cols = select_columns(&chain, &params(), |_| true).unwrap();
        let data = Columns::gather(chain.post_burn_in(0), &cols).unwrap();
        let h = ((data.weights.iter().sum::<f64>() + 4.0) / 2.0).floor();
        let mut start = vec![false; data.n_rows()];
        // a start that contains the whole excursion
        for i in (0..200).chain(data.n_rows() - 40..data.n_rows()) {
            start[i] = true;
        }
        let (untouched, mask) = c_steps(&data, start.clone(), h, 0).unwrap();
        assert_eq!(mask, start);
        let (short, _) = c_steps(&data, start.clone(), h, MCD_INITIAL_CSTEPS).unwrap();
        let (full, mask) = c_steps(&data, start, h, MCD_MAX_CSTEPS).unwrap();
        assert!(short < untouched, "two C-steps should lower the determinant");
        assert!(full <= short);
        let excursion_kept = (data.n_rows() - 40..data.n_rows()).filter(|i| mask[*i]).count();
        assert_eq!(excursion_kept, 0, "converged subset should drop the excursion");
    }

    #[test]
    fn non_yield_zeroes_cross_terms() {
        let chain = correlated_chain(3_000, 3);
        let cov = CovarianceEstimator::NonYield
            .estimate(&chain, 0, &params())
            .unwrap();
        assert_valid(&cov);
        assert_eq!(cov.names(), &["x", "y", "n_sig"]);
        assert_eq!(cov.get(0, 2), 0.0);
        assert_eq!(cov.get(2, 1), 0.0);
        assert_abs_diff_eq!(cov.get(2, 2), 25.0, epsilon = 2.0);
    }

    #[test]
    fn principal_is_exactly_symmetric() {
        let chain = correlated_chain(5_000, 4);
        let cov = CovarianceEstimator::Principal
            .estimate(&chain, 100, &params())
            .unwrap();
        assert_valid(&cov);
        assert_abs_diff_eq!(cov.get(1, 0), 1.2, epsilon = 0.15);
        let empirical = CovarianceEstimator::Empirical
            .estimate(&chain, 100, &params())
            .unwrap();
        for i in 0..3 {
            for j in 0..3 {
                assert_abs_diff_eq!(cov.get(i, j), empirical.get(i, j), epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn weights_act_as_repeated_samples() {
        let mut weighted = Chain::new(vec!["x".into(), "y".into()]);
        let mut expanded = Chain::new(vec!["x".into(), "y".into()]);
        let points = [[0.0, 1.0], [1.0, 0.5], [2.0, 3.0], [-1.0, 0.0]];
        for (k, pt) in points.iter().enumerate() {
            weighted.push(pt.to_vec(), 0.0, k);
            for _ in 0..=k {
                weighted.repeat_last();
                expanded.push(pt.to_vec(), 0.0, k);
            }
        }
        // weighted multiplicities are k + 2, so add one more copy to the expanded chain
        for (k, pt) in points.iter().enumerate() {
            expanded.push(pt.to_vec(), 0.0, 10 + k);
        }
        let a = CovarianceEstimator::Empirical
            .estimate(&weighted, 0, &params())
            .unwrap();
        let b = CovarianceEstimator::Empirical
            .estimate(&expanded, 0, &params())
            .unwrap();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(a.get(i, j), b.get(i, j), epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn degenerate_input_is_an_error() {
        let mut chain = Chain::new(vec!["x".into(), "y".into()]);
        chain.push(vec![1.0, 2.0], 0.0, 0);
        for estimator in [
            CovarianceEstimator::Robust,
            CovarianceEstimator::Empirical,
            CovarianceEstimator::NonYield,
            CovarianceEstimator::Principal,
        ] {
            assert!(matches!(
                estimator.estimate(&chain, 0, &params()),
                Err(McmcError::Estimation(_))
            ));
        }
        chain.push(vec![1.0, 3.0], 0.0, 1);
        chain.push(vec![1.0, 4.0], 0.0, 2);
        assert!(matches!(
            CovarianceEstimator::Empirical.estimate(&chain, 0, &params()),
            Err(McmcError::Estimation(_))
        ));
        // burn-in swallowing the chain
        assert!(CovarianceEstimator::Empirical
            .estimate(&chain, 2, &params())
            .is_err());
    }

    #[test]
    fn sqrt_factor_reproduces_matrix() {
        let cov = CovarianceMatrix::new(
            vec!["a".into(), "b".into()],
            DMatrix::from_row_slice(2, 2, &[2.0, 1.0, 1.0, 0.5]),
        )
        .unwrap();
        // singular: falls back to the eigen factor
        let a = cov.sqrt_factor();
        let back = &a * a.transpose();
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(back[(i, j)], cov.get(i, j), epsilon = 1e-10);
            }
        }
    }
}
