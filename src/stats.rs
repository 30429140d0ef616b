//! Acceptance tracking, compensated summation and single-chain effective sample size.

use ndarray::prelude::*;
use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use std::fmt;

/// Kahan-compensated running sum.
///
/// Naive accumulation loses low-order bits once the running total dwarfs the addends, which
/// matters when summing event weights over very large datasets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KahanSum {
    sum: f64,
    carry: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, x: f64) {
        let y = x - self.carry;
        let t = self.sum + y;
        self.carry = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn value(&self) -> f64 {
        self.sum
    }
}

impl FromIterator<f64> for KahanSum {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        let mut acc = KahanSum::new();
        for x in iter {
            acc.add(x);
        }
        acc
    }
}

/// Accepted vs. proposed counts for one chain run.
///
/// Created fresh at the start of every engine run and read by the adaptive controller once
/// the run ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptanceStatistic {
    pub proposed: u64,
    pub accepted: u64,
}

impl AcceptanceStatistic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, accepted: bool) {
        self.proposed += 1;
        if accepted {
            self.accepted += 1;
        }
    }

    /// Fraction of proposals accepted; zero when nothing was proposed.
    pub fn rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }
}

impl fmt::Display for AcceptanceStatistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "accepted {}/{} (p(accept)≈{:.3})",
            self.accepted,
            self.proposed,
            self.rate()
        )
    }
}

/// Weighted mean and standard deviation of `values`, using compensated sums.
///
/// Returns `None` when the total weight is not positive. The standard deviation uses the
/// frequency-weight correction `Σw / (Σw - 1)` when `Σw > 1`.
pub fn weighted_mean_std(values: &[f64], weights: &[f64]) -> Option<(f64, f64)> {
    let sum_w: KahanSum = weights.iter().copied().collect();
    let sum_w = sum_w.value();
    if sum_w <= 0.0 {
        return None;
    }
    let sum_wx: KahanSum = values.iter().zip(weights).map(|(x, w)| x * w).collect();
    let mean = sum_wx.value() / sum_w;
    let sum_wd2: KahanSum = values
        .iter()
        .zip(weights)
        .map(|(x, w)| w * (x - mean) * (x - mean))
        .collect();
    let var = if sum_w > 1.0 {
        sum_wd2.value() / (sum_w - 1.0)
    } else {
        sum_wd2.value() / sum_w
    };
    Some((mean, var.max(0.0).sqrt()))
}

/// Effective sample size of each column of a single chain `(n_steps, n_params)`.
///
/// Uses Geyer's initial monotone sequence on the autocorrelation, computed by FFT for long
/// chains and by brute force for short ones.
pub fn effective_sample_size(sample: ArrayView2<f64>) -> Array1<f64> {
    let (n, d) = sample.dim();
    if n < 4 {
        return Array1::from_elem(d, n as f64);
    }
    let acov = autocov(sample);
    let tau: Vec<f64> = (0..d)
        .into_par_iter()
        .map(|col| {
            let var0 = acov[[0, col]];
            if var0 <= 0.0 {
                return 1.0;
            }
            let rho = acov.column(col).mapv(|c| c / var0);
            let mut min = rho[0] + rho[1];
            let mut out = 0.0;
            for pair in rho.windows_with_stride(2, 2) {
                let mut p_t = pair[0] + pair[1];
                if p_t <= 0.0 {
                    break;
                }
                if p_t > min {
                    p_t = min;
                }
                min = p_t;
                out += p_t;
            }
            (-1.0 + 2.0 * out).max(1.0 / n as f64)
        })
        .collect();
    Array1::from_vec(tau).mapv(|t| n as f64 / t)
}

fn autocov(sample: ArrayView2<f64>) -> Array2<f64> {
    if sample.nrows() <= 100 {
        autocov_bf(sample)
    } else {
        autocov_fft(sample)
    }
}

/// Zero-padded FFT autocovariance of every column; rustfft does not normalise, so the
/// `1 / n_padded` factor is applied by hand.
fn autocov_fft(sample: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = sample.dim();
    let mut planner = FftPlanner::new();
    let mut n_padded = 1;
    while n_padded < 2 * n - 1 {
        n_padded <<= 1;
    }
    let fft = planner.plan_fft_forward(n_padded);
    let ffti = planner.plan_fft_inverse(n_padded);
    let out: Vec<f64> = sample
        .axis_iter(Axis(1))
        .into_par_iter()
        .map(|traj| {
            let mean = traj.sum() / n as f64;
            let mut x: Vec<Complex<f64>> = traj
                .iter()
                .map(|xi| Complex::new(xi - mean, 0.0))
                .chain(std::iter::repeat(Complex::new(0.0, 0.0)).take(n_padded - n))
                .collect();
            fft.process(x.as_mut_slice());
            x.iter_mut().for_each(|xi| *xi *= xi.conj());
            ffti.process(x.as_mut_slice());
            x.iter()
                .take(n)
                .map(|xi| xi.re / n_padded as f64 / n as f64)
                .collect::<Vec<f64>>()
        })
        .flatten_iter()
        .collect();
    let mut res = Array2::<f64>::zeros((n, d));
    for col in 0..d {
        for lag in 0..n {
            res[[lag, col]] = out[col * n + lag];
        }
    }
    res
}

fn autocov_bf(data: ArrayView2<f64>) -> Array2<f64> {
    let (n, d) = data.dim();
    let mut out = Array2::<f64>::zeros((n, d));
    out.axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(col_idx, mut out_col)| {
            let col = data.column(col_idx);
            let mean = col.sum() / n as f64;
            let centred = col.mapv(|x| x - mean);
            for lag in 0..n {
                let mut sum_lag = 0.0;
                for t in 0..(n - lag) {
                    sum_lag += centred[t] * centred[t + lag];
                }
                out_col[lag] = sum_lag / n as f64;
            }
        });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    #[test]
    fn kahan_beats_naive_summation() {
        let mut naive = 1.0e16_f64;
        let mut kahan = KahanSum::new();
        kahan.add(1.0e16);
        for _ in 0..1000 {
            naive += 1.0;
            kahan.add(1.0);
        }
        assert_eq!(kahan.value(), 1.0e16 + 1000.0);
        assert_ne!(naive, 1.0e16 + 1000.0);
    }

    #[test]
    fn acceptance_rate_counts() {
        let mut acc = AcceptanceStatistic::new();
        assert_eq!(acc.rate(), 0.0);
        for i in 0..10 {
            acc.record(i % 4 == 0);
        }
        assert_eq!(acc.proposed, 10);
        assert_eq!(acc.accepted, 3);
        assert_abs_diff_eq!(acc.rate(), 0.3);
    }

    #[test]
    fn weighted_stats_match_expanded_sample() {
        let values = [1.0, 2.0, 4.0];
        let weights = [2.0, 1.0, 1.0];
        let (mean, std) = weighted_mean_std(&values, &weights).unwrap();
        // Expanded sample: 1, 1, 2, 4
        assert_abs_diff_eq!(mean, 2.0);
        let var: f64 = (1.0 + 1.0 + 0.0 + 4.0) / 3.0;
        assert_abs_diff_eq!(std, var.sqrt(), epsilon = 1e-12);
        assert!(weighted_mean_std(&[], &[]).is_none());
    }

    #[test]
    fn fft_and_brute_force_autocov_agree() {
        let mut rng = SmallRng::seed_from_u64(7);
        let data = Array2::from_shape_fn((150, 2), |_| rng.sample::<f64, _>(StandardNormal));
        let a = autocov_fft(data.view());
        let b = autocov_bf(data.view());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-9);
        }
    }

    #[test]
    fn ess_of_iid_noise_is_close_to_length() {
        let mut rng = SmallRng::seed_from_u64(42);
        let data = Array2::from_shape_fn((4000, 1), |_| rng.sample::<f64, _>(StandardNormal));
        let ess = effective_sample_size(data.view());
        assert!(ess[0] > 2500.0 && ess[0] < 6000.0, "ess = {}", ess[0]);
    }

    #[test]
    fn ess_of_sticky_chain_is_small() {
        let mut rng = SmallRng::seed_from_u64(3);
        let mut x = 0.0;
        let data = Array2::from_shape_fn((4000, 1), |_| {
            x = 0.99 * x + 0.1 * rng.sample::<f64, _>(StandardNormal);
            x
        });
        let ess = effective_sample_size(data.view());
        assert!(ess[0] < 400.0, "ess = {}", ess[0]);
    }
}
