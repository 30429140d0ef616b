//! Chain storage.
//!
//! A [`Chain`] holds the distinct points visited by one engine run. A point that the chain
//! stays on for several iterations is stored once with a multiplicity `weight`, so the
//! stored samples plus weights represent every iteration of the run.

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// One accepted point of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Free-parameter values, ordered as [`Chain::names`].
    pub values: Vec<f64>,
    /// Negative log objective at `values`.
    pub nll: f64,
    /// Iteration at which the point was accepted (0 for the starting point).
    pub step: usize,
    /// Number of iterations the chain stayed on this point.
    pub weight: f64,
}

/// A sample together with its running position in the chain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChainEntry<'a> {
    pub entry: usize,
    pub sample: &'a Sample,
}

/// Ordered, append-only sequence of accepted samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    names: Vec<String>,
    samples: Vec<Sample>,
}

impl Chain {
    pub fn new(names: Vec<String>) -> Self {
        Self {
            names,
            samples: Vec::new(),
        }
    }

    /// Builds a chain from already collected samples.
    pub fn from_samples(names: Vec<String>, samples: Vec<Sample>) -> Self {
        Self { names, samples }
    }

    pub(crate) fn push(&mut self, values: Vec<f64>, nll: f64, step: usize) {
        self.samples.push(Sample {
            values,
            nll,
            step,
            weight: 1.0,
        });
    }

    /// Bumps the multiplicity of the last sample after a rejected proposal.
    pub(crate) fn repeat_last(&mut self) {
        if let Some(last) = self.samples.last_mut() {
            last.weight += 1.0;
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn dim(&self) -> usize {
        self.names.len()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    /// Samples `[burn_in, len)`. Empty if the burn-in covers the whole chain.
    pub fn post_burn_in(&self, burn_in: usize) -> &[Sample] {
        self.samples.get(burn_in..).unwrap_or(&[])
    }

    /// Every sample with its running entry index.
    pub fn entries(&self) -> impl Iterator<Item = ChainEntry<'_>> {
        self.samples
            .iter()
            .enumerate()
            .map(|(entry, sample)| ChainEntry { entry, sample })
    }

    /// Position of `name` among the chain's parameters.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Values of parameter `idx` over the post-burn-in samples.
    pub fn column(&self, idx: usize, burn_in: usize) -> Vec<f64> {
        self.post_burn_in(burn_in)
            .iter()
            .map(|s| s.values[idx])
            .collect()
    }

    /// Multiplicities of the post-burn-in samples.
    pub fn weights(&self, burn_in: usize) -> Vec<f64> {
        self.post_burn_in(burn_in).iter().map(|s| s.weight).collect()
    }

    /// Total number of iterations represented by the chain.
    pub fn total_weight(&self) -> f64 {
        self.samples.iter().map(|s| s.weight).sum()
    }

    /// Post-burn-in samples as an `(n_samples, dim)` array, one row per stored sample.
    pub fn to_array(&self, burn_in: usize) -> Array2<f64> {
        let rows = self.post_burn_in(burn_in);
        let mut out = Array2::<f64>::zeros((rows.len(), self.dim()));
        for (mut row, s) in out.rows_mut().into_iter().zip(rows) {
            for (dst, v) in row.iter_mut().zip(&s.values) {
                *dst = *v;
            }
        }
        out
    }

    /// Post-burn-in samples with each row repeated by its multiplicity, i.e. one row per
    /// iteration. Used for autocorrelation-based diagnostics.
    pub fn to_iteration_array(&self, burn_in: usize) -> Array2<f64> {
        let rows = self.post_burn_in(burn_in);
        let n: usize = rows.iter().map(|s| s.weight.max(1.0) as usize).sum();
        let mut out = Array2::<f64>::zeros((n, self.dim()));
        let mut r = 0;
        for s in rows {
            for _ in 0..s.weight.max(1.0) as usize {
                for (c, v) in s.values.iter().enumerate() {
                    out[[r, c]] = *v;
                }
                r += 1;
            }
        }
        out
    }

    /// The sample with the lowest negative log objective.
    pub fn best(&self) -> Option<&Sample> {
        self.samples
            .iter()
            .filter(|s| !s.nll.is_nan())
            .min_by(|a, b| a.nll.total_cmp(&b.nll))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_chain() -> Chain {
        let mut chain = Chain::new(vec!["a".into(), "b".into()]);
        chain.push(vec![0.0, 1.0], 5.0, 0);
        chain.repeat_last();
        chain.push(vec![1.0, 2.0], 3.0, 2);
        chain.push(vec![2.0, 3.0], 4.0, 3);
        chain.repeat_last();
        chain.repeat_last();
        chain
    }

    #[test]
    fn multiplicities_cover_all_iterations() {
        let chain = toy_chain();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain.weights(0), vec![2.0, 1.0, 3.0]);
        assert_eq!(chain.total_weight(), 6.0);
        assert_eq!(chain.to_iteration_array(0).nrows(), 6);
    }

    #[test]
    fn burn_in_slices_prefix() {
        let chain = toy_chain();
        assert_eq!(chain.post_burn_in(1).len(), 2);
        assert_eq!(chain.column(1, 1), vec![2.0, 3.0]);
        assert!(chain.post_burn_in(3).is_empty());
        assert!(chain.post_burn_in(10).is_empty());
        let arr = chain.to_array(1);
        assert_eq!(arr.shape(), &[2, 2]);
        assert_eq!(arr[[1, 0]], 2.0);
    }

    #[test]
    fn entries_are_numbered_and_best_found() {
        let chain = toy_chain();
        let entries: Vec<usize> = chain.entries().map(|e| e.entry).collect();
        assert_eq!(entries, vec![0, 1, 2]);
        assert_eq!(chain.best().unwrap().step, 2);
        assert_eq!(chain.index_of("b"), Some(1));
        assert_eq!(chain.index_of("c"), None);
    }
}
