//! End-to-end checks of the engine and the result extractor on a 3D Gaussian objective with
//! known location.

#[cfg(test)]
mod tests {
    use ndarray::Axis;
    use ndarray_stats::CorrelationExt;
    use staged_mcmc::chain::Chain;
    use staged_mcmc::covariance::CovarianceMatrix;
    use staged_mcmc::metropolis_hastings::{EngineConfig, MetropolisHastings};
    use staged_mcmc::objective::Objective;
    use staged_mcmc::params::{Parameter, ParameterSet};
    use staged_mcmc::proposals::{CovarianceGaussian, Proposal};
    use staged_mcmc::stats::effective_sample_size;
    use staged_mcmc::summary::summarize;

    const TRUTH: [f64; 3] = [1.0, -0.5, 2.0];
    const SIGMA: f64 = 0.3;
    const SEED: u64 = 42;

    fn names() -> Vec<String> {
        vec!["a".into(), "b".into(), "c".into()]
    }

    fn start() -> ParameterSet {
        let mut params = ParameterSet::new();
        for name in names() {
            params
                .insert(name, Parameter::new(0.0, -10.0, 10.0))
                .unwrap();
        }
        params
    }

    fn nll(p: &ParameterSet) -> Option<f64> {
        let mut acc = 0.0;
        for (name, truth) in ["a", "b", "c"].iter().zip(TRUTH) {
            let d = p.value(name)? - truth;
            acc += d * d / (2.0 * SIGMA * SIGMA);
        }
        Some(acc)
    }

    /// Runs `steps` engine steps with a `diag(0.1)` covariance proposal from the origin.
    fn run(steps: usize) -> (Chain, ParameterSet) {
        let cov = CovarianceMatrix::diagonal(names(), &[0.1, 0.1, 0.1]).unwrap();
        let mut proposal = CovarianceGaussian::new(names(), cov)
            .unwrap()
            .set_seed(SEED);
        let config = EngineConfig {
            num_steps: steps,
            keep_start: true,
            ..Default::default()
        };
        let mut params = start();
        let mut mh = MetropolisHastings::new(&nll, config).seed(SEED);
        let attempt = mh.run_chain(&mut params, &mut proposal).unwrap();
        (attempt.chain.expect("chain should converge"), params)
    }

    /// Monte Carlo standard error of each posterior mean.
    fn standard_errors(chain: &Chain, burn_in: usize, params: &ParameterSet) -> Vec<f64> {
        let ess = effective_sample_size(chain.to_iteration_array(burn_in).view());
        names()
            .iter()
            .zip(ess.iter())
            .map(|(n, e)| params.get(n).unwrap().error.unwrap() / e.sqrt())
            .collect()
    }

    #[test]
    fn posterior_means_match_truth() {
        const BURNIN: usize = 500;
        let (chain, mut params) = run(5000);
        assert!(chain.len() > BURNIN + 100, "chain too short: {}", chain.len());
        let summary = summarize(&chain, BURNIN, &mut params, Some(&nll as &dyn Objective)).unwrap();
        let se = standard_errors(&chain, BURNIN, &params);
        for ((name, truth), se) in names().iter().zip(TRUTH).zip(&se) {
            let est = summary.get(name).unwrap();
            assert!(
                (est.mean - truth).abs() < 3.0 * se,
                "{name}: mean {} vs truth {truth} (se {se})",
                est.mean
            );
            assert!(
                (est.std - SIGMA).abs() < 0.1,
                "{name}: posterior std {} vs {SIGMA}",
                est.std
            );
            assert_eq!(params.value(name), Some(est.mean));
        }
        assert!(summary.nll_at_mean.unwrap() < 1.0);
    }

    #[test]
    fn standard_error_shrinks_with_more_steps() {
        let (short, mut p_short) = run(500);
        let (long, mut p_long) = run(5000);
        summarize(&short, 50, &mut p_short, None).unwrap();
        summarize(&long, 500, &mut p_long, None).unwrap();
        let se_short = standard_errors(&short, 50, &p_short);
        let se_long = standard_errors(&long, 500, &p_long);
        for (name, (s, l)) in names().iter().zip(se_short.iter().zip(&se_long)) {
            assert!(l < s, "{name}: standard error {l} at 5000 steps vs {s} at 500");
        }
    }

    #[test]
    fn iteration_array_matches_weighted_moments() {
        let (chain, mut params) = run(3000);
        summarize(&chain, 100, &mut params, None).unwrap();
        let expanded = chain.to_iteration_array(100);
        let mean = expanded.mean_axis(Axis(0)).unwrap();
        let cov = expanded.t().cov(1.0).unwrap();
        for (k, name) in names().iter().enumerate() {
            let p = params.get(name).unwrap();
            assert!((mean[k] - p.value).abs() < 1e-9);
            assert!((cov[[k, k]].sqrt() - p.error.unwrap()).abs() < 1e-9);
        }
    }
}
