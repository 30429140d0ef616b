//! Fits the location of a 2D Gaussian with a staged sampler run (sequential burn-in, adapted
//! sequential chain, covariance-seeded chain) and prints the posterior summary.

use staged_mcmc::config::SamplerConfig;
use staged_mcmc::controller::{RunPolicy, Sampler};
use staged_mcmc::objective::{Dataset, DerivedQuantity};
use staged_mcmc::params::{Parameter, ParameterSet};
use std::error::Error;

#[cfg(feature = "csv")]
use staged_mcmc::io::csv::{save_chain_csv, save_covariance_csv};

/// Correlated Gaussian centred at (1, -0.5) with unit variances and correlation 0.5.
fn nll(p: &ParameterSet) -> Option<f64> {
    let dx = p.value("x")? - 1.0;
    let dy = p.value("y")? + 0.5;
    const RHO: f64 = 0.5;
    Some((dx * dx - 2.0 * RHO * dx * dy + dy * dy) / (2.0 * (1.0 - RHO * RHO)))
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut params = ParameterSet::new()
        .with("x", Parameter::new(0.0, -10.0, 10.0))?
        .with("y", Parameter::new(0.0, -10.0, 10.0))?;
    let data = Dataset::unweighted(vec![vec![0.0]; 1_000]);

    let mut config = SamplerConfig {
        num_iters: 5_000,
        num_burn_in: 500,
        norm: 4.0,
        seed: Some(42),
        show_progress: true,
        ..Default::default()
    };
    config.then_cov.num_iters = 5_000;
    config.then_cov.num_burn_in = 500;

    let sampler = Sampler::new(config).with_objective(&nll).with_data(&data);
    let report = sampler.run(&RunPolicy::SequentialThenCovariance, &mut params)?;
    println!(
        "{} runs, {} steps, final acceptance {:.3}, norm {:.4}",
        report.attempts, report.steps, report.acceptance, report.norm
    );
    for (name, ess) in &report.ess {
        println!("ESS {name}: {ess:.1}");
    }

    let quantities = [DerivedQuantity::new("distance", |p| {
        p.value("x").unwrap_or(f64::NAN).hypot(p.value("y").unwrap_or(f64::NAN))
    })];
    let derived = sampler.derived(&report, &mut params, &quantities);
    let summary = sampler.summarize(&report, &mut params)?;
    println!("{summary}");
    if let Some((mean, std)) = derived[0].mean_std() {
        println!("distance from origin: {mean:.3} ± {std:.3}");
    }

    #[cfg(feature = "csv")]
    {
        save_chain_csv(&report.chain, report.burn_in, &derived, "chain.csv")?;
        println!("Saved chain in file chain.csv.");
        if let Some(cov) = &report.covariance {
            save_covariance_csv(cov, "covariance.csv")?;
            println!("Saved covariance in file covariance.csv.");
        }
    }

    Ok(())
}
