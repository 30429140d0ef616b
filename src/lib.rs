//! # Staged MCMC
//!
//! Adaptive **Metropolis–Hastings** sampling of model parameters. The sampler minimises a
//! negative log objective over the free parameters of a [`params::ParameterSet`],
//! tunes its proposal towards a target acceptance rate and can seed a multivariate
//! Gaussian proposal from the covariance of an earlier chain.
//!
//! ## Getting Started
//!
//! You need to provide:
//! - an objective implementing [`objective::Objective`] (any
//!   `Fn(&ParameterSet) -> Option<f64>` works; `None` rejects the point),
//! - the event weights of the fitted data through [`objective::WeightedData`],
//! - a [`params::ParameterSet`] with bounds and constant/yield flags.
//!
//! ## Example: fitting a 2D Gaussian with a staged run
//!
//! ```rust
//! use staged_mcmc::config::SamplerConfig;
//! use staged_mcmc::controller::{RunPolicy, Sampler};
//! use staged_mcmc::objective::Dataset;
//! use staged_mcmc::params::{Parameter, ParameterSet};
//!
//! let mut params = ParameterSet::new()
//!     .with("mu", Parameter::new(0.0, -5.0, 5.0)).unwrap()
//!     .with("nu", Parameter::new(0.0, -5.0, 5.0)).unwrap();
//! let nll = |p: &ParameterSet| {
//!     let (mu, nu) = (p.value("mu")?, p.value("nu")?);
//!     Some(0.5 * ((mu - 1.0).powi(2) + (nu + 0.5).powi(2)))
//! };
//! let data = Dataset::unweighted(vec![vec![0.0]; 100]);
//!
//! let config = SamplerConfig {
//!     num_iters: 3000,
//!     num_burn_in: 100,
//!     norm: 4.0,
//!     seed: Some(42),
//!     ..Default::default()
//! };
//! let sampler = Sampler::new(config).with_objective(&nll).with_data(&data);
//! let report = sampler.run(&RunPolicy::SequentialThenCovariance, &mut params).unwrap();
//! let summary = sampler.summarize(&report, &mut params).unwrap();
//! println!("{summary}");
//! ```
//!
//! ## Features
//! - **Run policies** composing uniform, sequential, Gaussian and covariance-seeded phases
//! - **Acceptance-targeted norm adaptation** with stall recovery and an explicit retry cap
//! - **Covariance estimators**: robust (minimum covariance determinant), empirical,
//!   non-yield and principal
//! - **Weighted-data correction** with compensated summation
//! - **Effective Sample Size (ESS)** of the final chain
//! - **Optional I/O** (CSV) of chains, derived quantities and covariance matrices
//! - **Progress Indicators** and cooperative cancellation

pub mod chain;
pub mod config;
pub mod controller;
pub mod covariance;
pub mod error;
pub mod io;
pub mod metropolis_hastings;
pub mod objective;
pub mod params;
pub mod proposals;
pub mod stats;
pub mod summary;

pub use error::{McmcError, Result};
