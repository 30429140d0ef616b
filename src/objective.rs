/*!
# Objective adapter.

The sampler only sees a model through the [`Objective`] trait: a map from a
[`ParameterSet`] to a negative-log-objective value, or `None` when the model refuses the
point (out of domain, numerical overflow). Event data is seen through [`WeightedData`],
which is enough to compute the weighted-data correction

```text
alpha = (Σw)² / Σw²      applied as   nll' = (Σw / Σw²) · nll
```

that undoes the variance inflation of non-uniform event weights. The sums use Kahan
compensation and are computed once per run.

Derived quantities are pure functions of the parameters (no per-event data) that the
[`crate::summary`] module evaluates once per retained sample.
*/

use std::fmt;

use crate::params::ParameterSet;
use crate::stats::KahanSum;

/// A scalar negative-log-objective of the parameter values.
pub trait Objective {
    /// Returns the negative log objective at `params`, or `None` if the point is rejected.
    fn evaluate(&self, params: &ParameterSet) -> Option<f64>;
}

impl<F> Objective for F
where
    F: Fn(&ParameterSet) -> Option<f64>,
{
    fn evaluate(&self, params: &ParameterSet) -> Option<f64> {
        self(params)
    }
}

/// Read access to per-event weights of a dataset.
pub trait WeightedData {
    /// Number of events.
    fn num_entries(&self) -> usize;

    /// Weight of event `i`.
    fn weight(&self, i: usize) -> f64;

    /// True if any weight differs from one.
    fn is_non_poisson_weighted(&self) -> bool {
        (0..self.num_entries()).any(|i| self.weight(i) != 1.0)
    }

    /// Compensated `Σw`.
    fn sum_weights(&self) -> f64 {
        (0..self.num_entries())
            .map(|i| self.weight(i))
            .collect::<KahanSum>()
            .value()
    }

    /// Compensated `Σw²`.
    fn sum_weights2(&self) -> f64 {
        (0..self.num_entries())
            .map(|i| {
                let w = self.weight(i);
                w * w
            })
            .collect::<KahanSum>()
            .value()
    }
}

/// A simple in-memory dataset of value vectors with weights.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub values: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl Dataset {
    /// Dataset with explicit weights. `values` and `weights` must have equal length.
    pub fn new(values: Vec<Vec<f64>>, weights: Vec<f64>) -> Self {
        debug_assert_eq!(values.len(), weights.len());
        Self { values, weights }
    }

    /// Dataset where every event has unit weight.
    pub fn unweighted(values: Vec<Vec<f64>>) -> Self {
        let weights = vec![1.0; values.len()];
        Self { values, weights }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

impl WeightedData for Dataset {
    fn num_entries(&self) -> usize {
        self.weights.len()
    }

    fn weight(&self, i: usize) -> f64 {
        self.weights[i]
    }
}

/// Multiplicative factor `Σw / Σw²` for the negative log objective.
///
/// Equal to one for unit weights. Returns one for empty data or a vanishing `Σw²`.
pub fn weight_correction<D: WeightedData + ?Sized>(data: &D) -> f64 {
    let sum_w2 = data.sum_weights2();
    if data.num_entries() == 0 || sum_w2 == 0.0 {
        return 1.0;
    }
    data.sum_weights() / sum_w2
}

/// Wraps an [`Objective`] with an optional weighted-data scale factor.
///
/// Non-finite values from the wrapped objective are reported as rejections.
pub struct ObjectiveAdapter<'a> {
    objective: &'a dyn Objective,
    factor: f64,
}

impl<'a> ObjectiveAdapter<'a> {
    /// Adapter without any correction.
    pub fn new(objective: &'a dyn Objective) -> Self {
        Self {
            objective,
            factor: 1.0,
        }
    }

    /// Adapter that scales by [`weight_correction`] when `data` is non-trivially weighted.
    pub fn with_weight_correction<D: WeightedData + ?Sized>(
        objective: &'a dyn Objective,
        data: &D,
    ) -> Self {
        let factor = if data.is_non_poisson_weighted() {
            weight_correction(data)
        } else {
            1.0
        };
        log::debug!("weighted-data correction factor {factor}");
        Self { objective, factor }
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }
}

impl Objective for ObjectiveAdapter<'_> {
    fn evaluate(&self, params: &ParameterSet) -> Option<f64> {
        let raw = self.objective.evaluate(params)?;
        let value = raw * self.factor;
        value.is_finite().then_some(value)
    }
}

/// A named pure function of the parameters, evaluated per retained sample.
pub struct DerivedQuantity {
    pub name: String,
    func: Box<dyn Fn(&ParameterSet) -> f64 + Send + Sync>,
}

impl DerivedQuantity {
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&ParameterSet) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }

    pub fn eval(&self, params: &ParameterSet) -> f64 {
        (self.func)(params)
    }
}

impl fmt::Debug for DerivedQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedQuantity")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
