/*!
# Parameter sets.

A [`ParameterSet`] is the ordered, name-keyed collection of model parameters the sampler
moves around. Each [`Parameter`] carries its current value, soft bounds, a constant flag
and a yield flag (yields scale a component's population and get special treatment in
[`crate::covariance::CovarianceEstimator::NonYield`]).

Only free (non-constant) parameters take part in proposals and covariance estimation.
Bounds are soft: the sampler uses them to size and wrap proposals but never rejects a point
for leaving them; that is the objective's call.

Snapshots ([`ParameterSnapshot`]) are first-class values so the adaptive controller can
restore a known-good point after a stalled chain.
*/

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{McmcError, Result};

/// A single named model parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub value: f64,
    pub lower: f64,
    pub upper: f64,
    pub constant: bool,
    pub is_yield: bool,
    /// Posterior standard deviation, filled in by [`crate::summary::summarize`].
    pub error: Option<f64>,
}

impl Parameter {
    /// Creates a free, non-yield parameter.
    pub fn new(value: f64, lower: f64, upper: f64) -> Self {
        Self {
            value,
            lower,
            upper,
            constant: false,
            is_yield: false,
            error: None,
        }
    }

    /// Marks the parameter as a yield.
    pub fn as_yield(mut self) -> Self {
        self.is_yield = true;
        self
    }

    /// Marks the parameter as constant.
    pub fn fixed(mut self) -> Self {
        self.constant = true;
        self
    }

    /// Width of the bounded range.
    pub fn range(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Ordered mapping from unique parameter name to [`Parameter`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    params: IndexMap<String, Parameter>,
}

/// Saved parameter values, restorable with [`ParameterSet::restore`].
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSnapshot {
    values: IndexMap<String, f64>,
}

impl ParameterSnapshot {
    /// Value stored for `name`, if any.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter. Names must be unique and bounds ordered.
    pub fn insert(&mut self, name: impl Into<String>, param: Parameter) -> Result<()> {
        let name = name.into();
        if self.params.contains_key(&name) {
            return Err(McmcError::Usage(format!("duplicate parameter '{name}'")));
        }
        if !(param.lower <= param.upper) {
            return Err(McmcError::Usage(format!(
                "parameter '{name}' has inverted bounds [{}, {}]",
                param.lower, param.upper
            )));
        }
        self.params.insert(name, param);
        Ok(())
    }

    /// Builder form of [`ParameterSet::insert`].
    pub fn with(mut self, name: impl Into<String>, param: Parameter) -> Result<Self> {
        self.insert(name, param)?;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.get_mut(name)
    }

    /// Current value of `name`, if it exists.
    pub fn value(&self, name: &str) -> Option<f64> {
        self.params.get(name).map(|p| p.value)
    }

    /// Sets the value of `name`. Unknown names are a usage error.
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<()> {
        match self.params.get_mut(name) {
            Some(p) => {
                p.value = value;
                Ok(())
            }
            None => Err(McmcError::Usage(format!("unknown parameter '{name}'"))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter()
    }

    /// Iterator over the free (non-constant) parameters in order.
    pub fn free(&self) -> impl Iterator<Item = (&String, &Parameter)> {
        self.params.iter().filter(|(_, p)| !p.constant)
    }

    /// Names of the free parameters in order.
    pub fn free_names(&self) -> Vec<String> {
        self.free().map(|(n, _)| n.clone()).collect()
    }

    /// Number of free parameters.
    pub fn n_free(&self) -> usize {
        self.free().count()
    }

    /// Current values of the free parameters in order.
    pub fn free_values(&self) -> Vec<f64> {
        self.free().map(|(_, p)| p.value).collect()
    }

    /// Lower and upper bounds of the free parameters in order.
    pub fn free_bounds(&self) -> (Vec<f64>, Vec<f64>) {
        self.free().map(|(_, p)| (p.lower, p.upper)).unzip()
    }

    /// Writes `values` into the free parameters, in the order of [`ParameterSet::free_names`].
    pub fn set_free_values(&mut self, values: &[f64]) -> Result<()> {
        let n_free = self.n_free();
        if values.len() != n_free {
            return Err(McmcError::Usage(format!(
                "expected {n_free} free parameter values, got {}",
                values.len()
            )));
        }
        for (p, v) in self
            .params
            .values_mut()
            .filter(|p| !p.constant)
            .zip(values.iter())
        {
            p.value = *v;
        }
        Ok(())
    }

    /// Writes values for the named parameters. Names not in the set are ignored.
    pub fn set_named_values(&mut self, names: &[String], values: &[f64]) {
        for (name, v) in names.iter().zip(values.iter()) {
            if let Some(p) = self.params.get_mut(name) {
                p.value = *v;
            }
        }
    }

    /// Captures the current value of every parameter.
    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot {
            values: self
                .params
                .iter()
                .map(|(n, p)| (n.clone(), p.value))
                .collect(),
        }
    }

    /// Restores values from `snapshot`. Parameters absent from the snapshot keep their values.
    pub fn restore(&mut self, snapshot: &ParameterSnapshot) {
        for (name, value) in snapshot.values.iter() {
            if let Some(p) = self.params.get_mut(name) {
                p.value = *value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_params() -> ParameterSet {
        ParameterSet::new()
            .with("a", Parameter::new(1.0, -5.0, 5.0))
            .unwrap()
            .with("b", Parameter::new(2.0, 0.0, 10.0).fixed())
            .unwrap()
            .with("yld", Parameter::new(100.0, 0.0, 1000.0).as_yield())
            .unwrap()
    }

    #[test]
    fn free_view_skips_constants() {
        let params = three_params();
        assert_eq!(params.free_names(), vec!["a".to_string(), "yld".to_string()]);
        assert_eq!(params.free_values(), vec![1.0, 100.0]);
        let (lo, hi) = params.free_bounds();
        assert_eq!(lo, vec![-5.0, 0.0]);
        assert_eq!(hi, vec![5.0, 1000.0]);
    }

    #[test]
    fn set_free_values_leaves_constants_alone() {
        let mut params = three_params();
        params.set_free_values(&[3.0, 50.0]).unwrap();
        assert_eq!(params.value("a"), Some(3.0));
        assert_eq!(params.value("b"), Some(2.0));
        assert_eq!(params.value("yld"), Some(50.0));
        assert!(params.set_free_values(&[1.0]).is_err());
    }

    #[test]
    fn snapshot_restores_values() {
        let mut params = three_params();
        let snap = params.snapshot();
        params.set_value("a", -4.0).unwrap();
        params.set_value("yld", 7.0).unwrap();
        params.restore(&snap);
        assert_eq!(params.value("a"), Some(1.0));
        assert_eq!(params.value("yld"), Some(100.0));
    }

    #[test]
    fn rejects_duplicates_and_bad_bounds() {
        let mut params = three_params();
        assert!(params.insert("a", Parameter::new(0.0, 0.0, 1.0)).is_err());
        assert!(params.insert("c", Parameter::new(0.0, 1.0, 0.0)).is_err());
        assert!(params.set_value("missing", 1.0).is_err());
    }
}
