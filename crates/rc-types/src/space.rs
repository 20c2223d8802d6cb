//! Configuration space definitions: parameter ranges, defaults, forbidden
//! combinations, sampling, and the unit-hypercube encoding used by models and
//! space-filling designs.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::configuration::{Configuration, ParameterValue};
use crate::errors::{RacerError, RacerResult};

/// Rejection-sampling attempts per requested configuration before giving up
/// on a heavily forbidden space.
const MAX_SAMPLE_ATTEMPTS: usize = 100;

/// Standard deviation (in unit space) of numeric neighbourhood moves.
const NEIGHBOR_STDDEV: f64 = 0.2;

/// A single parameter dimension in the configuration space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Human-readable parameter name (e.g. "learning_rate").
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
    /// Explicit default; falls back to the range's natural centre.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<ParameterValue>,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
    /// Categorical choices.
    Choice { values: Vec<String> },
}

impl ParameterKind {
    pub fn is_categorical(&self) -> bool {
        matches!(self, Self::Choice { .. })
    }

    /// Number of distinct values, `None` for continuous ranges.
    pub fn cardinality(&self) -> Option<u64> {
        match self {
            Self::IntRange { low, high } => Some((high - low + 1).max(0) as u64),
            Self::Choice { values } => Some(values.len() as u64),
            _ => None,
        }
    }
}

/// A forbidden combination: a configuration matching every assignment is
/// invalid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForbiddenClause {
    pub assignments: Vec<(String, ParameterValue)>,
}

impl ForbiddenClause {
    pub fn matches(&self, config: &Configuration) -> bool {
        !self.assignments.is_empty()
            && self
                .assignments
                .iter()
                .all(|(name, value)| config.get(name) == Some(value))
    }
}

/// The full configuration space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConfigSpace {
    pub parameters: Vec<ParameterDef>,
    #[serde(default)]
    pub forbidden: Vec<ForbiddenClause>,
}

impl ConfigSpace {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, name: impl Into<String>, kind: ParameterKind) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind,
            default: None,
        });
        self
    }

    pub fn add_float(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::FloatRange { low, high })
    }

    pub fn add_int(self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.push(name, ParameterKind::IntRange { low, high })
    }

    pub fn add_log_uniform(self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.push(name, ParameterKind::LogUniform { low, high })
    }

    pub fn add_choice<S: Into<String>>(
        self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        let values = values.into_iter().map(Into::into).collect();
        self.push(name, ParameterKind::Choice { values })
    }

    /// Set the default of the most recently added parameter.
    pub fn with_default(mut self, value: impl Into<ParameterValue>) -> Self {
        if let Some(last) = self.parameters.last_mut() {
            last.default = Some(value.into());
        }
        self
    }

    pub fn add_forbidden(mut self, assignments: Vec<(String, ParameterValue)>) -> Self {
        self.forbidden.push(ForbiddenClause { assignments });
        self
    }

    pub fn dimensionality(&self) -> usize {
        self.parameters.len()
    }

    /// Total number of distinct configurations (returns `None` if any
    /// parameter is continuous).
    pub fn finite_size(&self) -> Option<u64> {
        let mut total: u64 = 1;
        for param in &self.parameters {
            // Continuous dimensions have no natural grid.
            let dim_size = param.kind.cardinality()?;
            total = total.checked_mul(dim_size)?;
        }
        Some(total)
    }

    pub fn is_categorical(&self, dim: usize) -> bool {
        self.parameters
            .get(dim)
            .map(|p| p.kind.is_categorical())
            .unwrap_or(false)
    }

    pub fn default_configuration(&self) -> Configuration {
        let values = self
            .parameters
            .iter()
            .map(|param| {
                let value = param
                    .default
                    .clone()
                    .unwrap_or_else(|| natural_default(&param.kind));
                (param.name.clone(), value)
            })
            .collect::<BTreeMap<_, _>>();
        Configuration::new(values).with_origin("Default")
    }

    /// Check ranges, types, completeness, and forbidden clauses.
    pub fn validate(&self, config: &Configuration) -> RacerResult<()> {
        if config.len() != self.parameters.len() {
            return Err(RacerError::InvalidConfiguration(format!(
                "expected {} parameters, got {}",
                self.parameters.len(),
                config.len()
            )));
        }

        for param in &self.parameters {
            let value = config.get(&param.name).ok_or_else(|| {
                RacerError::InvalidConfiguration(format!("missing parameter {}", param.name))
            })?;
            if !value_in_range(&param.kind, value) {
                return Err(RacerError::InvalidConfiguration(format!(
                    "{} = {} is outside its range",
                    param.name, value
                )));
            }
        }

        if let Some(clause) = self.forbidden.iter().find(|c| c.matches(config)) {
            return Err(RacerError::InvalidConfiguration(format!(
                "forbidden combination {:?}",
                clause.assignments
            )));
        }

        Ok(())
    }

    pub fn is_valid(&self, config: &Configuration) -> bool {
        self.validate(config).is_ok()
    }

    fn is_forbidden(&self, config: &Configuration) -> bool {
        self.forbidden.iter().any(|c| c.matches(config))
    }

    /// Draw `n` valid configurations uniformly at random.
    ///
    /// May return fewer than `n` if forbidden clauses reject too many draws.
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<Configuration> {
        let mut out = Vec::with_capacity(n);
        let mut attempts = 0;
        while out.len() < n && attempts < n.max(1) * MAX_SAMPLE_ATTEMPTS {
            attempts += 1;
            let config = self.sample_unchecked(rng);
            if !self.is_forbidden(&config) {
                out.push(config.with_origin("Random search"));
            }
        }
        out
    }

    fn sample_unchecked<R: Rng + ?Sized>(&self, rng: &mut R) -> Configuration {
        let values = self
            .parameters
            .iter()
            .map(|param| {
                let value = match &param.kind {
                    ParameterKind::FloatRange { low, high } => {
                        ParameterValue::Float(rng.random_range(*low..=*high))
                    }
                    ParameterKind::IntRange { low, high } => {
                        ParameterValue::Int(rng.random_range(*low..=*high))
                    }
                    ParameterKind::LogUniform { low, high } => {
                        let log_val: f64 = rng.random_range(low.ln()..=high.ln());
                        ParameterValue::Float(log_val.exp().clamp(*low, *high))
                    }
                    ParameterKind::Choice { values } => {
                        let idx = rng.random_range(0..values.len());
                        ParameterValue::Categorical(values[idx].clone())
                    }
                };
                (param.name.clone(), value)
            })
            .collect::<BTreeMap<_, _>>();
        Configuration::new(values)
    }

    /// Map a configuration into the unit hypercube, one coordinate per
    /// parameter in definition order.
    pub fn encode(&self, config: &Configuration) -> RacerResult<Vec<f64>> {
        self.parameters
            .iter()
            .map(|param| {
                let value = config.get(&param.name).ok_or_else(|| {
                    RacerError::InvalidConfiguration(format!("missing parameter {}", param.name))
                })?;
                encode_value(&param.kind, value).ok_or_else(|| {
                    RacerError::InvalidConfiguration(format!(
                        "{} = {} does not match its parameter kind",
                        param.name, value
                    ))
                })
            })
            .collect()
    }

    /// Map a unit-hypercube vector back to a configuration. Coordinates are
    /// clamped to [0, 1]; forbidden results are rejected.
    pub fn decode(&self, vector: &[f64]) -> RacerResult<Configuration> {
        if vector.len() != self.parameters.len() {
            return Err(RacerError::InvalidConfiguration(format!(
                "vector has {} coordinates, space has {} parameters",
                vector.len(),
                self.parameters.len()
            )));
        }
        let values = self
            .parameters
            .iter()
            .zip(vector)
            .map(|(param, &u)| (param.name.clone(), decode_value(&param.kind, u)))
            .collect::<BTreeMap<_, _>>();
        let config = Configuration::new(values);
        self.validate(&config)?;
        Ok(config)
    }

    /// One-exchange neighbourhood: numeric parameters get a few Gaussian moves
    /// in unit space (integers step by one), categoricals every other value.
    pub fn neighbors<R: Rng + ?Sized>(
        &self,
        config: &Configuration,
        per_numeric: usize,
        rng: &mut R,
    ) -> Vec<Configuration> {
        let mut out = Vec::new();

        for param in &self.parameters {
            let Some(current) = config.get(&param.name) else {
                continue;
            };
            let candidates: Vec<ParameterValue> = match (&param.kind, current) {
                (ParameterKind::Choice { values }, ParameterValue::Categorical(c)) => values
                    .iter()
                    .filter(|v| *v != c)
                    .map(|v| ParameterValue::Categorical(v.clone()))
                    .collect(),
                (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => [v - 1, v + 1]
                    .into_iter()
                    .filter(|n| n >= low && n <= high)
                    .map(ParameterValue::Int)
                    .collect(),
                (kind, value) => {
                    let Some(u) = encode_value(kind, value) else {
                        continue;
                    };
                    (0..per_numeric)
                        .map(|_| {
                            let noise = standard_normal(rng) * NEIGHBOR_STDDEV;
                            decode_value(kind, (u + noise).clamp(0.0, 1.0))
                        })
                        .filter(|v| v != value)
                        .collect()
                }
            };

            for candidate in candidates {
                let mut values = config.values().clone();
                values.insert(param.name.clone(), candidate);
                let neighbor = Configuration::new(values);
                if !self.is_forbidden(&neighbor) {
                    out.push(neighbor.with_origin("Local search"));
                }
            }
        }

        out
    }

    /// Full factorial grid; continuous dimensions use `float_steps` points.
    pub fn grid(&self, float_steps: usize) -> Vec<Configuration> {
        let mut axes: Vec<Vec<(&str, ParameterValue)>> = Vec::new();

        for param in &self.parameters {
            let values: Vec<ParameterValue> = match &param.kind {
                ParameterKind::IntRange { low, high } => {
                    (*low..=*high).map(ParameterValue::Int).collect()
                }
                ParameterKind::Choice { values } => values
                    .iter()
                    .map(|v| ParameterValue::Categorical(v.clone()))
                    .collect(),
                kind => {
                    let steps = float_steps.max(2);
                    (0..steps)
                        .map(|i| decode_value(kind, i as f64 / (steps - 1) as f64))
                        .collect()
                }
            };
            axes.push(
                values
                    .into_iter()
                    .map(|v| (param.name.as_str(), v))
                    .collect(),
            );
        }

        // Cartesian product
        let mut result: Vec<BTreeMap<String, ParameterValue>> = vec![BTreeMap::new()];
        for axis in &axes {
            let mut next = Vec::with_capacity(result.len() * axis.len());
            for existing in &result {
                for (name, value) in axis {
                    let mut combo = existing.clone();
                    combo.insert(name.to_string(), value.clone());
                    next.push(combo);
                }
            }
            result = next;
        }

        result
            .into_iter()
            .map(Configuration::new)
            .filter(|c| !self.is_forbidden(c))
            .collect()
    }
}

fn natural_default(kind: &ParameterKind) -> ParameterValue {
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float((low + high) / 2.0),
        ParameterKind::IntRange { low, high } => ParameterValue::Int(low + (high - low) / 2),
        ParameterKind::LogUniform { low, high } => ParameterValue::Float((low * high).sqrt()),
        ParameterKind::Choice { values } => {
            ParameterValue::Categorical(values.first().cloned().unwrap_or_default())
        }
    }
}

fn value_in_range(kind: &ParameterKind, value: &ParameterValue) -> bool {
    match (kind, value) {
        (ParameterKind::FloatRange { low, high }, ParameterValue::Float(v))
        | (ParameterKind::LogUniform { low, high }, ParameterValue::Float(v)) => {
            v.is_finite() && *v >= *low && *v <= *high
        }
        (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => v >= low && v <= high,
        (ParameterKind::Choice { values }, ParameterValue::Categorical(v)) => values.contains(v),
        _ => false,
    }
}

fn encode_value(kind: &ParameterKind, value: &ParameterValue) -> Option<f64> {
    let u = match (kind, value) {
        (ParameterKind::FloatRange { low, high }, ParameterValue::Float(v)) => {
            if (high - low).abs() < f64::EPSILON {
                0.5
            } else {
                (v - low) / (high - low)
            }
        }
        (ParameterKind::LogUniform { low, high }, ParameterValue::Float(v)) => {
            let span = high.ln() - low.ln();
            if span.abs() < f64::EPSILON {
                0.5
            } else {
                (v.ln() - low.ln()) / span
            }
        }
        (ParameterKind::IntRange { low, high }, ParameterValue::Int(v)) => {
            (*v - low) as f64 / ((high - low + 1) as f64) + 0.5 / ((high - low + 1) as f64)
        }
        (ParameterKind::Choice { values }, ParameterValue::Categorical(v)) => {
            let idx = values.iter().position(|c| c == v)?;
            (idx as f64 + 0.5) / values.len() as f64
        }
        _ => return None,
    };
    Some(u.clamp(0.0, 1.0))
}

fn decode_value(kind: &ParameterKind, u: f64) -> ParameterValue {
    let u = u.clamp(0.0, 1.0);
    match kind {
        ParameterKind::FloatRange { low, high } => ParameterValue::Float(low + u * (high - low)),
        ParameterKind::LogUniform { low, high } => {
            let log_val = low.ln() + u * (high.ln() - low.ln());
            ParameterValue::Float(log_val.exp().clamp(*low, *high))
        }
        ParameterKind::IntRange { low, high } => {
            let n = (high - low + 1) as f64;
            let offset = (u * n).floor().min(n - 1.0) as i64;
            ParameterValue::Int(low + offset)
        }
        ParameterKind::Choice { values } => {
            let n = values.len();
            let idx = ((u * n as f64).floor() as usize).min(n.saturating_sub(1));
            ParameterValue::Categorical(values.get(idx).cloned().unwrap_or_default())
        }
    }
}

/// Standard normal draw via Box-Muller.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2: f64 = rng.random();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sample_space() -> ConfigSpace {
        ConfigSpace::new()
            .add_int("a", 1, 5)
            .with_default(1i64)
            .add_log_uniform("b", 1e-3, 1.0)
            .with_default(0.1)
            .add_choice("c", ["cat", "dog"])
    }

    #[test]
    fn default_configuration_uses_explicit_defaults() {
        let default = sample_space().default_configuration();
        assert_eq!(default.get("a"), Some(&ParameterValue::Int(1)));
        assert_eq!(default.get("b"), Some(&ParameterValue::Float(0.1)));
        assert_eq!(default.get("c").and_then(|v| v.as_str()), Some("cat"));
        assert!(sample_space().is_valid(&default));
    }

    #[test]
    fn random_samples_respect_bounds() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let configs = space.sample(50, &mut rng);
        assert_eq!(configs.len(), 50);

        for config in &configs {
            match config.get("a") {
                Some(ParameterValue::Int(v)) => assert!((1..=5).contains(v)),
                other => panic!("unexpected a value: {other:?}"),
            }
            match config.get("b") {
                Some(ParameterValue::Float(v)) => assert!(*v >= 1e-3 && *v <= 1.0),
                other => panic!("unexpected b value: {other:?}"),
            }
            assert!(space.is_valid(config));
        }
    }

    #[test]
    fn sampling_is_reproducible_for_a_seed() {
        let space = sample_space();
        let first = space.sample(10, &mut ChaCha8Rng::seed_from_u64(3));
        let second = space.sample(10, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(first, second);
    }

    #[test]
    fn encode_decode_stays_in_unit_cube() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for config in space.sample(20, &mut rng) {
            let x = space.encode(&config).unwrap();
            assert!(x.iter().all(|v| (0.0..=1.0).contains(v)));
            let back = space.decode(&x).unwrap();
            assert_eq!(back.get("a"), config.get("a"));
            assert_eq!(back.get("c"), config.get("c"));
        }
    }

    #[test]
    fn finite_size_none_for_continuous() {
        assert_eq!(sample_space().finite_size(), None);
        let discrete = ConfigSpace::new().add_int("a", 1, 3).add_choice("b", ["x", "y"]);
        assert_eq!(discrete.finite_size(), Some(6));
        assert_eq!(discrete.grid(5).len(), 6);
    }

    #[test]
    fn forbidden_clause_rejects_configuration() {
        let space = ConfigSpace::new()
            .add_int("a", 1, 2)
            .add_choice("b", ["x", "y"])
            .add_forbidden(vec![
                ("a".into(), ParameterValue::Int(1)),
                ("b".into(), ParameterValue::from("x")),
            ]);

        let bad: Configuration = [
            ("a", ParameterValue::Int(1)),
            ("b", ParameterValue::from("x")),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            space.validate(&bad),
            Err(RacerError::InvalidConfiguration(_))
        ));
        assert_eq!(space.grid(2).len(), 3);
    }

    #[test]
    fn validate_rejects_out_of_range_and_missing() {
        let space = ConfigSpace::new().add_float("x", 0.0, 1.0);
        let out: Configuration = [("x", 2.0)].into_iter().collect();
        assert!(space.validate(&out).is_err());
        assert!(space.validate(&Configuration::default()).is_err());
    }

    #[test]
    fn neighbors_change_exactly_one_parameter() {
        let space = sample_space();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let base = space.default_configuration();
        let neighbors = space.neighbors(&base, 4, &mut rng);
        assert!(!neighbors.is_empty());
        for n in &neighbors {
            let changed = base
                .values()
                .iter()
                .filter(|(k, v)| n.get(k.as_str()) != Some(*v))
                .count();
            assert_eq!(changed, 1, "neighbor {n} differs in {changed} parameters");
            assert!(space.is_valid(n));
        }
    }
}
