//! Append-only record of every evaluated (configuration, instance, seed,
//! budget) trial.

use rc_types::{
    insufficient_data, Budget, ConfigId, ConfigSpace, Configuration, InstanceSeedBudgetKey,
    RacerError, RacerResult, RunKey, RunValue, DEFAULT_CRASH_COST,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// How raw run values turn into comparable costs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostPolicy {
    /// Cost charged for CRASHED and MEMOUT trials.
    pub crash_cost: f64,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self {
            crash_cost: DEFAULT_CRASH_COST,
        }
    }
}

/// Feature/target matrix handed to a surrogate model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingData {
    pub x: Vec<Vec<f64>>,
    pub y: Vec<f64>,
    pub config_ids: Vec<ConfigId>,
}

impl TrainingData {
    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    pub fn best_cost(&self) -> Option<f64> {
        self.y.iter().copied().reduce(f64::min)
    }
}

/// One stored trial, as serialized by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub key: RunKey,
    pub value: RunValue,
}

/// Serializable image of a [`RunHistory`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistorySnapshot {
    pub policy: CostPolicy,
    pub configs: Vec<(ConfigId, Configuration)>,
    pub data: Vec<RunEntry>,
}

/// Insertion-ordered mapping from [`RunKey`] to [`RunValue`].
#[derive(Debug, Clone, Default)]
pub struct RunHistory {
    policy: CostPolicy,
    config_ids: HashMap<Configuration, ConfigId>,
    /// `ids_config[id - 1]` is the configuration with that id.
    ids_config: Vec<Configuration>,
    entries: Vec<RunEntry>,
    index: HashMap<RunKey, usize>,
    /// Evaluated keys per configuration, in recording order.
    runs_by_config: HashMap<ConfigId, Vec<InstanceSeedBudgetKey>>,
    /// Mean cost over all non-censored runs; refreshed on every record.
    average_costs: HashMap<ConfigId, f64>,
}

impl RunHistory {
    pub fn new(policy: CostPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn policy(&self) -> &CostPolicy {
        &self.policy
    }

    /// Number of recorded trials.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_configs(&self) -> usize {
        self.ids_config.len()
    }

    /// Return the id of `config`, registering it if unseen.
    pub fn add_config(&mut self, config: &Configuration) -> ConfigId {
        if let Some(id) = self.config_ids.get(config) {
            return *id;
        }
        self.ids_config.push(config.clone());
        let id = self.ids_config.len() as ConfigId;
        self.config_ids.insert(config.clone(), id);
        id
    }

    pub fn config_id(&self, config: &Configuration) -> Option<ConfigId> {
        self.config_ids.get(config).copied()
    }

    pub fn config(&self, id: ConfigId) -> Option<&Configuration> {
        (id as usize)
            .checked_sub(1)
            .and_then(|idx| self.ids_config.get(idx))
    }

    pub fn configs(&self) -> impl Iterator<Item = (ConfigId, &Configuration)> {
        self.ids_config
            .iter()
            .enumerate()
            .map(|(idx, c)| (idx as ConfigId + 1, c))
    }

    /// All trials in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &RunEntry> {
        self.entries.iter()
    }

    /// Record a trial outcome.
    ///
    /// Fails with [`RacerError::DuplicateRun`] if the key already exists and
    /// `overwrite` is false.
    pub fn record(
        &mut self,
        config: &Configuration,
        key: InstanceSeedBudgetKey,
        value: RunValue,
        overwrite: bool,
    ) -> RacerResult<RunKey> {
        let config_id = self.add_config(config);
        let run_key = RunKey::new(config_id, key.clone());

        match self.index.get(&run_key) {
            Some(_) if !overwrite => {
                return Err(RacerError::DuplicateRun {
                    key: run_key.to_string(),
                });
            }
            Some(&pos) => {
                self.entries[pos].value = value;
            }
            None => {
                self.index.insert(run_key.clone(), self.entries.len());
                self.entries.push(RunEntry {
                    key: run_key.clone(),
                    value,
                });
                self.runs_by_config.entry(config_id).or_default().push(key);
            }
        }

        self.refresh_average(config_id);
        debug!(key = %run_key, "recorded run");
        Ok(run_key)
    }

    pub fn get(&self, key: &RunKey) -> Option<&RunValue> {
        self.index.get(key).map(|&pos| &self.entries[pos].value)
    }

    /// Look up the value of `config` on `key` without registering `config`.
    pub fn get_for(&self, config: &Configuration, key: &InstanceSeedBudgetKey) -> Option<&RunValue> {
        let id = self.config_id(config)?;
        self.get(&RunKey::new(id, key.clone()))
    }

    pub fn contains(&self, config: &Configuration, key: &InstanceSeedBudgetKey) -> bool {
        self.get_for(config, key).is_some()
    }

    /// Exact cost of a run value, or `None` when it is censored.
    pub fn observed_cost(&self, value: &RunValue) -> Option<f64> {
        if value.status.is_censored() {
            None
        } else if value.status.is_crash() {
            Some(self.policy.crash_cost)
        } else {
            Some(value.cost.scalar())
        }
    }

    /// Evaluated instance/seed/budget keys of `config`, in recording order.
    pub fn runs_for(&self, config: &Configuration) -> Vec<InstanceSeedBudgetKey> {
        self.config_id(config)
            .and_then(|id| self.runs_by_config.get(&id))
            .cloned()
            .unwrap_or_default()
    }

    pub fn num_trials(&self, config: &Configuration) -> usize {
        self.config_id(config)
            .and_then(|id| self.runs_by_config.get(&id))
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn values_on<'a>(
        &'a self,
        config: &Configuration,
        subset: &'a [InstanceSeedBudgetKey],
    ) -> impl Iterator<Item = &'a RunValue> + 'a {
        let id = self.config_id(config);
        subset.iter().filter_map(move |key| {
            id.and_then(|id| self.get(&RunKey::new(id, key.clone())))
        })
    }

    /// Mean cost over the non-censored observations of `config` on `subset`.
    ///
    /// CAPPED and RUNNING entries are ignored; fails with
    /// [`RacerError::InsufficientData`] if nothing usable remains.
    pub fn cost_of(
        &self,
        config: &Configuration,
        subset: &[InstanceSeedBudgetKey],
    ) -> RacerResult<f64> {
        let costs: Vec<f64> = self
            .values_on(config, subset)
            .filter_map(|v| self.observed_cost(v))
            .collect();
        if costs.is_empty() {
            return Err(insufficient_data!(
                "{config} has no uncensored runs on the {} requested keys",
                subset.len()
            ));
        }
        Ok(costs.iter().sum::<f64>() / costs.len() as f64)
    }

    /// Mean over every recorded observation on `subset`, censored entries
    /// contributing their recorded cost as a lower bound.
    ///
    /// Only valid for proving a configuration worse, never better.
    pub fn lower_bound_of(
        &self,
        config: &Configuration,
        subset: &[InstanceSeedBudgetKey],
    ) -> RacerResult<f64> {
        let costs: Vec<f64> = self
            .values_on(config, subset)
            .map(|v| self.observed_cost(v).unwrap_or_else(|| v.cost.scalar()))
            .collect();
        if costs.is_empty() {
            return Err(insufficient_data!("{config} has no runs on the requested keys"));
        }
        Ok(costs.iter().sum::<f64>() / costs.len() as f64)
    }

    /// Total measured runtime of `config` on `subset`.
    pub fn sum_runtime(&self, config: &Configuration, subset: &[InstanceSeedBudgetKey]) -> f64 {
        self.values_on(config, subset).map(|v| v.time).sum()
    }

    pub fn has_censored(&self, config: &Configuration, subset: &[InstanceSeedBudgetKey]) -> bool {
        self.values_on(config, subset)
            .any(|v| v.status.is_censored())
    }

    /// Mean cost over all non-censored runs of `config` (cached).
    pub fn average_cost(&self, config: &Configuration) -> Option<f64> {
        self.config_id(config)
            .and_then(|id| self.average_costs.get(&id))
            .copied()
    }

    /// Highest budget `config` has been evaluated on.
    pub fn highest_budget(&self, config: &Configuration) -> Option<Budget> {
        self.runs_for(config).iter().filter_map(|k| k.budget).max()
    }

    fn refresh_average(&mut self, config_id: ConfigId) {
        let keys = self.runs_by_config.get(&config_id).cloned().unwrap_or_default();
        let costs: Vec<f64> = keys
            .into_iter()
            .filter_map(|key| self.get(&RunKey::new(config_id, key)))
            .filter_map(|v| self.observed_cost(v))
            .collect();
        if costs.is_empty() {
            self.average_costs.remove(&config_id);
        } else {
            let mean = costs.iter().sum::<f64>() / costs.len() as f64;
            self.average_costs.insert(config_id, mean);
        }
    }

    /// The `n` configurations with the lowest average cost, best first.
    pub fn best_configurations(&self, n: usize) -> Vec<(Configuration, f64)> {
        let mut ranked: Vec<(Configuration, f64)> = self
            .configs()
            .filter_map(|(id, c)| self.average_costs.get(&id).map(|cost| (c.clone(), *cost)))
            .collect();
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
        ranked.truncate(n);
        ranked
    }

    /// Encoded configurations and their mean uncensored cost.
    ///
    /// With `budget` set, only runs at that budget are used. Configurations
    /// without an uncensored observation are left out.
    pub fn training_data(
        &self,
        space: &ConfigSpace,
        budget: Option<Budget>,
    ) -> RacerResult<TrainingData> {
        let mut data = TrainingData::default();
        for (id, config) in self.configs() {
            let Some(keys) = self.runs_by_config.get(&id) else {
                continue;
            };
            let costs: Vec<f64> = keys
                .iter()
                .filter(|k| budget.is_none() || k.budget == budget)
                .filter_map(|k| self.get(&RunKey::new(id, k.clone())))
                .filter_map(|v| self.observed_cost(v))
                .collect();
            if costs.is_empty() {
                continue;
            }
            data.x.push(space.encode(config)?);
            data.y.push(costs.iter().sum::<f64>() / costs.len() as f64);
            data.config_ids.push(id);
        }
        Ok(data)
    }

    /// Merge the trials of `other` into this history.
    pub fn update_from(&mut self, other: &RunHistory, overwrite: bool) -> RacerResult<()> {
        for entry in other.iter() {
            let config = other
                .config(entry.key.config_id)
                .ok_or_else(|| rc_types::internal_error!("dangling config id {}", entry.key.config_id))?
                .clone();
            self.record(
                &config,
                entry.key.instance_seed_budget(),
                entry.value.clone(),
                overwrite,
            )?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RunHistorySnapshot {
        RunHistorySnapshot {
            policy: self.policy,
            configs: self.configs().map(|(id, c)| (id, c.clone())).collect(),
            data: self.entries.clone(),
        }
    }

    /// Rebuild a history from its snapshot, preserving config ids and order.
    pub fn from_snapshot(snapshot: RunHistorySnapshot) -> RacerResult<Self> {
        let mut history = Self::new(snapshot.policy);
        let mut configs = snapshot.configs;
        configs.sort_by_key(|(id, _)| *id);
        for (expected, (id, config)) in configs.iter().enumerate() {
            if *id as usize != expected + 1 {
                return Err(rc_types::internal_error!(
                    "config ids must be dense, found {id} at position {}",
                    expected + 1
                ));
            }
            history.add_config(config);
        }
        for entry in snapshot.data {
            let config = history
                .config(entry.key.config_id)
                .ok_or_else(|| rc_types::internal_error!("dangling config id {}", entry.key.config_id))?
                .clone();
            history.record(&config, entry.key.instance_seed_budget(), entry.value, false)?;
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_types::{Cost, StatusType};

    fn config(x: f64) -> Configuration {
        [("x", x)].into_iter().collect()
    }

    fn key(instance: &str, seed: u64) -> InstanceSeedBudgetKey {
        InstanceSeedBudgetKey::new(Some(instance.to_string()), seed, None)
    }

    #[test]
    fn duplicate_record_requires_overwrite() {
        let mut rh = RunHistory::default();
        let c = config(0.1);
        rh.record(&c, key("a", 0), RunValue::success(1.0, 1.0), false)
            .unwrap();

        let err = rh
            .record(&c, key("a", 0), RunValue::success(2.0, 1.0), false)
            .unwrap_err();
        assert!(matches!(err, RacerError::DuplicateRun { .. }));

        rh.record(&c, key("a", 0), RunValue::success(2.0, 1.0), true)
            .unwrap();
        assert_eq!(rh.len(), 1);
        assert_eq!(rh.average_cost(&c), Some(2.0));
    }

    #[test]
    fn cost_of_ignores_capped_runs() {
        let mut rh = RunHistory::default();
        let c = config(0.2);
        rh.record(&c, key("a", 0), RunValue::success(2.0, 2.0), false)
            .unwrap();
        rh.record(&c, key("b", 0), RunValue::success(4.0, 4.0), false)
            .unwrap();
        rh.record(
            &c,
            key("c", 0),
            RunValue::new(100.0, 3.0, StatusType::Capped),
            false,
        )
        .unwrap();

        let all = rh.runs_for(&c);
        assert_eq!(all.len(), 3);
        assert_eq!(rh.cost_of(&c, &all).unwrap(), 3.0);
        assert!(rh.lower_bound_of(&c, &all).unwrap() > 3.0);
        assert!(rh.has_censored(&c, &all));
    }

    #[test]
    fn cost_of_fails_without_uncensored_data() {
        let mut rh = RunHistory::default();
        let c = config(0.3);
        rh.record(
            &c,
            key("a", 0),
            RunValue::new(5.0, 5.0, StatusType::Capped),
            false,
        )
        .unwrap();

        let err = rh.cost_of(&c, &[key("a", 0)]).unwrap_err();
        assert!(matches!(err, RacerError::InsufficientData { .. }));
        assert!(rh.cost_of(&config(0.9), &[key("a", 0)]).is_err());
    }

    #[test]
    fn crashes_use_crash_cost() {
        let mut rh = RunHistory::new(CostPolicy { crash_cost: 50.0 });
        let c = config(0.4);
        rh.record(
            &c,
            key("a", 0),
            RunValue::new(Cost::Single(0.0), 1.0, StatusType::Crashed),
            false,
        )
        .unwrap();
        rh.record(&c, key("b", 0), RunValue::success(10.0, 1.0), false)
            .unwrap();
        assert_eq!(rh.cost_of(&c, &rh.runs_for(&c)).unwrap(), 30.0);
    }

    #[test]
    fn runs_for_keeps_recording_order() {
        let mut rh = RunHistory::default();
        let c = config(0.5);
        for (i, inst) in ["c", "a", "b"].iter().enumerate() {
            rh.record(&c, key(inst, i as u64), RunValue::success(1.0, 1.0), false)
                .unwrap();
        }
        let instances: Vec<_> = rh
            .runs_for(&c)
            .into_iter()
            .map(|k| k.instance.unwrap())
            .collect();
        assert_eq!(instances, vec!["c", "a", "b"]);
        assert_eq!(rh.num_trials(&c), 3);
        assert_eq!(rh.num_trials(&config(0.6)), 0);
    }

    #[test]
    fn highest_budget_ignores_unbudgeted_runs() {
        let mut rh = RunHistory::default();
        let c = config(0.3);
        assert_eq!(rh.highest_budget(&c), None);

        rh.record(&c, key("a", 0), RunValue::success(1.0, 1.0), false)
            .unwrap();
        assert_eq!(rh.highest_budget(&c), None);

        for budget in [3.0, 9.0, 1.0] {
            let key = InstanceSeedBudgetKey::new(None, 0, Some(budget));
            rh.record(&c, key, RunValue::success(1.0, 1.0), false)
                .unwrap();
        }
        assert_eq!(rh.highest_budget(&c), Some(9.0_f64.into()));
    }

    #[test]
    fn training_data_skips_censored_only_configs() {
        let space = ConfigSpace::new().add_float("x", 0.0, 1.0);
        let mut rh = RunHistory::default();
        rh.record(&config(0.25), key("a", 0), RunValue::success(1.0, 1.0), false)
            .unwrap();
        rh.record(
            &config(0.75),
            key("a", 0),
            RunValue::new(9.0, 9.0, StatusType::Capped),
            false,
        )
        .unwrap();

        let data = rh.training_data(&space, None).unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data.x[0], vec![0.25]);
        assert_eq!(data.best_cost(), Some(1.0));
    }

    #[test]
    fn best_configurations_sorted_ascending() {
        let mut rh = RunHistory::default();
        rh.record(&config(0.1), key("a", 0), RunValue::success(3.0, 1.0), false)
            .unwrap();
        rh.record(&config(0.2), key("a", 0), RunValue::success(1.0, 1.0), false)
            .unwrap();
        rh.record(&config(0.3), key("a", 0), RunValue::success(2.0, 1.0), false)
            .unwrap();

        let best = rh.best_configurations(2);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].0, config(0.2));
        assert_eq!(best[1].0, config(0.3));
    }

    #[test]
    fn snapshot_round_trip_preserves_ids() {
        let mut rh = RunHistory::default();
        rh.record(&config(0.1), key("a", 0), RunValue::success(3.0, 1.0), false)
            .unwrap();
        rh.record(&config(0.2), key("a", 1), RunValue::success(1.0, 1.0), false)
            .unwrap();

        let restored = RunHistory::from_snapshot(rh.snapshot()).unwrap();
        assert_eq!(restored.config_id(&config(0.2)), Some(2));
        assert_eq!(restored.len(), 2);

        let mut merged = RunHistory::default();
        merged.update_from(&restored, false).unwrap();
        assert_eq!(merged.len(), 2);
    }
}
