//! Automatic remediation for critical health passes.
//!
//! Rules run in order and independently: a failing rule is recorded as a
//! failed [`RemediationAction`] and the remaining rules still run. Nothing is
//! retried until the next critical pass.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::HealthSettings;
use crate::optimizer::{Optimizer, Priority};
use crate::provider::{MaintenanceAction, ProviderError, ResourceMetrics, StatisticsProvider};

pub const DEAD_TUPLE_VACUUM_THRESHOLD: u64 = 100_000;
pub const CONNECTION_SATURATION_PCT: f64 = 95.0;
pub const CACHE_TUNING_THRESHOLD: f64 = 0.8;
/// New `max_connections` is the current value times this factor.
pub const CONNECTION_GROWTH_FACTOR: f64 = 1.5;
/// Recommended indexes created per priority level per pass.
pub const INDEXES_PER_PASS: usize = 5;
/// Entries kept in the remediation log.
pub const REMEDIATION_LOG_CAPACITY: usize = 100;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemediationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{failed} of {attempted} index creations failed")]
    IndexCreation { failed: usize, attempted: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RemediationOutcome {
    Succeeded { detail: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub action_type: String,
    pub timestamp: i64,
    pub outcome: RemediationOutcome,
}

impl RemediationAction {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RemediationOutcome::Succeeded { .. })
    }
}

pub struct RemediationContext<'a> {
    pub metrics: &'a ResourceMetrics,
    pub provider: &'a dyn StatisticsProvider,
    pub optimizer: &'a Optimizer,
    pub settings: &'a HealthSettings,
}

pub trait RemediationRule: Send + Sync {
    fn action_type(&self) -> &'static str;
    fn applies(&self, ctx: &RemediationContext) -> bool;
    /// Returns a short description of what was done.
    fn apply(&self, ctx: &RemediationContext) -> Result<String, RemediationError>;
}

pub fn all_remediation_rules() -> Vec<Box<dyn RemediationRule>> {
    vec![
        Box::new(VacuumRule),
        Box::new(ConnectionLimitRule),
        Box::new(CacheTuningRule),
        Box::new(IndexCreationRule),
    ]
}

/// Runs every applicable rule and returns one action per rule that fired.
pub fn remediate(
    rules: &[Box<dyn RemediationRule>],
    ctx: &RemediationContext,
    now: i64,
) -> Vec<RemediationAction> {
    rules
        .iter()
        .filter(|rule| rule.applies(ctx))
        .map(|rule| {
            let outcome = match rule.apply(ctx) {
                Ok(detail) => {
                    tracing::info!(action = rule.action_type(), %detail, "Remediation applied");
                    RemediationOutcome::Succeeded { detail }
                }
                Err(e) => {
                    tracing::warn!(action = rule.action_type(), error = %e, "Remediation failed");
                    RemediationOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };
            RemediationAction {
                action_type: rule.action_type().to_string(),
                timestamp: now,
                outcome,
            }
        })
        .collect()
}

pub struct VacuumRule;

impl RemediationRule for VacuumRule {
    fn action_type(&self) -> &'static str {
        "vacuum"
    }

    fn applies(&self, ctx: &RemediationContext) -> bool {
        ctx.metrics
            .dead_tuples
            .is_some_and(|d| d > DEAD_TUPLE_VACUUM_THRESHOLD)
    }

    fn apply(&self, ctx: &RemediationContext) -> Result<String, RemediationError> {
        ctx.provider.run_maintenance(&MaintenanceAction::Vacuum)?;
        Ok(format!(
            "vacuumed with {} dead tuples",
            ctx.metrics.dead_tuples.unwrap_or_default()
        ))
    }
}

pub struct ConnectionLimitRule;

impl RemediationRule for ConnectionLimitRule {
    fn action_type(&self) -> &'static str {
        "raise_connection_limit"
    }

    fn applies(&self, ctx: &RemediationContext) -> bool {
        ctx.metrics
            .connection_utilization_pct()
            .is_some_and(|pct| pct > CONNECTION_SATURATION_PCT)
    }

    fn apply(&self, ctx: &RemediationContext) -> Result<String, RemediationError> {
        let current = ctx.metrics.max_connections.unwrap_or_default();
        let target = (current as f64 * CONNECTION_GROWTH_FACTOR).ceil() as u64;
        ctx.provider
            .run_maintenance(&MaintenanceAction::RaiseConnectionLimit { target })?;
        Ok(format!("max_connections {current} -> {target}"))
    }
}

pub struct CacheTuningRule;

impl RemediationRule for CacheTuningRule {
    fn action_type(&self) -> &'static str {
        "tune_cache"
    }

    fn applies(&self, ctx: &RemediationContext) -> bool {
        ctx.metrics
            .cache_hit_ratio
            .is_some_and(|r| r < CACHE_TUNING_THRESHOLD)
    }

    fn apply(&self, ctx: &RemediationContext) -> Result<String, RemediationError> {
        ctx.provider.run_maintenance(&MaintenanceAction::TuneCache)?;
        Ok("cache size increased".to_string())
    }
}

/// Creates urgent then high priority recommended indexes. Runs as a dry run
/// unless automatic index creation is enabled.
pub struct IndexCreationRule;

impl RemediationRule for IndexCreationRule {
    fn action_type(&self) -> &'static str {
        "create_indexes"
    }

    fn applies(&self, ctx: &RemediationContext) -> bool {
        ctx.metrics
            .avg_query_time_ms
            .is_some_and(|ms| ms > ctx.settings.performance.avg_query_critical_ms)
    }

    fn apply(&self, ctx: &RemediationContext) -> Result<String, RemediationError> {
        let dry_run = !ctx.settings.auto_create_indexes;
        let mut results = ctx.optimizer.create_recommended_indexes(
            ctx.provider,
            Priority::Urgent,
            INDEXES_PER_PASS,
            dry_run,
        );
        results.extend(ctx.optimizer.create_recommended_indexes(
            ctx.provider,
            Priority::High,
            INDEXES_PER_PASS,
            dry_run,
        ));

        let attempted = results.len();
        let failed = results.iter().filter(|r| !r.is_success()).count();
        if failed > 0 {
            return Err(RemediationError::IndexCreation { failed, attempted });
        }
        let mode = if dry_run { " (dry run)" } else { "" };
        Ok(format!("{attempted} recommended indexes created{mode}"))
    }
}

/// Bounded log of remediation actions, oldest first.
#[derive(Debug, Clone, Default)]
pub struct RemediationLog {
    entries: VecDeque<RemediationAction>,
}

impl RemediationLog {
    pub fn extend(&mut self, actions: impl IntoIterator<Item = RemediationAction>) {
        for a in actions {
            if self.entries.len() >= REMEDIATION_LOG_CAPACITY {
                self.entries.pop_front();
            }
            self.entries.push_back(a);
        }
    }

    pub fn entries(&self) -> Vec<RemediationAction> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerSettings;
    use crate::provider::mock::MockProvider;

    fn run(provider: &MockProvider, settings: &HealthSettings) -> Vec<RemediationAction> {
        let metrics = provider.get_resource_metrics().unwrap();
        let optimizer = Optimizer::new(OptimizerSettings::default());
        let ctx = RemediationContext {
            metrics: &metrics,
            provider,
            optimizer: &optimizer,
            settings,
        };
        remediate(&all_remediation_rules(), &ctx, 1_000)
    }

    #[test]
    fn healthy_metrics_trigger_nothing() {
        let provider = MockProvider::typical_workload();
        assert!(run(&provider, &HealthSettings::default()).is_empty());
        assert!(provider.maintenance_log().is_empty());
    }

    #[test]
    fn overloaded_triggers_rules_in_order() {
        let provider = MockProvider::overloaded();
        let actions = run(&provider, &HealthSettings::default());
        let types: Vec<_> = actions.iter().map(|a| a.action_type.as_str()).collect();
        assert_eq!(
            types,
            vec!["vacuum", "raise_connection_limit", "tune_cache", "create_indexes"]
        );
        assert!(actions.iter().all(RemediationAction::succeeded));
        assert_eq!(
            provider.maintenance_log(),
            vec![
                MaintenanceAction::Vacuum,
                MaintenanceAction::RaiseConnectionLimit { target: 150 },
                MaintenanceAction::TuneCache,
            ]
        );
        // no recommendations refreshed yet, and dry run by default
        assert!(provider.executed_ddl().is_empty());
    }

    #[test]
    fn failures_are_recorded_and_do_not_stop_later_rules() {
        let provider = MockProvider::overloaded();
        provider.set_fail_maintenance(true);
        let actions = run(&provider, &HealthSettings::default());
        assert_eq!(actions.len(), 4);
        assert_eq!(actions.iter().filter(|a| !a.succeeded()).count(), 3);
        assert!(actions[3].succeeded());
        assert_eq!(actions[0].timestamp, 1_000);
    }

    #[test]
    fn log_is_bounded() {
        let mut log = RemediationLog::default();
        let action = |i: i64| RemediationAction {
            action_type: "vacuum".into(),
            timestamp: i,
            outcome: RemediationOutcome::Succeeded {
                detail: String::new(),
            },
        };
        log.extend((0..150).map(action));
        assert_eq!(log.len(), REMEDIATION_LOG_CAPACITY);
        assert_eq!(log.entries()[0].timestamp, 50);
    }
}
