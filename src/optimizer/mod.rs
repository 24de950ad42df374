//! Index catalog and recommendation engine.
//!
//! The [`Optimizer`] keeps the catalog of existing indexes (refreshed by
//! [`discover`](Optimizer::discover)), derives index recommendations from
//! query profiles, finds redundant and unused indexes, and applies create and
//! drop actions through the statistics provider.
//!
//! DDL runs one statement at a time. A failure is reported on its item and
//! never aborts the rest of a batch.

pub mod actions;
pub mod catalog;
pub mod recommend;
pub mod redundancy;

pub use actions::{ActionOutcome, DdlActionError, IndexActionResult};
pub use catalog::{DiscoverySummary, IndexDescriptor, canonical_table};
pub use recommend::{IndexRecommendation, Priority, consolidate_recommendations};
pub use redundancy::{RedundancyReport, Retention, jaccard};

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::QueryPerformanceProfile;
use crate::config::EngineConfig;
use crate::provider::{ProviderError, StatisticsProvider};
use actions::{create_index_statement, drop_index_statement};

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub similarity_threshold: f64,
    pub unused_index_secs: i64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for OptimizerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            similarity_threshold: config.duplicate_index_similarity_threshold,
            unused_index_secs: config.unused_index_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub total_indexes: usize,
    pub total_size_bytes: u64,
    pub constraint_indexes: usize,
    pub unused_indexes: usize,
    pub unused_size_bytes: u64,
    pub redundant_pairs: usize,
    /// Pending recommendations per priority.
    pub recommendations: BTreeMap<Priority, usize>,
}

/// Result of an optimization pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub created: Vec<IndexActionResult>,
    pub dropped: Vec<IndexActionResult>,
}

pub struct Optimizer {
    settings: OptimizerSettings,
    catalog: Mutex<BTreeMap<String, IndexDescriptor>>,
    recommendations: Mutex<Arc<Vec<IndexRecommendation>>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // every writer replaces whole entries, so the data is consistent after a panic
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Optimizer {
    pub fn new(settings: OptimizerSettings) -> Self {
        Self {
            settings,
            catalog: Mutex::new(BTreeMap::new()),
            recommendations: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn settings(&self) -> &OptimizerSettings {
        &self.settings
    }

    /// Refreshes the catalog from the provider's index metadata.
    pub fn discover(&self, provider: &dyn StatisticsProvider) -> Result<DiscoverySummary, ProviderError> {
        let metadata = provider.get_index_metadata()?;
        Ok(self.discover_from(&metadata, chrono::Utc::now().timestamp()))
    }

    pub fn discover_from(&self, metadata: &[crate::provider::IndexMetadata], now: i64) -> DiscoverySummary {
        let summary = catalog::merge(&mut guard(&self.catalog), metadata, now);
        info!(
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            "index catalog refreshed"
        );
        summary
    }

    /// All catalog entries, ordered by name.
    pub fn catalog(&self) -> Vec<IndexDescriptor> {
        guard(&self.catalog).values().cloned().collect()
    }

    pub fn index(&self, name: &str) -> Option<IndexDescriptor> {
        guard(&self.catalog).get(name).cloned()
    }

    /// `true` if some index on `table` has `column` as its first key column.
    pub fn has_index_leading_with(&self, table: &str, column: &str) -> bool {
        self.covers(table, &[column.to_string()])
    }

    /// `true` if some index on `table` leads with exactly `columns`.
    pub fn covers(&self, table: &str, columns: &[String]) -> bool {
        let table = canonical_table(table);
        guard(&self.catalog)
            .values()
            .any(|idx| idx.table == table && idx.leads_with(columns))
    }

    /// Index recommendation for one query pattern, unless the catalog
    /// already has a matching index.
    pub fn recommend_from_query(&self, profile: &QueryPerformanceProfile) -> Option<IndexRecommendation> {
        let rec = recommend::recommend(profile)?;
        if self.covers(&rec.table, &rec.columns) {
            return None;
        }
        Some(rec)
    }

    /// Recomputes the recommendation set from `profiles` and replaces the
    /// previous one.
    pub fn refresh_recommendations(
        &self,
        profiles: &[QueryPerformanceProfile],
    ) -> Arc<Vec<IndexRecommendation>> {
        let recs: Vec<_> = profiles
            .iter()
            .filter_map(|p| self.recommend_from_query(p))
            .collect();
        let consolidated = Arc::new(consolidate_recommendations(recs));
        *guard(&self.recommendations) = Arc::clone(&consolidated);
        info!(count = consolidated.len(), "index recommendations refreshed");
        consolidated
    }

    pub fn recommendations(&self) -> Arc<Vec<IndexRecommendation>> {
        Arc::clone(&guard(&self.recommendations))
    }

    pub fn recommendation(&self, id: &str) -> Option<IndexRecommendation> {
        self.recommendations().iter().find(|r| r.id == id).cloned()
    }

    pub fn find_redundant_indexes(&self) -> Vec<RedundancyReport> {
        redundancy::find_redundant(&self.catalog(), self.settings.similarity_threshold)
    }

    pub fn find_unused_indexes(&self, now: i64) -> Vec<IndexDescriptor> {
        redundancy::find_unused(&self.catalog(), now, self.settings.unused_index_secs)
    }

    /// Creates up to `limit` pending recommendations of exactly `priority`.
    pub fn create_recommended_indexes(
        &self,
        provider: &dyn StatisticsProvider,
        priority: Priority,
        limit: usize,
        dry_run: bool,
    ) -> Vec<IndexActionResult> {
        self.recommendations()
            .iter()
            .filter(|r| r.priority == priority)
            .take(limit)
            .map(|r| self.apply_recommendation(provider, r, dry_run))
            .collect()
    }

    /// Applies the recommendations with the given ids.
    ///
    /// Fails without touching the database if any id is unknown.
    pub fn apply_recommendations(
        &self,
        provider: &dyn StatisticsProvider,
        ids: &[String],
        dry_run: bool,
    ) -> Result<Vec<IndexActionResult>, DdlActionError> {
        let current = self.recommendations();
        let mut selected = Vec::with_capacity(ids.len());
        for id in ids {
            let rec = current
                .iter()
                .find(|r| &r.id == id)
                .ok_or_else(|| DdlActionError::UnknownRecommendation(id.clone()))?;
            selected.push(rec);
        }
        Ok(selected
            .into_iter()
            .map(|r| self.apply_recommendation(provider, r, dry_run))
            .collect())
    }

    fn apply_recommendation(
        &self,
        provider: &dyn StatisticsProvider,
        rec: &IndexRecommendation,
        dry_run: bool,
    ) -> IndexActionResult {
        self.create_named_index(
            provider,
            &rec.id,
            &rec.table,
            &rec.columns,
            rec.estimated_size_bytes,
            dry_run,
        )
        .unwrap_or_else(|e| IndexActionResult::failed(&rec.id, Some(&rec.table), &e))
    }

    /// Creates an index on `table(columns)` with a generated name.
    pub fn create_index(
        &self,
        provider: &dyn StatisticsProvider,
        table: &str,
        columns: &[String],
        dry_run: bool,
    ) -> Result<IndexActionResult, DdlActionError> {
        let table = canonical_table(table);
        let columns: Vec<String> = columns.iter().map(|c| recommend::unqualify(c)).collect();
        let name = recommend::index_name(&table, &columns);
        self.create_named_index(provider, &name, &table, &columns, 0, dry_run)
    }

    fn create_named_index(
        &self,
        provider: &dyn StatisticsProvider,
        name: &str,
        table: &str,
        columns: &[String],
        estimated_size: u64,
        dry_run: bool,
    ) -> Result<IndexActionResult, DdlActionError> {
        let statement = create_index_statement(name, table, columns)?;

        if dry_run {
            info!(index = name, %statement, "dry run: would create index");
            return Ok(IndexActionResult {
                index_name: name.to_string(),
                table: Some(table.to_string()),
                statement: Some(statement),
                outcome: ActionOutcome::DryRun,
            });
        }

        if let Err(e) = provider.execute_ddl(&statement) {
            warn!(index = name, error = %e, "index creation failed");
            return Err(e.into());
        }
        info!(index = name, table, "index created");

        let now = chrono::Utc::now().timestamp();
        guard(&self.catalog).insert(
            name.to_string(),
            IndexDescriptor {
                name: name.to_string(),
                table: canonical_table(table),
                columns: columns.to_vec(),
                is_primary: false,
                is_unique: false,
                size_bytes: estimated_size,
                usage_count: 0,
                last_used: None,
                first_seen: now,
            },
        );
        let mut pending = guard(&self.recommendations);
        if pending.iter().any(|r| r.id == name) {
            let remaining: Vec<_> = pending.iter().filter(|r| r.id != name).cloned().collect();
            *pending = Arc::new(remaining);
        }
        drop(pending);

        Ok(IndexActionResult {
            index_name: name.to_string(),
            table: Some(table.to_string()),
            statement: Some(statement),
            outcome: ActionOutcome::Applied,
        })
    }

    /// Drops a catalog index. Constraint-backing indexes are refused.
    pub fn drop_index(
        &self,
        provider: &dyn StatisticsProvider,
        name: &str,
        dry_run: bool,
    ) -> Result<IndexActionResult, DdlActionError> {
        let idx = self
            .index(name)
            .ok_or_else(|| DdlActionError::UnknownIndex(name.to_string()))?;
        if idx.is_constraint() {
            return Err(DdlActionError::Protected(name.to_string()));
        }
        let statement = drop_index_statement(&idx.name, &idx.table)?;

        if dry_run {
            info!(index = name, %statement, "dry run: would drop index");
            return Ok(IndexActionResult {
                index_name: idx.name,
                table: Some(idx.table),
                statement: Some(statement),
                outcome: ActionOutcome::DryRun,
            });
        }

        if let Err(e) = provider.execute_ddl(&statement) {
            warn!(index = name, error = %e, "index drop failed");
            return Err(e.into());
        }
        info!(index = name, table = %idx.table, "index dropped");
        guard(&self.catalog).remove(name);

        Ok(IndexActionResult {
            index_name: idx.name,
            table: Some(idx.table),
            statement: Some(statement),
            outcome: ActionOutcome::Applied,
        })
    }

    /// Drops the removable side of each pair.
    ///
    /// A pair whose kept side was already dropped is skipped, so a group of
    /// overlapping indexes always keeps at least one member even when the
    /// pairwise retention choices form a cycle.
    pub fn drop_redundant_indexes(
        &self,
        provider: &dyn StatisticsProvider,
        pairs: &[RedundancyReport],
        dry_run: bool,
    ) -> Vec<IndexActionResult> {
        let mut visited = HashSet::new();
        let mut dropped: HashSet<&str> = HashSet::new();
        let mut out = Vec::with_capacity(pairs.len());
        for pair in pairs {
            if dropped.contains(pair.primary.as_str()) {
                debug!(
                    kept = %pair.primary,
                    redundant = %pair.redundant,
                    "kept side already dropped, pair skipped"
                );
                continue;
            }
            if !visited.insert(pair.redundant.as_str()) {
                continue;
            }
            let result = match self.drop_index(provider, &pair.redundant, dry_run) {
                Ok(r) => r,
                Err(DdlActionError::Protected(_)) => IndexActionResult::skipped(
                    &pair.redundant,
                    Some(&pair.table),
                    "backs a primary key or unique constraint",
                ),
                Err(e) => IndexActionResult::failed(&pair.redundant, Some(&pair.table), &e),
            };
            if matches!(result.outcome, ActionOutcome::Applied | ActionOutcome::DryRun) {
                dropped.insert(pair.redundant.as_str());
            }
            out.push(result);
        }
        out
    }

    /// Creates urgent and high recommendations (up to `limit` each) and
    /// drops redundant indexes.
    pub fn optimize(
        &self,
        provider: &dyn StatisticsProvider,
        limit: usize,
        dry_run: bool,
    ) -> OptimizationResult {
        let mut created = self.create_recommended_indexes(provider, Priority::Urgent, limit, dry_run);
        created.extend(self.create_recommended_indexes(provider, Priority::High, limit, dry_run));
        let redundant = self.find_redundant_indexes();
        let dropped = self.drop_redundant_indexes(provider, &redundant, dry_run);
        OptimizationResult { created, dropped }
    }

    pub fn index_statistics(&self, now: i64) -> IndexStatistics {
        let catalog = self.catalog();
        let unused = redundancy::find_unused(&catalog, now, self.settings.unused_index_secs);
        let mut recommendations = BTreeMap::new();
        for rec in self.recommendations().iter() {
            *recommendations.entry(rec.priority).or_insert(0) += 1;
        }
        IndexStatistics {
            total_indexes: catalog.len(),
            total_size_bytes: catalog.iter().map(|i| i.size_bytes).sum(),
            constraint_indexes: catalog.iter().filter(|i| i.is_constraint()).count(),
            unused_indexes: unused.len(),
            unused_size_bytes: unused.iter().map(|i| i.size_bytes).sum(),
            redundant_pairs: redundancy::find_redundant(&catalog, self.settings.similarity_threshold)
                .len(),
            recommendations,
        }
    }
}
