//! Index catalog: the optimizer's view of existing indexes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::provider::IndexMetadata;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    /// Canonical table name, see [`canonical_table`].
    pub table: String,
    /// Key columns in index order. Expressions are kept verbatim.
    pub columns: Vec<String>,
    pub is_primary: bool,
    pub is_unique: bool,
    pub size_bytes: u64,
    /// Cumulative scan counter at the last discovery.
    pub usage_count: u64,
    /// Last discovery at which the scan counter had grown.
    pub last_used: Option<i64>,
    pub first_seen: i64,
}

impl IndexDescriptor {
    /// `true` if the index's leading key columns are exactly `columns`.
    pub fn leads_with(&self, columns: &[String]) -> bool {
        !columns.is_empty()
            && self.columns.len() >= columns.len()
            && self.columns.iter().zip(columns).all(|(a, b)| a == b)
    }

    /// Primary and unique indexes back constraints and are never dropped.
    pub fn is_constraint(&self) -> bool {
        self.is_primary || self.is_unique
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoverySummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Lowercases, strips double quotes and the `public.` schema.
pub fn canonical_table(name: &str) -> String {
    let name = name.trim().replace('"', "").to_ascii_lowercase();
    match name.strip_prefix("public.") {
        Some(rest) => rest.to_string(),
        None => name,
    }
}

/// Extracts key columns from an index definition.
///
/// Takes the first parenthesised group after `ON`, splits it on top-level
/// commas and drops sort options (`ASC`, `DESC`, `NULLS ...`, `COLLATE ...`,
/// operator classes). `CREATE INDEX i ON t USING btree (a, lower(b) DESC)`
/// yields `["a", "lower(b)"]`.
pub fn parse_index_columns(definition: &str) -> Vec<String> {
    let upper = definition.to_ascii_uppercase();
    let start = upper.find(" ON ").unwrap_or(0);
    let Some(open) = definition[start..].find('(').map(|i| start + i) else {
        return Vec::new();
    };

    let mut depth = 0usize;
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in definition[open + 1..].chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' if depth == 0 => break,
            ')' => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts.iter().map(String::as_str).filter_map(key_column).collect()
}

fn key_column(part: &str) -> Option<String> {
    let part = part.trim();
    if part.is_empty() {
        return None;
    }
    if part.contains('(') {
        // expression: strip trailing sort options after the last ')'
        let end = part.rfind(')').map(|i| i + 1).unwrap_or(part.len());
        return Some(part[..end].trim().to_ascii_lowercase());
    }
    part.split_whitespace()
        .next()
        .map(|c| c.replace('"', "").to_ascii_lowercase())
}

/// Merges provider metadata into `catalog` by name.
///
/// Indexes absent from `metadata` are removed. A growing scan counter marks
/// the index as used at `now`; first sight with scans counts as used too.
pub(crate) fn merge(
    catalog: &mut BTreeMap<String, IndexDescriptor>,
    metadata: &[IndexMetadata],
    now: i64,
) -> DiscoverySummary {
    let mut summary = DiscoverySummary::default();
    let mut present = std::collections::HashSet::with_capacity(metadata.len());

    for meta in metadata {
        present.insert(meta.name.as_str());
        let columns = parse_index_columns(&meta.definition);
        let table = canonical_table(&meta.table);

        match catalog.get_mut(&meta.name) {
            Some(existing) => {
                if meta.scan_count != existing.usage_count && meta.scan_count > 0 {
                    // grown, or reset and used again since
                    existing.last_used = Some(now);
                }
                existing.usage_count = meta.scan_count;
                existing.table = table;
                existing.columns = columns;
                existing.is_primary = meta.is_primary;
                existing.is_unique = meta.is_unique;
                existing.size_bytes = meta.size_bytes;
                summary.updated += 1;
            }
            None => {
                catalog.insert(
                    meta.name.clone(),
                    IndexDescriptor {
                        name: meta.name.clone(),
                        table,
                        columns,
                        is_primary: meta.is_primary,
                        is_unique: meta.is_unique,
                        size_bytes: meta.size_bytes,
                        usage_count: meta.scan_count,
                        last_used: (meta.scan_count > 0).then_some(now),
                        first_seen: now,
                    },
                );
                summary.added += 1;
            }
        }
    }

    let before = catalog.len();
    catalog.retain(|name, _| present.contains(name.as_str()));
    summary.removed = before - catalog.len();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &str, table: &str, def_cols: &str, scans: u64) -> IndexMetadata {
        IndexMetadata {
            name: name.to_string(),
            table: table.to_string(),
            definition: format!("CREATE INDEX {name} ON public.{table} USING btree ({def_cols})"),
            size_bytes: 8192,
            scan_count: scans,
            ..Default::default()
        }
    }

    #[test]
    fn parse_simple_columns() {
        assert_eq!(
            parse_index_columns("CREATE INDEX i ON public.users USING btree (email, created_at)"),
            vec!["email", "created_at"]
        );
    }

    #[test]
    fn parse_sort_options_and_expressions() {
        assert_eq!(
            parse_index_columns(
                "CREATE UNIQUE INDEX i ON t USING btree (\"Email\" DESC NULLS LAST, lower(name) text_pattern_ops, coalesce(a, b))"
            ),
            vec!["email", "lower(name)", "coalesce(a, b)"]
        );
    }

    #[test]
    fn parse_ignores_include_and_predicate() {
        assert_eq!(
            parse_index_columns(
                "CREATE INDEX i ON t USING btree (a) INCLUDE (b) WHERE (deleted_at IS NULL)"
            ),
            vec!["a"]
        );
        assert!(parse_index_columns("garbage").is_empty());
    }

    #[test]
    fn canonical_table_names() {
        assert_eq!(canonical_table("public.Users"), "users");
        assert_eq!(canonical_table("\"sales\".\"Orders\""), "sales.orders");
        assert_eq!(canonical_table("orders"), "orders");
    }

    #[test]
    fn merge_is_idempotent_and_tracks_usage() {
        let mut catalog = BTreeMap::new();
        let metadata = vec![meta("a", "users", "email", 0), meta("b", "users", "id", 5)];

        let s = merge(&mut catalog, &metadata, 100);
        assert_eq!((s.added, s.updated, s.removed), (2, 0, 0));
        assert_eq!(catalog["a"].last_used, None);
        assert_eq!(catalog["b"].last_used, Some(100));

        let s = merge(&mut catalog, &metadata, 200);
        assert_eq!((s.added, s.updated, s.removed), (0, 2, 0));
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog["b"].last_used, Some(100));
        assert_eq!(catalog["a"].first_seen, 100);

        let grown = vec![meta("a", "users", "email", 3), meta("b", "users", "id", 5)];
        merge(&mut catalog, &grown, 300);
        assert_eq!(catalog["a"].last_used, Some(300));
        assert_eq!(catalog["a"].usage_count, 3);
    }

    #[test]
    fn merge_removes_absent_indexes() {
        let mut catalog = BTreeMap::new();
        merge(&mut catalog, &[meta("a", "t", "x", 0), meta("b", "t", "y", 0)], 0);
        let s = merge(&mut catalog, &[meta("b", "t", "y", 0)], 1);
        assert_eq!(s.removed, 1);
        assert!(!catalog.contains_key("a"));
    }

    #[test]
    fn leads_with() {
        let mut catalog = BTreeMap::new();
        merge(&mut catalog, &[meta("a", "t", "x, y", 0)], 0);
        let idx = &catalog["a"];
        assert!(idx.leads_with(&["x".to_string()]));
        assert!(idx.leads_with(&["x".to_string(), "y".to_string()]));
        assert!(!idx.leads_with(&["y".to_string()]));
        assert!(!idx.leads_with(&[]));
    }
}
