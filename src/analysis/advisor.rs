//! Lexical advisors for slow queries.
//!
//! Each advisor scans the raw text of a slow query and may emit rewrite or
//! indexing hints. Index existence is checked against the optimizer's catalog.

use std::sync::LazyLock;

use regex::Regex;

use super::QueryPerformanceProfile;
use super::report::{Recommendation, RecommendationKind};
use crate::optimizer::recommend::{extract_table, unqualify};
use crate::optimizer::{Optimizer, Priority, canonical_table};

static SELECT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bselect\s+(?:distinct\s+)?\*").expect("valid regex"));
static ORDER_BY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\border\s+by\s+([\w."]+)"#).expect("valid regex"));
static LIMIT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blimit\b").expect("valid regex"));
static LEADING_WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:i?like)\s+'%").expect("valid regex"));
static JOIN_ON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\bjoin\s+([\w."]+)(?:\s+(?:as\s+)?([a-z_]\w*))?\s+on\s+([\w."]+)\s*=\s*([\w."]+)"#,
    )
    .expect("valid regex")
});

/// Inputs an advisor sees for one slow query.
pub struct AdviceContext<'a> {
    pub profile: &'a QueryPerformanceProfile,
    pub optimizer: &'a Optimizer,
}

pub trait QueryAdvisor: Send + Sync {
    fn id(&self) -> &'static str;
    fn evaluate(&self, ctx: &AdviceContext) -> Vec<Recommendation>;
}

pub fn all_advisors() -> Vec<Box<dyn QueryAdvisor>> {
    vec![
        Box::new(SelectStarAdvisor),
        Box::new(OrderByLimitAdvisor),
        Box::new(LeadingWildcardAdvisor),
        Box::new(JoinIndexAdvisor),
    ]
}

fn rewrite(ctx: &AdviceContext, priority: Priority, message: String) -> Recommendation {
    Recommendation {
        kind: RecommendationKind::QueryRewrite,
        priority,
        query_key: ctx.profile.key.clone(),
        table: None,
        columns: Vec::new(),
        message,
    }
}

fn missing_index(ctx: &AdviceContext, table: String, column: String, why: &str) -> Recommendation {
    Recommendation {
        kind: RecommendationKind::Index,
        priority: Priority::High,
        query_key: ctx.profile.key.clone(),
        message: format!("Create an index on {table}({column}) {why}"),
        table: Some(table),
        columns: vec![column],
    }
}

// ============================================================
// SelectStarAdvisor
// ============================================================

pub struct SelectStarAdvisor;

impl QueryAdvisor for SelectStarAdvisor {
    fn id(&self) -> &'static str {
        "select_star"
    }

    fn evaluate(&self, ctx: &AdviceContext) -> Vec<Recommendation> {
        if !SELECT_STAR.is_match(&ctx.profile.sample_query) {
            return Vec::new();
        }
        vec![rewrite(
            ctx,
            Priority::Medium,
            "Avoid SELECT *: fetch only the columns the caller uses".to_string(),
        )]
    }
}

// ============================================================
// OrderByLimitAdvisor
// ============================================================

pub struct OrderByLimitAdvisor;

impl QueryAdvisor for OrderByLimitAdvisor {
    fn id(&self) -> &'static str {
        "order_by_limit"
    }

    fn evaluate(&self, ctx: &AdviceContext) -> Vec<Recommendation> {
        let query = &ctx.profile.sample_query;
        if !LIMIT.is_match(query) {
            return Vec::new();
        }
        let Some(column) = ORDER_BY.captures(query).map(|c| unqualify(&c[1])) else {
            return Vec::new();
        };
        let Some(table) = extract_table(query) else {
            return Vec::new();
        };
        if ctx.optimizer.has_index_leading_with(&table, &column) {
            return Vec::new();
        }
        vec![missing_index(ctx, table, column, "so ORDER BY ... LIMIT can stop early")]
    }
}

// ============================================================
// LeadingWildcardAdvisor
// ============================================================

pub struct LeadingWildcardAdvisor;

impl QueryAdvisor for LeadingWildcardAdvisor {
    fn id(&self) -> &'static str {
        "leading_wildcard"
    }

    fn evaluate(&self, ctx: &AdviceContext) -> Vec<Recommendation> {
        if !LEADING_WILDCARD.is_match(&ctx.profile.sample_query) {
            return Vec::new();
        }
        vec![rewrite(
            ctx,
            Priority::Medium,
            "LIKE '%...' cannot use a btree index; consider a trigram index or full-text search"
                .to_string(),
        )]
    }
}

// ============================================================
// JoinIndexAdvisor
// ============================================================

pub struct JoinIndexAdvisor;

impl QueryAdvisor for JoinIndexAdvisor {
    fn id(&self) -> &'static str {
        "join_index"
    }

    fn evaluate(&self, ctx: &AdviceContext) -> Vec<Recommendation> {
        let mut out = Vec::new();
        for caps in JOIN_ON.captures_iter(&ctx.profile.sample_query) {
            let table = canonical_table(&caps[1]);
            let alias = caps
                .get(2)
                .map(|m| m.as_str().to_ascii_lowercase())
                .unwrap_or_else(|| unqualify(&table));

            let column = [&caps[3], &caps[4]]
                .into_iter()
                .find(|side| {
                    side.rsplit_once('.').is_some_and(|(q, _)| {
                        let q = canonical_table(q);
                        q == alias || q == table
                    })
                })
                .unwrap_or(&caps[4]);
            let column = unqualify(column);

            if !ctx.optimizer.has_index_leading_with(&table, &column) {
                out.push(missing_index(ctx, table, column, "to support the join"));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::OptimizerSettings;
    use crate::provider::{IndexMetadata, QueryStatRecord};

    fn profile(query: &str) -> QueryPerformanceProfile {
        let stat = QueryStatRecord {
            query_text: query.to_string(),
            calls: 10,
            total_time_ms: 20_000.0,
            ..Default::default()
        };
        QueryPerformanceProfile::new(crate::analysis::normalize(query), &stat, 0)
    }

    fn optimizer_with(indexes: &[(&str, &str, &str)]) -> Optimizer {
        let optimizer = Optimizer::new(OptimizerSettings::default());
        let metadata = indexes
            .iter()
            .map(|(name, table, cols)| IndexMetadata {
                name: name.to_string(),
                table: table.to_string(),
                definition: format!("CREATE INDEX {name} ON {table} USING btree ({cols})"),
                ..Default::default()
            })
            .collect::<Vec<_>>();
        optimizer.discover_from(&metadata, 0);
        optimizer
    }

    fn run(advisor: &dyn QueryAdvisor, query: &str, optimizer: &Optimizer) -> Vec<Recommendation> {
        let p = profile(query);
        advisor.evaluate(&AdviceContext {
            profile: &p,
            optimizer,
        })
    }

    #[test]
    fn select_star_flagged() {
        let opt = optimizer_with(&[]);
        assert_eq!(run(&SelectStarAdvisor, "select * from users", &opt).len(), 1);
        assert!(run(&SelectStarAdvisor, "select id from users", &opt).is_empty());
    }

    #[test]
    fn order_by_limit_without_index() {
        let opt = optimizer_with(&[]);
        let recs = run(
            &OrderByLimitAdvisor,
            "SELECT id FROM orders ORDER BY o.created_at DESC LIMIT 10",
            &opt,
        );
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].table.as_deref(), Some("orders"));
        assert_eq!(recs[0].columns, vec!["created_at".to_string()]);
    }

    #[test]
    fn order_by_limit_with_index() {
        let opt = optimizer_with(&[("idx_orders_created", "orders", "created_at, id")]);
        assert!(
            run(
                &OrderByLimitAdvisor,
                "SELECT id FROM orders ORDER BY created_at LIMIT 10",
                &opt
            )
            .is_empty()
        );
        // no LIMIT
        let opt = optimizer_with(&[]);
        assert!(run(&OrderByLimitAdvisor, "SELECT id FROM orders ORDER BY created_at", &opt).is_empty());
    }

    #[test]
    fn leading_wildcard_only() {
        let opt = optimizer_with(&[]);
        assert_eq!(
            run(&LeadingWildcardAdvisor, "SELECT * FROM p WHERE name LIKE '%phone'", &opt).len(),
            1
        );
        assert!(run(&LeadingWildcardAdvisor, "SELECT * FROM p WHERE name LIKE 'phone%'", &opt).is_empty());
    }

    #[test]
    fn join_column_resolved_through_alias() {
        let opt = optimizer_with(&[]);
        let recs = run(
            &JoinIndexAdvisor,
            "SELECT u.id FROM users u JOIN orders o ON u.id = o.user_id WHERE u.id = 1",
            &opt,
        );
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].table.as_deref(), Some("orders"));
        assert_eq!(recs[0].columns, vec!["user_id".to_string()]);

        let opt = optimizer_with(&[("idx_orders_user_id", "orders", "user_id")]);
        assert!(
            run(
                &JoinIndexAdvisor,
                "SELECT u.id FROM users u JOIN orders o ON u.id = o.user_id",
                &opt
            )
            .is_empty()
        );
    }
}
