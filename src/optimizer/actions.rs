//! DDL statements for index creation and removal.
//!
//! Identifiers are validated before they are spliced into SQL; anything that
//! is not a plain (optionally schema-qualified) identifier is rejected.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::recommend::MAX_IDENTIFIER_LEN;
use crate::provider::ProviderError;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(?:\.[A-Za-z_][A-Za-z0-9_$]*)?$").expect("valid regex")
});

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DdlActionError {
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("no columns given")]
    NoColumns,
    #[error("unknown index {0:?}")]
    UnknownIndex(String),
    #[error("unknown recommendation {0:?}")]
    UnknownRecommendation(String),
    #[error("index {0:?} backs a constraint and is never dropped")]
    Protected(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl DdlActionError {
    /// `true` if the caller supplied bad input (as opposed to a database failure).
    pub fn is_client_error(&self) -> bool {
        !matches!(self, DdlActionError::Provider(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActionOutcome {
    /// Statement computed, not executed.
    DryRun,
    Applied,
    Skipped { reason: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexActionResult {
    pub index_name: String,
    pub table: Option<String>,
    pub statement: Option<String>,
    pub outcome: ActionOutcome,
}

impl IndexActionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ActionOutcome::DryRun | ActionOutcome::Applied)
    }

    pub(crate) fn skipped(index_name: &str, table: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            index_name: index_name.to_string(),
            table: table.map(str::to_string),
            statement: None,
            outcome: ActionOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub(crate) fn failed(index_name: &str, table: Option<&str>, error: &DdlActionError) -> Self {
        Self {
            index_name: index_name.to_string(),
            table: table.map(str::to_string),
            statement: None,
            outcome: ActionOutcome::Failed {
                error: error.to_string(),
            },
        }
    }
}

pub fn validate_identifier(name: &str) -> Result<(), DdlActionError> {
    let parts_fit = name.split('.').all(|p| p.len() <= MAX_IDENTIFIER_LEN);
    if IDENTIFIER.is_match(name) && parts_fit {
        Ok(())
    } else {
        Err(DdlActionError::InvalidIdentifier(name.to_string()))
    }
}

/// `CREATE INDEX CONCURRENTLY IF NOT EXISTS <name> ON <table> (<cols>)`
pub fn create_index_statement(
    name: &str,
    table: &str,
    columns: &[String],
) -> Result<String, DdlActionError> {
    if columns.is_empty() {
        return Err(DdlActionError::NoColumns);
    }
    validate_identifier(name)?;
    if name.contains('.') {
        // index is created in the table's schema
        return Err(DdlActionError::InvalidIdentifier(name.to_string()));
    }
    validate_identifier(table)?;
    for c in columns {
        validate_identifier(c)?;
    }
    Ok(format!(
        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {name} ON {table} ({})",
        columns.join(", ")
    ))
}

/// `DROP INDEX CONCURRENTLY IF EXISTS <schema.name>`, qualified with the
/// table's schema when the table has one.
pub fn drop_index_statement(name: &str, table: &str) -> Result<String, DdlActionError> {
    validate_identifier(name)?;
    let qualified = match table.split_once('.') {
        Some((schema, _)) if !name.contains('.') => format!("{schema}.{name}"),
        _ => name.to_string(),
    };
    validate_identifier(&qualified)?;
    Ok(format!("DROP INDEX CONCURRENTLY IF EXISTS {qualified}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("sales.orders").is_ok());
        assert!(validate_identifier("_t$1").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("users; DROP TABLE x").is_err());
        assert!(validate_identifier("a.b.c").is_err());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn create_statement() {
        let sql = create_index_statement(
            "idx_users_email_0000abcd",
            "users",
            &["email".to_string(), "created_at".to_string()],
        )
        .unwrap();
        assert_eq!(
            sql,
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_users_email_0000abcd ON users (email, created_at)"
        );
        assert_eq!(
            create_index_statement("i", "users", &[]),
            Err(DdlActionError::NoColumns)
        );
        assert!(create_index_statement("i", "users", &["lower(email)".to_string()]).is_err());
        assert!(create_index_statement("s.i", "users", &["a".to_string()]).is_err());
    }

    #[test]
    fn drop_statement_qualifies_schema() {
        assert_eq!(
            drop_index_statement("idx_a", "sales.orders").unwrap(),
            "DROP INDEX CONCURRENTLY IF EXISTS sales.idx_a"
        );
        assert_eq!(
            drop_index_statement("idx_a", "orders").unwrap(),
            "DROP INDEX CONCURRENTLY IF EXISTS idx_a"
        );
    }

    #[test]
    fn client_errors() {
        assert!(DdlActionError::NoColumns.is_client_error());
        assert!(!DdlActionError::Provider(ProviderError::Timeout(1)).is_client_error());
    }
}
