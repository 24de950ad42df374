//! Normalization of SQL statements into grouping keys.
//!
//! Two executions of the same statement that differ only in literal values or
//! whitespace map to the same key, so their samples fold into one profile:
//! `SELECT * FROM users WHERE id = 5` and `SELECT *  FROM users WHERE id=42`
//! both become `SELECT * FROM users WHERE id=?`. Keyword case is preserved.
//!
//! Rules, applied in this order:
//! 1. single-quoted string literals (with `''` escapes) → `?`
//! 2. bind parameters (`$1`, `$2`, ...) → `?`
//! 3. numeric literals → `?`
//! 4. `NULL` in any case → `?`
//! 5. whitespace runs → one space
//! 6. spaces around `= < > ! , ( ) ;` removed
//! 7. leading/trailing whitespace trimmed

use std::sync::LazyLock;

use regex::Regex;

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"'(?:[^']|'')*'").expect("valid regex"));
static BIND_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\d+").expect("valid regex"));
static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").expect("valid regex"));
static NULL_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnull\b").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));
static PUNCT_SPACING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*([=<>!,();])\s*").expect("valid regex"));

/// Normalize a SQL statement into its grouping key. Never fails.
///
/// `normalize(&normalize(q)) == normalize(q)` for every input.
pub fn normalize(query: &str) -> String {
    let s = STRING_LITERAL.replace_all(query, "?");
    let s = BIND_PARAM.replace_all(&s, "?");
    let s = NUMBER.replace_all(&s, "?");
    let s = NULL_LITERAL.replace_all(&s, "?");
    let s = WHITESPACE.replace_all(&s, " ");
    let s = PUNCT_SPACING.replace_all(&s, "$1");
    s.trim().to_string()
}
