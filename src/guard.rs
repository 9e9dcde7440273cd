//! Read-only statement guard for card SQL.
//!
//! The checks are a denylist over the statement text, not a parser. They
//! reject some legitimate SELECTs (a keyword such as `update` inside a string
//! literal or identifier) and cannot catch every injection shape, so they are
//! a first line of defence only.

use crate::config::GuardSettings;
use crate::errors::AppError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

static SELECT_PREFIX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\s*select\b").expect("valid select regex"));

static FORBIDDEN_KEYWORD_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(insert|update|delete|drop|alter|create|truncate|grant|revoke)\b")
        .expect("valid keyword regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Empty,
    NotSelect,
    MultipleStatements,
    Comment,
    ForbiddenKeyword(String),
    NotPermitted(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "query is empty"),
            Self::NotSelect => write!(f, "only SELECT statements are permitted"),
            Self::MultipleStatements => write!(f, "multiple statements are not permitted"),
            Self::Comment => write!(f, "SQL comments are not permitted"),
            Self::ForbiddenKeyword(keyword) => {
                write!(f, "forbidden keyword '{}' in query", keyword)
            }
            Self::NotPermitted(card_id) => {
                write!(f, "card '{}' is not permitted to execute queries", card_id)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryGuardResult {
    Accepted(String),
    Rejected(RejectReason),
}

impl QueryGuardResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Converts a rejection into [`AppError::Configuration`]; a rejected
    /// statement must never reach execution.
    pub fn into_sql(self) -> Result<String, AppError> {
        match self {
            Self::Accepted(sql) => Ok(sql),
            Self::Rejected(reason) => Err(AppError::Configuration(reason.to_string())),
        }
    }
}

fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    match trimmed.strip_suffix(';') {
        Some(stripped) => stripped.trim_end(),
        None => trimmed,
    }
}

fn check_shape(statement: &str) -> Result<(), RejectReason> {
    if statement.is_empty() {
        return Err(RejectReason::Empty);
    }
    if !SELECT_PREFIX_RE.is_match(statement) {
        return Err(RejectReason::NotSelect);
    }
    if statement.contains(';') {
        return Err(RejectReason::MultipleStatements);
    }
    if statement.contains("--") || statement.contains("/*") {
        return Err(RejectReason::Comment);
    }
    if let Some(keyword) = FORBIDDEN_KEYWORD_RE.find(statement) {
        return Err(RejectReason::ForbiddenKeyword(keyword.as_str().to_ascii_lowercase()));
    }
    Ok(())
}

/// Validates an already-bound statement and wraps it in a row-capping
/// subquery.
pub fn validate_and_bound(sql: &str, card_id: &str, settings: &GuardSettings) -> QueryGuardResult {
    if settings.allowlist_enabled && !settings.allowed_ids.contains(card_id) {
        return QueryGuardResult::Rejected(RejectReason::NotPermitted(card_id.to_string()));
    }

    let statement = strip_trailing_semicolon(sql);
    if let Err(reason) = check_shape(statement) {
        return QueryGuardResult::Rejected(reason);
    }

    QueryGuardResult::Accepted(format!(
        "SELECT * FROM ({}) AS subquery LIMIT {}",
        statement, settings.max_rows
    ))
}
