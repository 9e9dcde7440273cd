use crate::errors::{AppError, AppResult};
use crate::models::{BoundQuery, FilterValues, FlatRow};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::HashMap;

/// Substituted for a placeholder whose filter is missing, null or empty.
/// Only meaningful inside `LIKE` comparisons.
pub const WILDCARD_LITERAL: &str = "'%'";

// Quoted literals, quoted identifiers and `::` casts are matched first so the
// placeholder arm never fires inside them. Group 2 catches positional `$N`
// tokens already present in the template.
static NAMED_PARAM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"'(?:[^']|'')*'|"(?:[^"]|"")*"|::|:([A-Za-z_][A-Za-z0-9_]*)|(\$[0-9]+)"#)
        .expect("valid named parameter regex")
});

static ROW_PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"'(?:[^']|'')*'|\{([^{}\s][^{}]*)\}").expect("valid row placeholder regex")
});

fn is_bindable(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::String(text) => !text.is_empty(),
        _ => true,
    }
}

/// Rejects templates that already carry positional `$N` parameters outside
/// quoted text. Those would share slots with the indices allocated by
/// [`bind_parameters`].
pub fn ensure_no_positional_params(template: &str) -> AppResult<()> {
    match NAMED_PARAM_RE
        .captures_iter(template)
        .find_map(|caps| caps.get(2))
    {
        Some(token) => Err(AppError::Configuration(format!(
            "card SQL must use :name placeholders, found positional parameter {}",
            token.as_str()
        ))),
        None => Ok(()),
    }
}

/// Rewrites `:identifier` placeholders into `$N` positional parameters.
///
/// Distinct identifiers are numbered in order of first appearance and every
/// repeat of an identifier reuses its index. Identifiers without a usable
/// filter value become [`WILDCARD_LITERAL`] and consume no index. Positional
/// tokens already in the template are left as-is; callers screen them with
/// [`ensure_no_positional_params`] first.
pub fn bind_parameters(template: &str, filters: &FilterValues) -> BoundQuery {
    let mut slots: HashMap<String, Option<usize>> = HashMap::new();
    let mut values = Vec::new();

    let sql = NAMED_PARAM_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let Some(name) = caps.get(1).map(|m| m.as_str()) else {
                return caps[0].to_string();
            };
            let slot = *slots.entry(name.to_string()).or_insert_with(|| {
                filters.get(name).filter(|value| is_bindable(value)).map(|value| {
                    values.push(value.clone());
                    values.len()
                })
            });
            match slot {
                Some(index) => format!("${}", index),
                None => WILDCARD_LITERAL.to_string(),
            }
        })
        .into_owned();

    BoundQuery { sql, values }
}

/// Binds the `{column}` placeholders of a drill-down template to the values
/// of a clicked row. JSON null binds SQL NULL.
pub fn bind_row_placeholders(template: &str, row: &FlatRow) -> AppResult<BoundQuery> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut values = Vec::new();
    let mut missing: Option<String> = None;

    let sql = ROW_PLACEHOLDER_RE
        .replace_all(template, |caps: &Captures<'_>| {
            let Some(column) = caps.get(1).map(|m| m.as_str()) else {
                return caps[0].to_string();
            };
            if let Some(index) = slots.get(column) {
                return format!("${}", index);
            }
            let Some(value) = row.get(column) else {
                missing.get_or_insert_with(|| column.to_string());
                return caps[0].to_string();
            };
            values.push(value.clone());
            slots.insert(column.to_string(), values.len());
            format!("${}", values.len())
        })
        .into_owned();

    if let Some(column) = missing {
        return Err(AppError::Validation(format!(
            "Drill-down placeholder '{{{}}}' has no matching column in the selected row",
            column
        )));
    }

    Ok(BoundQuery { sql, values })
}
