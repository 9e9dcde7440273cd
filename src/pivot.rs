//! Pivot engine: cross-tabulates a flat rowset.
//!
//! Rows are grouped by the `rowFields` values (output rows, first-seen
//! order) and by the `columnFields` values (output columns, global
//! first-seen order). Each cell aggregates the `valueField` numbers that
//! fell into that row/column combination.

use crate::errors::{AppError, AppResult};
use crate::models::{Aggregation, EmptyCell, FlatRow, PivotSpec, PivotedRow};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Canonical string form of a grouping value. Both grouping and
/// [`drill_into`] compare through this form.
pub fn canonical_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

/// Numeric coercion of a value-field entry; anything non-numeric counts as 0.
pub fn numeric_value(value: Option<&Value>) -> f64 {
    let parsed = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => text.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|n| n.is_finite()).unwrap_or(0.0)
}

fn number_value(value: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        return Value::from(value as i64);
    }
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

pub fn validate_spec(spec: &PivotSpec) -> AppResult<()> {
    if spec.value_field.trim().is_empty() {
        return Err(AppError::Validation("pivotConfig.valueField is required".to_string()));
    }

    for (axis, fields) in [("rowFields", &spec.row_fields), ("columnFields", &spec.column_fields)] {
        let mut seen = BTreeSet::new();
        for field in fields {
            if field.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "pivotConfig.{} cannot contain an empty field name",
                    axis
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(AppError::Validation(format!(
                    "Duplicate field '{}' in pivotConfig.{}",
                    field, axis
                )));
            }
        }
    }

    if let Some(field) = spec
        .row_fields
        .iter()
        .find(|field| spec.column_fields.contains(field))
    {
        return Err(AppError::Validation(format!(
            "Field '{}' cannot be both a row field and a column field",
            field
        )));
    }

    if spec.column_fields.is_empty() && spec.row_fields.contains(&spec.value_field) {
        return Err(AppError::Validation(format!(
            "valueField '{}' would overwrite its own row field; add a column field or alias the value column",
            spec.value_field
        )));
    }

    Ok(())
}

/// Every output key must be distinct: row fields first, then one label per
/// column key.
fn check_labels(spec: &PivotSpec, labels: &[String]) -> AppResult<()> {
    let mut seen: BTreeSet<&str> = spec.row_fields.iter().map(String::as_str).collect();
    for label in labels {
        if !seen.insert(label.as_str()) {
            return Err(AppError::Validation(format!(
                "Pivot column label '{}' is ambiguous for these rows",
                label
            )));
        }
    }
    Ok(())
}

fn key_parts(row: &FlatRow, fields: &[String]) -> Vec<String> {
    fields
        .iter()
        .map(|field| canonical_value(row.get(field)))
        .collect()
}

fn column_label(spec: &PivotSpec, parts: &[String]) -> String {
    if spec.column_fields.is_empty() {
        return spec.value_field.clone();
    }
    spec.column_fields
        .iter()
        .zip(parts)
        .map(|(field, value)| format!("{}:{}", field, value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn aggregate(values: &[f64], aggregation: Aggregation) -> f64 {
    match aggregation {
        Aggregation::Sum => values.iter().sum(),
        Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
        Aggregation::Count => values.len() as f64,
        Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
    }
}

struct RowGroup {
    parts: Vec<String>,
    cells: HashMap<usize, Vec<f64>>,
}

/// Cross-tabulates `rows` according to `spec`.
pub fn pivot(rows: &[FlatRow], spec: &PivotSpec) -> AppResult<Vec<PivotedRow>> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    validate_spec(spec)?;

    let mut row_index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut groups: Vec<RowGroup> = Vec::new();
    let mut column_index: HashMap<Vec<String>, usize> = HashMap::new();
    let mut columns: Vec<Vec<String>> = Vec::new();

    for row in rows {
        let row_key = key_parts(row, &spec.row_fields);
        let col_key = key_parts(row, &spec.column_fields);
        let value = numeric_value(row.get(&spec.value_field));

        let col_slot = match column_index.get(&col_key) {
            Some(slot) => *slot,
            None => {
                columns.push(col_key.clone());
                column_index.insert(col_key, columns.len() - 1);
                columns.len() - 1
            }
        };

        let group_slot = match row_index.get(&row_key) {
            Some(slot) => *slot,
            None => {
                groups.push(RowGroup {
                    parts: row_key.clone(),
                    cells: HashMap::new(),
                });
                row_index.insert(row_key, groups.len() - 1);
                groups.len() - 1
            }
        };

        groups[group_slot]
            .cells
            .entry(col_slot)
            .or_default()
            .push(value);
    }

    let labels: Vec<String> = columns.iter().map(|parts| column_label(spec, parts)).collect();
    check_labels(spec, &labels)?;
    let empty_cell = match spec.empty_cell.unwrap_or_default() {
        EmptyCell::Zero => Value::from(0),
        EmptyCell::Null => Value::Null,
    };

    let output = groups
        .into_iter()
        .map(|group| {
            let mut out = PivotedRow::new();
            for (field, value) in spec.row_fields.iter().zip(group.parts) {
                out.insert(field.clone(), Value::String(value));
            }
            for (slot, label) in labels.iter().enumerate() {
                let cell = match group.cells.get(&slot) {
                    Some(values) => number_value(aggregate(values, spec.aggregation)),
                    None => empty_cell.clone(),
                };
                out.insert(label.clone(), cell);
            }
            out
        })
        .collect();

    Ok(output)
}

fn matches_row_fields(raw: &FlatRow, pivoted_row: &PivotedRow, spec: &PivotSpec) -> bool {
    spec.row_fields
        .iter()
        .all(|field| canonical_value(raw.get(field)) == canonical_value(pivoted_row.get(field)))
}

/// Source rows behind one pivoted row: every raw row whose `rowFields`
/// values equal the pivoted row's.
pub fn drill_into(pivoted_row: &PivotedRow, raw_rows: &[FlatRow], spec: &PivotSpec) -> Vec<FlatRow> {
    raw_rows
        .iter()
        .filter(|raw| matches_row_fields(raw, pivoted_row, spec))
        .cloned()
        .collect()
}

/// Source rows behind a single cell of a pivoted row, identified by the
/// column label it was emitted under.
pub fn drill_into_cell(
    pivoted_row: &PivotedRow,
    column: &str,
    raw_rows: &[FlatRow],
    spec: &PivotSpec,
) -> Vec<FlatRow> {
    raw_rows
        .iter()
        .filter(|raw| {
            matches_row_fields(raw, pivoted_row, spec)
                && column_label(spec, &key_parts(raw, &spec.column_fields)) == column
        })
        .cloned()
        .collect()
}
