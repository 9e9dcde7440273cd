use crate::errors::{AppError, AppResult};
use crate::models::{FilterDefinition, FilterValues};
use serde_json::Value;

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(text)) => text.is_empty(),
        Some(_) => false,
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Checks the `filters` member of a card-data request: absent or null means
/// no filters, otherwise it must be an object of scalars or scalar lists.
pub fn parse_filter_payload(payload: &Value) -> AppResult<FilterValues> {
    let object = match payload {
        Value::Null => return Ok(FilterValues::new()),
        Value::Object(object) => object,
        _ => {
            return Err(AppError::Validation(
                "filters must be an object mapping filter names to values".to_string(),
            ))
        }
    };

    let mut values = FilterValues::new();
    for (name, value) in object {
        let valid = match value {
            Value::Array(items) => items.iter().all(is_scalar),
            other => is_scalar(other),
        };
        if !valid {
            return Err(AppError::Validation(format!(
                "Filter '{}' must be a scalar or a list of scalars",
                name
            )));
        }
        values.insert(name.clone(), value.clone());
    }
    Ok(values)
}

/// Maps supplied filter values onto SQL parameter names, applying defaults
/// and enforcing required filters.
///
/// A value may be supplied under the filter's `name` or directly under its
/// `sqlParameter`; the latter wins when both are present. Supplied values
/// with no matching definition pass through unchanged.
pub fn resolve_filters(definitions: &[FilterDefinition], supplied: &FilterValues) -> AppResult<FilterValues> {
    let mut resolved = supplied.clone();

    for definition in definitions {
        let parameter = definition.sql_parameter.trim();
        if parameter.is_empty() {
            return Err(AppError::Validation(format!(
                "Filter '{}' has no SQL parameter",
                definition.name
            )));
        }

        let mut value = supplied
            .get(parameter)
            .filter(|value| !is_blank(Some(*value)))
            .or_else(|| supplied.get(&definition.name))
            .cloned();

        if is_blank(value.as_ref()) {
            value = definition.default_value.clone();
        }

        if is_blank(value.as_ref()) {
            if definition.is_required {
                return Err(AppError::Validation(format!(
                    "Filter '{}' is required",
                    definition.name
                )));
            }
            continue;
        }

        if let Some(value) = value {
            if parameter != definition.name {
                resolved.remove(&definition.name);
            }
            resolved.insert(parameter.to_string(), value);
        }
    }

    Ok(resolved)
}
