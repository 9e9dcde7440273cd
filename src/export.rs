use crate::models::FlatRow;
use serde_json::Value;

fn csv_cell(value: Option<&Value>) -> String {
    let text = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    };
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text
    }
}

/// Renders a rowset as CSV using the first row's columns as the header.
pub fn rows_to_csv(rows: &[FlatRow]) -> String {
    let Some(first) = rows.first() else {
        return String::new();
    };
    let headers: Vec<&String> = first.keys().collect();

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(
        headers
            .iter()
            .map(|header| csv_cell(Some(&Value::String((*header).clone()))))
            .collect::<Vec<_>>()
            .join(","),
    );
    for row in rows {
        lines.push(
            headers
                .iter()
                .map(|header| csv_cell(row.get(header.as_str())))
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    lines.join("\n")
}
