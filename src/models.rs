use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One tuple returned by the data store, column order preserved.
pub type FlatRow = serde_json::Map<String, serde_json::Value>;

/// Pivot output row: row-field columns first, then one column per observed
/// column-key label.
pub type PivotedRow = serde_json::Map<String, serde_json::Value>;

/// End-user filter values keyed by placeholder identifier.
pub type FilterValues = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    #[serde(alias = "average")]
    Avg,
    Count,
    Min,
    Max,
}

/// How a pivot cell with no contributing source rows is emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyCell {
    #[default]
    Zero,
    Null,
}

impl EmptyCell {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zero" | "0" => Some(Self::Zero),
            "null" | "none" => Some(Self::Null),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotSpec {
    pub row_fields: Vec<String>,
    pub column_fields: Vec<String>,
    pub value_field: String,
    pub aggregation: Aggregation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_cell: Option<EmptyCell>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterDefinition {
    pub name: String,
    pub sql_parameter: String,
    #[serde(default)]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub is_required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDefinition {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub title: String,
    pub sql_template: String,
    #[serde(default)]
    pub pivot_enabled: bool,
    #[serde(default)]
    pub pivot_config: Option<PivotSpec>,
    #[serde(default)]
    pub drilldown_enabled: bool,
    #[serde(default)]
    pub drilldown_query: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub filters: Vec<FilterDefinition>,
}

fn default_true() -> bool {
    true
}

/// Positional query produced by the binder: `sql` references `$1..$N` and
/// `values[i]` binds `$(i + 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundQuery {
    pub sql: String,
    pub values: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDataRequest {
    #[serde(default)]
    pub filters: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotedCardData {
    pub data: Vec<PivotedRow>,
    pub raw_data: Vec<FlatRow>,
    pub pivot_config: PivotSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CardDataResponse {
    Pivoted(PivotedCardData),
    Rows(Vec<FlatRow>),
}

impl CardDataResponse {
    pub fn row_count(&self) -> usize {
        match self {
            Self::Rows(rows) => rows.len(),
            Self::Pivoted(pivoted) => pivoted.data.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_pivot_spec_from_camel_case() {
        let spec: PivotSpec = serde_json::from_value(json!({
            "rowFields": ["region"],
            "columnFields": ["qtr"],
            "valueField": "sales",
            "aggregation": "sum"
        }))
        .expect("spec");
        assert_eq!(spec.row_fields, vec!["region".to_string()]);
        assert_eq!(spec.aggregation, Aggregation::Sum);
        assert_eq!(spec.empty_cell, None);
    }

    #[test]
    fn pivoted_response_serializes_with_raw_data_key() {
        let response = CardDataResponse::Pivoted(PivotedCardData {
            data: vec![],
            raw_data: vec![],
            pivot_config: PivotSpec {
                row_fields: vec![],
                column_fields: vec![],
                value_field: "v".to_string(),
                aggregation: Aggregation::Count,
                empty_cell: None,
            },
        });
        let value = serde_json::to_value(&response).expect("serialize");
        assert!(value.get("rawData").is_some());
        assert!(value.get("pivotConfig").is_some());

        let flat = serde_json::to_value(CardDataResponse::Rows(vec![])).expect("serialize");
        assert_eq!(flat, json!([]));
    }

    #[test]
    fn accepts_average_alias_and_rejects_unknown_aggregations() {
        let avg: Aggregation = serde_json::from_value(json!("average")).expect("alias");
        assert_eq!(avg, Aggregation::Avg);
        assert_eq!(serde_json::to_value(avg).expect("serialize"), json!("avg"));
        assert!(serde_json::from_value::<Aggregation>(json!("median")).is_err());
    }
}
