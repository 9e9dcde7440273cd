use crate::adapters::{CardStore, QueryExecutor};
use crate::binder::{bind_parameters, bind_row_placeholders, ensure_no_positional_params};
use crate::config::GuardSettings;
use crate::errors::{AppError, AppResult};
use crate::filters::{parse_filter_payload, resolve_filters};
use crate::guard::{validate_and_bound, QueryGuardResult};
use crate::models::{
    BoundQuery, CardDataRequest, CardDataResponse, CardDefinition, EmptyCell, FlatRow, PivotSpec,
    PivotedCardData,
};
use crate::pivot::{pivot, validate_spec};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// End-to-end card-data pipeline: lookup, filter binding, guard, execution
/// and optional pivot.
#[derive(Clone)]
pub struct CardQueryService {
    cards: Arc<dyn CardStore>,
    executor: Arc<dyn QueryExecutor>,
    guard: GuardSettings,
    empty_cell: EmptyCell,
}

impl CardQueryService {
    pub fn new(cards: Arc<dyn CardStore>, executor: Arc<dyn QueryExecutor>, guard: GuardSettings) -> Self {
        Self {
            cards,
            executor,
            guard,
            empty_cell: EmptyCell::default(),
        }
    }

    /// Empty-cell mode for pivot specs that do not set one themselves.
    pub fn with_empty_cell(mut self, empty_cell: EmptyCell) -> Self {
        self.empty_cell = empty_cell;
        self
    }

    pub async fn card_data(
        &self,
        tenant_id: &str,
        card_id: &str,
        request: CardDataRequest,
    ) -> AppResult<CardDataResponse> {
        let span = tracing::info_span!(
            "card_data",
            request_id = %Uuid::new_v4(),
            tenant_id = %tenant_id,
            card_id = %card_id
        );
        self.card_data_inner(tenant_id, card_id, request).instrument(span).await
    }

    async fn card_data_inner(
        &self,
        tenant_id: &str,
        card_id: &str,
        request: CardDataRequest,
    ) -> AppResult<CardDataResponse> {
        let started = Instant::now();
        let card = self.active_card(tenant_id, card_id).await?;
        let pivot_spec = self.effective_pivot_spec(&card)?;

        let supplied = parse_filter_payload(&request.filters)?;
        let resolved = resolve_filters(&card.filters, &supplied)?;
        ensure_no_positional_params(&card.sql_template)?;
        let bound = bind_parameters(&card.sql_template, &resolved);

        let rows = self.run_guarded(&card.id, bound).await?;

        let response = match pivot_spec {
            Some(spec) => {
                let data = pivot(&rows, &spec)?;
                CardDataResponse::Pivoted(PivotedCardData {
                    data,
                    raw_data: rows,
                    pivot_config: spec,
                })
            }
            None => CardDataResponse::Rows(rows),
        };

        info!(
            row_count = response.row_count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "card data served"
        );
        Ok(response)
    }

    /// Runs the card's drill-down query for one clicked row.
    pub async fn drilldown_data(&self, tenant_id: &str, card_id: &str, row: &FlatRow) -> AppResult<Vec<FlatRow>> {
        let span = tracing::info_span!(
            "drilldown_data",
            request_id = %Uuid::new_v4(),
            tenant_id = %tenant_id,
            card_id = %card_id
        );
        async {
            let started = Instant::now();
            let card = self.active_card(tenant_id, card_id).await?;
            if !card.drilldown_enabled {
                return Err(AppError::Validation(format!(
                    "Drill-down is not enabled for card {}",
                    card.id
                )));
            }
            let template = card
                .drilldown_query
                .as_deref()
                .map(str::trim)
                .filter(|query| !query.is_empty())
                .ok_or_else(|| {
                    AppError::Validation(format!("Card {} has no drill-down query", card.id))
                })?;

            ensure_no_positional_params(template)?;
            let bound = bind_row_placeholders(template, row)?;
            let rows = self.run_guarded(&card.id, bound).await?;

            info!(
                row_count = rows.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "drill-down served"
            );
            Ok(rows)
        }
        .instrument(span)
        .await
    }

    async fn active_card(&self, tenant_id: &str, card_id: &str) -> AppResult<CardDefinition> {
        match self.cards.get_card(tenant_id, card_id).await? {
            Some(card) if card.is_active => Ok(card),
            _ => Err(AppError::NotFound(format!("Card {} not found", card_id))),
        }
    }

    fn effective_pivot_spec(&self, card: &CardDefinition) -> AppResult<Option<PivotSpec>> {
        if !card.pivot_enabled {
            return Ok(None);
        }
        let mut spec = card.pivot_config.clone().ok_or_else(|| {
            AppError::Validation(format!("Card {} has pivot enabled but no pivot config", card.id))
        })?;
        spec.empty_cell.get_or_insert(self.empty_cell);
        validate_spec(&spec)?;
        Ok(Some(spec))
    }

    async fn run_guarded(&self, card_id: &str, bound: BoundQuery) -> AppResult<Vec<FlatRow>> {
        let verdict = validate_and_bound(&bound.sql, card_id, &self.guard);
        if let QueryGuardResult::Rejected(reason) = &verdict {
            warn!(reason = %reason, "card query rejected by guard");
        }
        let sql = verdict.into_sql()?;

        debug!(sql = %sql, param_count = bound.values.len(), "executing card query");
        self.executor.execute(&sql, &bound.values).await.map_err(|err| {
            error!(error = %err, "card query failed");
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::CardQueryService;
    use crate::adapters::{MemoryCardStore, QueryExecutor};
    use crate::config::GuardSettings;
    use crate::errors::{AppError, AppResult};
    use crate::models::{
        Aggregation, CardDataRequest, CardDataResponse, CardDefinition, EmptyCell, FilterDefinition, FlatRow,
        PivotSpec,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingExecutor {
        rows: Vec<FlatRow>,
        fail: bool,
        calls: Mutex<Vec<(String, Vec<Value>)>>,
    }

    impl RecordingExecutor {
        fn with_rows(rows: Value) -> Self {
            Self {
                rows: serde_json::from_value(rows).expect("rows"),
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, Vec<Value>)> {
            self.calls.lock().expect("calls").clone()
        }
    }

    #[async_trait]
    impl QueryExecutor for RecordingExecutor {
        async fn execute(&self, sql: &str, values: &[Value]) -> AppResult<Vec<FlatRow>> {
            self.calls
                .lock()
                .expect("calls")
                .push((sql.to_string(), values.to_vec()));
            if self.fail {
                return Err(AppError::Execution("relation \"orders\" does not exist".to_string()));
            }
            Ok(self.rows.clone())
        }
    }

    fn card() -> CardDefinition {
        CardDefinition {
            id: "42".to_string(),
            tenant_id: "acme".to_string(),
            title: "Sales".to_string(),
            sql_template: "SELECT region, q, sales FROM orders WHERE region LIKE :region".to_string(),
            pivot_enabled: false,
            pivot_config: None,
            drilldown_enabled: false,
            drilldown_query: None,
            is_active: true,
            filters: vec![FilterDefinition {
                name: "Region".to_string(),
                sql_parameter: "region".to_string(),
                default_value: None,
                is_required: false,
            }],
        }
    }

    fn service(card: CardDefinition, executor: Arc<RecordingExecutor>, guard: GuardSettings) -> CardQueryService {
        CardQueryService::new(Arc::new(MemoryCardStore::from_cards([card])), executor, guard)
    }

    fn request(filters: Value) -> CardDataRequest {
        CardDataRequest { filters }
    }

    #[tokio::test]
    async fn binds_filters_and_wraps_with_row_cap() {
        let executor = Arc::new(RecordingExecutor::with_rows(json!([{"region": "E", "q": "Q1", "sales": 10}])));
        let svc = service(card(), executor.clone(), GuardSettings::default());

        let response = svc
            .card_data("acme", "42", request(json!({"Region": "E%"})))
            .await
            .expect("card data");
        assert_eq!(response.row_count(), 1);

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].0,
            "SELECT * FROM (SELECT region, q, sales FROM orders WHERE region LIKE $1) AS subquery LIMIT 1000"
        );
        assert_eq!(calls[0].1, vec![json!("E%")]);
    }

    #[tokio::test]
    async fn missing_filter_falls_back_to_wildcard() {
        let executor = Arc::new(RecordingExecutor::default());
        let svc = service(card(), executor.clone(), GuardSettings::default());

        svc.card_data("acme", "42", CardDataRequest::default())
            .await
            .expect("card data");
        let calls = executor.calls();
        assert!(calls[0].0.contains("region LIKE '%'"));
        assert!(calls[0].1.is_empty());
    }

    #[tokio::test]
    async fn pivots_and_keeps_raw_rows() {
        let mut pivot_card = card();
        pivot_card.pivot_enabled = true;
        pivot_card.pivot_config = Some(PivotSpec {
            row_fields: vec!["region".to_string()],
            column_fields: vec!["q".to_string()],
            value_field: "sales".to_string(),
            aggregation: Aggregation::Sum,
            empty_cell: None,
        });
        let executor = Arc::new(RecordingExecutor::with_rows(json!([
            {"region": "E", "q": "Q1", "sales": 10},
            {"region": "E", "q": "Q2", "sales": 5},
            {"region": "W", "q": "Q1", "sales": 7}
        ])));
        let svc = service(pivot_card, executor, GuardSettings::default()).with_empty_cell(EmptyCell::Null);

        let response = svc
            .card_data("acme", "42", CardDataRequest::default())
            .await
            .expect("card data");
        let CardDataResponse::Pivoted(pivoted) = response else {
            panic!("expected pivoted response");
        };
        assert_eq!(pivoted.data.len(), 2);
        assert_eq!(pivoted.raw_data.len(), 3);
        assert_eq!(pivoted.data[1]["q:Q2"], json!(null));
        assert_eq!(pivoted.pivot_config.empty_cell, Some(EmptyCell::Null));
    }

    #[tokio::test]
    async fn rejected_query_never_reaches_executor() {
        let mut bad = card();
        bad.sql_template = "DELETE FROM orders".to_string();
        let executor = Arc::new(RecordingExecutor::default());
        let svc = service(bad, executor.clone(), GuardSettings::default());

        let err = svc
            .card_data("acme", "42", CardDataRequest::default())
            .await
            .expect_err("rejected");
        assert!(matches!(err, AppError::Configuration(_)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn allowlist_blocks_unlisted_cards() {
        let executor = Arc::new(RecordingExecutor::default());
        let guard = GuardSettings {
            allowlist_enabled: true,
            allowed_ids: BTreeSet::from(["7".to_string()]),
            ..GuardSettings::default()
        };
        let svc = service(card(), executor.clone(), guard);

        let err = svc
            .card_data("acme", "42", CardDataRequest::default())
            .await
            .expect_err("not allowlisted");
        assert!(matches!(err, AppError::Configuration(_)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_and_inactive_cards_are_not_found() {
        let mut inactive = card();
        inactive.is_active = false;
        let svc = service(inactive, Arc::new(RecordingExecutor::default()), GuardSettings::default());

        for (tenant, id) in [("acme", "42"), ("acme", "missing"), ("globex", "42")] {
            let err = svc
                .card_data(tenant, id, CardDataRequest::default())
                .await
                .expect_err("not found");
            assert!(matches!(err, AppError::NotFound(_)));
        }
    }

    #[tokio::test]
    async fn malformed_pivot_spec_fails_before_execution() {
        let mut pivot_card = card();
        pivot_card.pivot_enabled = true;
        pivot_card.pivot_config = Some(PivotSpec {
            row_fields: vec!["region".to_string()],
            column_fields: vec![],
            value_field: String::new(),
            aggregation: Aggregation::Sum,
            empty_cell: None,
        });
        let executor = Arc::new(RecordingExecutor::default());
        let svc = service(pivot_card, executor.clone(), GuardSettings::default());

        let err = svc
            .card_data("acme", "42", CardDataRequest::default())
            .await
            .expect_err("invalid spec");
        assert!(matches!(err, AppError::Validation(_)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn execution_failures_propagate() {
        let executor = Arc::new(RecordingExecutor {
            fail: true,
            ..RecordingExecutor::default()
        });
        let svc = service(card(), executor, GuardSettings::default());

        let err = svc
            .card_data("acme", "42", CardDataRequest::default())
            .await
            .expect_err("execution error");
        assert!(matches!(err, AppError::Execution(_)));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn drilldown_binds_row_values() {
        let mut drill_card = card();
        drill_card.drilldown_enabled = true;
        drill_card.drilldown_query = Some("SELECT * FROM orders WHERE region = {region} AND q = {q}".to_string());
        let executor = Arc::new(RecordingExecutor::with_rows(json!([{"id": 1}])));
        let svc = service(drill_card, executor.clone(), GuardSettings::default());

        let row: FlatRow = serde_json::from_value(json!({"region": "O'Brien", "q": "Q1"})).expect("row");
        let rows = svc.drilldown_data("acme", "42", &row).await.expect("drill");
        assert_eq!(rows.len(), 1);

        let calls = executor.calls();
        assert!(calls[0].0.contains("region = $1 AND q = $2"));
        assert_eq!(calls[0].1, vec![json!("O'Brien"), json!("Q1")]);
    }

    #[tokio::test]
    async fn positional_parameters_in_card_sql_are_rejected() {
        let mut raw = card();
        raw.sql_template = "SELECT * FROM orders WHERE region = $1 AND q = :q".to_string();
        let executor = Arc::new(RecordingExecutor::default());
        let svc = service(raw, executor.clone(), GuardSettings::default());

        let err = svc
            .card_data("acme", "42", request(json!({"q": "Q1"})))
            .await
            .expect_err("positional token");
        assert!(matches!(err, AppError::Configuration(_)));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn drilldown_requires_enabled_card() {
        let svc = service(card(), Arc::new(RecordingExecutor::default()), GuardSettings::default());
        let err = svc
            .drilldown_data("acme", "42", &FlatRow::new())
            .await
            .expect_err("disabled");
        assert!(matches!(err, AppError::Validation(_)));
    }
}
