use crate::adapters::{CardStore, QueryExecutor};
use crate::errors::{AppError, AppResult};
use crate::models::{CardDefinition, FilterDefinition, FlatRow, PivotSpec};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed card catalogue that also executes card queries against the
/// same database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

struct StoredCard {
    id: String,
    tenant_id: String,
    title: String,
    sql_query: String,
    pivot_enabled: bool,
    pivot_config_json: Option<String>,
    drilldown_enabled: bool,
    drilldown_query: Option<String>,
    is_active: bool,
}

impl SqliteStore {
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> AppResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> AppResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> AppResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Execution("database mutex poisoned".to_string()))
    }

    /// Runs `work` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, work: F) -> AppResult<T>
    where
        F: FnOnce(&Connection) -> AppResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || -> AppResult<T> {
            let conn = conn
                .lock()
                .map_err(|_| AppError::Execution("database mutex poisoned".to_string()))?;
            work(&conn)
        })
        .await
        .map_err(|err| AppError::Execution(format!("database task failed: {}", err)))?
    }

    /// Runs arbitrary DDL/DML for seeding. Card queries never go through here.
    pub fn execute_batch(&self, sql: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)?;
        Ok(())
    }

    pub fn save_card(&self, card: &CardDefinition) -> AppResult<()> {
        let pivot_json = card
            .pivot_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboard_cards (
               tenant_id, id, title, sql_query, pivot_enabled, pivot_config_json,
               drilldown_enabled, drilldown_query, is_active
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (tenant_id, id) DO UPDATE SET
               title = excluded.title,
               sql_query = excluded.sql_query,
               pivot_enabled = excluded.pivot_enabled,
               pivot_config_json = excluded.pivot_config_json,
               drilldown_enabled = excluded.drilldown_enabled,
               drilldown_query = excluded.drilldown_query,
               is_active = excluded.is_active",
            params![
                card.tenant_id,
                card.id,
                card.title,
                card.sql_template,
                card.pivot_enabled,
                pivot_json,
                card.drilldown_enabled,
                card.drilldown_query,
                card.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn save_filter(
        &self,
        tenant_id: &str,
        filter_id: &str,
        filter: &FilterDefinition,
        display_order: i64,
    ) -> AppResult<()> {
        let default_json = filter
            .default_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO dashboard_filters (tenant_id, id, name, sql_parameter, default_value_json, display_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tenant_id, id) DO UPDATE SET
               name = excluded.name,
               sql_parameter = excluded.sql_parameter,
               default_value_json = excluded.default_value_json,
               display_order = excluded.display_order",
            params![
                tenant_id,
                filter_id,
                filter.name,
                filter.sql_parameter,
                default_json,
                display_order
            ],
        )?;
        Ok(())
    }

    pub fn attach_filter(&self, tenant_id: &str, card_id: &str, filter_id: &str, is_required: bool) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO card_filters (tenant_id, card_id, filter_id, is_required)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (tenant_id, card_id, filter_id) DO UPDATE SET is_required = excluded.is_required",
            params![tenant_id, card_id, filter_id, is_required],
        )?;
        Ok(())
    }

    fn read_card(conn: &Connection, tenant_id: &str, card_id: &str) -> AppResult<Option<CardDefinition>> {
        let stored = conn
            .query_row(
                "SELECT id, tenant_id, title, sql_query, pivot_enabled, pivot_config_json,
                        drilldown_enabled, drilldown_query, is_active
                 FROM dashboard_cards WHERE tenant_id = ?1 AND id = ?2",
                params![tenant_id, card_id],
                |row| {
                    Ok(StoredCard {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        title: row.get(2)?,
                        sql_query: row.get(3)?,
                        pivot_enabled: row.get(4)?,
                        pivot_config_json: row.get(5)?,
                        drilldown_enabled: row.get(6)?,
                        drilldown_query: row.get(7)?,
                        is_active: row.get(8)?,
                    })
                },
            )
            .optional()?;

        let Some(stored) = stored else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT df.name, df.sql_parameter, df.default_value_json, cf.is_required
             FROM dashboard_filters df
             JOIN card_filters cf ON cf.filter_id = df.id AND cf.tenant_id = df.tenant_id
             WHERE cf.tenant_id = ?1 AND cf.card_id = ?2 AND df.is_active = 1
             ORDER BY df.display_order, df.name",
        )?;
        let raw_filters = stmt
            .query_map(params![tenant_id, card_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let filters = raw_filters
            .into_iter()
            .map(|(name, sql_parameter, default_json, is_required)| {
                let default_value = default_json
                    .as_deref()
                    .map(serde_json::from_str::<serde_json::Value>)
                    .transpose()?;
                Ok(FilterDefinition {
                    name,
                    sql_parameter,
                    default_value,
                    is_required,
                })
            })
            .collect::<AppResult<Vec<_>>>()?;

        let pivot_config = stored
            .pivot_config_json
            .as_deref()
            .map(serde_json::from_str::<PivotSpec>)
            .transpose()
            .map_err(|err| {
                AppError::Validation(format!("Card {} has a malformed pivot config: {}", stored.id, err))
            })?;

        Ok(Some(CardDefinition {
            id: stored.id,
            tenant_id: stored.tenant_id,
            title: stored.title,
            sql_template: stored.sql_query,
            pivot_enabled: stored.pivot_enabled,
            pivot_config,
            drilldown_enabled: stored.drilldown_enabled,
            drilldown_query: stored.drilldown_query,
            is_active: stored.is_active,
            filters,
        }))
    }
}

fn to_sql_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(int) => serde_json::Value::from(int),
        ValueRef::Real(real) => serde_json::Number::from_f64(real)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn run_query(conn: &Connection, sql: &str, values: &[serde_json::Value]) -> AppResult<Vec<FlatRow>> {
    let mut stmt = conn.prepare(sql)?;

    for (idx, value) in values.iter().enumerate() {
        let name = format!("${}", idx + 1);
        let position = stmt.parameter_index(&name)?.ok_or_else(|| {
            AppError::Execution(format!("query has no placeholder {} for bound value", name))
        })?;
        stmt.raw_bind_parameter(position, to_sql_value(value))?;
    }

    let columns: Vec<String> = stmt.column_names().into_iter().map(ToString::to_string).collect();
    let mut rows = stmt.raw_query();
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut flat = FlatRow::new();
        for (idx, column) in columns.iter().enumerate() {
            flat.insert(column.clone(), from_sql_value(row.get_ref(idx)?));
        }
        out.push(flat);
    }
    Ok(out)
}

#[async_trait]
impl CardStore for SqliteStore {
    async fn get_card(&self, tenant_id: &str, card_id: &str) -> AppResult<Option<CardDefinition>> {
        let tenant_id = tenant_id.to_string();
        let card_id = card_id.to_string();
        self.blocking(move |conn| Self::read_card(conn, &tenant_id, &card_id))
            .await
    }
}

#[async_trait]
impl QueryExecutor for SqliteStore {
    async fn execute(&self, sql: &str, values: &[serde_json::Value]) -> AppResult<Vec<FlatRow>> {
        let sql = sql.to_string();
        let values = values.to_vec();
        self.blocking(move |conn| run_query(conn, &sql, &values)).await
    }
}

#[cfg(test)]
mod tests {
    use super::SqliteStore;
    use crate::adapters::{CardStore, QueryExecutor};
    use crate::errors::AppError;
    use crate::models::{Aggregation, CardDefinition, FilterDefinition, PivotSpec};
    use serde_json::json;

    fn card() -> CardDefinition {
        CardDefinition {
            id: "7".to_string(),
            tenant_id: "acme".to_string(),
            title: "Sales by region".to_string(),
            sql_template: "SELECT region, sales FROM orders WHERE region LIKE :region".to_string(),
            pivot_enabled: true,
            pivot_config: Some(PivotSpec {
                row_fields: vec!["region".to_string()],
                column_fields: vec![],
                value_field: "sales".to_string(),
                aggregation: Aggregation::Sum,
                empty_cell: None,
            }),
            drilldown_enabled: false,
            drilldown_query: None,
            is_active: true,
            filters: vec![],
        }
    }

    #[tokio::test]
    async fn round_trips_card_with_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteStore::open(&dir.path().join("cards.db")).expect("store");
        store.save_card(&card()).expect("save card");
        store
            .save_filter(
                "acme",
                "f-region",
                &FilterDefinition {
                    name: "Region".to_string(),
                    sql_parameter: "region".to_string(),
                    default_value: Some(json!("E%")),
                    is_required: false,
                },
                1,
            )
            .expect("save filter");
        store.attach_filter("acme", "7", "f-region", true).expect("attach");

        let loaded = store.get_card("acme", "7").await.expect("lookup").expect("card");
        assert_eq!(loaded.sql_template, card().sql_template);
        assert_eq!(loaded.pivot_config, card().pivot_config);
        assert_eq!(loaded.filters.len(), 1);
        assert!(loaded.filters[0].is_required);
        assert_eq!(loaded.filters[0].default_value, Some(json!("E%")));

        assert!(store.get_card("other", "7").await.expect("lookup").is_none());
    }

    #[tokio::test]
    async fn executes_positional_parameters() {
        let store = SqliteStore::open_in_memory().expect("store");
        store
            .execute_batch(
                "CREATE TABLE orders (region TEXT, qty INTEGER, price REAL);
                 INSERT INTO orders VALUES ('E', 2, 1.5), ('W', 3, 2.0), ('E', 1, NULL);",
            )
            .expect("seed");

        let rows = store
            .execute(
                "SELECT * FROM (SELECT region, qty, price FROM orders WHERE region = $1 OR region = $1) AS subquery LIMIT 10",
                &[json!("E")],
            )
            .await
            .expect("execute");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["qty"], json!(2));
        assert_eq!(rows[0]["price"], json!(1.5));
        assert_eq!(rows[1]["price"], json!(null));
        let columns: Vec<&String> = rows[0].keys().collect();
        assert_eq!(columns, vec!["region", "qty", "price"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lookups_and_queries_run_off_the_async_worker() {
        let store = SqliteStore::open_in_memory().expect("store");
        store.save_card(&card()).expect("save card");
        store
            .execute_batch("CREATE TABLE orders (region TEXT, sales INTEGER); INSERT INTO orders VALUES ('E', 1);")
            .expect("seed");

        let (card, rows) = tokio::join!(
            store.get_card("acme", "7"),
            store.execute("SELECT region FROM orders", &[])
        );
        assert_eq!(card.expect("lookup").expect("card").id, "7");
        assert_eq!(rows.expect("rows").len(), 1);

        let lookups = (0..8).map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.get_card("acme", "7").await })
        });
        for handle in lookups.collect::<Vec<_>>() {
            assert!(handle.await.expect("join").expect("lookup").is_some());
        }
    }

    #[tokio::test]
    async fn surfaces_store_failures_as_execution_errors() {
        let store = SqliteStore::open_in_memory().expect("store");
        let err = store
            .execute("SELECT * FROM missing_table", &[])
            .await
            .expect_err("missing table");
        assert!(matches!(err, AppError::Execution(_)));
    }
}
