pub mod adapters;
pub mod binder;
pub mod config;
pub mod db;
pub mod errors;
pub mod export;
pub mod filters;
pub mod guard;
pub mod models;
pub mod pivot;
pub mod service;

pub use crate::adapters::{CardStore, MemoryCardStore, QueryExecutor};
pub use crate::binder::{bind_parameters, bind_row_placeholders};
pub use crate::config::{AppConfig, GuardSettings};
pub use crate::db::SqliteStore;
pub use crate::errors::{AppError, AppResult};
pub use crate::export::rows_to_csv;
pub use crate::guard::{validate_and_bound, QueryGuardResult, RejectReason};
pub use crate::models::{
    Aggregation, BoundQuery, CardDataRequest, CardDataResponse, CardDefinition, EmptyCell, FilterDefinition,
    FilterValues, FlatRow, PivotSpec, PivotedCardData, PivotedRow,
};
pub use crate::pivot::{drill_into, drill_into_cell, pivot};
pub use crate::service::CardQueryService;

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Installs the global subscriber. `RUST_LOG` takes precedence over
/// `filter`. With a log directory, JSON lines go to a daily-rolling
/// `cardq.log`; otherwise human-readable output goes to stderr.
pub fn init_tracing(log_dir: Option<&Path>, filter: &str) -> AppResult<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(filter))
        .map_err(|error| AppError::Startup(format!("invalid log filter '{}': {}", filter, error)))?;

    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "cardq.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| AppError::Startup(error.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| AppError::Startup(error.to_string())),
    }
}
