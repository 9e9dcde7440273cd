//! Seams between the card pipeline and the outside world: where card
//! definitions come from and what runs the guarded SQL.

pub mod memory;

use crate::errors::AppResult;
use crate::models::{CardDefinition, FlatRow};
use async_trait::async_trait;

pub use memory::MemoryCardStore;

#[async_trait]
pub trait CardStore: Send + Sync {
    /// Looks up a card scoped to a tenant; `Ok(None)` when it does not exist.
    async fn get_card(&self, tenant_id: &str, card_id: &str) -> AppResult<Option<CardDefinition>>;
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Runs `sql` with `values[i]` bound to `$(i + 1)`. Failures surface as
    /// [`crate::errors::AppError::Execution`] and are never retried here.
    async fn execute(&self, sql: &str, values: &[serde_json::Value]) -> AppResult<Vec<FlatRow>>;
}
