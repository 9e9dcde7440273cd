use super::CardStore;
use crate::errors::AppResult;
use crate::models::CardDefinition;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryCardStore {
    cards: RwLock<HashMap<(String, String), CardDefinition>>,
}

impl MemoryCardStore {
    pub fn from_cards(cards: impl IntoIterator<Item = CardDefinition>) -> Self {
        let cards = cards
            .into_iter()
            .map(|card| ((card.tenant_id.clone(), card.id.clone()), card))
            .collect();
        Self {
            cards: RwLock::new(cards),
        }
    }

    pub async fn insert(&self, card: CardDefinition) {
        let mut cards = self.cards.write().await;
        cards.insert((card.tenant_id.clone(), card.id.clone()), card);
    }
}

#[async_trait]
impl CardStore for MemoryCardStore {
    async fn get_card(&self, tenant_id: &str, card_id: &str) -> AppResult<Option<CardDefinition>> {
        let cards = self.cards.read().await;
        Ok(cards.get(&(tenant_id.to_string(), card_id.to_string())).cloned())
    }
}
