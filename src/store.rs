use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::TransactionStatus;

/// A marketplace transaction aggregate, as far as this service needs to
/// see it. The real persistence layer lives elsewhere; these traits are
/// the boundary.
#[derive(Debug, Clone)]
pub struct MarketTransaction {
    pub id: Uuid,
    pub transaction_hash: String,
    pub status: TransactionStatus,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn find_by_hash(&self, tx_hash: &str) -> anyhow::Result<Option<MarketTransaction>>;

    async fn update_status(&self, id: Uuid, status: TransactionStatus) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub contract_name: String,
    pub event_name: String,
    pub event_data: Value,
    pub block_number: u64,
    pub transaction_hash: String,
    pub observed_at: DateTime<Utc>,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    async fn record(&self, event: StoredEvent) -> anyhow::Result<()>;
}

/// In-memory transaction store keyed by transaction hash.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    transactions: RwLock<HashMap<String, MarketTransaction>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, tx_hash: impl Into<String>, status: TransactionStatus) -> Uuid {
        let tx_hash = tx_hash.into();
        let id = Uuid::new_v4();
        self.transactions.write().await.insert(
            tx_hash.clone(),
            MarketTransaction {
                id,
                transaction_hash: tx_hash,
                status,
            },
        );
        id
    }

    pub async fn status_of(&self, tx_hash: &str) -> Option<TransactionStatus> {
        self.transactions
            .read()
            .await
            .get(tx_hash)
            .map(|tx| tx.status)
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn find_by_hash(&self, tx_hash: &str) -> anyhow::Result<Option<MarketTransaction>> {
        Ok(self.transactions.read().await.get(tx_hash).cloned())
    }

    async fn update_status(&self, id: Uuid, status: TransactionStatus) -> anyhow::Result<()> {
        let mut transactions = self.transactions.write().await;
        for tx in transactions.values_mut() {
            if tx.id == id {
                tx.status = status;
                return Ok(());
            }
        }
        anyhow::bail!("transaction {id} not found")
    }
}

/// In-memory event archive.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: RwLock<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn record(&self, event: StoredEvent) -> anyhow::Result<()> {
        self.events.write().await.push(event);
        Ok(())
    }
}
