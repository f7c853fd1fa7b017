use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use starknet_events_monitor::metrics::WebhookMetrics;
use starknet_events_monitor::store::{MarketTransaction, TransactionStore};
use starknet_events_monitor::types::{TransactionStatus, WebhookEvent};
use starknet_events_monitor::webhook::WebhookProcessor;

/// Store double that counts status updates and can fail the first N of
/// them.
struct CountingStore {
    id: Uuid,
    tx_hash: Option<String>,
    updates: AtomicU32,
    failures_remaining: AtomicU32,
}

impl CountingStore {
    fn with_transaction(tx_hash: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx_hash: Some(tx_hash.to_string()),
            updates: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
        }
    }

    fn empty() -> Self {
        Self {
            id: Uuid::new_v4(),
            tx_hash: None,
            updates: AtomicU32::new(0),
            failures_remaining: AtomicU32::new(0),
        }
    }

    fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    fn update_count(&self) -> u32 {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionStore for CountingStore {
    async fn find_by_hash(&self, tx_hash: &str) -> anyhow::Result<Option<MarketTransaction>> {
        Ok(self.tx_hash.as_deref().filter(|hash| *hash == tx_hash).map(
            |hash| MarketTransaction {
                id: self.id,
                transaction_hash: hash.to_string(),
                status: TransactionStatus::Pending,
            },
        ))
    }

    async fn update_status(&self, _id: Uuid, _status: TransactionStatus) -> anyhow::Result<()> {
        let remaining = self.failures_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("database unavailable");
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn event(tx_hash: &str, block_number: u64) -> WebhookEvent {
    serde_json::from_value(json!({
        "txHash": tx_hash,
        "status": "COMPLETED",
        "blockTimestamp": "2025-06-01T12:00:00Z",
        "blockNumber": block_number,
        "logs": [
            {"contractAddress": "0x1", "eventType": "Transfer", "data": {"from": "0x2", "to": "0x3", "tokenId": "7"}},
            {"contractAddress": "0x1", "eventType": "Listed", "data": {}}
        ]
    }))
    .unwrap()
}

fn processor(store: Arc<CountingStore>, metrics: Arc<WebhookMetrics>) -> Arc<WebhookProcessor> {
    Arc::new(WebhookProcessor::new(
        store,
        metrics,
        3,
        Duration::from_secs(86_400),
    ))
}

#[tokio::test(start_paused = true)]
async fn duplicate_delivery_is_applied_exactly_once() {
    let store = Arc::new(CountingStore::with_transaction("0xabc"));
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics);

    processor.process_event(event("0xabc", 10), 0).await;
    assert_eq!(store.update_count(), 1);
    assert_eq!(processor.processed_count(), 1);

    // Replaying the identical event must be a no-op and must not throw.
    processor.process_event(event("0xabc", 10), 0).await;
    assert_eq!(store.update_count(), 1);
    assert_eq!(processor.processed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn distinct_blocks_are_distinct_events() {
    let store = Arc::new(CountingStore::with_transaction("0xabc"));
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics);

    processor.process_event(event("0xabc", 10), 0).await;
    processor.process_event(event("0xabc", 11), 0).await;
    assert_eq!(store.update_count(), 2);
    assert_eq!(processor.processed_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn missing_transaction_is_dropped_without_retry() {
    let store = Arc::new(CountingStore::empty());
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics.clone());

    processor.process_event(event("0xghost", 10), 0).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(store.update_count(), 0);
    assert_eq!(processor.processed_count(), 0);
    assert_eq!(metrics.snapshot().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_to_success() {
    let store = Arc::new(CountingStore::with_transaction("0xabc"));
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics.clone());

    store.fail_next(2);
    processor.process_event(event("0xabc", 10), 0).await;

    // Backoffs are 1s then 2s; leave room for both.
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(store.update_count(), 1);
    assert_eq!(processor.processed_count(), 1);
    assert_eq!(metrics.snapshot().retry_count, 2);
}

#[tokio::test(start_paused = true)]
async fn retries_exhaust_terminally() {
    let store = Arc::new(CountingStore::with_transaction("0xabc"));
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics.clone());

    store.fail_next(u32::MAX);
    processor.process_event(event("0xabc", 10), 0).await;

    // Backoffs 1s, 2s, 4s, then the terminal error path.
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(store.update_count(), 0);
    assert_eq!(processor.processed_count(), 0);
    assert_eq!(metrics.snapshot().retry_count, 3);
}

#[tokio::test(start_paused = true)]
async fn detached_processing_completes_off_the_caller() {
    let store = Arc::new(CountingStore::with_transaction("0xabc"));
    let metrics = Arc::new(WebhookMetrics::new());
    let processor = processor(store.clone(), metrics);

    processor.process_detached(event("0xabc", 10));
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(store.update_count(), 1);
    assert_eq!(processor.processed_count(), 1);
}
