use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};

use crate::cache::TtlSet;
use crate::metrics::WebhookMetrics;
use crate::store::{MarketTransaction, TransactionStore};
use crate::types::{WebhookEvent, WebhookEventLog};

const MAX_DEDUP_ENTRIES: usize = 100_000;

/// Applies externally pushed transaction-status events exactly once.
///
/// Deduplication runs on the `txHash-blockNumber` key: the check and the
/// post-success insert are plain synchronous operations on a locked set,
/// so racing deliveries cannot interleave an await inside either one.
pub struct WebhookProcessor {
    transactions: Arc<dyn TransactionStore>,
    metrics: Arc<WebhookMetrics>,
    processed: Mutex<TtlSet>,
    max_retries: u32,
    dedup_ttl: Duration,
}

impl WebhookProcessor {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        metrics: Arc<WebhookMetrics>,
        max_retries: u32,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            transactions,
            metrics,
            processed: Mutex::new(TtlSet::new(MAX_DEDUP_ENTRIES)),
            max_retries,
            dedup_ttl,
        }
    }

    /// Fire-and-forget entry point for the HTTP handler: the handoff is
    /// the unit the caller waits on, never the processing itself.
    pub fn process_detached(self: &Arc<Self>, event: WebhookEvent) {
        tokio::spawn(self.process_event(event, 0));
    }

    pub fn process_event(
        self: &Arc<Self>,
        event: WebhookEvent,
        attempt: u32,
    ) -> BoxFuture<'static, ()> {
        let processor = Arc::clone(self);
        Box::pin(async move {
            let event_id = event.dedup_key();

            {
                let processed = processor.processed.lock().unwrap();
                if processed.contains(&event_id, Utc::now().timestamp_millis()) {
                    info!(event = %event_id, "event already processed, skipping");
                    return;
                }
            }

            info!(event = %event_id, attempt = attempt + 1, "processing transaction event");

            match processor.apply(&event).await {
                Ok(true) => {
                    let now_ms = Utc::now().timestamp_millis();
                    let ttl_ms = processor.dedup_ttl.as_millis() as i64;
                    let mut processed = processor.processed.lock().unwrap();
                    processed.insert(event_id.clone(), now_ms, ttl_ms);
                    info!(event = %event_id, "successfully processed event");
                }
                Ok(false) => {
                    // The aggregate does not exist locally yet. Retrying
                    // will not create it, so the event is dropped.
                }
                Err(err) => {
                    error!(event = %event_id, "error processing event: {err:?}");
                    if attempt < processor.max_retries {
                        processor.metrics.record_retry();
                        let delay = Duration::from_millis(1000u64 << attempt);
                        info!(event = %event_id, delay_ms = delay.as_millis() as u64, "retrying event");
                        let retry = Arc::clone(&processor);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            retry.process_event(event, attempt + 1).await;
                        });
                    } else {
                        error!(event = %event_id, "max retries exceeded for event");
                    }
                }
            }
        })
    }

    /// Returns Ok(true) when the status transition was applied, Ok(false)
    /// when no local transaction matches the hash.
    async fn apply(&self, event: &WebhookEvent) -> anyhow::Result<bool> {
        let Some(transaction) = self.transactions.find_by_hash(&event.tx_hash).await? else {
            warn!(tx_hash = %event.tx_hash, "transaction not found for webhook event");
            return Ok(false);
        };

        let old_status = transaction.status;
        self.transactions
            .update_status(transaction.id, event.status)
            .await?;
        info!(
            transaction = %transaction.id,
            old = %old_status,
            new = %event.status,
            "transaction status updated"
        );

        for log in &event.logs {
            debug!(event_type = %log.event_type, contract = %log.contract_address, "processing log");
            match log.event_type.as_str() {
                "Transfer" => self.handle_transfer(log, &transaction).await?,
                "Approval" => self.handle_approval(log, &transaction).await?,
                other => info!(event_type = other, "unknown log type, skipping"),
            }
        }

        Ok(true)
    }

    async fn handle_transfer(
        &self,
        log: &WebhookEventLog,
        transaction: &MarketTransaction,
    ) -> anyhow::Result<()> {
        let from = log.data.get("from").and_then(|v| v.as_str()).unwrap_or("");
        let to = log.data.get("to").and_then(|v| v.as_str()).unwrap_or("");
        info!(
            transaction = %transaction.id,
            from, to,
            "transfer observed for transaction"
        );
        Ok(())
    }

    async fn handle_approval(
        &self,
        log: &WebhookEventLog,
        transaction: &MarketTransaction,
    ) -> anyhow::Result<()> {
        let owner = log.data.get("owner").and_then(|v| v.as_str()).unwrap_or("");
        info!(
            transaction = %transaction.id,
            owner,
            "approval observed for transaction"
        );
        Ok(())
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().len()
    }
}
