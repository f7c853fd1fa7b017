use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::{Validate, ValidationError};

/// A single decoded event observed on chain. Immutable once produced by
/// the provider; `data` stays untyped because payload shape depends on the
/// event type and a wrong shape must validate as invalid, not panic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEvent {
    pub name: String,
    pub data: Value,
    pub block_number: u64,
    pub transaction_hash: String,
}

/// Envelope enqueued to the per-contract events queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub contract_name: String,
    pub event_name: String,
    pub event_data: Value,
    pub block_number: u64,
    pub transaction_hash: String,
    pub processed_at: DateTime<Utc>,
}

/// Lifecycle status of a marketplace transaction, as reported by the
/// chain indexer in webhook callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reverted,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Completed => "COMPLETED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Reverted => "REVERTED",
        };
        f.write_str(s)
    }
}

/// One event log carried in a webhook callback.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEventLog {
    #[validate(length(min = 1))]
    pub contract_address: String,
    #[validate(length(min = 1))]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Inbound transaction-status event pushed by the chain indexer.
///
/// Field names follow the external JSON contract; the payload is checked
/// against this schema after signature verification and before any
/// processing is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    #[validate(length(min = 1))]
    pub tx_hash: String,
    pub status: TransactionStatus,
    #[validate(custom(function = validate_iso8601))]
    pub block_timestamp: String,
    #[validate(range(min = 1))]
    pub block_number: u64,
    #[validate(nested)]
    pub logs: Vec<WebhookEventLog>,
}

impl WebhookEvent {
    /// Idempotency key for deduplicating re-delivered webhooks.
    pub fn dedup_key(&self) -> String {
        format!("{}-{}", self.tx_hash, self.block_number)
    }
}

fn validate_iso8601(value: &str) -> Result<(), ValidationError> {
    DateTime::parse_from_rfc3339(value)
        .map(|_| ())
        .map_err(|_| ValidationError::new("iso8601"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "txHash": "0xabc",
            "status": "COMPLETED",
            "blockTimestamp": "2025-06-01T12:00:00Z",
            "blockNumber": 42,
            "logs": [
                {"contractAddress": "0x1", "eventType": "Transfer", "data": {"from": "0x2", "to": "0x3", "tokenId": "7"}}
            ]
        })
    }

    #[test]
    fn webhook_event_roundtrip() {
        let event: WebhookEvent = serde_json::from_value(sample_json()).unwrap();
        assert_eq!(event.tx_hash, "0xabc");
        assert_eq!(event.status, TransactionStatus::Completed);
        assert_eq!(event.dedup_key(), "0xabc-42");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn rejects_empty_tx_hash() {
        let mut json = sample_json();
        json["txHash"] = serde_json::json!("");
        let event: WebhookEvent = serde_json::from_value(json).unwrap();
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        let mut json = sample_json();
        json["status"] = serde_json::json!("HALF_DONE");
        assert!(serde_json::from_value::<WebhookEvent>(json).is_err());
    }

    #[test]
    fn rejects_bad_timestamp() {
        let mut json = sample_json();
        json["blockTimestamp"] = serde_json::json!("yesterday");
        let event: WebhookEvent = serde_json::from_value(json).unwrap();
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_zero_block_number() {
        let mut json = sample_json();
        json["blockNumber"] = serde_json::json!(0);
        let event: WebhookEvent = serde_json::from_value(json).unwrap();
        assert!(event.validate().is_err());
    }

    #[test]
    fn rejects_negative_block_number_at_parse() {
        let mut json = sample_json();
        json["blockNumber"] = serde_json::json!(-5);
        assert!(serde_json::from_value::<WebhookEvent>(json).is_err());
    }
}
