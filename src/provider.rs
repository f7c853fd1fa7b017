use anyhow::{Context, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::types::ChainEvent;

/// Read access to the chain: current head and ranged event queries.
///
/// Listeners hold this as a trait object so tests can script heads and
/// batches without a network.
#[async_trait]
pub trait EventProvider: Send + Sync {
    async fn block_number(&self) -> anyhow::Result<u64>;

    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
    ) -> anyhow::Result<Vec<ChainEvent>>;
}

/// Starknet JSON-RPC provider over HTTP.
pub struct RpcEventProvider {
    http: reqwest::Client,
    url: reqwest::Url,
    chunk_size: u64,
}

impl RpcEventProvider {
    pub fn new(rpc_url: &str) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(rpc_url)
            .with_context(|| format!("invalid chain RPC url: {rpc_url}"))?;
        Ok(Self {
            http: reqwest::Client::new(),
            url,
            chunk_size: 100,
        })
    }

    /// Connection smoke test. Startup proceeds on failure with a warning;
    /// the poll loop's failure accounting takes it from there.
    pub async fn check_connection(&self) {
        match self.block_number().await {
            Ok(head) => info!(head, "connected to chain RPC endpoint"),
            Err(err) => warn!("chain RPC connection test failed: {err:?}"),
        }
    }

    async fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: Value = self
            .http
            .post(self.url.clone())
            .json(&request)
            .send()
            .await
            .with_context(|| format!("rpc request {method} failed"))?
            .error_for_status()
            .with_context(|| format!("rpc request {method} rejected"))?
            .json()
            .await
            .with_context(|| format!("rpc response for {method} is not json"))?;

        if let Some(error) = response.get("error") {
            return Err(anyhow!("rpc error from {method}: {error}"));
        }

        response
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("rpc response for {method} has no result"))
    }
}

#[async_trait]
impl EventProvider for RpcEventProvider {
    async fn block_number(&self) -> anyhow::Result<u64> {
        let result = self.call("starknet_blockNumber", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| anyhow!("starknet_blockNumber returned non-numeric result: {result}"))
    }

    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
        address: &str,
    ) -> anyhow::Result<Vec<ChainEvent>> {
        let mut events = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut filter = json!({
                "from_block": { "block_number": from_block },
                "to_block": { "block_number": to_block },
                "address": address,
                "chunk_size": self.chunk_size,
            });
            if let Some(token) = &continuation_token {
                filter["continuation_token"] = json!(token);
            }

            let result = self
                .call("starknet_getEvents", json!([{ "filter": filter }]))
                .await?;

            let page = result
                .get("events")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            for raw in page {
                events.push(decode_raw_event(&raw));
            }

            match result.get("continuation_token").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(
            from_block,
            to_block,
            count = events.len(),
            "fetched events from provider"
        );
        Ok(events)
    }
}

/// The first key is the event selector; full ABI decoding is a consumer
/// concern, so the selector doubles as the event name and the payload is
/// passed through as returned.
fn decode_raw_event(raw: &Value) -> ChainEvent {
    let name = raw
        .get("keys")
        .and_then(Value::as_array)
        .and_then(|keys| keys.first())
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    ChainEvent {
        name,
        data: raw.get("data").cloned().unwrap_or(Value::Null),
        block_number: raw.get("block_number").and_then(Value::as_u64).unwrap_or(0),
        transaction_hash: raw
            .get("transaction_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}
