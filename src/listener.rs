use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use crate::config::ListenerCfg;
use crate::contracts::ContractSpec;
use crate::provider::EventProvider;
use crate::queue::{EventQueue, JobOptions};
use crate::store::{EventStore, StoredEvent};
use crate::types::{ChainEvent, EventEnvelope};

const MAX_PERFORMANCE_HISTORY: usize = 1000;
const BATCH_PAUSE: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Default)]
struct ListenerState {
    last_processed_block: u64,
    is_listening: bool,
    failure_count: u32,
    circuit_open: bool,
}

#[derive(Debug, Default)]
struct PerfWindow {
    samples_ms: VecDeque<u64>,
}

impl PerfWindow {
    fn record(&mut self, elapsed_ms: u64) {
        self.samples_ms.push_back(elapsed_ms);
        if self.samples_ms.len() > MAX_PERFORMANCE_HISTORY {
            self.samples_ms.pop_front();
        }
    }

    fn metrics(&self, slow_threshold_ms: u64) -> PerformanceMetrics {
        if self.samples_ms.is_empty() {
            return PerformanceMetrics::default();
        }
        let sum: u64 = self.samples_ms.iter().sum();
        PerformanceMetrics {
            avg_processing_time: (sum as f64 / self.samples_ms.len() as f64).round() as u64,
            max_processing_time: self.samples_ms.iter().copied().max().unwrap_or(0),
            events_processed: self.samples_ms.len() as u64,
            slow_events_count: self
                .samples_ms
                .iter()
                .filter(|&&ms| ms > slow_threshold_ms)
                .count() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub avg_processing_time: u64,
    pub max_processing_time: u64,
    pub events_processed: u64,
    pub slow_events_count: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerHealth {
    pub is_listening: bool,
    pub last_processed_block: u64,
    pub circuit_open: bool,
    pub failure_count: u32,
    pub performance: PerformanceMetrics,
    pub contract_address: String,
    pub supported_events: Vec<&'static str>,
}

/// Maintains a logically continuous view of one contract's event stream
/// over an unreliable polling provider.
///
/// All state transitions happen in short synchronous critical sections on
/// one mutex; provider and queue calls are never made while it is held.
pub struct Listener {
    spec: ContractSpec,
    provider: Arc<dyn EventProvider>,
    queue: Arc<dyn EventQueue>,
    event_store: Option<Arc<dyn EventStore>>,
    cfg: ListenerCfg,
    state: Mutex<ListenerState>,
    perf: Mutex<PerfWindow>,
}

impl Listener {
    pub fn new(
        spec: ContractSpec,
        provider: Arc<dyn EventProvider>,
        queue: Arc<dyn EventQueue>,
        event_store: Option<Arc<dyn EventStore>>,
        cfg: ListenerCfg,
    ) -> Arc<Self> {
        Arc::new(Self {
            spec,
            provider,
            queue,
            event_store,
            cfg,
            state: Mutex::new(ListenerState::default()),
            perf: Mutex::new(PerfWindow::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Starts listening. A listener that is already running is left
    /// alone; a provider failure while fetching the initial head is
    /// fatal and propagates to the caller.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_listening {
                warn!(contract = %self.spec.name, "listener is already running");
                return Ok(());
            }
            state.is_listening = true;
        }

        info!(contract = %self.spec.name, "starting event listener");

        let head = match self.provider.block_number().await {
            Ok(head) => head,
            Err(err) => {
                error!(contract = %self.spec.name, "failed to start listener: {err:?}");
                self.state.lock().unwrap().is_listening = false;
                return Err(err);
            }
        };

        let gap = {
            let mut state = self.state.lock().unwrap();
            if state.last_processed_block == 0 {
                // First run: adopt the current head, no backfill.
                state.last_processed_block = head;
                None
            } else if state.last_processed_block < head {
                Some((state.last_processed_block + 1, head))
            } else {
                None
            }
        };

        if let Some((from, to)) = gap {
            self.recover(from, to).await;
        }

        let listener = Arc::clone(self);
        tokio::spawn(async move { listener.poll_loop().await });

        Ok(())
    }

    /// Stops future poll scheduling. In-flight recovery or retries are
    /// not cancelled.
    pub fn stop(&self) {
        self.state.lock().unwrap().is_listening = false;
        info!(contract = %self.spec.name, "stopped event listener");
    }

    async fn poll_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.cfg.poll_interval).await;
            if !self.state.lock().unwrap().is_listening {
                break;
            }

            match self.provider.block_number().await {
                Ok(head) => {
                    let last = self.state.lock().unwrap().last_processed_block;
                    if head > last {
                        self.recover(last + 1, head).await;
                    }
                }
                Err(err) => {
                    error!(contract = %self.spec.name, "error during event polling: {err:?}");
                    self.note_failure();
                }
            }
        }
        debug!(contract = %self.spec.name, "poll loop exited");
    }

    /// Fetches and processes `[from_block, to_block]` in bounded batches.
    /// A failed batch is logged and skipped so one bad range cannot stall
    /// the rest; the cursor always lands on `to_block`.
    pub async fn recover(self: &Arc<Self>, from_block: u64, to_block: u64) {
        info!(
            contract = %self.spec.name,
            from_block,
            to_block,
            "recovering missed events"
        );

        let mut current = from_block;
        while current <= to_block {
            let end = (current + self.cfg.batch_size - 1).min(to_block);

            match self
                .provider
                .get_events(current, end, &self.spec.address)
                .await
            {
                Ok(events) => {
                    for event in events {
                        self.process_event(event).await;
                    }
                }
                Err(err) => {
                    error!(
                        contract = %self.spec.name,
                        from_block = current,
                        to_block = end,
                        "failed to get events from provider: {err:?}"
                    );
                }
            }

            // Brief pause so recovery does not hammer the provider.
            tokio::time::sleep(BATCH_PAUSE).await;
            current = end + 1;
        }

        let mut state = self.state.lock().unwrap();
        state.last_processed_block = state.last_processed_block.max(to_block);
        info!(contract = %self.spec.name, to_block, "recovered events up to block");
    }

    /// Validates and dispatches one event. Invalid events are dropped
    /// without touching the failure counter; dispatch errors count toward
    /// the circuit breaker and schedule an out-of-band retry.
    pub async fn process_event(self: &Arc<Self>, event: ChainEvent) {
        if self.state.lock().unwrap().circuit_open {
            warn!(contract = %self.spec.name, "circuit breaker open, skipping event processing");
            return;
        }

        if !self.spec.validator.validate(&event) {
            warn!(
                contract = %self.spec.name,
                event = %event.name,
                "event validation failed"
            );
            return;
        }

        let started = Instant::now();
        let outcome = self.dispatch(&event).await;

        match outcome {
            Ok(()) => {
                self.state.lock().unwrap().failure_count = 0;

                let elapsed_ms = started.elapsed().as_millis() as u64;
                self.perf.lock().unwrap().record(elapsed_ms);
                if elapsed_ms > self.cfg.slow_threshold_ms {
                    warn!(
                        contract = %self.spec.name,
                        event = %event.name,
                        elapsed_ms,
                        "slow event processing"
                    );
                }
            }
            Err(err) => {
                let failure_count = self.note_failure();
                error!(
                    contract = %self.spec.name,
                    event = %event.name,
                    failure_count,
                    "event processing failed: {err:?}"
                );

                let listener = Arc::clone(self);
                tokio::spawn(async move {
                    listener.retry_with_backoff(event, failure_count).await;
                });
            }
        }
    }

    /// Enqueues the event envelope plus any per-event routed job, then
    /// archives it when an event store is wired in.
    async fn dispatch(&self, event: &ChainEvent) -> anyhow::Result<()> {
        let envelope = EventEnvelope {
            contract_name: self.spec.name.clone(),
            event_name: event.name.clone(),
            event_data: event.data.clone(),
            block_number: event.block_number,
            transaction_hash: event.transaction_hash.clone(),
            processed_at: Utc::now(),
        };
        self.queue
            .enqueue(
                &self.spec.events_queue(),
                serde_json::to_value(&envelope)?,
                JobOptions::default(),
            )
            .await?;

        if let Some(route) = self.spec.route(&event.name) {
            let mut body = event
                .data
                .as_object()
                .cloned()
                .unwrap_or_else(|| Map::from_iter([("data".to_string(), event.data.clone())]));
            body.insert("blockNumber".to_string(), json!(event.block_number));
            body.insert(
                "transactionHash".to_string(),
                json!(event.transaction_hash),
            );
            self.queue
                .enqueue(route, Value::Object(body), JobOptions::default())
                .await?;
        }

        if let Some(store) = &self.event_store {
            store
                .record(StoredEvent {
                    contract_name: self.spec.name.clone(),
                    event_name: event.name.clone(),
                    event_data: event.data.clone(),
                    block_number: event.block_number,
                    transaction_hash: event.transaction_hash.clone(),
                    observed_at: Utc::now(),
                })
                .await?;
        }

        Ok(())
    }

    /// One deferred re-dispatch, backoff scaled by the failure count at
    /// the time of the failure. Success pays one failure back; another
    /// failure just logs, the next poll cycle will surface it again.
    async fn retry_with_backoff(self: &Arc<Self>, event: ChainEvent, attempt: u32) {
        if attempt >= self.cfg.max_retry_attempts {
            return;
        }

        let backoff = Duration::from_millis((1000u64 << attempt).min(MAX_RETRY_BACKOFF_MS));
        info!(
            contract = %self.spec.name,
            event = %event.name,
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            "retrying event processing"
        );
        tokio::time::sleep(backoff).await;

        match self.dispatch(&event).await {
            Ok(()) => {
                let mut state = self.state.lock().unwrap();
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            Err(err) => {
                error!(
                    contract = %self.spec.name,
                    attempt = attempt + 1,
                    "retry failed: {err:?}"
                );
            }
        }
    }

    /// Registers a failure; opens the circuit at the threshold. Returns
    /// the updated count.
    fn note_failure(self: &Arc<Self>) -> u32 {
        let mut state = self.state.lock().unwrap();
        state.failure_count += 1;
        let count = state.failure_count;

        if count >= self.cfg.max_failures && !state.circuit_open {
            state.circuit_open = true;
            drop(state);
            error!(
                contract = %self.spec.name,
                failures = count,
                "circuit breaker opened"
            );

            let listener = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(listener.cfg.reset_timeout).await;
                {
                    let mut state = listener.state.lock().unwrap();
                    state.circuit_open = false;
                    state.failure_count = 0;
                }
                info!(contract = %listener.spec.name, "circuit breaker reset");
            });
        }

        count
    }

    pub fn health(&self) -> ListenerHealth {
        let state = self.state.lock().unwrap();
        let performance = self.perf.lock().unwrap().metrics(self.cfg.slow_threshold_ms);
        ListenerHealth {
            is_listening: state.is_listening,
            last_processed_block: state.last_processed_block,
            circuit_open: state.circuit_open,
            failure_count: state.failure_count,
            performance,
            contract_address: self.spec.address.clone(),
            supported_events: self.spec.supported_events(),
        }
    }
}
