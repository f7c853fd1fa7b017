use anyhow::Context as _;
use async_nats::jetstream::{self, AckKind, consumer::pull, stream};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Options accepted at enqueue time. They travel with the job so workers
/// on other processes see the same retry budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobHandle {
    pub id: Uuid,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobEnvelope {
    id: Uuid,
    queue: String,
    max_attempts: u32,
    payload: Value,
    enqueued_at: DateTime<Utc>,
}

/// Producer boundary towards the job broker. Listeners and ops tooling
/// only see this trait; the broker itself is an external collaborator.
#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        options: JobOptions,
    ) -> anyhow::Result<JobHandle>;
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub exists: bool,
    pub messages: u64,
}

/// NATS JetStream-backed queue producer. One stream per queue name;
/// workers are pull consumers; jobs that exhaust their attempts are
/// forwarded to `<queue>-dlq` for manual inspection.
pub struct NatsQueue {
    jetstream: jetstream::Context,
    default_max_attempts: u32,
}

fn stream_name(queue: &str) -> String {
    format!("jobs-{queue}")
}

fn subject(queue: &str) -> String {
    format!("jobs.{queue}")
}

fn should_dead_letter(delivered: i64, max_attempts: u32) -> bool {
    delivered >= max_attempts as i64
}

async fn ensure_stream(
    jetstream: &jetstream::Context,
    queue: &str,
) -> anyhow::Result<stream::Stream> {
    jetstream
        .get_or_create_stream(stream::Config {
            name: stream_name(queue),
            subjects: vec![subject(queue)],
            ..Default::default()
        })
        .await
        .with_context(|| format!("failed to ensure stream for queue {queue}"))
}

async fn publish_envelope(
    jetstream: &jetstream::Context,
    queue: &str,
    envelope: &JobEnvelope,
) -> anyhow::Result<()> {
    ensure_stream(jetstream, queue).await?;
    let bytes = serde_json::to_vec(envelope)?;
    jetstream
        .publish(subject(queue), bytes.into())
        .await
        .with_context(|| format!("failed to publish job to queue {queue}"))?
        .await
        .with_context(|| format!("no publish ack from queue {queue}"))?;
    Ok(())
}

impl NatsQueue {
    pub async fn connect(url: &str, default_max_attempts: u32) -> anyhow::Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("failed to connect to NATS at {url}"))?;
        info!(url, "connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
            default_max_attempts,
        })
    }

    /// Registers a worker for a queue. The handler is invoked once per
    /// delivery; a delivery that fails after its attempt budget is
    /// forwarded to the queue's DLQ and acknowledged so it stops
    /// redelivering.
    pub async fn register_worker<F, Fut>(&self, queue: &str, handler: F) -> anyhow::Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let stream = ensure_stream(&self.jetstream, queue).await?;
        let consumer = stream
            .get_or_create_consumer(
                "workers",
                pull::Config {
                    durable_name: Some("workers".to_string()),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to create consumer for queue {queue}"))?;

        let jetstream = self.jetstream.clone();
        let queue = queue.to_string();
        info!(queue = %queue, "worker registered");

        tokio::spawn(async move {
            let mut messages = match consumer.messages().await {
                Ok(messages) => messages,
                Err(err) => {
                    error!(queue, "failed to open worker message stream: {err:?}");
                    return;
                }
            };

            while let Some(message) = messages.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(queue, "worker message stream error: {err:?}");
                        continue;
                    }
                };

                let envelope: JobEnvelope = match serde_json::from_slice(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        // Undecodable jobs can never succeed; drop them.
                        error!(queue, "discarding undecodable job: {err:?}");
                        let _ = message.ack().await;
                        continue;
                    }
                };

                let delivered = message.info().map(|info| info.delivered).unwrap_or(1);
                match handler(envelope.payload.clone()).await {
                    Ok(()) => {
                        debug!(queue, job = %envelope.id, "job completed");
                        let _ = message.ack().await;
                    }
                    Err(err) => {
                        error!(queue, job = %envelope.id, delivered, "job failed: {err:?}");
                        if should_dead_letter(delivered, envelope.max_attempts.max(1)) {
                            let dlq = format!("{}-dlq", envelope.queue);
                            warn!(queue, job = %envelope.id, dlq, "forwarding job to dead-letter queue");
                            let dlq_envelope = JobEnvelope {
                                id: envelope.id,
                                queue: dlq.clone(),
                                max_attempts: 1,
                                payload: envelope.payload.clone(),
                                enqueued_at: Utc::now(),
                            };
                            if let Err(err) = publish_envelope(&jetstream, &dlq, &dlq_envelope).await
                            {
                                error!(queue, job = %envelope.id, "failed to dead-letter job: {err:?}");
                            }
                            let _ = message.ack().await;
                        } else {
                            let _ = message.ack_with(AckKind::Nak(None)).await;
                        }
                    }
                }
            }

            warn!(queue, "worker message stream ended");
        });

        Ok(())
    }

    pub async fn queue_status(&self, queue: &str) -> QueueStatus {
        match self.jetstream.get_stream(stream_name(queue)).await {
            Ok(mut stream) => match stream.info().await {
                Ok(info) => QueueStatus {
                    exists: true,
                    messages: info.state.messages,
                },
                Err(_) => QueueStatus {
                    exists: true,
                    messages: 0,
                },
            },
            Err(_) => QueueStatus {
                exists: false,
                messages: 0,
            },
        }
    }
}

#[async_trait]
impl EventQueue for NatsQueue {
    async fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        options: JobOptions,
    ) -> anyhow::Result<JobHandle> {
        let envelope = JobEnvelope {
            id: Uuid::new_v4(),
            queue: queue.to_string(),
            max_attempts: options.max_attempts.unwrap_or(self.default_max_attempts),
            payload,
            enqueued_at: Utc::now(),
        };

        publish_envelope(&self.jetstream, queue, &envelope).await?;
        debug!(queue, job = %envelope.id, "job enqueued");

        Ok(JobHandle {
            id: envelope.id,
            queue: queue.to_string(),
        })
    }
}
