use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ChainCfg {
    pub rpc_url: String,
    pub poll_interval_secs: Option<u64>,
    pub batch_size: Option<u64>,
    pub max_failures: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub max_retry_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContractCfg {
    pub name: String,
    pub address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NatsCfg {
    pub url: String,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookCfg {
    pub secret: Option<String>,
    pub dedup_ttl_secs: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerCfg {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppCfg {
    pub chain: ChainCfg,
    pub contracts: Vec<ContractCfg>,
    pub nats: NatsCfg,
    pub webhook: WebhookCfg,
    pub server: ServerCfg,
}

/// Per-listener tuning knobs derived from [`ChainCfg`].
#[derive(Debug, Clone, Copy)]
pub struct ListenerCfg {
    pub poll_interval: Duration,
    pub batch_size: u64,
    pub max_failures: u32,
    pub reset_timeout: Duration,
    pub max_retry_attempts: u32,
    pub slow_threshold_ms: u64,
}

impl Default for ListenerCfg {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            max_failures: 5,
            reset_timeout: Duration::from_millis(10_000),
            max_retry_attempts: 3,
            slow_threshold_ms: 500,
        }
    }
}

impl AppCfg {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config: Self = serde_yaml::from_str(&std::fs::read_to_string(path)?)?;

        // Environment overrides the file for the shared secret so it can
        // stay out of checked-in config.
        if let Ok(secret) = std::env::var("STARKNET_WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook.secret = Some(secret);
            }
        }

        if config.contracts.is_empty() {
            anyhow::bail!("no contracts configured, nothing to monitor");
        }

        Ok(config)
    }

    pub fn listener_cfg(&self) -> ListenerCfg {
        let defaults = ListenerCfg::default();
        ListenerCfg {
            poll_interval: self
                .chain
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: self.chain.batch_size.unwrap_or(defaults.batch_size),
            max_failures: self.chain.max_failures.unwrap_or(defaults.max_failures),
            reset_timeout: self
                .chain
                .reset_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.reset_timeout),
            max_retry_attempts: self
                .chain
                .max_retry_attempts
                .unwrap_or(defaults.max_retry_attempts),
            slow_threshold_ms: defaults.slow_threshold_ms,
        }
    }

    pub fn webhook_dedup_ttl(&self) -> Duration {
        // 24h default, the maximum age an indexer re-delivery is expected
        // to arrive within.
        Duration::from_secs(self.webhook.dedup_ttl_secs.unwrap_or(86_400))
    }

    pub fn webhook_max_retries(&self) -> u32 {
        self.webhook.max_retries.unwrap_or(3)
    }

    pub fn nats_max_attempts(&self) -> u32 {
        self.nats.max_attempts.unwrap_or(3)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_cfg_defaults() {
        let cfg: AppCfg = serde_yaml::from_str(
            r#"
chain:
  rpc_url: "http://localhost:9545"
contracts:
  - name: nft
    address: "0x1"
nats:
  url: "nats://localhost:4222"
webhook: {}
server:
  host: "0.0.0.0"
  port: 8080
"#,
        )
        .unwrap();

        let listener = cfg.listener_cfg();
        assert_eq!(listener.poll_interval, Duration::from_secs(5));
        assert_eq!(listener.batch_size, 100);
        assert_eq!(listener.max_failures, 5);
        assert_eq!(listener.reset_timeout, Duration::from_millis(10_000));
        assert_eq!(listener.max_retry_attempts, 3);
        assert_eq!(cfg.webhook_max_retries(), 3);
        assert_eq!(cfg.bind_address(), "0.0.0.0:8080");
    }

    #[test]
    fn listener_cfg_overrides() {
        let cfg: AppCfg = serde_yaml::from_str(
            r#"
chain:
  rpc_url: "http://localhost:9545"
  poll_interval_secs: 2
  batch_size: 50
  max_failures: 3
  reset_timeout_ms: 2000
contracts:
  - name: auction
    address: "0x2"
nats:
  url: "nats://localhost:4222"
  max_attempts: 5
webhook:
  max_retries: 1
server:
  host: "127.0.0.1"
  port: 3000
"#,
        )
        .unwrap();

        let listener = cfg.listener_cfg();
        assert_eq!(listener.poll_interval, Duration::from_secs(2));
        assert_eq!(listener.batch_size, 50);
        assert_eq!(listener.max_failures, 3);
        assert_eq!(listener.reset_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.nats_max_attempts(), 5);
        assert_eq!(cfg.webhook_max_retries(), 1);
    }
}
