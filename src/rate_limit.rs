use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

/// Cadence of the background sweep that drops expired windows.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierCfg {
    pub name: &'static str,
    pub limit: u32,
    pub window_ms: i64,
}

/// Short-burst protection.
pub const BURST: TierCfg = TierCfg {
    name: "burst",
    limit: 20,
    window_ms: 10_000,
};

/// Sustained-rate protection.
pub const STANDARD: TierCfg = TierCfg {
    name: "standard",
    limit: 100,
    window_ms: 60_000,
};

/// Duplicate-submission storms for one transaction hash.
pub const TRANSACTION: TierCfg = TierCfg {
    name: "transaction",
    limit: 5,
    window_ms: 60_000,
};

const TIERS: [TierCfg; 3] = [BURST, STANDARD, TRANSACTION];

/// Identity of one inbound request as the limiter sees it.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub client_ip: String,
    pub webhook_source: Option<String>,
    pub tx_hash: Option<String>,
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    window_start_ms: i64,
    reset_ms: i64,
}

/// Standing of the most restrictive tier after an allowed request; feeds
/// the X-RateLimit-* response headers.
#[derive(Debug, Clone, Copy)]
pub struct TierStanding {
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RateLimitRejection {
    pub tier: &'static str,
    pub limit: u32,
    pub reset_ms: i64,
    pub retry_after_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
    pub total_entries: usize,
    pub entries_by_tier: BTreeMap<String, usize>,
}

/// Fixed-window rate limiter evaluating three independent tiers.
///
/// All tiers are peeked before any counter moves; a rejection charges
/// nothing, an allowance charges every tier. Both passes run under one
/// lock with no suspension point in between, so two racing requests can
/// never both observe "under the limit" and then both commit.
#[derive(Debug, Default)]
pub struct MultiTierRateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

fn tier_key(tier: &TierCfg, scope: &RequestScope) -> String {
    match tier.name {
        "burst" => format!("burst:{}", scope.client_ip),
        "standard" => match &scope.webhook_source {
            Some(source) => format!("standard:webhook:{}:{}", source, scope.client_ip),
            None => format!("standard:webhook:{}", scope.client_ip),
        },
        _ => format!(
            "transaction:tx:{}:{}",
            scope.tx_hash.as_deref().unwrap_or("unknown"),
            scope.client_ip
        ),
    }
}

impl MultiTierRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, scope: &RequestScope) -> Result<TierStanding, RateLimitRejection> {
        self.check_at(scope, Utc::now().timestamp_millis())
    }

    pub fn check_at(
        &self,
        scope: &RequestScope,
        now_ms: i64,
    ) -> Result<TierStanding, RateLimitRejection> {
        let mut entries = self.entries.lock().unwrap();

        // Peek every tier first; nothing is charged on rejection.
        for tier in TIERS {
            let key = tier_key(&tier, scope);
            if let Some(entry) = entries.get(&key) {
                if now_ms <= entry.reset_ms && entry.count >= tier.limit {
                    warn!(
                        tier = tier.name,
                        key = %key,
                        window_start_ms = entry.window_start_ms,
                        "rate limit exceeded"
                    );
                    return Err(RateLimitRejection {
                        tier: tier.name,
                        limit: tier.limit,
                        reset_ms: entry.reset_ms,
                        retry_after_secs: ((entry.reset_ms - now_ms) as f64 / 1000.0).ceil() as i64,
                    });
                }
            }
        }

        // Every tier allowed: charge them all in the same critical section.
        let mut most_restrictive = TierStanding {
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_ms: now_ms,
        };
        for tier in TIERS {
            let key = tier_key(&tier, scope);
            let entry = entries
                .entry(key)
                .and_modify(|entry| {
                    if now_ms > entry.reset_ms {
                        entry.count = 1;
                        entry.window_start_ms = now_ms;
                        entry.reset_ms = now_ms + tier.window_ms;
                    } else {
                        entry.count += 1;
                    }
                })
                .or_insert(RateLimitEntry {
                    count: 1,
                    window_start_ms: now_ms,
                    reset_ms: now_ms + tier.window_ms,
                });

            let standing = TierStanding {
                limit: tier.limit,
                remaining: tier.limit.saturating_sub(entry.count),
                reset_ms: entry.reset_ms,
            };
            if standing.remaining < most_restrictive.remaining {
                most_restrictive = standing;
            }
        }

        Ok(most_restrictive)
    }

    /// Drops windows that have fully elapsed; returns how many were removed.
    pub fn sweep(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| now_ms <= entry.reset_ms);
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "cleaned up expired rate limit entries");
        }
        removed
    }

    pub fn status(&self) -> RateLimitStatus {
        let entries = self.entries.lock().unwrap();
        let mut entries_by_tier: BTreeMap<String, usize> = BTreeMap::new();
        for key in entries.keys() {
            let tier = key.split(':').next().unwrap_or("unknown").to_string();
            *entries_by_tier.entry(tier).or_default() += 1;
        }
        RateLimitStatus {
            total_entries: entries.len(),
            entries_by_tier,
        }
    }

    pub fn reset_all(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Real client IP with proxy-header precedence, `::ffff:` prefix stripped.
pub fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let mut ip = header("x-forwarded-for")
        .and_then(|forwarded| forwarded.split(',').next())
        .map(|first| first.trim().to_string())
        .or_else(|| header("x-real-ip").map(str::to_string))
        .or_else(|| header("cf-connecting-ip").map(str::to_string))
        .or_else(|| socket.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string());

    if let Some(stripped) = ip.strip_prefix("::ffff:") {
        ip = stripped.to_string();
    }
    ip
}
