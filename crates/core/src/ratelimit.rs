// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-host retry-after tracker (§4.C), shared cluster-wide via the
//! coordination bus's JetStream KV so every shard honors a rate limit one
//! shard incurred (S5).

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;

use crate::bus::CoordinationBus;
use crate::clock::Clock;
use crate::model::RateLimitRecord;

pub struct RateLimitGate {
    bus: Arc<CoordinationBus>,
    kv: jetstream::kv::Store,
    backoff: Duration,
    cap: Duration,
}

impl RateLimitGate {
    pub fn new(bus: Arc<CoordinationBus>, kv: jetstream::kv::Store, backoff: Duration, cap: Duration) -> Self {
        Self { bus, kv, backoff, cap }
    }

    /// Returns the wall-clock instant (epoch ms) at which the caller may
    /// retry, or `None` if the host is clear.
    pub async fn check(&self, host: &str, clock: &dyn Clock) -> anyhow::Result<Option<i64>> {
        let key = format!("ratelimit.{host}");
        let Some(entry) = self.kv.entry(&key).await? else {
            return Ok(None);
        };
        let record: RateLimitRecord = match serde_json::from_slice(&entry.value) {
            Ok(r) => r,
            Err(_) => return Ok(None),
        };
        if record.retry_at > clock.now_ms() {
            Ok(Some(record.retry_at))
        } else {
            Ok(None)
        }
    }

    /// Stores a per-host record with TTL equal to `retry_at - now`.
    pub async fn record(&self, host: &str, retry_at: i64) -> anyhow::Result<()> {
        let key = format!("ratelimit.{host}");
        let record = RateLimitRecord { host: host.to_owned(), retry_at };
        let payload = serde_json::to_vec(&record)?;
        self.kv.put(&key, payload.into()).await?;
        Ok(())
    }

    /// Exponential backoff fallback when upstream gave no `Retry-After` /
    /// `X-Ratelimit-Reset` header, capped at `rateLimitCap`.
    pub fn exponential_backoff(&self, attempt: u32) -> Duration {
        backoff_for(self.backoff, self.cap, attempt)
    }

    /// Computes and records a fallback `retry_at` for a 429 with no
    /// parseable header, using a cluster-wide per-host strike count so every
    /// shard's hits against the same host sharpen the same backoff curve.
    pub async fn backoff_retry_at(&self, host: &str, clock: &dyn Clock) -> i64 {
        let attempt = self.bus.incr_by(&format!("ratelimit.attempts.{host}"), 1).await.unwrap_or(1);
        let wait = self.exponential_backoff(attempt.saturating_sub(1).min(u32::MAX as u64) as u32);
        let retry_at = clock.now_ms() + wait.as_millis() as i64;
        let _ = self.record(host, retry_at).await;
        retry_at
    }

    /// Parses `Retry-After` (seconds, RFC 7231) falling back to
    /// `X-Ratelimit-Reset` (epoch seconds) when present.
    pub fn retry_at_from_headers(headers: &reqwest::header::HeaderMap, now_ms: i64) -> Option<i64> {
        if let Some(v) = headers.get("retry-after").and_then(|v| v.to_str().ok()) {
            if let Ok(secs) = v.parse::<i64>() {
                return Some(now_ms + secs * 1000);
            }
        }
        if let Some(v) = headers.get("x-ratelimit-reset").and_then(|v| v.to_str().ok()) {
            if let Ok(epoch_secs) = v.parse::<i64>() {
                return Some(epoch_secs * 1000);
            }
        }
        None
    }
}

fn backoff_for(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    scaled.min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_caps_growth() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(5000);
        assert_eq!(backoff_for(base, cap, 0), Duration::from_millis(1000));
        assert_eq!(backoff_for(base, cap, 1), Duration::from_millis(2000));
        assert_eq!(backoff_for(base, cap, 10), cap);
    }

    #[test]
    fn retry_at_prefers_retry_after_header() -> anyhow::Result<()> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert("retry-after", "30".parse()?);
        let retry_at = RateLimitGate::retry_at_from_headers(&headers, 1_000_000);
        assert_eq!(retry_at, Some(1_030_000));
        Ok(())
    }
}
