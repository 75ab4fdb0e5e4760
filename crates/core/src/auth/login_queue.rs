// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serialized cluster-wide login queue (§4.E), enabled by `useLoginQueue`.
//! At most one shard drains the queue at a time, so at most one upstream
//! login call is in flight cluster-wide (S6). Grounded in the teacher's
//! `credential/distributor.rs`, which serializes credential work the same
//! way across a single process; here the serialization point moves onto
//! the coordination bus's distributed lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::bus::CoordinationBus;
use crate::clock::Clock;
use crate::model::AuthQueueItem;

const LOCK_NAME: &str = "login_queue";
const QUEUE_NAME: &str = "login_queue";
/// Items left unclaimed this long are marked stale rather than retried
/// forever (an operator-visible dead item beats a silent stall).
const STALE_AFTER_MS: i64 = 5 * 60 * 1000;

pub type LoginOperation =
    Arc<dyn Fn(AuthQueueItem) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send>> + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginQueueResult {
    pub processed: bool,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub stale: bool,
}

/// Enqueue an operation and return its assigned counter.
pub async fn enqueue(
    bus: &CoordinationBus,
    clock: &dyn Clock,
    operation: &str,
    payload: serde_json::Value,
) -> anyhow::Result<u64> {
    let counter = bus.next_counter(QUEUE_NAME).await?;
    let item = AuthQueueItem { counter, operation: operation.to_owned(), payload, enqueued_at: clock.now_ms() };
    bus.queue_push(QUEUE_NAME, item).await?;
    Ok(counter)
}

/// `{processed, result?, remaining}` per §4.E.
pub async fn poll(bus: &CoordinationBus, counter: u64) -> anyhow::Result<(LoginQueueResult, usize)> {
    let key = format!("loginresult.{counter}");
    let remaining = bus.queue_len(QUEUE_NAME).await?;
    match bus.get_json::<LoginQueueResult>(&key).await? {
        Some(result) => Ok((result, remaining)),
        None => Ok((LoginQueueResult { processed: false, result: None, stale: false }, remaining)),
    }
}

/// Drives the drain loop: tries to take the processing lock, and if held,
/// pops and runs one item per `interval` tick until the queue is empty or
/// the lock is lost to the TTL (another shard may then pick it up).
pub async fn run_drain_loop(
    bus: Arc<CoordinationBus>,
    clock: Arc<dyn Clock>,
    operation: LoginOperation,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let holder = format!("shard-{}", uuid::Uuid::new_v4());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let lock_ttl = interval.saturating_mul(4).max(Duration::from_secs(1));
        match bus.try_lock(LOCK_NAME, lock_ttl, &holder).await {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::warn!(err = %e, "login queue lock acquisition failed");
                continue;
            }
        }

        if let Err(e) = drain_one(&bus, clock.as_ref(), &operation).await {
            tracing::warn!(err = %e, "login queue drain step failed");
        }
    }
}

async fn drain_one(bus: &CoordinationBus, clock: &dyn Clock, operation: &LoginOperation) -> anyhow::Result<()> {
    let Some(item) = bus.queue_pop(QUEUE_NAME).await? else {
        return Ok(());
    };

    let now = clock.now_ms();
    let key = format!("loginresult.{}", item.counter);
    if now - item.enqueued_at > STALE_AFTER_MS {
        bus.put_json(&key, &LoginQueueResult { processed: true, result: None, stale: true }).await?;
        return Ok(());
    }

    let result = operation(item.clone()).await;
    bus.put_json(&key, &LoginQueueResult { processed: true, result: Some(result), stale: false }).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_queue_result_serializes_without_result_field() -> anyhow::Result<()> {
        let pending = LoginQueueResult { processed: false, result: None, stale: false };
        let json = serde_json::to_string(&pending)?;
        let back: LoginQueueResult = serde_json::from_str(&json)?;
        assert!(!back.processed);
        assert!(back.result.is_none());
        Ok(())
    }
}
