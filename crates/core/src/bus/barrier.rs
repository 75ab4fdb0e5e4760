// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-process readiness latch. Opens when an `AllShardsReady` broadcast
//! arrives; all cross-shard sends block on it until then.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

#[derive(Default)]
pub struct ReadinessBarrier {
    ready: AtomicBool,
    notify: Notify,
}

impl ReadinessBarrier {
    pub fn new() -> Self {
        Self { ready: AtomicBool::new(false), notify: Notify::new() }
    }

    pub async fn wait_ready(&self) {
        while !self.ready.load(Ordering::Acquire) {
            self.notify.notified().await;
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn open(&self) {
        self.ready.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Re-arms the barrier, e.g. when a shard respawn is detected.
    pub fn rearm(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn wait_ready_unblocks_on_open() -> anyhow::Result<()> {
        let barrier = Arc::new(ReadinessBarrier::new());
        let waiter = {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move { barrier.wait_ready().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());
        barrier.open();
        tokio::time::timeout(Duration::from_secs(1), waiter).await??;
        Ok(())
    }
}
