// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Alert engine (§4.I): periodic partitioned scan, diff against standing
//! alerts, notify, migrate-to-DM on an inaccessible channel. Partitioning
//! and the per-account state machine live in [`partition`] and [`user`]
//! respectively; this module only wires the two execution modes together.

mod partition;
mod user;

use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

pub use partition::partition_for_shard;

use crate::bus::CoordinationBus;
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::model::UserId;
use crate::notify::NotificationPort;
use crate::shop::ShopService;
use crate::store::UserStore;

const SEQUENTIAL_BATCH_SIZE: usize = 50;

pub struct AlertEngine {
    store: Arc<UserStore>,
    shop: Arc<ShopService>,
    notify: Arc<dyn NotificationPort>,
    bus: Arc<CoordinationBus>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
}

impl AlertEngine {
    pub fn new(
        store: Arc<UserStore>,
        shop: Arc<ShopService>,
        notify: Arc<dyn NotificationPort>,
        bus: Arc<CoordinationBus>,
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, shop, notify, bus, config, clock }
    }

    /// Entry point invoked by the scheduler's `refreshSkins` trigger. Every
    /// shard derives its own partition independently; no broadcast needed.
    pub async fn run_scan(&self, shard_id: u32, shard_count: u32, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let candidate_ids = self.store.user_ids_with_alerts_or_daily_shop().await?;
        let partition = partition::partition_for_shard(&candidate_ids, shard_id, shard_count);
        tracing::info!(shard_id, partition_size = partition.len(), "alert scan starting");

        let config = self.config.current().await;
        if config.alert_concurrency <= 1 {
            self.run_sequential(partition, shutdown).await
        } else {
            self.run_concurrent(partition, config.alert_concurrency, shutdown).await
        }
    }

    async fn run_sequential(&self, partition: Vec<UserId>, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let config = self.config.current().await;
        for batch in partition.chunks(SEQUENTIAL_BATCH_SIZE) {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let writes = self.store.begin_batch_writes();
            let cache = self.store.begin_user_cache_scope();
            let mut should_wait = false;

            for &user_id in batch {
                if shutdown.is_cancelled() {
                    break;
                }
                if should_wait {
                    tokio::time::sleep(config.delay_between_alerts()).await;
                }
                let outcome = user::process_user(
                    user_id,
                    &self.store,
                    &writes,
                    &cache,
                    &self.shop,
                    self.notify.as_ref(),
                    &self.bus,
                    &config,
                    self.clock.as_ref(),
                    shutdown,
                )
                .await;
                should_wait = matches!(outcome, Ok(true));
            }

            writes.commit_batch_writes().await?;
        }
        Ok(())
    }

    async fn run_concurrent(
        &self,
        partition: Vec<UserId>,
        concurrency: usize,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let config = self.config.current().await;
        let writes = self.store.begin_batch_writes();

        stream::iter(partition)
            .for_each_concurrent(concurrency, |user_id| {
                let writes = &writes;
                let config = &config;
                async move {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    // Each task opens its own read-cache scope (§4.I) so
                    // concurrent users never see each other's snapshots.
                    let cache = self.store.begin_user_cache_scope();
                    if let Err(e) = user::process_user(
                        user_id,
                        &self.store,
                        writes,
                        &cache,
                        &self.shop,
                        self.notify.as_ref(),
                        &self.bus,
                        config,
                        self.clock.as_ref(),
                        shutdown,
                    )
                    .await
                    {
                        tracing::warn!(user_id, err = %e, "alert engine: user processing failed");
                    }
                }
            })
            .await;

        writes.commit_batch_writes().await?;
        Ok(())
    }
}
