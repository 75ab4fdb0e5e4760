// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Scheduler & lifecycle (§4.L): a cron-like table of periodic tasks, the
//! leader-election lock two other ambient jobs gate on (emoji warmup,
//! catalog/stats persistence), and the graceful-shutdown flush. Grounded in
//! the teacher's `upstream::health::spawn_health_checker` for the
//! "ticking loop against a shutdown token" shape, generalized from one fixed
//! interval to a table of independently-scheduled cron jobs, and in
//! `auth::login_queue::run_drain_loop` for the renewable distributed-lock
//! leader-election pattern.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use chrono_tz::Tz;
use cron::Schedule;
use tokio_util::sync::CancellationToken;

use crate::alerts::AlertEngine;
use crate::bus::{BusMessage, CoordinationBus};
use crate::catalog::{Catalog, CatalogFetchPort};
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::logging::LogForwarder;
use crate::notify::AssetPort;
use crate::stats::StatsStore;
use crate::upstream::UpstreamClient;

/// Fixed evaluation timezone (§4.L). No config key in §6 exposes a
/// timezone knob, so every cron expression in `ShardConfig` is read
/// against UTC; see DESIGN.md for this Open Question's resolution.
const SCHEDULE_TZ: Tz = Tz::UTC;

const LEADER_LOCK_NAME: &str = "scheduler_leader";
const LEADER_LOCK_TTL: Duration = Duration::from_secs(30);
const LEADER_RENEW_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
enum JobKind {
    AlertScan,
    VersionRefresh,
    PriceReload,
    UserAgentRefresh,
}

struct ScheduledJob {
    kind: JobKind,
    schedule: Schedule,
}

pub struct Scheduler {
    config: Arc<ConfigHandle>,
    bus: Arc<CoordinationBus>,
    clock: Arc<dyn Clock>,
    alerts: Arc<AlertEngine>,
    catalog: Arc<Catalog>,
    catalog_fetch: Arc<dyn CatalogFetchPort>,
    upstream: Arc<UpstreamClient>,
    assets: Arc<dyn AssetPort>,
    stats: Arc<StatsStore>,
    logs: Arc<LogForwarder>,
    manifest_url: String,
    shard_id: u32,
    shard_count: u32,
    is_leader: Arc<AtomicBool>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<ConfigHandle>,
        bus: Arc<CoordinationBus>,
        clock: Arc<dyn Clock>,
        alerts: Arc<AlertEngine>,
        catalog: Arc<Catalog>,
        catalog_fetch: Arc<dyn CatalogFetchPort>,
        upstream: Arc<UpstreamClient>,
        assets: Arc<dyn AssetPort>,
        stats: Arc<StatsStore>,
        logs: Arc<LogForwarder>,
        manifest_url: String,
        shard_id: u32,
        shard_count: u32,
    ) -> Self {
        Self {
            config,
            bus,
            clock,
            alerts,
            catalog,
            catalog_fetch,
            upstream,
            assets,
            stats,
            logs,
            manifest_url,
            shard_id,
            shard_count,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag other ambient loops (the catalog's debounced persistence
    /// loop) gate on, so there is exactly one leader-election mechanism.
    pub fn is_leader_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.is_leader)
    }

    fn build_jobs(&self, config: &crate::config::ShardConfig) -> anyhow::Result<Vec<ScheduledJob>> {
        Ok(vec![
            ScheduledJob { kind: JobKind::AlertScan, schedule: Schedule::from_str(&config.refresh_skins)? },
            ScheduledJob {
                kind: JobKind::VersionRefresh,
                schedule: Schedule::from_str(&config.check_game_version)?,
            },
            ScheduledJob { kind: JobKind::PriceReload, schedule: Schedule::from_str(&config.refresh_prices)? },
            ScheduledJob {
                kind: JobKind::UserAgentRefresh,
                schedule: Schedule::from_str(&config.update_user_agent)?,
            },
        ])
    }

    /// Runs every periodic job until `shutdown` fires, then flushes debounced
    /// persistence and propagates `process_exit` so peer shards exit too.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let jobs = {
            let config = self.config.current().await;
            self.build_jobs(&config)?
        };

        let mut handles = Vec::new();
        for job in jobs {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_job_loop(job, shutdown).await }));
        }

        {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_leader_election_loop(shutdown).await }));
        }
        {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_emoji_warmup_loop(shutdown).await }));
        }
        {
            let scheduler = Arc::clone(&self);
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move { scheduler.run_log_forwarding_loop(shutdown).await }));
        }

        shutdown.cancelled().await;
        for handle in handles {
            let _ = handle.await;
        }

        let is_leader = self.is_leader.load(Ordering::Acquire);
        if let Err(e) = self.stats.flush_if_leader(is_leader).await {
            tracing::warn!(err = %e, "scheduler shutdown: stats flush failed");
        }
        self.bus.broadcast(&BusMessage::ProcessExit).await?;
        Ok(())
    }

    async fn run_job_loop(&self, job: ScheduledJob, shutdown: CancellationToken) {
        loop {
            let now = Utc::now().with_timezone(&SCHEDULE_TZ);
            let Some(next) = job.schedule.after(&now).next() else {
                tracing::warn!(kind = ?job.kind, "scheduler: cron expression has no further occurrences");
                return;
            };
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
            if shutdown.is_cancelled() {
                return;
            }

            if let Err(e) = self.run_job(job.kind, &shutdown).await {
                tracing::warn!(err = %e, kind = ?job.kind, "scheduler: job failed");
            }
        }
    }

    async fn run_job(&self, kind: JobKind, shutdown: &CancellationToken) -> anyhow::Result<()> {
        match kind {
            JobKind::AlertScan => {
                let shard_count = self.resolved_shard_count().await;
                self.alerts.run_scan(self.shard_id, shard_count, shutdown).await
            }
            JobKind::VersionRefresh => {
                let new_version = self.catalog_fetch.fetch_manifest_version().await?;
                if self.catalog.needs_refetch(&new_version).await {
                    tracing::info!(new_version, "scheduler: game version changed, refetching catalog");
                    let fresh = self.catalog_fetch.fetch_all_tables(&new_version).await?;
                    self.catalog.replace_all(fresh).await;
                    self.bus.broadcast(&BusMessage::VersionData { game_version: new_version }).await?;
                }
                Ok(())
            }
            JobKind::PriceReload => self.catalog.load_from_disk().await,
            JobKind::UserAgentRefresh => {
                self.upstream.refresh_client_version(&self.manifest_url).await?;
                Ok(())
            }
        }
    }

    async fn resolved_shard_count(&self) -> u32 {
        let config = self.config.current().await;
        config.explicit_shard_count().unwrap_or(self.shard_count.max(1))
    }

    /// Renews a TTL'd distributed lock on a fixed cadence; whichever shard
    /// holds it is "the leader" for debounced-persistence and warmup jobs.
    async fn run_leader_election_loop(&self, shutdown: CancellationToken) {
        let holder = format!("shard-{}-{}", self.shard_id, self.clock.now_ms());
        loop {
            match self.bus.try_lock(LEADER_LOCK_NAME, LEADER_LOCK_TTL, &holder).await {
                Ok(held) => self.is_leader.store(held, Ordering::Release),
                Err(e) => {
                    tracing::warn!(err = %e, "scheduler: leader lock check failed");
                    self.is_leader.store(false, Ordering::Release);
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(LEADER_RENEW_INTERVAL) => {}
            }
        }
    }

    async fn run_emoji_warmup_loop(&self, shutdown: CancellationToken) {
        loop {
            let interval = self.config.current().await.emoji_cache_expiration();
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            if !self.is_leader.load(Ordering::Acquire) {
                continue;
            }
            match self.assets.warm_snapshot().await {
                Ok(snapshot) => {
                    if let Err(e) = self.bus.broadcast(&BusMessage::EmojiCatalogWarm { snapshot }).await {
                        tracing::warn!(err = %e, "scheduler: emoji warmup broadcast failed");
                    }
                }
                Err(e) => tracing::warn!(err = %e, "scheduler: emoji warmup failed"),
            }
        }
    }

    async fn run_log_forwarding_loop(&self, shutdown: CancellationToken) {
        loop {
            let (interval, config) = {
                let config = self.config.current().await;
                (Duration::from_millis(config.log_frequency_ms), config)
            };
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.logs.flush(&self.bus, &config).await {
                        tracing::warn!(err = %e, "scheduler: final log flush failed");
                    }
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            if let Err(e) = self.logs.flush(&self.bus, &config).await {
                tracing::warn!(err = %e, "scheduler: log flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cron_expressions_in_default_config_parse() -> anyhow::Result<()> {
        // Every field carries a serde default, so `{}` deserializes to the
        // same cron expressions `ShardConfig`'s `#[arg(default_value = ...)]`
        // attributes use.
        let config: crate::config::ShardConfig = serde_json::from_str("{}")?;
        Schedule::from_str(&config.refresh_skins)?;
        Schedule::from_str(&config.check_game_version)?;
        Schedule::from_str(&config.refresh_prices)?;
        Schedule::from_str(&config.update_user_agent)?;
        Ok(())
    }
}
