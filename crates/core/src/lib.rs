// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shopwatch core: a sharded, horizontally-scaled alerting and live-match
//! service for a cosmetic storefront of a session-based multiplayer game.
//!
//! [`Shard`] bundles every component a presentation adapter needs — the
//! chat-SDK command handlers call straight into its public fields
//! (`shard.shop.fetch_shop(...)`, `shard.matches.aggregate_live_match(...)`,
//! `shard.catalog.search_items(...)`) — while [`Shard::run`] drives the
//! background lifecycle (scheduler, bus dispatch, debounced persistence)
//! until shutdown. This split mirrors the teacher's `coop_mux::MuxState` /
//! `coop_mux::run` separation: a shared handle callers hold onto, plus a
//! driver loop spawned once per process.

pub mod alerts;
pub mod auth;
pub mod bus;
pub mod catalog;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod matches;
pub mod model;
pub mod notify;
pub mod ratelimit;
pub mod scheduler;
pub mod shop;
pub mod stats;
pub mod store;
pub mod upstream;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alerts::AlertEngine;
use crate::auth::{AuthCore, AuthEndpoints};
use crate::bus::{BusConfig, BusMessage, CoordinationBus};
use crate::catalog::{Catalog, CatalogFetchPort};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigHandle, ShardConfig};
use crate::logging::{LogBuffer, LogForwarder};
use crate::matches::{MatchAggregator, MatchEndpoints};
use crate::notify::{AssetPort, NotificationPort};
use crate::ratelimit::RateLimitGate;
use crate::scheduler::Scheduler;
use crate::shop::{ShopEndpoints, ShopService};
use crate::stats::StatsStore;
use crate::store::UserStore;
use crate::upstream::UpstreamClient;

/// Wire endpoints for the three external collaborators named opaque in §6 —
/// exact URLs are a deployment concern, not something this crate hardcodes.
pub struct Endpoints {
    pub shop: ShopEndpoints,
    pub auth: AuthEndpoints,
    pub live_match: MatchEndpoints,
    pub manifest_url: String,
    pub upstream_base_url: String,
    pub bus_prefix: String,
}

/// Everything [`Shard::bootstrap`] needs that this crate cannot construct
/// itself because it crosses the external-collaborator boundary (spec §1):
/// a chat-SDK notifier, an emoji/asset registry, and the upstream catalog
/// fetcher.
pub struct Ports {
    pub notify: Arc<dyn NotificationPort>,
    pub assets: Arc<dyn AssetPort>,
    pub catalog_fetch: Arc<dyn CatalogFetchPort>,
}

/// One shard process's wired-up components. Presentation-layer command
/// handlers hold an `Arc<Shard>` and call into its public fields directly;
/// [`Shard::run`] separately drives the scheduler and ambient bus traffic
/// for as long as the process lives.
pub struct Shard {
    pub config: Arc<ConfigHandle>,
    pub clock: Arc<dyn Clock>,
    pub bus: Arc<CoordinationBus>,
    pub store: Arc<UserStore>,
    pub auth: Arc<AuthCore>,
    pub catalog: Arc<Catalog>,
    pub stats: Arc<StatsStore>,
    pub shop: Arc<ShopService>,
    pub alerts: Arc<AlertEngine>,
    pub matches: Arc<MatchAggregator>,
    /// Lines pushed here go out on the scheduler's log-forwarding loop;
    /// exposed for the presentation adapter's own event handlers to feed.
    pub log_buffer: Arc<LogBuffer>,
    shard_id: u32,
    scheduler: Arc<Scheduler>,
}

impl Shard {
    /// Connects to the coordination bus, opens the embedded store, and wires
    /// every component together. Does not start any background loop —
    /// call [`Shard::run`] for that once the caller is ready.
    pub async fn bootstrap(config: ShardConfig, endpoints: Endpoints, ports: Ports) -> anyhow::Result<Arc<Shard>> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let shard_id = config.shard_id;
        let shard_count = config.explicit_shard_count().unwrap_or(1);
        let config = Arc::new(ConfigHandle::new(config));
        let current = config.current().await;

        let bus = CoordinationBus::connect(&BusConfig {
            url: format!("{}:{}", current.store_host, current.store_port),
            token: current.store_password.clone(),
            prefix: endpoints.bus_prefix.clone(),
            shard_id,
            shard_count,
        })
        .await?;

        let rate_limit = Arc::new(RateLimitGate::new(
            Arc::clone(&bus),
            bus.kv_store(),
            current.rate_limit_backoff(),
            current.rate_limit_cap(),
        ));
        let upstream = Arc::new(UpstreamClient::new(
            endpoints.upstream_base_url.clone(),
            Arc::clone(&rate_limit),
            Arc::clone(&clock),
        )?);

        let store = Arc::new(UserStore::open(&current.db_path)?);
        let auth = Arc::new(AuthCore::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            Arc::clone(&config),
            Arc::clone(&clock),
            reqwest::Client::builder().build()?,
            endpoints.auth,
            Arc::clone(&rate_limit),
        ));

        let catalog = Arc::new(Catalog::new(current.db_path.with_file_name("skins.json")));
        catalog.load_from_disk().await?;
        let stats = Arc::new(StatsStore::new(current.db_path.with_file_name("stats.json")));
        if current.track_store_stats {
            stats.load_from_disk().await?;
        }

        let shop = Arc::new(ShopService::new(
            Arc::clone(&upstream),
            Arc::clone(&auth),
            Arc::clone(&catalog),
            Arc::clone(&bus),
            Arc::clone(&clock),
            endpoints.shop,
            current.use_shop_cache,
        ));
        let alerts = Arc::new(AlertEngine::new(
            Arc::clone(&store),
            Arc::clone(&shop),
            Arc::clone(&ports.notify),
            Arc::clone(&bus),
            Arc::clone(&config),
            Arc::clone(&clock),
        ));
        let matches = Arc::new(MatchAggregator::new(
            Arc::clone(&upstream),
            Arc::clone(&auth),
            Arc::clone(&catalog),
            Arc::clone(&clock),
            endpoints.live_match,
        ));

        let log_buffer = Arc::new(LogBuffer::new());
        let logs = Arc::new(LogForwarder::new(Arc::clone(&log_buffer))?);

        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&bus),
            Arc::clone(&clock),
            Arc::clone(&alerts),
            Arc::clone(&catalog),
            ports.catalog_fetch,
            Arc::clone(&upstream),
            ports.assets,
            Arc::clone(&stats),
            logs,
            endpoints.manifest_url,
            shard_id,
            shard_count,
        ));

        Ok(Arc::new(Shard {
            config,
            clock,
            bus,
            store,
            auth,
            catalog,
            stats,
            shop,
            alerts,
            matches,
            log_buffer,
            shard_id,
            scheduler,
        }))
    }

    /// Drives this shard's background lifecycle until `shutdown` fires:
    /// the bus subscriber, the login-queue drain loop, ambient bus message
    /// dispatch, debounced catalog/stats persistence, and the scheduler's
    /// cron table. Returns once every job has wound down and `process_exit`
    /// has propagated to peer shards.
    pub async fn run(self: &Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.bus.spawn_subscriber(shutdown.clone());
        if let Err(e) = self.bus.announce_started().await {
            tracing::warn!(err = %e, "failed to announce shard startup on coordination bus");
        }

        tokio::spawn(crate::auth::login_queue::run_drain_loop(
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            self.auth.login_queue_operation(),
            self.config.current().await.login_queue_interval(),
            shutdown.clone(),
        ));

        let is_leader = self.scheduler.is_leader_flag();
        tokio::spawn(Arc::clone(&self.catalog).run_persistence_loop(
            Arc::clone(&self.bus),
            {
                let is_leader = Arc::clone(&is_leader);
                move || is_leader.load(Ordering::Acquire)
            },
            shutdown.clone(),
        ));

        self.spawn_bus_dispatch_loop(shutdown.clone());

        let ready_timeout = self.config.current().await.shard_ready_timeout();
        if tokio::time::timeout(ready_timeout, self.bus.barrier.wait_ready()).await.is_err() {
            tracing::warn!("shard startup: readiness barrier timed out, proceeding anyway");
        }

        self.scheduler.clone().run(shutdown).await?;

        let is_leader = is_leader.load(Ordering::Acquire);
        if let Err(e) = self.stats.flush_if_leader(is_leader).await {
            tracing::warn!(err = %e, "shard shutdown: stats flush failed");
        }
        Ok(())
    }

    fn spawn_bus_dispatch_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let shard = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = shard.bus.subscribe();
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => {
                        let Ok(msg) = msg else { continue };
                        if let Err(e) = shard.catalog.handle_bus_message(&msg).await {
                            tracing::warn!(err = %e, "catalog bus dispatch failed");
                        }
                        shard.handle_bus_message(msg, &shutdown).await;
                    }
                }
            }
        });
    }

    async fn handle_bus_message(self: &Arc<Self>, msg: BusMessage, shutdown: &CancellationToken) {
        match msg {
            BusMessage::ForceCheckAlerts => {
                let shard = Arc::clone(self);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let shard_count = shard.config.current().await.explicit_shard_count().unwrap_or(1);
                    if let Err(e) = shard.alerts.run_scan(shard.shard_id, shard_count.max(1), &shutdown).await {
                        tracing::warn!(err = %e, "forced alert scan failed");
                    }
                });
            }
            BusMessage::ConfigReload => {
                if let Err(e) = self.config.reload().await {
                    tracing::warn!(err = %e, "config reload failed");
                }
            }
            BusMessage::ProcessExit => shutdown.cancel(),
            _ => {}
        }
    }
}
