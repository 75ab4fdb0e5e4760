// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Coordination bus backed by `async-nats`, the teacher's own choice for
//! cross-process pub/sub (`transport/nats_pub.rs`, `nats_sub.rs`). Shared
//! counter/queue/lock primitives ride on the same connection via JetStream
//! KV, so no new external dependency is introduced.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::barrier::ReadinessBarrier;
use crate::bus::messages::BusMessage;
use crate::model::{AuthQueueItem, ChannelId};

pub struct BusConfig {
    pub url: String,
    pub token: Option<String>,
    pub prefix: String,
    pub shard_id: u32,
    pub shard_count: u32,
}

/// Cross-shard coordination fabric (§4.D).
pub struct CoordinationBus {
    client: async_nats::Client,
    kv: jetstream::kv::Store,
    prefix: String,
    own_shard_id: u32,
    shard_count: u32,
    /// Channel ids this shard's local cache currently holds, consulted by
    /// targeted-by-key delivery.
    owned_keys: RwLock<HashSet<ChannelId>>,
    pub barrier: Arc<ReadinessBarrier>,
    local_tx: broadcast::Sender<BusMessage>,
    /// Every shard_id ever seen announcing itself, across respawns —
    /// re-announcing one already in this set means it respawned.
    confirmed_shards: RwLock<HashSet<u32>>,
    /// Shard ids seen since the last rearm; the barrier reopens once this
    /// reaches `shard_count`.
    epoch_shards: RwLock<HashSet<u32>>,
}

#[derive(Serialize, Deserialize)]
struct LockValue {
    holder: String,
    expires_at: i64,
}

impl CoordinationBus {
    pub async fn connect(config: &BusConfig) -> anyhow::Result<Arc<Self>> {
        let mut opts = async_nats::ConnectOptions::new().retry_on_initial_connect();
        if let Some(ref token) = config.token {
            opts = opts.token(token.clone());
        }
        let client = opts.connect(&config.url).await?;
        let js = jetstream::new(client.clone());
        let kv = js
            .create_key_value(jetstream::kv::Config {
                bucket: format!("{}_state", config.prefix),
                ..Default::default()
            })
            .await?;

        let (local_tx, _) = broadcast::channel(1024);
        let bus = Arc::new(Self {
            client,
            kv,
            prefix: config.prefix.clone(),
            own_shard_id: config.shard_id,
            shard_count: config.shard_count.max(1),
            owned_keys: RwLock::new(HashSet::new()),
            barrier: Arc::new(ReadinessBarrier::new()),
            local_tx,
            confirmed_shards: RwLock::new(HashSet::new()),
            epoch_shards: RwLock::new(HashSet::new()),
        });
        Ok(bus)
    }

    /// Announces this shard's presence. Called once `spawn_subscriber` is
    /// running so the reply to our own announcement isn't missed. The first
    /// announcement of a given `shard_id` counts toward the initial
    /// readiness epoch; a repeat announcement (a respawn) re-arms the
    /// barrier on every shard and every live shard re-announces itself so
    /// the epoch refills and readiness is re-declared.
    pub async fn announce_started(&self) -> anyhow::Result<()> {
        self.raw_broadcast(&BusMessage::ShardStarted { shard_id: self.own_shard_id }).await
    }

    async fn raw_broadcast(&self, msg: &BusMessage) -> anyhow::Result<()> {
        let subject = format!("{}.broadcast", self.prefix);
        let payload = serde_json::to_vec(msg)?;
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }

    async fn handle_shard_started(self: &Arc<Self>, shard_id: u32) {
        let is_respawn = {
            let mut confirmed = self.confirmed_shards.write().await;
            !confirmed.insert(shard_id)
        };

        if is_respawn {
            self.barrier.rearm();
            self.epoch_shards.write().await.clear();
        }
        let epoch_len = {
            let mut epoch = self.epoch_shards.write().await;
            epoch.insert(shard_id);
            epoch.len()
        };

        if is_respawn {
            let bus = Arc::clone(self);
            tokio::spawn(async move {
                let _ = bus.raw_broadcast(&BusMessage::ShardStarted { shard_id: bus.own_shard_id }).await;
            });
        }

        if epoch_len >= self.shard_count as usize {
            self.barrier.open();
        }
    }

    /// Spawn the subscriber loop that fans broadcasts into `subscribe()` and
    /// answers targeted-by-key requests for locally-owned channel ids.
    pub fn spawn_subscriber(self: &Arc<Self>, shutdown: CancellationToken) {
        let bus = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = bus.run_subscriber(shutdown).await {
                tracing::error!(err = %e, "coordination bus subscriber failed");
            }
        });
    }

    async fn run_subscriber(self: &Arc<Self>, shutdown: CancellationToken) -> anyhow::Result<()> {
        let broadcast_subject = format!("{}.broadcast", self.prefix);
        let targeted_subject = format!("{}.targeted.*", self.prefix);
        let mut broadcasts = self.client.subscribe(broadcast_subject).await?;
        let mut targeted = self.client.subscribe(targeted_subject).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = broadcasts.next() => {
                    let Some(msg) = msg else { break };
                    let Ok(parsed) = serde_json::from_slice::<BusMessage>(&msg.payload) else {
                        continue;
                    };
                    if matches!(parsed, BusMessage::AllShardsReady) {
                        self.barrier.open();
                    }
                    if let BusMessage::ShardStarted { shard_id } = parsed {
                        self.handle_shard_started(shard_id).await;
                        continue;
                    }
                    let _ = self.local_tx.send(parsed);
                }
                msg = targeted.next() => {
                    let Some(msg) = msg else { break };
                    let Some(key_str) = msg.subject.as_str().rsplit('.').next() else { continue };
                    let Ok(key) = key_str.parse::<ChannelId>() else { continue };
                    if self.owned_keys.read().await.contains(&key) {
                        if let Ok(parsed) = serde_json::from_slice::<BusMessage>(&msg.payload) {
                            let _ = self.local_tx.send(parsed);
                        }
                        if let Some(reply) = msg.reply {
                            let _ = self.client.publish(reply, "ok".into()).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.local_tx.subscribe()
    }

    /// Shares the same JetStream KV bucket backing this bus's own
    /// primitives, so the rate-limit gate needs no second connection.
    pub fn kv_store(&self) -> jetstream::kv::Store {
        self.kv.clone()
    }

    /// Broadcast send: every shard (including sender) receives `msg`, in
    /// per-sender FIFO order (guaranteed by the single NATS connection).
    /// Blocks on the readiness barrier first (§4.D.3): no cross-shard send
    /// may race ahead of it.
    pub async fn broadcast(&self, msg: &BusMessage) -> anyhow::Result<()> {
        self.barrier.wait_ready().await;
        let subject = format!("{}.broadcast", self.prefix);
        let payload = serde_json::to_vec(msg)?;
        self.client.publish(subject, payload.into()).await?;
        Ok(())
    }

    /// Targeted-by-key send: delivered only to the shard whose local cache
    /// holds `key`. Returns whether any shard accepted it. Blocks on the
    /// readiness barrier first, same as `broadcast`.
    pub async fn send_to_key(&self, msg: &BusMessage, key: ChannelId) -> anyhow::Result<bool> {
        self.barrier.wait_ready().await;
        let subject = format!("{}.targeted.{key}", self.prefix);
        let payload = serde_json::to_vec(msg)?;
        match self.client.request(subject, payload.into()).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    pub async fn register_owned_key(&self, key: ChannelId) {
        self.owned_keys.write().await.insert(key);
    }

    pub async fn unregister_owned_key(&self, key: ChannelId) {
        self.owned_keys.write().await.remove(&key);
    }

    // ── Distributed lock ────────────────────────────────────────────────

    pub async fn try_lock(&self, name: &str, ttl: Duration, holder: &str) -> anyhow::Result<bool> {
        let key = format!("lock.{name}");
        let now = crate::clock::SystemClock.now_ms();
        let expires_at = now + ttl.as_millis() as i64;
        let value = serde_json::to_vec(&LockValue { holder: holder.to_owned(), expires_at })?;

        match self.kv.entry(&key).await? {
            None => Ok(self.kv.create(&key, value.into()).await.is_ok()),
            Some(entry) => {
                let existing: LockValue = serde_json::from_slice(&entry.value)?;
                if existing.expires_at > now {
                    return Ok(false);
                }
                Ok(self.kv.update(&key, value.into(), entry.revision).await.is_ok())
            }
        }
    }

    pub async fn unlock(&self, name: &str) -> anyhow::Result<()> {
        let key = format!("lock.{name}");
        self.kv.delete(&key).await?;
        Ok(())
    }

    // ── Shared counter ──────────────────────────────────────────────────

    pub async fn next_counter(&self, name: &str) -> anyhow::Result<u64> {
        let key = format!("counter.{name}");
        loop {
            match self.kv.entry(&key).await? {
                None => {
                    if self.kv.create(&key, b"1".to_vec().into()).await.is_ok() {
                        return Ok(1);
                    }
                }
                Some(entry) => {
                    let current: u64 = std::str::from_utf8(&entry.value)?.parse().unwrap_or(0);
                    let next = current + 1;
                    if self
                        .kv
                        .update(&key, next.to_string().into_bytes().into(), entry.revision)
                        .await
                        .is_ok()
                    {
                        return Ok(next);
                    }
                }
            }
        }
    }

    /// Generic CAS increment for ad-hoc shared counters (per-day stats
    /// aggregation), where `next_counter`'s fixed by-1 step doesn't fit.
    pub async fn incr_by(&self, key: &str, delta: u64) -> anyhow::Result<u64> {
        loop {
            match self.kv.entry(key).await? {
                None => {
                    if self.kv.create(key, delta.to_string().into_bytes().into()).await.is_ok() {
                        return Ok(delta);
                    }
                }
                Some(entry) => {
                    let current: u64 = std::str::from_utf8(&entry.value)?.parse().unwrap_or(0);
                    let next = current + delta;
                    if self
                        .kv
                        .update(key, next.to_string().into_bytes().into(), entry.revision)
                        .await
                        .is_ok()
                    {
                        return Ok(next);
                    }
                }
            }
        }
    }

    // ── Shared FIFO queue (auth queue) ──────────────────────────────────

    pub async fn queue_push(&self, name: &str, item: AuthQueueItem) -> anyhow::Result<()> {
        let key = format!("queue.{name}");
        loop {
            let (mut items, revision) = match self.kv.entry(&key).await? {
                None => (Vec::new(), None),
                Some(entry) => {
                    let items: Vec<AuthQueueItem> =
                        serde_json::from_slice(&entry.value).unwrap_or_default();
                    (items, Some(entry.revision))
                }
            };
            items.push(item.clone());
            let payload = serde_json::to_vec(&items)?;
            let ok = match revision {
                None => self.kv.create(&key, payload.into()).await.is_ok(),
                Some(rev) => self.kv.update(&key, payload.into(), rev).await.is_ok(),
            };
            if ok {
                return Ok(());
            }
        }
    }

    pub async fn queue_pop(&self, name: &str) -> anyhow::Result<Option<AuthQueueItem>> {
        let key = format!("queue.{name}");
        loop {
            let Some(entry) = self.kv.entry(&key).await? else {
                return Ok(None);
            };
            let mut items: Vec<AuthQueueItem> =
                serde_json::from_slice(&entry.value).unwrap_or_default();
            if items.is_empty() {
                return Ok(None);
            }
            let popped = items.remove(0);
            let payload = serde_json::to_vec(&items)?;
            if self.kv.update(&key, payload.into(), entry.revision).await.is_ok() {
                return Ok(Some(popped));
            }
        }
    }

    pub async fn queue_len(&self, name: &str) -> anyhow::Result<usize> {
        let key = format!("queue.{name}");
        match self.kv.entry(&key).await? {
            None => Ok(0),
            Some(entry) => {
                let items: Vec<AuthQueueItem> =
                    serde_json::from_slice(&entry.value).unwrap_or_default();
                Ok(items.len())
            }
        }
    }

    // ── General-purpose ephemeral KV, used by the login queue's per-`c`
    // result slots alongside the rate-limit gate's per-host records ────────

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let payload = serde_json::to_vec(value)?;
        self.kv.put(key, payload.into()).await?;
        Ok(())
    }

    pub async fn get_json<T: for<'de> Deserialize<'de>>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.kv.entry(key).await? {
            None => Ok(None),
            Some(entry) => Ok(serde_json::from_slice(&entry.value).ok()),
        }
    }

    pub async fn delete_key(&self, key: &str) -> anyhow::Result<()> {
        self.kv.delete(key).await?;
        Ok(())
    }
}
