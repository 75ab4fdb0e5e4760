// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Asset catalog (§4.G): versioned lookup tables, debounced leader-only
//! persistence (atomic tempfile + rename, grounded in the teacher's
//! `credential/persist.rs`), and monotone price discovery fed by the shop
//! service.

pub mod search;
pub mod tables;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub use search::{fuzzy_search, SearchResult};
pub use tables::CatalogTables;

use crate::bus::{BusMessage, CoordinationBus};
use crate::model::ItemId;

/// Source of truth the scheduler's version-refresh job consults (§4.L):
/// whatever reads the upstream static-CDN manifest and its per-table
/// endpoints. Kept as a port so the catalog itself never depends on the
/// wire shape of those "opaque" endpoints (spec §6).
#[async_trait]
pub trait CatalogFetchPort: Send + Sync {
    async fn fetch_manifest_version(&self) -> anyhow::Result<String>;
    async fn fetch_all_tables(&self, game_version: &str) -> anyhow::Result<CatalogTables>;
}

/// Debounce window for disk persistence: bursts of price discoveries during
/// a shop-fetch wave coalesce into one write.
const PERSIST_DEBOUNCE: Duration = Duration::from_secs(3);

pub struct Catalog {
    tables: RwLock<CatalogTables>,
    dirty: AtomicBool,
    path: PathBuf,
}

impl Catalog {
    pub fn new(path: PathBuf) -> Self {
        Self { tables: RwLock::new(CatalogTables::default()), dirty: AtomicBool::new(false), path }
    }

    pub async fn load_from_disk(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let loaded: CatalogTables = serde_json::from_str(&contents)?;
        *self.tables.write().await = loaded;
        Ok(())
    }

    pub async fn snapshot(&self) -> CatalogTables {
        self.tables.read().await.clone()
    }

    pub async fn game_version(&self) -> String {
        self.tables.read().await.game_version.clone()
    }

    /// Replaces every table wholesale (called after a full refetch, either
    /// on first start or when `game_version` changes) and marks dirty.
    pub async fn replace_all(&self, fresh: CatalogTables) {
        *self.tables.write().await = fresh;
        self.dirty.store(true, Ordering::Release);
    }

    /// Returns true if `new_version` differs from the currently cached one,
    /// meaning every table must be refetched (§4.G).
    pub async fn needs_refetch(&self, new_version: &str) -> bool {
        self.tables.read().await.game_version != new_version
    }

    /// Monotone union: new item ids are added, existing ones keep their
    /// latest observed price. The known key set never shrinks between
    /// version changes. Returns whether anything changed, so the caller
    /// only re-broadcasts on a genuine update.
    pub async fn merge_prices_local(&self, partial: &HashMap<ItemId, u64>) -> bool {
        let mut tables = self.tables.write().await;
        let mut changed = false;
        for (id, price) in partial {
            match tables.prices.get(id) {
                Some(existing) if existing == price => {}
                _ => {
                    tables.prices.insert(id.clone(), *price);
                    changed = true;
                }
            }
        }
        drop(tables);
        if changed {
            self.dirty.store(true, Ordering::Release);
        }
        changed
    }

    /// Merges locally, then broadcasts the partial so every shard's
    /// in-memory copy stays current between debounced disk persists.
    pub async fn merge_prices(&self, bus: &CoordinationBus, partial: HashMap<ItemId, u64>) -> anyhow::Result<bool> {
        let changed = self.merge_prices_local(&partial).await;
        if changed {
            bus.broadcast(&BusMessage::PriceUpdate { prices: partial }).await?;
        }
        Ok(changed)
    }

    /// Reacts to bus traffic: merges peer-discovered prices in, and reloads
    /// from disk when the leader announces a fresh persisted snapshot.
    pub async fn handle_bus_message(&self, msg: &BusMessage) -> anyhow::Result<()> {
        match msg {
            BusMessage::PriceUpdate { prices } => {
                self.merge_prices_local(prices).await;
            }
            BusMessage::CatalogReload => {
                self.load_from_disk().await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Debounced persistence loop. Only the leader shard actually writes;
    /// followers just clear their own dirty flag (their tables stay current
    /// via `PriceUpdate` broadcasts and are refreshed wholesale on reload).
    pub async fn run_persistence_loop(
        self: Arc<Self>,
        bus: Arc<CoordinationBus>,
        is_leader: impl Fn() -> bool + Send + 'static,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(PERSIST_DEBOUNCE);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if self.dirty.swap(false, Ordering::AcqRel) && is_leader() {
                        let _ = self.persist_to_disk().await;
                    }
                    return;
                }
                _ = ticker.tick() => {}
            }

            if !self.dirty.swap(false, Ordering::AcqRel) {
                continue;
            }
            if !is_leader() {
                continue;
            }
            if let Err(e) = self.persist_to_disk().await {
                tracing::warn!(err = %e, "catalog persist failed");
                self.dirty.store(true, Ordering::Release);
                continue;
            }
            if let Err(e) = bus.broadcast(&BusMessage::CatalogReload).await {
                tracing::warn!(err = %e, "catalog reload broadcast failed");
            }
        }
    }

    async fn persist_to_disk(&self) -> anyhow::Result<()> {
        let json = {
            let tables = self.tables.read().await;
            serde_json::to_string_pretty(&*tables)?
        };
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }

    pub async fn search_items(&self, query: &str, locale: Option<&str>, limit: usize) -> Vec<SearchResult> {
        let tables = self.tables.read().await;
        let candidates = tables.items.values().map(|i| (&i.id, i.canonical_name.as_str(), &i.names_by_locale));
        fuzzy_search(query, locale, candidates, limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merge_prices_local_grows_monotonically() {
        let catalog = Catalog::new(PathBuf::from("/tmp/does-not-matter.json"));
        let mut first = HashMap::new();
        first.insert("skin-a".to_owned(), 1775);
        assert!(catalog.merge_prices_local(&first).await);

        let mut second = HashMap::new();
        second.insert("skin-b".to_owned(), 2475);
        assert!(catalog.merge_prices_local(&second).await);

        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.prices.len(), 2);
        assert_eq!(snapshot.prices.get("skin-a"), Some(&1775));
    }

    #[tokio::test]
    async fn merge_prices_local_is_idempotent_for_unchanged_values() {
        let catalog = Catalog::new(PathBuf::from("/tmp/does-not-matter.json"));
        let mut prices = HashMap::new();
        prices.insert("skin-a".to_owned(), 1775);
        assert!(catalog.merge_prices_local(&prices).await);
        assert!(!catalog.merge_prices_local(&prices).await);
    }

    #[tokio::test]
    async fn persist_to_disk_writes_atomically_via_tempfile_rename() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("catalog.json");
        let catalog = Catalog::new(path.clone());

        let mut prices = HashMap::new();
        prices.insert("skin-a".to_owned(), 1775);
        catalog.merge_prices_local(&prices).await;
        catalog.persist_to_disk().await?;

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reloaded = Catalog::new(path);
        reloaded.load_from_disk().await?;
        assert_eq!(reloaded.snapshot().await.prices.get("skin-a"), Some(&1775));
        Ok(())
    }
}
