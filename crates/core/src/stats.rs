// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-day aggregate counters (§6 persisted state: `stats.json`,
//! `stats:{date}:{users|shops|items}`). Grounded in the same debounced
//! leader-write pattern as [`crate::catalog::Catalog`]: local counters are
//! cheap to bump on every request; only the leader persists `stats.json`,
//! while the shared-store counters give every shard a cluster-wide view
//! without waiting on that debounce.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration as ChronoDuration, NaiveDate};
use tokio::sync::RwLock;

use crate::bus::CoordinationBus;
use crate::model::DailyStats;

pub struct StatsStore {
    days: RwLock<HashMap<String, DailyStats>>,
    dirty: AtomicBool,
    path: PathBuf,
}

impl StatsStore {
    pub fn new(path: PathBuf) -> Self {
        Self { days: RwLock::new(HashMap::new()), dirty: AtomicBool::new(false), path }
    }

    pub async fn load_from_disk(&self) -> anyhow::Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let loaded: HashMap<String, DailyStats> = serde_json::from_str(&contents)?;
        *self.days.write().await = loaded;
        Ok(())
    }

    pub async fn snapshot(&self) -> HashMap<String, DailyStats> {
        self.days.read().await.clone()
    }

    async fn bump_local(&self, date: &str, f: impl FnOnce(&mut DailyStats)) {
        let mut days = self.days.write().await;
        let entry = days.entry(date.to_owned()).or_insert_with(|| DailyStats { date: date.to_owned(), ..Default::default() });
        f(entry);
        drop(days);
        self.dirty.store(true, Ordering::Release);
    }

    pub async fn record_user_seen(&self, bus: &CoordinationBus, date: &str) -> anyhow::Result<()> {
        self.bump_local(date, |d| d.users += 1).await;
        bus.incr_by(&format!("stats.{date}.users"), 1).await?;
        Ok(())
    }

    pub async fn record_shop_fetch(&self, bus: &CoordinationBus, date: &str) -> anyhow::Result<()> {
        self.bump_local(date, |d| d.shops += 1).await;
        bus.incr_by(&format!("stats.{date}.shops"), 1).await?;
        Ok(())
    }

    pub async fn record_items_delivered(&self, bus: &CoordinationBus, date: &str, count: u64) -> anyhow::Result<()> {
        if count == 0 {
            return Ok(());
        }
        self.bump_local(date, |d| d.items += count).await;
        bus.incr_by(&format!("stats.{date}.items"), count).await?;
        Ok(())
    }

    /// Drops days older than `retention_days` relative to `today`
    /// (`YYYY-MM-DD` lexicographic ordering matches chronological ordering).
    pub async fn prune_expired(&self, today: &str, retention_days: u32) {
        let Ok(today) = NaiveDate::parse_from_str(today, "%Y-%m-%d") else { return };
        let Some(cutoff) = today.checked_sub_signed(ChronoDuration::days(retention_days as i64)) else { return };
        let cutoff = cutoff.format("%Y-%m-%d").to_string();

        let mut days = self.days.write().await;
        let before = days.len();
        days.retain(|date, _| date.as_str() >= cutoff.as_str());
        if days.len() != before {
            drop(days);
            self.dirty.store(true, Ordering::Release);
        }
    }

    /// Called from the scheduler's shutdown flush and its debounce tick;
    /// only the leader actually touches disk (peers keep their own local
    /// counters, which is fine — `stats.json` is a leader-owned export, the
    /// `stats:{date}:*` shared counters are the cluster-wide source of truth).
    pub async fn flush_if_leader(&self, is_leader: bool) -> anyhow::Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if !is_leader {
            return Ok(());
        }
        self.persist_to_disk().await
    }

    async fn persist_to_disk(&self) -> anyhow::Result<()> {
        let json = {
            let days = self.days.read().await;
            serde_json::to_string_pretty(&*days)?
        };
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_to_disk_writes_atomically_via_tempfile_rename() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("stats.json");
        let stats = StatsStore::new(path.clone());

        stats.bump_local("2026-07-27", |d| d.users += 3).await;
        stats.persist_to_disk().await?;

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reloaded = StatsStore::new(path);
        reloaded.load_from_disk().await?;
        assert_eq!(reloaded.snapshot().await.get("2026-07-27").map(|d| d.users), Some(3));
        Ok(())
    }

    #[tokio::test]
    async fn prune_expired_drops_only_days_older_than_retention() {
        let stats = StatsStore::new(PathBuf::from("/tmp/does-not-matter.json"));
        stats.bump_local("2026-07-01", |d| d.users += 1).await;
        stats.bump_local("2026-07-27", |d| d.users += 1).await;

        stats.prune_expired("2026-07-27", 7).await;

        let snapshot = stats.snapshot().await;
        assert!(!snapshot.contains_key("2026-07-01"));
        assert!(snapshot.contains_key("2026-07-27"));
    }
}
