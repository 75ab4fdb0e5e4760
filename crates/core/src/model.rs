// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Core data model: User, Account, Auth, Alert, ShopSnapshot, RateLimitRecord,
//! AuthQueueItem. See invariants I1-I6 on [`Account`] and [`User`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

pub type UserId = u64;
pub type ChannelId = u64;
pub type Puuid = String;
pub type ItemId = String;

/// Right-shifts a snowflake id by 22 bits, discarding the timestamp portion
/// and keeping the worker-id portion, then reduces mod `shard_count`.
pub fn shard_for(id: UserId, shard_count: u32) -> u32 {
    if shard_count == 0 {
        return 0;
    }
    ((id >> 22) % shard_count as u64) as u32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthKind {
    /// Regenerates access tokens via a reauthorize redirect.
    Cookie { cookies: String },
    /// Long-lived, possibly-rotated refresh token.
    Code { refresh_token: String, refresh_token_obtained_at: i64 },
}

/// A token set owned by an [`Account`]. Invariant I5: if cookie-based,
/// issuing a fresh access token must also refresh `entitlement_token`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub kind: AuthKind,
    pub access_token: String,
    pub id_token: String,
    pub entitlement_token: String,
    /// Epoch ms at which `access_token` expires.
    pub access_token_expires_at: i64,
}

impl Auth {
    /// Invariant I6: tokens used by the alert engine must be non-expired
    /// within `buffer_ms` of dispatch time.
    pub fn needs_refresh(&self, now_ms: i64, buffer_ms: i64) -> bool {
        self.access_token_expires_at - now_ms <= buffer_ms
    }
}

/// `{uuid, channel_id}`. Set-semantics per Account enforced by [`Account::add_alert`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Alert {
    pub item_id: ItemId,
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub puuid: Puuid,
    pub user_id: UserId,
    pub username: String,
    pub region: String,
    pub auth: Option<Auth>,
    pub alerts: Vec<Alert>,
    pub auth_failures: u32,
    pub last_fetched_data: i64,
    pub last_notice_seen: String,
    /// Passthrough schema field (`lastSawEasterEgg`); no defined behavior.
    pub last_saw_easter_egg: Option<u64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Account {
    /// Returns false (no-op) if an alert for the same ItemId already exists.
    pub fn add_alert(&mut self, alert: Alert) -> bool {
        if self.alerts.iter().any(|a| a.item_id == alert.item_id) {
            return false;
        }
        self.alerts.push(alert);
        true
    }

    pub fn remove_alert(&mut self, item_id: &str) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|a| a.item_id != item_id);
        self.alerts.len() != before
    }

    /// Drops duplicate ItemIds, keeping the first occurrence. Returns true if
    /// any were removed, in which case the caller must persist and invalidate
    /// the read cache (§4.I step 2).
    pub fn dedup_alerts(&mut self) -> bool {
        let mut seen = HashSet::new();
        let before = self.alerts.len();
        self.alerts.retain(|a| seen.insert(a.item_id.clone()));
        self.alerts.len() != before
    }

    /// Invariant I4: on reaching `strikes`, Auth becomes absent.
    pub fn record_auth_failure(&mut self, strikes: u32) -> bool {
        self.auth_failures = (self.auth_failures + 1).min(strikes);
        if self.auth_failures >= strikes {
            self.auth = None;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserSettings {
    /// 1-based account index that receives daily-shop notifications, if any.
    pub daily_shop_account_index: Option<usize>,
    pub locale: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub accounts: Vec<Account>,
    /// 1-based; invariant I3: `current_account_index` in [1, accounts.len()].
    pub current_account_index: usize,
    pub settings: UserSettings,
    pub created_at: i64,
    pub updated_at: i64,
}

impl User {
    pub fn current_account(&self) -> Option<&Account> {
        self.current_account_index.checked_sub(1).and_then(|i| self.accounts.get(i))
    }

    pub fn current_account_mut(&mut self) -> Option<&mut Account> {
        let idx = self.current_account_index.checked_sub(1)?;
        self.accounts.get_mut(idx)
    }

    pub fn has_alerts_or_daily_shop(&self) -> bool {
        self.settings.daily_shop_account_index.is_some()
            || self.accounts.iter().any(|a| !a.alerts.is_empty())
    }

    /// Dedup alerts across Accounts sharing the same (ItemId, ChannelId) pair.
    pub fn dedup_cross_account_alerts(&mut self) {
        let mut seen: HashSet<(ItemId, ChannelId)> = HashSet::new();
        for account in &mut self.accounts {
            account.alerts.retain(|a| seen.insert((a.item_id.clone(), a.channel_id)));
        }
    }
}

/// `{puuid, items, expires_at, cached}`. Daily-reset, cached per-Account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShopSnapshot {
    pub puuid: Puuid,
    pub items: Vec<ItemId>,
    pub expires_at: i64,
    pub cached: bool,
}

/// `{host, retry_at}`. TTL in the shared store equals `retry_at - now`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub host: String,
    pub retry_at: i64,
}

/// `{counter, operation, payload, enqueued_at}`. Counter is monotonic cluster-wide.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthQueueItem {
    pub counter: u64,
    pub operation: String,
    pub payload: serde_json::Value,
    pub enqueued_at: i64,
}

/// Per-day aggregate counters backing `stats.json` / `stats:{date}:{...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: String,
    pub users: u64,
    pub shops: u64,
    pub items: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_for_discards_timestamp_bits() {
        // Two ids differing only in the low 22 bits land on the same shard.
        let a: UserId = 0b1010_0000_0000_0000_0000_0000_1111_1111_1111_1111_1111_1111;
        let b: UserId = 0b1010_0000_0000_0000_0000_0000_0000_0000_0000_0000_0000_0000;
        assert_eq!(shard_for(a, 4), shard_for(b, 4));
    }

    #[test]
    fn add_alert_enforces_set_semantics() {
        let mut account = sample_account();
        assert!(account.add_alert(Alert { item_id: "skin-1".into(), channel_id: 1 }));
        assert!(!account.add_alert(Alert { item_id: "skin-1".into(), channel_id: 2 }));
        assert_eq!(account.alerts.len(), 1);
    }

    #[test]
    fn dedup_alerts_keeps_first() {
        let mut account = sample_account();
        account.alerts.push(Alert { item_id: "skin-1".into(), channel_id: 1 });
        account.alerts.push(Alert { item_id: "skin-1".into(), channel_id: 2 });
        assert!(account.dedup_alerts());
        assert_eq!(account.alerts, vec![Alert { item_id: "skin-1".into(), channel_id: 1 }]);
    }

    #[test]
    fn record_auth_failure_clears_auth_at_cap() {
        let mut account = sample_account();
        account.auth = Some(Auth {
            kind: AuthKind::Code { refresh_token: "rt".into(), refresh_token_obtained_at: 0 },
            access_token: "at".into(),
            id_token: "it".into(),
            entitlement_token: "et".into(),
            access_token_expires_at: 0,
        });
        account.auth_failures = 2;
        assert!(account.record_auth_failure(3));
        assert!(account.auth.is_none());
    }

    fn sample_account() -> Account {
        Account {
            puuid: "p1".into(),
            user_id: 1,
            username: "u".into(),
            region: "na".into(),
            auth: None,
            alerts: vec![],
            auth_failures: 0,
            last_fetched_data: 0,
            last_notice_seen: String::new(),
            last_saw_easter_egg: None,
            created_at: 0,
            updated_at: 0,
        }
    }
}
