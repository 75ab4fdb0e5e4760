// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Embedded relational user store (§4.B). Backed by `rusqlite` in WAL journal
//! mode: writes serialize on a single connection guarded by a mutex, reads
//! proceed once the write holding the lock releases it. Batch-write and
//! read-cache scopes are explicit structs borrowed from the store rather
//! than thread-locals or module-level globals (REDESIGN FLAGS in spec §9).

mod schema;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::InfrastructureError;
use crate::model::{User, UserId};

pub struct UserStore {
    conn: Arc<Mutex<Connection>>,
}

impl UserStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Full eager join of accounts.
    pub async fn get_user(&self, id: UserId) -> Result<Option<User>, InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::load_user(&conn, id)
    }

    /// Upsert user row plus upsert-all-accounts, outside any batch scope.
    pub async fn save_user(&self, user: &User) -> Result<(), InfrastructureError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        schema::upsert_user(&tx, user)?;
        tx.commit().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        Ok(())
    }

    /// Targeted update that avoids rewriting sibling accounts.
    pub async fn update_single_account(
        &self,
        account: &crate::model::Account,
    ) -> Result<(), InfrastructureError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        schema::upsert_account(&tx, account)?;
        tx.commit().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        Ok(())
    }

    pub async fn update_account_auth(
        &self,
        puuid: &str,
        auth: Option<&crate::model::Auth>,
    ) -> Result<(), InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::update_account_auth(&conn, puuid, auth)
    }

    pub async fn delete_user(&self, id: UserId) -> Result<(), InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::delete_user(&conn, id)
    }

    pub async fn delete_account(&self, puuid: &str) -> Result<(), InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::delete_account(&conn, puuid)
    }

    pub async fn all_user_ids(&self) -> Result<Vec<UserId>, InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::all_user_ids(&conn)
    }

    /// Indexed fast path: only users with >=1 non-empty alert set or a
    /// dailyShop setting, for the alert engine's partition derivation.
    pub async fn user_ids_with_alerts_or_daily_shop(
        &self,
    ) -> Result<Vec<UserId>, InfrastructureError> {
        let conn = self.conn.lock().await;
        schema::user_ids_with_alerts_or_daily_shop(&conn)
    }

    /// Open a batch-write scope. Callers accumulate `save_user` calls keyed
    /// by user id (last write wins) and flush in one transaction on commit.
    pub fn begin_batch_writes(&self) -> BatchScope<'_> {
        BatchScope { store: self, pending: Mutex::new(HashMap::new()) }
    }

    /// Open a read-cache scope bound to whatever borrows it — pass `&scope`
    /// into nested calls to fold them into the same scope; never share a
    /// `CacheScope` across concurrently-running tasks.
    pub fn begin_user_cache_scope(&self) -> CacheScope<'_> {
        CacheScope { store: self, cache: Mutex::new(HashMap::new()) }
    }

    async fn commit_batch(
        &self,
        pending: HashMap<UserId, User>,
    ) -> Result<(), InfrastructureError> {
        if pending.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        for user in pending.values() {
            schema::upsert_user(&tx, user)?;
        }
        tx.commit().map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
        Ok(())
    }
}

/// §4.B batch-write scope: within it, `get_user` on the underlying store
/// still returns committed state — buffered saves are only visible after
/// `commit`. Nested `begin_batch_writes` calls should reuse (`&scope`) the
/// outer scope rather than opening a second one, so writes fold into a
/// single transaction.
pub struct BatchScope<'s> {
    store: &'s UserStore,
    pending: Mutex<HashMap<UserId, User>>,
}

impl<'s> BatchScope<'s> {
    /// Last-write-wins per user within the scope.
    pub async fn save_user(&self, user: User) {
        self.pending.lock().await.insert(user.id, user);
    }

    pub async fn commit_batch_writes(self) -> Result<(), InfrastructureError> {
        let pending = self.pending.into_inner();
        self.store.commit_batch(pending).await
    }
}

/// §4.B read-cache scope: repeated `get_user(id)` returns the same snapshot
/// until `invalidate` is called for that id. Caller MUST invalidate after any
/// mutation made within the scope, else stale reads will occur.
pub struct CacheScope<'s> {
    store: &'s UserStore,
    cache: Mutex<HashMap<UserId, User>>,
}

impl<'s> CacheScope<'s> {
    pub async fn get_user(&self, id: UserId) -> Result<Option<User>, InfrastructureError> {
        if let Some(cached) = self.cache.lock().await.get(&id) {
            return Ok(Some(cached.clone()));
        }
        let fresh = self.store.get_user(id).await?;
        if let Some(ref user) = fresh {
            self.cache.lock().await.insert(id, user.clone());
        }
        Ok(fresh)
    }

    pub async fn invalidate_user_cache(&self, id: UserId) {
        self.cache.lock().await.remove(&id);
    }

    pub async fn end_user_cache_scope(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, Alert, UserSettings};

    fn sample_user(id: UserId) -> User {
        User {
            id,
            accounts: vec![Account {
                puuid: format!("puuid-{id}"),
                user_id: id,
                username: "player".into(),
                region: "na".into(),
                auth: None,
                alerts: vec![Alert { item_id: "skin-1".into(), channel_id: 10 }],
                auth_failures: 0,
                last_fetched_data: 0,
                last_notice_seen: String::new(),
                last_saw_easter_egg: None,
                created_at: 0,
                updated_at: 0,
            }],
            current_account_index: 1,
            settings: UserSettings::default(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn round_trip_save_then_load() -> anyhow::Result<()> {
        let store = UserStore::open_in_memory()?;
        let user = sample_user(1);
        store.save_user(&user).await?;
        let loaded = store.get_user(1).await?.ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(loaded.accounts.len(), 1);
        assert_eq!(loaded.accounts[0].puuid, "puuid-1");
        Ok(())
    }

    #[tokio::test]
    async fn batch_scope_commits_last_write_per_user_in_one_transaction() -> anyhow::Result<()> {
        let store = UserStore::open_in_memory()?;
        let scope = store.begin_batch_writes();
        let mut u1 = sample_user(1);
        scope.save_user(u1.clone()).await;
        u1.current_account_index = 1;
        u1.settings.locale = Some("en-US".into());
        scope.save_user(u1.clone()).await;
        scope.save_user(sample_user(2)).await;
        scope.commit_batch_writes().await?;

        let loaded1 = store.get_user(1).await?.ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(loaded1.settings.locale.as_deref(), Some("en-US"));
        assert!(store.get_user(2).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn cache_scope_returns_stale_snapshot_until_invalidated() -> anyhow::Result<()> {
        let store = UserStore::open_in_memory()?;
        store.save_user(&sample_user(1)).await?;

        let scope = store.begin_user_cache_scope();
        let first = scope.get_user(1).await?.ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(first.current_account_index, 1);

        let mut updated = first.clone();
        updated.current_account_index = 1;
        updated.settings.locale = Some("fr-FR".into());
        store.save_user(&updated).await?;

        // Without invalidation, the scope still returns the original snapshot.
        let cached = scope.get_user(1).await?.ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_ne!(cached.settings.locale, updated.settings.locale);

        scope.invalidate_user_cache(1).await;
        let fresh = scope.get_user(1).await?.ok_or_else(|| anyhow::anyhow!("missing user"))?;
        assert_eq!(fresh.settings.locale, updated.settings.locale);
        Ok(())
    }

    #[tokio::test]
    async fn user_ids_with_alerts_or_daily_shop_is_indexed_fast_path() -> anyhow::Result<()> {
        let store = UserStore::open_in_memory()?;
        store.save_user(&sample_user(1)).await?;
        let mut quiet_user = sample_user(2);
        quiet_user.accounts[0].alerts.clear();
        store.save_user(&quiet_user).await?;

        let ids = store.user_ids_with_alerts_or_daily_shop().await?;
        assert_eq!(ids, vec![1]);
        Ok(())
    }
}
