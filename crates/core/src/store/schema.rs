// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SQL schema and row (de)serialization for the user store (persisted layout
//! from spec §6: `users`, `accounts`, index on `accounts.userId`).

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::InfrastructureError;
use crate::model::{Account, Auth, User, UserId};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY,
    currentAccount  INTEGER NOT NULL DEFAULT 1,
    settings        TEXT NOT NULL DEFAULT '{}',
    hasAlertsOrDailyShop INTEGER NOT NULL DEFAULT 0,
    createdAt       INTEGER NOT NULL,
    updatedAt       INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS accounts (
    puuid           TEXT PRIMARY KEY,
    userId          INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    username        TEXT NOT NULL,
    region          TEXT NOT NULL,
    auth            TEXT,
    alerts          TEXT NOT NULL DEFAULT '[]',
    authFailures    INTEGER NOT NULL DEFAULT 0,
    lastFetchedData INTEGER NOT NULL DEFAULT 0,
    lastNoticeSeen  TEXT NOT NULL DEFAULT '',
    lastSawEasterEgg INTEGER,
    createdAt       INTEGER NOT NULL,
    updatedAt       INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_accounts_userId ON accounts(userId);
CREATE INDEX IF NOT EXISTS idx_users_has_alerts ON users(hasAlertsOrDailyShop);
";

pub fn init(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn has_alerts_or_daily_shop(user: &User) -> bool {
    user.settings.daily_shop_account_index.is_some()
        || user.accounts.iter().any(|a| !a.alerts.is_empty())
}

pub fn upsert_user(conn: &Connection, user: &User) -> Result<(), InfrastructureError> {
    let settings = serde_json::to_string(&user.settings).unwrap_or_else(|_| "{}".into());
    conn.execute(
        "INSERT INTO users (id, currentAccount, settings, hasAlertsOrDailyShop, createdAt, updatedAt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
            currentAccount = excluded.currentAccount,
            settings = excluded.settings,
            hasAlertsOrDailyShop = excluded.hasAlertsOrDailyShop,
            updatedAt = excluded.updatedAt",
        params![
            user.id as i64,
            user.current_account_index as i64,
            settings,
            has_alerts_or_daily_shop(user) as i64,
            user.updated_at,
        ],
    )
    .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;

    for account in &user.accounts {
        upsert_account(conn, account)?;
    }
    Ok(())
}

pub fn upsert_account(conn: &Connection, account: &Account) -> Result<(), InfrastructureError> {
    let auth = account.auth.as_ref().map(|a| serde_json::to_string(a).unwrap_or_default());
    let alerts = serde_json::to_string(&account.alerts).unwrap_or_else(|_| "[]".into());
    conn.execute(
        "INSERT INTO accounts (puuid, userId, username, region, auth, alerts, authFailures,
            lastFetchedData, lastNoticeSeen, lastSawEasterEgg, createdAt, updatedAt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT(puuid) DO UPDATE SET
            username = excluded.username,
            region = excluded.region,
            auth = excluded.auth,
            alerts = excluded.alerts,
            authFailures = excluded.authFailures,
            lastFetchedData = excluded.lastFetchedData,
            lastNoticeSeen = excluded.lastNoticeSeen,
            lastSawEasterEgg = excluded.lastSawEasterEgg,
            updatedAt = excluded.updatedAt",
        params![
            account.puuid,
            account.user_id as i64,
            account.username,
            account.region,
            auth,
            alerts,
            account.auth_failures,
            account.last_fetched_data,
            account.last_notice_seen,
            account.last_saw_easter_egg.map(|v| v as i64),
            account.updated_at,
        ],
    )
    .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;

    // Recompute the owning user's fast-path flag now that its alert set changed.
    conn.execute(
        "UPDATE users SET hasAlertsOrDailyShop = (
            settings LIKE '%dailyShopAccountIndex%' OR EXISTS (
                SELECT 1 FROM accounts WHERE userId = users.id AND alerts != '[]'
            )
         ) WHERE id = ?1",
        params![account.user_id as i64],
    )
    .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    Ok(())
}

pub fn update_account_auth(
    conn: &Connection,
    puuid: &str,
    auth: Option<&Auth>,
) -> Result<(), InfrastructureError> {
    let auth_json = auth.map(|a| serde_json::to_string(a).unwrap_or_default());
    conn.execute(
        "UPDATE accounts SET auth = ?1, updatedAt = ?2 WHERE puuid = ?3",
        params![auth_json, crate::clock::SystemClock.now_ms(), puuid],
    )
    .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    Ok(())
}

pub fn delete_user(conn: &Connection, id: UserId) -> Result<(), InfrastructureError> {
    conn.execute("DELETE FROM users WHERE id = ?1", params![id as i64])
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    Ok(())
}

pub fn delete_account(conn: &Connection, puuid: &str) -> Result<(), InfrastructureError> {
    conn.execute("DELETE FROM accounts WHERE puuid = ?1", params![puuid])
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    Ok(())
}

pub fn all_user_ids(conn: &Connection) -> Result<Vec<UserId>, InfrastructureError> {
    let mut stmt = conn
        .prepare("SELECT id FROM users ORDER BY id")
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    rows.map(|r| r.map(|v| v as UserId).map_err(|_| InfrastructureError::SharedStoreUnavailable))
        .collect()
}

pub fn user_ids_with_alerts_or_daily_shop(
    conn: &Connection,
) -> Result<Vec<UserId>, InfrastructureError> {
    let mut stmt = conn
        .prepare("SELECT id FROM users WHERE hasAlertsOrDailyShop = 1 ORDER BY id")
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;
    rows.map(|r| r.map(|v| v as UserId).map_err(|_| InfrastructureError::SharedStoreUnavailable))
        .collect()
}

pub fn load_user(conn: &Connection, id: UserId) -> Result<Option<User>, InfrastructureError> {
    let row = conn
        .query_row(
            "SELECT currentAccount, settings, createdAt, updatedAt FROM users WHERE id = ?1",
            params![id as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;

    let Some((current_account, settings_json, created_at, updated_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare(
            "SELECT puuid, userId, username, region, auth, alerts, authFailures,
                lastFetchedData, lastNoticeSeen, lastSawEasterEgg, createdAt, updatedAt
             FROM accounts WHERE userId = ?1 ORDER BY createdAt",
        )
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;

    let accounts = stmt
        .query_map(params![id as i64], |row| {
            let auth_json: Option<String> = row.get(4)?;
            let alerts_json: String = row.get(5)?;
            Ok(Account {
                puuid: row.get(0)?,
                user_id: row.get::<_, i64>(1)? as UserId,
                username: row.get(2)?,
                region: row.get(3)?,
                auth: auth_json.and_then(|s| serde_json::from_str(&s).ok()),
                alerts: serde_json::from_str(&alerts_json).unwrap_or_default(),
                auth_failures: row.get(6)?,
                last_fetched_data: row.get(7)?,
                last_notice_seen: row.get(8)?,
                last_saw_easter_egg: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
                created_at: row.get(10)?,
                updated_at: row.get(11)?,
            })
        })
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| InfrastructureError::SharedStoreUnavailable)?;

    Ok(Some(User {
        id,
        accounts,
        current_account_index: current_account as usize,
        settings: serde_json::from_str(&settings_json).unwrap_or_default(),
        created_at,
        updated_at,
    }))
}
