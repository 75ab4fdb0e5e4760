// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Default implementations of the three external-collaborator ports
//! (`NotificationPort`, `AssetPort`, `CatalogFetchPort`). A production
//! deployment links a real chat-SDK adapter over these instead; these exist
//! so the binary is runnable standalone and so the port boundary has at
//! least one concrete implementation to check its shape against.

use async_trait::async_trait;
use shopwatch_core::catalog::{CatalogFetchPort, CatalogTables};
use shopwatch_core::model::{Alert, ChannelId, ShopSnapshot, UserId};
use shopwatch_core::notify::{AssetPort, ChannelInaccessibleReason, DeliveryOutcome, NotificationPort};

/// Logs every notification instead of rendering it through a chat SDK.
pub struct ConsoleNotificationPort;

#[async_trait]
impl NotificationPort for ConsoleNotificationPort {
    async fn send_alert(
        &self,
        user_id: UserId,
        account_idx: usize,
        alerts: &[Alert],
        expires_at: i64,
        target_channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome> {
        tracing::info!(user_id, account_idx, count = alerts.len(), expires_at, target_channel_id, "alert delivery");
        Ok(DeliveryOutcome::Delivered)
    }

    async fn send_daily_shop(
        &self,
        user_id: UserId,
        snapshot: &ShopSnapshot,
        channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome> {
        tracing::info!(user_id, items = snapshot.items.len(), channel_id, "daily shop delivery");
        Ok(DeliveryOutcome::Delivered)
    }

    async fn send_credentials_expired(
        &self,
        user_id: UserId,
        target_channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome> {
        tracing::info!(user_id, target_channel_id, "credentials expired notice");
        Ok(DeliveryOutcome::Delivered)
    }

    async fn notify_channel_inaccessible(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        reason: ChannelInaccessibleReason,
        migrated_count: Option<usize>,
    ) -> anyhow::Result<()> {
        tracing::warn!(user_id, channel_id, %reason, migrated_count, "channel inaccessible");
        Ok(())
    }

    async fn open_dm_channel(&self, user_id: UserId) -> anyhow::Result<ChannelId> {
        Ok(user_id)
    }
}

/// No real emoji registry; references are just the asset name itself.
pub struct ConsoleAssetPort;

#[async_trait]
impl AssetPort for ConsoleAssetPort {
    async fn emoji_ref(&self, name: &str) -> anyhow::Result<String> {
        Ok(name.to_owned())
    }

    async fn warm_snapshot(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    async fn adopt_snapshot(&self, _snapshot: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Fetches the manifest and table endpoints directly and deserializes their
/// bodies as-is into [`CatalogTables`]. The real upstream wire shape is an
/// opaque contract per spec — a production deployment overrides this with
/// whatever per-table parsing its actual endpoints require.
pub struct DirectCatalogFetchPort {
    http: reqwest::Client,
    manifest_url: String,
    tables_url_template: String,
}

impl DirectCatalogFetchPort {
    pub fn new(http: reqwest::Client, manifest_url: String, tables_url_template: String) -> Self {
        Self { http, manifest_url, tables_url_template }
    }
}

#[async_trait]
impl CatalogFetchPort for DirectCatalogFetchPort {
    async fn fetch_manifest_version(&self) -> anyhow::Result<String> {
        let body: serde_json::Value = self.http.get(&self.manifest_url).send().await?.json().await?;
        body.get("riotClientVersion")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .ok_or_else(|| anyhow::anyhow!("manifest response missing riotClientVersion"))
    }

    async fn fetch_all_tables(&self, game_version: &str) -> anyhow::Result<CatalogTables> {
        let url = self.tables_url_template.replace("{version}", game_version);
        let mut tables: CatalogTables = self.http.get(&url).send().await?.json().await?;
        tables.game_version = game_version.to_owned();
        Ok(tables)
    }
}
