// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification port (§4.K) and emoji/static-asset port (§4.M): interfaces
//! the presentation adapter implements. The alert engine and live-match
//! aggregator hold a `dyn NotificationPort` and never reach into a concrete
//! chat SDK directly.

use async_trait::async_trait;

use crate::model::{Alert, ChannelId, ShopSnapshot, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// This shard does not own `channel_id`'s cache; caller should fall
    /// back to a targeted-by-key send over the coordination bus.
    NotOnThisShard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelInaccessibleReason {
    MissingPermission,
    ChannelDeleted,
    BotRemovedFromServer,
    Unknown,
}

impl std::fmt::Display for ChannelInaccessibleReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingPermission => "missing permission",
            Self::ChannelDeleted => "channel deleted",
            Self::BotRemovedFromServer => "bot removed from server",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn send_alert(
        &self,
        user_id: UserId,
        account_idx: usize,
        alerts: &[Alert],
        expires_at: i64,
        target_channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome>;

    async fn send_daily_shop(
        &self,
        user_id: UserId,
        snapshot: &ShopSnapshot,
        channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome>;

    async fn send_credentials_expired(
        &self,
        user_id: UserId,
        target_channel_id: ChannelId,
    ) -> anyhow::Result<DeliveryOutcome>;

    async fn notify_channel_inaccessible(
        &self,
        user_id: UserId,
        channel_id: ChannelId,
        reason: ChannelInaccessibleReason,
        migrated_count: Option<usize>,
    ) -> anyhow::Result<()>;

    /// Opens or fetches the user's DM channel, used by alert-engine DM
    /// migration when a guild channel becomes truly inaccessible.
    async fn open_dm_channel(&self, user_id: UserId) -> anyhow::Result<ChannelId>;
}

/// Emoji/static-asset port (§4.M): upload-once, reference-forever registry
/// scoped to the whole application rather than per-guild.
#[async_trait]
pub trait AssetPort: Send + Sync {
    /// Returns the stable reference id for `name`, uploading it first if
    /// this is the first time the process has seen it.
    async fn emoji_ref(&self, name: &str) -> anyhow::Result<String>;

    /// Snapshot of everything currently registered, broadcast cluster-wide
    /// on warmup so peer shards don't re-upload the same assets.
    async fn warm_snapshot(&self) -> anyhow::Result<serde_json::Value>;

    /// Seeds the local registry from a peer's warm snapshot.
    async fn adopt_snapshot(&self, snapshot: serde_json::Value) -> anyhow::Result<()>;
}
