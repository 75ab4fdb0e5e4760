// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Closed tagged-variant message type for the coordination bus. Replaces the
//! source's string `type` field + switch dispatch (REDESIGN FLAGS, spec §9):
//! each variant carries its own payload shape and the presentation adapter
//! owns translating it to chat-SDK calls.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Alert, ChannelId, ItemId, ShopSnapshot, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    AllShardsReady,
    /// Control message a shard broadcasts once it has connected to the bus.
    /// Re-announcing an already-seen `shard_id` signals a respawn and
    /// re-arms the readiness barrier on every receiving shard.
    ShardStarted { shard_id: u32 },
    ConfigReload,
    CatalogReload,
    PriceUpdate { prices: HashMap<ItemId, u64> },
    EmojiCatalogWarm { snapshot: serde_json::Value },
    SettingsInvalidate { user_id: UserId },
    AlertDelivery {
        user_id: UserId,
        account_idx: usize,
        alerts: Vec<Alert>,
        expires_at: i64,
        target_channel_id: ChannelId,
    },
    DailyShopDelivery { user_id: UserId, snapshot: ShopSnapshot, channel_id: ChannelId },
    CredentialsExpired { user_id: UserId, target_channel_id: ChannelId },
    ForceCheckAlerts,
    LogLines { lines: Vec<String> },
    VersionData { game_version: String },
    /// Propagated on graceful shutdown so peer shards exit cleanly too.
    ProcessExit,
}
