// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Catalog table types (§4.G). Each table is versioned by the manifest id
//! (`game_version`) it was fetched under.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::ItemId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: ItemId,
    pub canonical_name: String,
    pub names_by_locale: HashMap<String, String>,
    pub rarity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosmeticMeta {
    pub id: ItemId,
    pub canonical_name: String,
    pub names_by_locale: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RarityMeta {
    pub id: String,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleMeta {
    pub id: String,
    pub canonical_name: String,
    pub item_ids: Vec<ItemId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMeta {
    pub id: String,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMeta {
    pub id: String,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankMeta {
    pub tier: u32,
    pub canonical_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonMeta {
    pub id: String,
    pub label: String,
    pub starts_at: i64,
    pub ends_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeMeta {
    pub id: String,
    pub canonical_name: String,
    pub is_competitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattlepassSchedule {
    pub season_id: String,
    pub starts_at: i64,
    pub ends_at: i64,
}

/// Everything cached by the asset catalog, all stamped with the
/// `game_version` they were fetched under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogTables {
    pub game_version: String,
    pub items: HashMap<ItemId, ItemMeta>,
    pub prices: HashMap<ItemId, u64>,
    pub cosmetics: HashMap<ItemId, CosmeticMeta>,
    pub rarities: HashMap<String, RarityMeta>,
    pub bundles: HashMap<String, BundleMeta>,
    pub maps: HashMap<String, MapMeta>,
    pub agents: HashMap<String, AgentMeta>,
    pub ranks: HashMap<String, RankMeta>,
    pub seasons: Vec<SeasonMeta>,
    pub modes: HashMap<String, ModeMeta>,
    pub battlepass: Option<BattlepassSchedule>,
}
