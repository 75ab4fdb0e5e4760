// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shop service (§4.H): `fetch_shop`, `fetch_night_market`, `fetch_bundles`.
//! Reads a short-lived per-Puuid cache, authenticates via the auth core on
//! miss, and feeds any prices observed in the response back to the catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::RwLock;

use crate::auth::AuthCore;
use crate::bus::CoordinationBus;
use crate::catalog::Catalog;
use crate::clock::Clock;
use crate::error::UpstreamError;
use crate::model::{Account, ItemId, Puuid, ShopSnapshot};
use crate::upstream::UpstreamClient;

/// Daily shop refreshes server-side once per day; a ~25h TTL tolerates clock
/// skew without ever serving two calendar days of the same snapshot.
const SHOP_CACHE_TTL: Duration = Duration::from_secs(25 * 3600);

#[derive(Debug, Deserialize)]
struct OfferEntry {
    item_id: ItemId,
    price: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ShopResponse {
    offers: Vec<OfferEntry>,
    expires_in_secs: u64,
}

#[derive(Debug, Deserialize)]
struct BundleOffer {
    items: Vec<OfferEntry>,
}

#[derive(Debug, Deserialize)]
struct BundlesResponse {
    bundles: Vec<BundleOffer>,
}

struct CacheEntry {
    snapshot: ShopSnapshot,
    cached_at: i64,
}

pub struct ShopEndpoints {
    pub shop_url_template: String,
    pub night_market_url_template: String,
    pub bundles_url: String,
    pub host: String,
}

pub struct ShopService {
    upstream: Arc<UpstreamClient>,
    auth: Arc<AuthCore>,
    catalog: Arc<Catalog>,
    bus: Arc<CoordinationBus>,
    clock: Arc<dyn Clock>,
    endpoints: ShopEndpoints,
    use_cache: bool,
    cache: RwLock<HashMap<Puuid, CacheEntry>>,
}

impl ShopService {
    pub fn new(
        upstream: Arc<UpstreamClient>,
        auth: Arc<AuthCore>,
        catalog: Arc<Catalog>,
        bus: Arc<CoordinationBus>,
        clock: Arc<dyn Clock>,
        endpoints: ShopEndpoints,
        use_cache: bool,
    ) -> Self {
        Self { upstream, auth, catalog, bus, clock, endpoints, use_cache, cache: RwLock::new(HashMap::new()) }
    }

    pub async fn fetch_shop(&self, account: &Account) -> Result<ShopSnapshot, UpstreamError> {
        if self.use_cache {
            if let Some(cached) = self.cached_snapshot(&account.puuid).await {
                return Ok(cached);
            }
        }

        self.auth.auth_user(account.user_id, Some(&account.puuid)).await?;

        let url = self.endpoints.shop_url_template.replace("{puuid}", &account.puuid);
        let body = self.upstream.get_json(&self.endpoints.host, &url).await?;
        let parsed: ShopResponse =
            serde_json::from_value(body).map_err(|e| UpstreamError::Transport(e.to_string()))?;

        self.observe_prices(&parsed.offers).await;

        let now = self.clock.now_ms();
        let snapshot = ShopSnapshot {
            puuid: account.puuid.clone(),
            items: parsed.offers.iter().map(|o| o.item_id.clone()).collect(),
            expires_at: now + (parsed.expires_in_secs as i64) * 1000,
            cached: false,
        };
        self.cache
            .write()
            .await
            .insert(account.puuid.clone(), CacheEntry { snapshot: snapshot.clone(), cached_at: now });
        Ok(snapshot)
    }

    pub async fn fetch_night_market(&self, account: &Account) -> Result<Option<ShopSnapshot>, UpstreamError> {
        self.auth.auth_user(account.user_id, Some(&account.puuid)).await?;
        let url = self.endpoints.night_market_url_template.replace("{puuid}", &account.puuid);
        let body = self.upstream.get_json(&self.endpoints.host, &url).await?;
        if body.is_null() {
            return Ok(None);
        }
        let parsed: ShopResponse =
            serde_json::from_value(body).map_err(|e| UpstreamError::Transport(e.to_string()))?;
        self.observe_prices(&parsed.offers).await;

        let now = self.clock.now_ms();
        Ok(Some(ShopSnapshot {
            puuid: account.puuid.clone(),
            items: parsed.offers.iter().map(|o| o.item_id.clone()).collect(),
            expires_at: now + (parsed.expires_in_secs as i64) * 1000,
            cached: false,
        }))
    }

    pub async fn fetch_bundles(&self) -> Result<Vec<ItemId>, UpstreamError> {
        let body = self.upstream.get_json(&self.endpoints.host, &self.endpoints.bundles_url).await?;
        let parsed: BundlesResponse =
            serde_json::from_value(body).map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let mut item_ids = Vec::new();
        for bundle in &parsed.bundles {
            self.observe_prices(&bundle.items).await;
            item_ids.extend(bundle.items.iter().map(|o| o.item_id.clone()));
        }
        Ok(item_ids)
    }

    async fn observe_prices(&self, offers: &[OfferEntry]) {
        let partial: HashMap<ItemId, u64> =
            offers.iter().filter_map(|o| o.price.map(|p| (o.item_id.clone(), p))).collect();
        if partial.is_empty() {
            return;
        }
        if let Err(e) = self.catalog.merge_prices(&self.bus, partial).await {
            tracing::warn!(err = %e, "failed to merge prices discovered in shop response");
        }
    }

    async fn cached_snapshot(&self, puuid: &str) -> Option<ShopSnapshot> {
        let cache = self.cache.read().await;
        let entry = cache.get(puuid)?;
        if is_expired(self.clock.now_ms(), entry.cached_at, SHOP_CACHE_TTL) {
            return None;
        }
        let mut snapshot = entry.snapshot.clone();
        snapshot.cached = true;
        Some(snapshot)
    }
}

fn is_expired(now_ms: i64, cached_at: i64, ttl: Duration) -> bool {
    let age_ms = now_ms - cached_at;
    age_ms < 0 || (age_ms as u128) > ttl.as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_expired_tolerates_up_to_ttl() {
        assert!(!is_expired(SHOP_CACHE_TTL.as_millis() as i64, 0, SHOP_CACHE_TTL));
        assert!(is_expired(SHOP_CACHE_TTL.as_millis() as i64 + 1, 0, SHOP_CACHE_TTL));
    }

    #[test]
    fn is_expired_treats_future_cached_at_as_expired() {
        assert!(is_expired(0, 1_000, SHOP_CACHE_TTL));
    }
}
