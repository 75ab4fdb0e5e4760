// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-user alert loop (§4.I): the state machine described there is spread
//! across `fetch_with_retry` (the `fetching -> {success|maintenance|...}`
//! transitions) and `dispatch_alert`/`dispatch_daily_shop` (the
//! `success -> diff -> dispatching -> idle` tail).

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::{BusMessage, CoordinationBus};
use crate::clock::Clock;
use crate::config::ShardConfig;
use crate::error::UpstreamError;
use crate::model::{Account, Alert, ChannelId, ShopSnapshot, User, UserId};
use crate::notify::{ChannelInaccessibleReason, DeliveryOutcome, NotificationPort};
use crate::shop::ShopService;
use crate::store::{BatchScope, CacheScope, UserStore};

const MAINTENANCE_RETRY: Duration = Duration::from_secs(15 * 60);
/// Blocked/transport errors have no defined retry policy in the state
/// machine; treated as transient with a short bounded retry before the
/// account is skipped for this scan.
const TRANSPORT_RETRY_ATTEMPTS: u32 = 3;

/// Processes every Account belonging to `user_id`. Returns whether a real
/// upstream round trip happened (cache miss) for use by the sequential
/// mode's `should_wait` flag.
#[allow(clippy::too_many_arguments)]
pub async fn process_user(
    user_id: UserId,
    store: &UserStore,
    writes: &BatchScope<'_>,
    cache: &CacheScope<'_>,
    shop: &ShopService,
    notify: &dyn NotificationPort,
    bus: &CoordinationBus,
    config: &ShardConfig,
    clock: &dyn Clock,
    shutdown: &CancellationToken,
) -> anyhow::Result<bool> {
    let Some(mut user) = cache.get_user(user_id).await.map_err(|e| anyhow::anyhow!(e))? else {
        return Ok(false);
    };

    let daily_shop_idx = user.settings.daily_shop_account_index;
    let mut any_cache_miss = false;
    let mut mutated = false;
    let mut credentials_expired_channels: HashSet<ChannelId> = HashSet::new();

    for idx in 0..user.accounts.len() {
        if shutdown.is_cancelled() {
            break;
        }
        let is_daily_shop_target =
            daily_shop_idx == Some(idx + 1) && idx + 1 == user.current_account_index;
        if user.accounts[idx].alerts.is_empty() && !is_daily_shop_target {
            continue;
        }

        if user.accounts[idx].dedup_alerts() {
            mutated = true;
            cache.invalidate_user_cache(user_id).await;
        }

        let outcome = fetch_with_retry(
            &mut user.accounts[idx],
            shop,
            config,
            clock,
            shutdown,
            &mut any_cache_miss,
        )
        .await;

        match outcome {
            FetchOutcome::Success(snapshot) => {
                if is_daily_shop_target {
                    dispatch_daily_shop(notify, bus, store, cache, &mut user, idx, &snapshot).await?;
                }
                dispatch_alerts(notify, bus, store, cache, &mut user, idx, &snapshot).await?;
            }
            FetchOutcome::AuthFailed => {
                mutated = true;
                credentials_expired_channels
                    .extend(user.accounts[idx].alerts.iter().map(|a| a.channel_id));
                cache.invalidate_user_cache(user_id).await;
            }
            FetchOutcome::GaveUp => {}
        }
    }

    for channel_id in credentials_expired_channels {
        dispatch_credentials_expired(notify, bus, store, cache, &mut user, channel_id).await?;
    }

    if mutated {
        user.updated_at = clock.now_ms();
        writes.save_user(user).await;
    }

    Ok(any_cache_miss)
}

enum FetchOutcome {
    Success(ShopSnapshot),
    AuthFailed,
    GaveUp,
}

async fn fetch_with_retry(
    account: &mut Account,
    shop: &ShopService,
    config: &ShardConfig,
    clock: &dyn Clock,
    shutdown: &CancellationToken,
    any_cache_miss: &mut bool,
) -> FetchOutcome {
    let mut transport_attempts = 0;
    loop {
        if shutdown.is_cancelled() {
            return FetchOutcome::GaveUp;
        }
        match shop.fetch_shop(account).await {
            Ok(snapshot) => {
                *any_cache_miss |= !snapshot.cached;
                return FetchOutcome::Success(snapshot);
            }
            Err(UpstreamError::Maintenance) => {
                if sleep_or_shutdown(MAINTENANCE_RETRY, shutdown).await {
                    return FetchOutcome::GaveUp;
                }
            }
            Err(UpstreamError::RateLimited { retry_at }) => {
                let wait_ms = (retry_at - clock.now_ms()).max(0) as u64;
                if sleep_or_shutdown(Duration::from_millis(wait_ms), shutdown).await {
                    return FetchOutcome::GaveUp;
                }
            }
            Err(UpstreamError::InvalidCredentials) => {
                if account.record_auth_failure(config.auth_failure_strikes) {
                    return FetchOutcome::AuthFailed;
                }
                return FetchOutcome::GaveUp;
            }
            Err(UpstreamError::Blocked) | Err(UpstreamError::Transport(_)) => {
                transport_attempts += 1;
                if transport_attempts >= TRANSPORT_RETRY_ATTEMPTS {
                    tracing::warn!(puuid = %account.puuid, "alert engine: giving up after repeated transport errors");
                    return FetchOutcome::GaveUp;
                }
                if sleep_or_shutdown(config.rate_limit_backoff() * transport_attempts, shutdown).await {
                    return FetchOutcome::GaveUp;
                }
            }
        }
    }
}

/// Sleeps for `duration` unless `shutdown` fires first. Returns whether
/// shutdown interrupted the sleep.
async fn sleep_or_shutdown(duration: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.cancelled() => true,
    }
}

async fn dispatch_daily_shop(
    notify: &dyn NotificationPort,
    bus: &CoordinationBus,
    store: &UserStore,
    cache: &CacheScope<'_>,
    user: &mut User,
    account_idx: usize,
    snapshot: &ShopSnapshot,
) -> anyhow::Result<()> {
    let channel_id = match user.accounts[account_idx].alerts.first() {
        Some(alert) => alert.channel_id,
        None => return Ok(()),
    };

    let send = notify.send_daily_shop(user.id, snapshot, channel_id).await;
    resolve_delivery(
        notify,
        bus,
        store,
        cache,
        user,
        channel_id,
        send,
        BusMessage::DailyShopDelivery { user_id: user.id, snapshot: snapshot.clone(), channel_id },
    )
    .await
}

async fn dispatch_alerts(
    notify: &dyn NotificationPort,
    bus: &CoordinationBus,
    store: &UserStore,
    cache: &CacheScope<'_>,
    user: &mut User,
    account_idx: usize,
    snapshot: &ShopSnapshot,
) -> anyhow::Result<()> {
    let offer_items: HashSet<&str> = snapshot.items.iter().map(String::as_str).collect();
    let positive: Vec<Alert> = user.accounts[account_idx]
        .alerts
        .iter()
        .filter(|a| offer_items.contains(a.item_id.as_str()))
        .cloned()
        .collect();
    if positive.is_empty() {
        return Ok(());
    }

    let mut by_channel: HashMap<ChannelId, Vec<Alert>> = HashMap::new();
    for alert in positive {
        by_channel.entry(alert.channel_id).or_default().push(alert);
    }

    for (channel_id, alerts) in by_channel {
        let send = notify.send_alert(user.id, account_idx + 1, &alerts, snapshot.expires_at, channel_id).await;
        resolve_delivery(
            notify,
            bus,
            store,
            cache,
            user,
            channel_id,
            send,
            BusMessage::AlertDelivery {
                user_id: user.id,
                account_idx: account_idx + 1,
                alerts,
                expires_at: snapshot.expires_at,
                target_channel_id: channel_id,
            },
        )
        .await?;
    }
    Ok(())
}

async fn dispatch_credentials_expired(
    notify: &dyn NotificationPort,
    bus: &CoordinationBus,
    store: &UserStore,
    cache: &CacheScope<'_>,
    user: &mut User,
    channel_id: ChannelId,
) -> anyhow::Result<()> {
    let send = notify.send_credentials_expired(user.id, channel_id).await;
    resolve_delivery(
        notify,
        bus,
        store,
        cache,
        user,
        channel_id,
        send,
        BusMessage::CredentialsExpired { user_id: user.id, target_channel_id: channel_id },
    )
    .await
}

/// Shared tail of every dispatch: local delivery, then targeted-by-key bus
/// fallback, then DM migration if no shard claims the channel at all.
async fn resolve_delivery(
    notify: &dyn NotificationPort,
    bus: &CoordinationBus,
    store: &UserStore,
    cache: &CacheScope<'_>,
    user: &mut User,
    channel_id: ChannelId,
    send_result: anyhow::Result<DeliveryOutcome>,
    retry_msg: BusMessage,
) -> anyhow::Result<()> {
    match send_result {
        Ok(DeliveryOutcome::Delivered) => Ok(()),
        Ok(DeliveryOutcome::NotOnThisShard) => {
            if bus.send_to_key(&retry_msg, channel_id).await? {
                return Ok(());
            }
            migrate_to_dm(notify, store, cache, user, channel_id, ChannelInaccessibleReason::Unknown).await
        }
        Err(e) => {
            let reason = classify_inaccessible_reason(&e);
            migrate_to_dm(notify, store, cache, user, channel_id, reason).await
        }
    }
}

async fn migrate_to_dm(
    notify: &dyn NotificationPort,
    store: &UserStore,
    cache: &CacheScope<'_>,
    user: &mut User,
    inaccessible_channel_id: ChannelId,
    reason: ChannelInaccessibleReason,
) -> anyhow::Result<()> {
    let dm_channel_id = notify.open_dm_channel(user.id).await?;

    let mut migrated_count = 0usize;
    for account in &mut user.accounts {
        for alert in &mut account.alerts {
            if alert.channel_id == inaccessible_channel_id {
                alert.channel_id = dm_channel_id;
                migrated_count += 1;
            }
        }
    }

    // Single transactional save, outside the batch scope: migration must
    // land immediately so a crash before the batch commit can't lose it.
    store.save_user(user).await?;
    cache.invalidate_user_cache(user.id).await;

    notify
        .notify_channel_inaccessible(user.id, inaccessible_channel_id, reason, Some(migrated_count))
        .await?;
    Ok(())
}

fn classify_inaccessible_reason(err: &anyhow::Error) -> ChannelInaccessibleReason {
    let text = err.to_string().to_lowercase();
    if text.contains("permission") {
        ChannelInaccessibleReason::MissingPermission
    } else if text.contains("delet") {
        ChannelInaccessibleReason::ChannelDeleted
    } else if text.contains("removed") || text.contains("kicked") || text.contains("left guild") {
        ChannelInaccessibleReason::BotRemovedFromServer
    } else {
        ChannelInaccessibleReason::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_inaccessible_reason_matches_known_keywords() {
        assert_eq!(
            classify_inaccessible_reason(&anyhow::anyhow!("missing Permission to view channel")),
            ChannelInaccessibleReason::MissingPermission
        );
        assert_eq!(
            classify_inaccessible_reason(&anyhow::anyhow!("channel was deleted")),
            ChannelInaccessibleReason::ChannelDeleted
        );
        assert_eq!(
            classify_inaccessible_reason(&anyhow::anyhow!("bot was removed from server")),
            ChannelInaccessibleReason::BotRemovedFromServer
        );
        assert_eq!(
            classify_inaccessible_reason(&anyhow::anyhow!("socket reset")),
            ChannelInaccessibleReason::Unknown
        );
    }
}
