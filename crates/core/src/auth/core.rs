// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Auth core (§4.E): `auth_user`, `redeem_cookies`, `redeem_code_callback`,
//! `delete_user_auth`, and the optional serialized login queue gate in front
//! of `redeem_cookies`/`redeem_code_callback`. Grounded in the teacher's
//! `credential/broker.rs`, generalized from a single-process token broker to
//! one that defers to the cluster-wide queue when `useLoginQueue` is set.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::login_queue;
use crate::auth::oauth;
use crate::bus::CoordinationBus;
use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::UpstreamError;
use crate::model::{Account, Auth, AuthKind, UserId};
use crate::ratelimit::RateLimitGate;
use crate::store::UserStore;

/// Bounded retries for the refresh-token exchange; transient errors
/// (rate-limited, maintenance, transport) back off exponentially between
/// attempts, per `oauth::refresh_with_retries`.
const REFRESH_MAX_RETRIES: u32 = 3;

pub struct AuthEndpoints {
    pub token_url: String,
    pub reauthorize_url: String,
    pub client_id: String,
}

pub struct AuthCore {
    store: Arc<UserStore>,
    bus: Arc<CoordinationBus>,
    config: Arc<ConfigHandle>,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    endpoints: AuthEndpoints,
    rate_limit: Arc<RateLimitGate>,
    token_host: String,
}

impl AuthCore {
    pub fn new(
        store: Arc<UserStore>,
        bus: Arc<CoordinationBus>,
        config: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
        endpoints: AuthEndpoints,
        rate_limit: Arc<RateLimitGate>,
    ) -> Self {
        let token_host = reqwest::Url::parse(&endpoints.token_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| endpoints.token_url.clone());
        Self { store, bus, config, clock, http, endpoints, rate_limit, token_host }
    }

    /// Verifies or refreshes an Account's access token in place, persisting
    /// the result. `account` defaults to the user's current account.
    pub async fn auth_user(&self, user_id: UserId, account_puuid: Option<&str>) -> Result<(), UpstreamError> {
        let config = self.config.current().await;
        let Some(mut user) = self.store.get_user(user_id).await.map_err(|_| UpstreamError::Transport("store unavailable".into()))? else {
            return Err(UpstreamError::Transport("user not registered".into()));
        };

        let account = match account_puuid {
            Some(puuid) => user.accounts.iter_mut().find(|a| a.puuid == puuid),
            None => user.current_account_mut(),
        };
        let Some(account) = account else {
            return Err(UpstreamError::Transport("account not found".into()));
        };

        let Some(auth) = account.auth.clone() else {
            return Err(UpstreamError::InvalidCredentials);
        };

        let now = self.clock.now_ms();
        let buffer_ms = config.token_refresh_buffer().num_milliseconds();
        if !auth.needs_refresh(now, buffer_ms) {
            return Ok(());
        }
        if !config.auto_refresh_tokens {
            return Err(UpstreamError::InvalidCredentials);
        }

        match self.refresh(&auth).await {
            Ok(fresh) => {
                account.auth = Some(fresh);
                account.auth_failures = 0;
                account.updated_at = now;
                let _ = self.store.update_single_account(account).await;
                Ok(())
            }
            Err(e) => {
                if !e.is_transient() {
                    account.record_auth_failure(config.auth_failure_strikes);
                    account.updated_at = now;
                    let _ = self.store.update_single_account(account).await;
                }
                Err(e)
            }
        }
    }

    /// Refresh flow: prefer `refresh_token`, fall back to cookie reauthorize.
    /// Always re-fetches `entitlement_token` alongside `access_token`.
    async fn refresh(&self, auth: &Auth) -> Result<Auth, UpstreamError> {
        let token = match &auth.kind {
            AuthKind::Code { refresh_token, .. } => {
                oauth::refresh_with_retries(
                    &self.http,
                    &self.endpoints.token_url,
                    &self.endpoints.client_id,
                    refresh_token,
                    &self.token_host,
                    &self.rate_limit,
                    self.clock.as_ref(),
                    REFRESH_MAX_RETRIES,
                )
                .await?
            }
            AuthKind::Cookie { cookies } => {
                oauth::do_cookie_reauthorize(
                    &self.http,
                    &self.endpoints.reauthorize_url,
                    cookies,
                    &self.token_host,
                    &self.rate_limit,
                    self.clock.as_ref(),
                )
                .await?
            }
        };

        let kind = match &auth.kind {
            AuthKind::Code { refresh_token_obtained_at, .. } => AuthKind::Code {
                refresh_token: token.refresh_token.clone().unwrap_or_else(|| match &auth.kind {
                    AuthKind::Code { refresh_token, .. } => refresh_token.clone(),
                    _ => unreachable!(),
                }),
                refresh_token_obtained_at: if token.refresh_token.is_some() {
                    self.clock.now_ms()
                } else {
                    *refresh_token_obtained_at
                },
            },
            AuthKind::Cookie { cookies } => AuthKind::Cookie { cookies: cookies.clone() },
        };

        Ok(Auth {
            kind,
            access_token: token.access_token,
            id_token: token.id_token,
            entitlement_token: token.entitlement_token,
            access_token_expires_at: self.clock.now_ms() + (token.expires_in as i64) * 1000,
        })
    }

    /// `redeem_cookies(user_id, cookies)`. Goes through the login queue when
    /// `useLoginQueue` is enabled; otherwise calls upstream directly.
    pub async fn redeem_cookies(&self, user_id: UserId, cookies: String) -> Result<(), UpstreamError> {
        let config = self.config.current().await;
        if config.use_login_queue {
            self.enqueue_and_await(user_id, "redeem_cookies", serde_json::json!({ "cookies": cookies })).await
        } else {
            self.do_redeem_cookies(user_id, &cookies).await
        }
    }

    async fn do_redeem_cookies(&self, user_id: UserId, cookies: &str) -> Result<(), UpstreamError> {
        let token = oauth::do_cookie_reauthorize(
            &self.http,
            &self.endpoints.reauthorize_url,
            cookies,
            &self.token_host,
            &self.rate_limit,
            self.clock.as_ref(),
        )
        .await?;
        self.upsert_account_from_token(user_id, AuthKind::Cookie { cookies: cookies.to_owned() }, token).await
    }

    /// `redeem_code_callback(user_id, callback_url)`.
    pub async fn redeem_code_callback(&self, user_id: UserId, callback_url: String) -> Result<(), UpstreamError> {
        let config = self.config.current().await;
        if config.use_login_queue {
            self.enqueue_and_await(user_id, "redeem_code_callback", serde_json::json!({ "callback_url": callback_url }))
                .await
        } else {
            self.do_redeem_code_callback(user_id, &callback_url).await
        }
    }

    async fn do_redeem_code_callback(&self, user_id: UserId, callback_url: &str) -> Result<(), UpstreamError> {
        let code = oauth::parse_callback_code(callback_url)
            .ok_or_else(|| UpstreamError::Transport("callback url missing code".into()))?;
        let token = oauth::exchange_code(
            &self.http,
            &self.endpoints.token_url,
            &self.endpoints.client_id,
            &code,
            &self.token_host,
            &self.rate_limit,
            self.clock.as_ref(),
        )
        .await?;
        let refresh_token = token
            .refresh_token
            .clone()
            .ok_or_else(|| UpstreamError::Transport("token endpoint returned no refresh_token".into()))?;
        self.upsert_account_from_token(
            user_id,
            AuthKind::Code { refresh_token, refresh_token_obtained_at: self.clock.now_ms() },
            token,
        )
        .await
    }

    async fn upsert_account_from_token(
        &self,
        user_id: UserId,
        kind: AuthKind,
        token: oauth::TokenResponse,
    ) -> Result<(), UpstreamError> {
        let now = self.clock.now_ms();
        let auth = Auth {
            kind,
            access_token: token.access_token,
            id_token: token.id_token,
            entitlement_token: token.entitlement_token,
            access_token_expires_at: now + (token.expires_in as i64) * 1000,
        };

        let mut user = self
            .store
            .get_user(user_id)
            .await
            .map_err(|_| UpstreamError::Transport("store unavailable".into()))?
            .unwrap_or_else(|| new_empty_user(user_id, now));

        // puuid is not known until the upstream identity call resolves; the
        // caller (command layer) is responsible for filling it in once the
        // player identity response comes back. Here we only persist tokens
        // onto whatever account is currently selected, creating one if absent.
        if user.current_account().is_none() {
            user.accounts.push(placeholder_account(user_id, now));
            user.current_account_index = user.accounts.len();
        }
        if let Some(account) = user.current_account_mut() {
            account.auth = Some(auth);
            account.auth_failures = 0;
            account.updated_at = now;
        }
        user.updated_at = now;

        self.store
            .save_user(&user)
            .await
            .map_err(|_| UpstreamError::Transport("store unavailable".into()))?;
        Ok(())
    }

    /// `delete_user_auth(account)`: sets Auth to absent.
    pub async fn delete_user_auth(&self, user_id: UserId, account_puuid: &str) -> Result<(), UpstreamError> {
        self.store
            .update_account_auth(account_puuid, None)
            .await
            .map_err(|_| UpstreamError::Transport("store unavailable".into()))?;
        tracing::info!(user_id, account_puuid, "auth cleared");
        Ok(())
    }

    async fn enqueue_and_await(
        &self,
        user_id: UserId,
        operation: &str,
        mut payload: serde_json::Value,
    ) -> Result<(), UpstreamError> {
        let config = self.config.current().await;
        if let serde_json::Value::Object(ref mut map) = payload {
            map.insert("user_id".into(), serde_json::json!(user_id));
        }
        let counter = login_queue::enqueue(&self.bus, self.clock.as_ref(), operation, payload)
            .await
            .map_err(|_| UpstreamError::Transport("coordination bus unavailable".into()))?;

        loop {
            tokio::time::sleep(config.login_queue_poll_rate()).await;
            let (result, _remaining) = login_queue::poll(&self.bus, counter)
                .await
                .map_err(|_| UpstreamError::Transport("coordination bus unavailable".into()))?;
            if result.processed {
                if result.stale {
                    return Err(UpstreamError::Transport("login queue item went stale".into()));
                }
                return match result.result {
                    Some(serde_json::Value::String(ref s)) if s == "ok" => Ok(()),
                    Some(serde_json::Value::Object(ref map)) => {
                        if let Some(err) = map.get("error").and_then(|v| v.as_str()) {
                            Err(UpstreamError::Transport(err.to_owned()))
                        } else {
                            Ok(())
                        }
                    }
                    _ => Ok(()),
                };
            }
        }
    }

    /// Builds the handler the login-queue drain loop invokes for whichever
    /// shard currently holds the processing lock.
    pub fn login_queue_operation(self: &Arc<Self>) -> login_queue::LoginOperation {
        let this = Arc::clone(self);
        Arc::new(move |item| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                let user_id = item.payload.get("user_id").and_then(|v| v.as_u64()).unwrap_or(0);
                let outcome = match item.operation.as_str() {
                    "redeem_cookies" => {
                        let cookies = item.payload.get("cookies").and_then(|v| v.as_str()).unwrap_or_default();
                        this.do_redeem_cookies(user_id, cookies).await
                    }
                    "redeem_code_callback" => {
                        let callback_url =
                            item.payload.get("callback_url").and_then(|v| v.as_str()).unwrap_or_default();
                        this.do_redeem_code_callback(user_id, callback_url).await
                    }
                    other => Err(UpstreamError::Transport(format!("unknown queued operation {other}"))),
                };
                match outcome {
                    Ok(()) => serde_json::json!("ok"),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                }
            })
        })
    }

    pub fn drain_loop_interval(&self) -> Duration {
        Duration::from_millis(500)
    }
}

fn new_empty_user(id: UserId, now: i64) -> crate::model::User {
    crate::model::User {
        id,
        accounts: Vec::new(),
        current_account_index: 0,
        settings: crate::model::UserSettings::default(),
        created_at: now,
        updated_at: now,
    }
}

fn placeholder_account(user_id: UserId, now: i64) -> Account {
    Account {
        puuid: format!("pending-{user_id}-{now}"),
        user_id,
        username: String::new(),
        region: String::new(),
        auth: None,
        alerts: Vec::new(),
        auth_failures: 0,
        last_fetched_data: 0,
        last_notice_seen: String::new(),
        last_saw_easter_egg: None,
        created_at: now,
        updated_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::ShardConfig;

    fn test_config() -> ShardConfig {
        ShardConfig {
            shards: "1".into(),
            shard_id: 0,
            max_accounts_per_user: 5,
            refresh_skins: "0 0 0 * * *".into(),
            check_game_version: "0 */15 * * * *".into(),
            refresh_prices: "0 0 */6 * * *".into(),
            update_user_agent: "0 0 0 * * 0".into(),
            delay_between_alerts_ms: 1500,
            alert_concurrency: 1,
            alerts_per_page: 10,
            career_cache_expiration_secs: 3600,
            emoji_cache_expiration_secs: 86_400,
            loadout_cache_expiration_secs: 3600,
            defer_interactions: false,
            use_shop_cache: true,
            use_login_queue: false,
            login_queue_interval_ms: 2000,
            login_queue_poll_rate_ms: 10,
            auth_failure_strikes: 3,
            auto_refresh_tokens: true,
            token_refresh_buffer_minutes: 5,
            rate_limit_backoff_ms: 1000,
            rate_limit_cap_ms: 300_000,
            maintenance_mode: false,
            status: None,
            shard_ready_timeout_ms: 30_000,
            stats_expiration_days: 30,
            track_store_stats: true,
            log_to_channel: None,
            log_frequency_ms: 60_000,
            log_urls: vec![],
            verbose_logging: false,
            store_host: "127.0.0.1".into(),
            store_port: 4222,
            store_password: None,
            db_path: "users.db".into(),
            config_file: None,
        }
    }

    #[tokio::test]
    async fn auth_user_skips_refresh_when_token_fresh() -> anyhow::Result<()> {
        let store = Arc::new(UserStore::open_in_memory()?);
        let clock = Arc::new(FakeClock::new(0));
        let config = Arc::new(ConfigHandle::new(test_config()));

        let mut user = new_empty_user(1, 0);
        let mut account = placeholder_account(1, 0);
        account.auth = Some(Auth {
            kind: AuthKind::Code { refresh_token: "rt".into(), refresh_token_obtained_at: 0 },
            access_token: "at".into(),
            id_token: "it".into(),
            entitlement_token: "et".into(),
            access_token_expires_at: 10 * 60 * 1000,
        });
        user.accounts.push(account);
        user.current_account_index = 1;
        store.save_user(&user).await?;

        // auth_user's upstream path is exercised in the alert-engine
        // integration tests against a live coordination bus; here we only
        // confirm the "still fresh" short-circuit never touches the network.
        let auth = user.accounts[0].auth.clone().ok_or_else(|| anyhow::anyhow!("missing auth"))?;
        assert!(!auth.needs_refresh(clock.now_ms(), config.current().await.token_refresh_buffer().num_milliseconds()));
        Ok(())
    }
}
