// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process-wide settings, loaded with `clap` (env-overridable) and
//! reloadable from a JSON file at runtime. Generalized from the teacher's
//! `MuxConfig` (`config.rs`), which is `Clone` and swapped wholesale on
//! reload rather than mutated in place.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Configuration for a shard process. Every field is settable via CLI flag,
/// environment variable, or (for the keys in spec §6) the JSON config file.
/// Token fields and foreign API keys are never logged (see `Debug` impl).
#[derive(Clone, Args, Serialize, Deserialize)]
pub struct ShardConfig {
    /// Target shard count, or "auto" to derive from the coordination bus.
    #[arg(long, default_value = "auto", env = "SHOPWATCH_SHARDS")]
    #[serde(default = "default_shards")]
    pub shards: String,

    #[arg(long, default_value_t = 0, env = "SHOPWATCH_SHARD_ID")]
    #[serde(default)]
    pub shard_id: u32,

    #[arg(long, default_value_t = 5, env = "SHOPWATCH_MAX_ACCOUNTS_PER_USER")]
    #[serde(default = "default_max_accounts")]
    pub max_accounts_per_user: u32,

    /// Cron expression for the alert scan.
    #[arg(long, default_value = "0 0 0 * * *", env = "SHOPWATCH_REFRESH_SKINS")]
    #[serde(default = "default_refresh_skins")]
    pub refresh_skins: String,

    /// Cron expression for the upstream version refresh.
    #[arg(long, default_value = "0 */15 * * * *", env = "SHOPWATCH_CHECK_GAME_VERSION")]
    #[serde(default = "default_check_game_version")]
    pub check_game_version: String,

    /// Cron expression for catalog reload from disk.
    #[arg(long, default_value = "0 0 */6 * * *", env = "SHOPWATCH_REFRESH_PRICES")]
    #[serde(default = "default_refresh_prices")]
    pub refresh_prices: String,

    /// Cron expression for client-platform header refresh.
    #[arg(long, default_value = "0 0 0 * * 0", env = "SHOPWATCH_UPDATE_USER_AGENT")]
    #[serde(default = "default_update_user_agent")]
    pub update_user_agent: String,

    #[arg(long, default_value_t = 1500, env = "SHOPWATCH_DELAY_BETWEEN_ALERTS_MS")]
    #[serde(default = "default_delay_between_alerts_ms")]
    pub delay_between_alerts_ms: u64,

    /// 1 = sequential mode; >1 = bounded-parallel mode.
    #[arg(long, default_value_t = 1, env = "SHOPWATCH_ALERT_CONCURRENCY")]
    #[serde(default = "default_alert_concurrency")]
    pub alert_concurrency: usize,

    /// Presentation-only; carried for schema fidelity.
    #[arg(long, default_value_t = 10, env = "SHOPWATCH_ALERTS_PER_PAGE")]
    #[serde(default = "default_alerts_per_page")]
    pub alerts_per_page: u32,

    #[arg(long, default_value_t = 3600, env = "SHOPWATCH_CAREER_CACHE_EXPIRATION_SECS")]
    #[serde(default = "default_career_cache_secs")]
    pub career_cache_expiration_secs: u64,

    #[arg(long, default_value_t = 86_400, env = "SHOPWATCH_EMOJI_CACHE_EXPIRATION_SECS")]
    #[serde(default = "default_emoji_cache_secs")]
    pub emoji_cache_expiration_secs: u64,

    #[arg(long, default_value_t = 3600, env = "SHOPWATCH_LOADOUT_CACHE_EXPIRATION_SECS")]
    #[serde(default = "default_loadout_cache_secs")]
    pub loadout_cache_expiration_secs: u64,

    #[arg(long, default_value_t = false, env = "SHOPWATCH_DEFER_INTERACTIONS")]
    #[serde(default)]
    pub defer_interactions: bool,

    #[arg(long, default_value_t = true, env = "SHOPWATCH_USE_SHOP_CACHE")]
    #[serde(default = "default_true")]
    pub use_shop_cache: bool,

    #[arg(long, default_value_t = true, env = "SHOPWATCH_USE_LOGIN_QUEUE")]
    #[serde(default = "default_true")]
    pub use_login_queue: bool,

    #[arg(long, default_value_t = 2000, env = "SHOPWATCH_LOGIN_QUEUE_INTERVAL_MS")]
    #[serde(default = "default_login_queue_interval_ms")]
    pub login_queue_interval_ms: u64,

    #[arg(long, default_value_t = 500, env = "SHOPWATCH_LOGIN_QUEUE_POLL_RATE_MS")]
    #[serde(default = "default_login_queue_poll_rate_ms")]
    pub login_queue_poll_rate_ms: u64,

    #[arg(long, default_value_t = 3, env = "SHOPWATCH_AUTH_FAILURE_STRIKES")]
    #[serde(default = "default_auth_failure_strikes")]
    pub auth_failure_strikes: u32,

    #[arg(long, default_value_t = true, env = "SHOPWATCH_AUTO_REFRESH_TOKENS")]
    #[serde(default = "default_true")]
    pub auto_refresh_tokens: bool,

    #[arg(long, default_value_t = 5, env = "SHOPWATCH_TOKEN_REFRESH_BUFFER_MINUTES")]
    #[serde(default = "default_token_refresh_buffer_minutes")]
    pub token_refresh_buffer_minutes: i64,

    #[arg(long, default_value_t = 1000, env = "SHOPWATCH_RATE_LIMIT_BACKOFF_MS")]
    #[serde(default = "default_rate_limit_backoff_ms")]
    pub rate_limit_backoff_ms: u64,

    #[arg(long, default_value_t = 300_000, env = "SHOPWATCH_RATE_LIMIT_CAP_MS")]
    #[serde(default = "default_rate_limit_cap_ms")]
    pub rate_limit_cap_ms: u64,

    #[arg(long, default_value_t = false, env = "SHOPWATCH_MAINTENANCE_MODE")]
    #[serde(default)]
    pub maintenance_mode: bool,

    #[arg(long, env = "SHOPWATCH_STATUS")]
    #[serde(default)]
    pub status: Option<String>,

    #[arg(long, default_value_t = 30_000, env = "SHOPWATCH_SHARD_READY_TIMEOUT_MS")]
    #[serde(default = "default_shard_ready_timeout_ms")]
    pub shard_ready_timeout_ms: u64,

    #[arg(long, default_value_t = 30, env = "SHOPWATCH_STATS_EXPIRATION_DAYS")]
    #[serde(default = "default_stats_expiration_days")]
    pub stats_expiration_days: u32,

    #[arg(long, default_value_t = true, env = "SHOPWATCH_TRACK_STORE_STATS")]
    #[serde(default = "default_true")]
    pub track_store_stats: bool,

    #[arg(long, env = "SHOPWATCH_LOG_TO_CHANNEL")]
    #[serde(default)]
    pub log_to_channel: Option<u64>,

    #[arg(long, default_value_t = 60_000, env = "SHOPWATCH_LOG_FREQUENCY_MS")]
    #[serde(default = "default_log_frequency_ms")]
    pub log_frequency_ms: u64,

    #[arg(long, value_delimiter = ',', env = "SHOPWATCH_LOG_URLS")]
    #[serde(default)]
    pub log_urls: Vec<String>,

    #[arg(long, default_value_t = false, env = "SHOPWATCH_VERBOSE_LOGGING")]
    #[serde(default)]
    pub verbose_logging: bool,

    /// Host for the shared coordination-bus store.
    #[arg(long, default_value = "127.0.0.1", env = "SHOPWATCH_STORE_HOST")]
    #[serde(default = "default_store_host")]
    pub store_host: String,

    #[arg(long, default_value_t = 4222, env = "SHOPWATCH_STORE_PORT")]
    #[serde(default = "default_store_port")]
    pub store_port: u16,

    #[arg(long, env = "SHOPWATCH_STORE_PASSWORD")]
    #[serde(default)]
    pub store_password: Option<String>,

    #[arg(long, default_value = "users.db", env = "SHOPWATCH_DB_PATH")]
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Path to the optional JSON config file (§6). Out of scope: the file's
    /// own loader UI; in scope: atomic reload of the values it sets.
    #[arg(long, env = "SHOPWATCH_CONFIG_FILE")]
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl std::fmt::Debug for ShardConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConfig")
            .field("shards", &self.shards)
            .field("shard_id", &self.shard_id)
            .field("alert_concurrency", &self.alert_concurrency)
            .field("use_login_queue", &self.use_login_queue)
            .field("maintenance_mode", &self.maintenance_mode)
            .field("store_host", &self.store_host)
            .field("store_port", &self.store_port)
            .field("store_password", &self.store_password.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

macro_rules! default_fn {
    ($name:ident -> $ty:ty = $val:expr) => {
        fn $name() -> $ty {
            $val
        }
    };
}

default_fn!(default_shards -> String = "auto".to_owned());
default_fn!(default_max_accounts -> u32 = 5);
default_fn!(default_refresh_skins -> String = "0 0 0 * * *".to_owned());
default_fn!(default_check_game_version -> String = "0 */15 * * * *".to_owned());
default_fn!(default_refresh_prices -> String = "0 0 */6 * * *".to_owned());
default_fn!(default_update_user_agent -> String = "0 0 0 * * 0".to_owned());
default_fn!(default_delay_between_alerts_ms -> u64 = 1500);
default_fn!(default_alert_concurrency -> usize = 1);
default_fn!(default_alerts_per_page -> u32 = 10);
default_fn!(default_career_cache_secs -> u64 = 3600);
default_fn!(default_emoji_cache_secs -> u64 = 86_400);
default_fn!(default_loadout_cache_secs -> u64 = 3600);
default_fn!(default_true -> bool = true);
default_fn!(default_login_queue_interval_ms -> u64 = 2000);
default_fn!(default_login_queue_poll_rate_ms -> u64 = 500);
default_fn!(default_auth_failure_strikes -> u32 = 3);
default_fn!(default_token_refresh_buffer_minutes -> i64 = 5);
default_fn!(default_rate_limit_backoff_ms -> u64 = 1000);
default_fn!(default_rate_limit_cap_ms -> u64 = 300_000);
default_fn!(default_shard_ready_timeout_ms -> u64 = 30_000);
default_fn!(default_stats_expiration_days -> u32 = 30);
default_fn!(default_log_frequency_ms -> u64 = 60_000);
default_fn!(default_store_host -> String = "127.0.0.1".to_owned());
default_fn!(default_store_port -> u16 = 4222);
default_fn!(default_db_path -> PathBuf = PathBuf::from("users.db"));

impl ShardConfig {
    pub fn delay_between_alerts(&self) -> Duration {
        Duration::from_millis(self.delay_between_alerts_ms)
    }

    pub fn login_queue_interval(&self) -> Duration {
        Duration::from_millis(self.login_queue_interval_ms)
    }

    pub fn login_queue_poll_rate(&self) -> Duration {
        Duration::from_millis(self.login_queue_poll_rate_ms)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn rate_limit_cap(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cap_ms)
    }

    pub fn token_refresh_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.token_refresh_buffer_minutes)
    }

    pub fn shard_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.shard_ready_timeout_ms)
    }

    pub fn career_cache_expiration(&self) -> Duration {
        Duration::from_secs(self.career_cache_expiration_secs)
    }

    pub fn emoji_cache_expiration(&self) -> Duration {
        Duration::from_secs(self.emoji_cache_expiration_secs)
    }

    pub fn loadout_cache_expiration(&self) -> Duration {
        Duration::from_secs(self.loadout_cache_expiration_secs)
    }

    /// Resolved shard count: parses `shards` as a number, or `None` for "auto"
    /// (in which case the coordination bus's readiness barrier determines it).
    pub fn explicit_shard_count(&self) -> Option<u32> {
        self.shards.parse().ok()
    }

    pub fn load_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Atomic-replace config handle. Mirrors the teacher's `MuxConfig` (`Clone`,
/// rebuilt wholesale) but wraps it so a reload swaps the whole value instead
/// of mutating fields in place — resolves REDESIGN FLAGS' "implicit global
/// state" callout for config specifically.
pub struct ConfigHandle {
    inner: RwLock<Arc<ShardConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ShardConfig) -> Self {
        Self { inner: RwLock::new(Arc::new(config)) }
    }

    pub async fn current(&self) -> Arc<ShardConfig> {
        self.inner.read().await.clone()
    }

    /// Re-reads the config file named by the current config's `config_file`,
    /// if any, and atomically swaps in the new value.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let path = {
            let guard = self.inner.read().await;
            guard.config_file.clone()
        };
        let Some(path) = path else {
            anyhow::bail!("no config_file set; nothing to reload from");
        };
        let mut fresh = ShardConfig::load_file(&path)?;
        fresh.config_file = Some(path);
        *self.inner.write().await = Arc::new(fresh);
        tracing::info!("config reloaded");
        Ok(())
    }

    pub async fn replace(&self, config: ShardConfig) {
        *self.inner.write().await = Arc::new(config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reload_swaps_atomically() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("config.json");
        let initial = ShardConfig {
            shards: "4".into(),
            shard_id: 0,
            max_accounts_per_user: 5,
            refresh_skins: default_refresh_skins(),
            check_game_version: default_check_game_version(),
            refresh_prices: default_refresh_prices(),
            update_user_agent: default_update_user_agent(),
            delay_between_alerts_ms: 1500,
            alert_concurrency: 1,
            alerts_per_page: 10,
            career_cache_expiration_secs: 3600,
            emoji_cache_expiration_secs: 86_400,
            loadout_cache_expiration_secs: 3600,
            defer_interactions: false,
            use_shop_cache: true,
            use_login_queue: true,
            login_queue_interval_ms: 2000,
            login_queue_poll_rate_ms: 500,
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
            db_path: PathBuf::from("users.db"),
            config_file: Some(path.clone()),
        };
        std::fs::write(&path, serde_json::to_string(&initial)?)?;

        let handle = ConfigHandle::new(initial);
        let mut updated = (*handle.current().await).clone();
        updated.maintenance_mode = true;
        std::fs::write(&path, serde_json::to_string(&updated)?)?;

        handle.reload().await?;
        assert!(handle.current().await.maintenance_mode);
        Ok(())
    }
}
