// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

mod adapters;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::error;

use shopwatch_core::auth::AuthEndpoints;
use shopwatch_core::config::ShardConfig;
use shopwatch_core::matches::MatchEndpoints;
use shopwatch_core::shop::ShopEndpoints;
use shopwatch_core::{Endpoints, Ports, Shard};

/// Reads an endpoint URL from the environment, falling back to a dev default
/// that points at nothing reachable — standing in for the presentation
/// layer's own deployment-specific endpoint configuration (out of scope
/// here; see spec §1/§6).
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn endpoints_from_env() -> Endpoints {
    let host = env_or("SHOPWATCH_UPSTREAM_HOST", "upstream.example.invalid");
    Endpoints {
        shop: ShopEndpoints {
            shop_url_template: env_or("SHOPWATCH_SHOP_URL", "https://upstream.example.invalid/shop/{puuid}"),
            night_market_url_template: env_or(
                "SHOPWATCH_NIGHT_MARKET_URL",
                "https://upstream.example.invalid/shop/{puuid}/night-market",
            ),
            bundles_url: env_or("SHOPWATCH_BUNDLES_URL", "https://upstream.example.invalid/bundles"),
            host: host.clone(),
        },
        auth: AuthEndpoints {
            token_url: env_or("SHOPWATCH_TOKEN_URL", "https://upstream.example.invalid/oauth/token"),
            reauthorize_url: env_or("SHOPWATCH_REAUTHORIZE_URL", "https://upstream.example.invalid/oauth/reauthorize"),
            client_id: env_or("SHOPWATCH_CLIENT_ID", "play-client"),
        },
        live_match: MatchEndpoints {
            host,
            party_url: env_or("SHOPWATCH_PARTY_URL", "https://upstream.example.invalid/party"),
            pregame_url_template: env_or("SHOPWATCH_PREGAME_URL", "https://upstream.example.invalid/pregame/{puuid}"),
            ingame_url_template: env_or("SHOPWATCH_INGAME_URL", "https://upstream.example.invalid/ingame/{puuid}"),
            name_resolve_url: env_or("SHOPWATCH_NAME_RESOLVE_URL", "https://upstream.example.invalid/names"),
            rank_url_template: env_or("SHOPWATCH_RANK_URL", "https://upstream.example.invalid/rank/{puuid}"),
            match_detail_url_template: env_or(
                "SHOPWATCH_MATCH_DETAIL_URL",
                "https://upstream.example.invalid/matches/{match_id}",
            ),
        },
        manifest_url: env_or("SHOPWATCH_MANIFEST_URL", "https://upstream.example.invalid/manifest"),
        upstream_base_url: env_or("SHOPWATCH_UPSTREAM_BASE_URL", "https://upstream.example.invalid"),
        bus_prefix: env_or("SHOPWATCH_BUS_PREFIX", "shopwatch"),
    }
}

fn default_ports() -> anyhow::Result<Ports> {
    let http = reqwest::Client::builder().build()?;
    let catalog_fetch = adapters::DirectCatalogFetchPort::new(
        http,
        env_or("SHOPWATCH_MANIFEST_URL", "https://upstream.example.invalid/manifest"),
        env_or("SHOPWATCH_CATALOG_TABLES_URL", "https://upstream.example.invalid/catalog/{version}"),
    );
    Ok(Ports {
        notify: Arc::new(adapters::ConsoleNotificationPort),
        assets: Arc::new(adapters::ConsoleAssetPort),
        catalog_fetch: Arc::new(catalog_fetch),
    })
}

#[tokio::main]
async fn main() {
    let config = ShardConfig::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: ShardConfig) -> anyhow::Result<()> {
    let endpoints = endpoints_from_env();
    let ports = default_ports()?;
    let shard = Shard::bootstrap(config, endpoints, ports).await?;

    let shutdown = CancellationToken::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c_shutdown.cancel();
    });

    shard.run(shutdown).await
}
