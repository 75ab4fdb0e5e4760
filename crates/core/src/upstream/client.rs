// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP client for the upstream game API (§4.F). Grounded in the teacher's
//! `upstream/client.rs` (one `reqwest::Client`, thin `get`/`post` wrappers
//! returning `serde_json::Value`), generalized with the pinned TLS profile,
//! a static platform header, a refreshable client-version header, and a
//! mandatory rate-limit-gate consultation around every call.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::UpstreamError;
use crate::ratelimit::RateLimitGate;
use crate::upstream::tls;

/// Pre-computed once: the platform descriptor is stable for the process
/// lifetime, unlike the client-version header.
const CLIENT_PLATFORM: &str = "ew0KCSJwbGF0Zm9ybVR5cGUiOiAiUEMiLA0KCSJwbGF0Zm9ybU9TIjogIldpbmRvd3MiLA0KCSJwbGF0Zm9ybU9TVmVyc2lvbiI6ICIxMC4wLjE5MDQyLjEuMjU2LjY0Yml0IiwNCgkicGxhdGZvcm1DaGlwc2V0IjogIlVua25vd24iDQp9";

pub struct UpstreamClient {
    http: reqwest::Client,
    rate_limit: Arc<RateLimitGate>,
    clock: Arc<dyn Clock>,
    base_url: String,
    client_version: RwLock<String>,
}

impl UpstreamClient {
    pub fn new(base_url: String, rate_limit: Arc<RateLimitGate>, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        tls::install_default_provider();
        let tls_config = tls::pinned_tls_config()?;

        let mut headers = HeaderMap::new();
        headers.insert("X-Riot-ClientPlatform", HeaderValue::from_static(CLIENT_PLATFORM));

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .default_headers(headers)
            .pool_max_idle_per_host(10)
            .timeout(Duration::from_secs(15))
            .build()?;

        Ok(Self { http, rate_limit, clock, base_url, client_version: RwLock::new(String::new()) })
    }

    /// Refetches the client-version header value from the manifest endpoint.
    /// Cheap to call on a schedule (`updateUserAgent`); a failed refresh
    /// keeps the previous value rather than clearing it.
    pub async fn refresh_client_version(&self, manifest_url: &str) -> Result<(), UpstreamError> {
        let resp = self.http.get(manifest_url).send().await?;
        if !resp.status().is_success() {
            return Err(Self::classify(resp.status()));
        }
        let body: serde_json::Value = resp.json().await?;
        let version = body
            .get("riotClientVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| UpstreamError::Transport("manifest missing riotClientVersion".into()))?;
        *self.client_version.write().await = version.to_owned();
        Ok(())
    }

    pub async fn get_json(&self, host: &str, url: &str) -> Result<serde_json::Value, UpstreamError> {
        self.guarded(host, || self.http.get(url)).await
    }

    pub async fn post_json(
        &self,
        host: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        self.guarded(host, || self.http.post(url).json(body)).await
    }

    pub async fn put_json(
        &self,
        host: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        self.guarded(host, || self.http.put(url).json(body)).await
    }

    /// Every call passes through here: gate check, attach headers, send,
    /// feed rate-limit response headers back to the gate.
    async fn guarded<F>(&self, host: &str, build: F) -> Result<serde_json::Value, UpstreamError>
    where
        F: FnOnce() -> reqwest::RequestBuilder,
    {
        if let Ok(Some(retry_at)) = self.rate_limit.check(host, self.clock.as_ref()).await {
            return Err(UpstreamError::RateLimited { retry_at });
        }

        let version = self.client_version.read().await.clone();
        let mut req = build();
        if !version.is_empty() {
            req = req.header("X-Riot-ClientVersion", version);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let header_retry_at = RateLimitGate::retry_at_from_headers(&headers, self.clock.now_ms());

        if let Some(retry_at) = header_retry_at {
            let _ = self.rate_limit.record(host, retry_at).await;
        }

        if !status.is_success() {
            if status.as_u16() == 429 {
                let retry_at = match header_retry_at {
                    Some(retry_at) => retry_at,
                    None => self.rate_limit.backoff_retry_at(host, self.clock.as_ref()).await,
                };
                return Err(UpstreamError::RateLimited { retry_at });
            }
            return Err(Self::classify(status));
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    fn classify(status: reqwest::StatusCode) -> UpstreamError {
        match status.as_u16() {
            401 | 403 => UpstreamError::InvalidCredentials,
            503 => UpstreamError::Maintenance,
            451 => UpstreamError::Blocked,
            _ => UpstreamError::Transport(format!("unexpected status {status}")),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
