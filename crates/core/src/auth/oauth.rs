// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token wire types and the refresh/cookie-exchange HTTP calls. Grounded in
//! the teacher's `credential/oauth.rs` + `credential/refresh.rs`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::UpstreamError;
use crate::ratelimit::RateLimitGate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    pub id_token: String,
    pub entitlement_token: String,
}

/// Classifies a failed response status. A bare 429 with no `Retry-After` /
/// `X-Ratelimit-Reset` header falls back to `gate`'s exponential backoff
/// (§4.C), rather than an unbounded zero-wait retry.
async fn classify_status(
    status: reqwest::StatusCode,
    headers: &reqwest::header::HeaderMap,
    host: &str,
    gate: &RateLimitGate,
    clock: &dyn Clock,
) -> UpstreamError {
    match status.as_u16() {
        401 | 403 => UpstreamError::InvalidCredentials,
        429 => {
            let retry_at = match RateLimitGate::retry_at_from_headers(headers, clock.now_ms()) {
                Some(retry_at) => {
                    let _ = gate.record(host, retry_at).await;
                    retry_at
                }
                None => gate.backoff_retry_at(host, clock).await,
            };
            UpstreamError::RateLimited { retry_at }
        }
        503 => UpstreamError::Maintenance,
        451 => UpstreamError::Blocked,
        _ => UpstreamError::Transport(format!("unexpected status {status}")),
    }
}

/// Exchange a `refresh_token` for a fresh token set.
pub async fn do_refresh(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    refresh_token: &str,
    host: &str,
    gate: &RateLimitGate,
    clock: &dyn Clock,
) -> Result<TokenResponse, UpstreamError> {
    let resp = client
        .post(token_url)
        .form(&[("grant_type", "refresh_token"), ("client_id", client_id), ("refresh_token", refresh_token)])
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(classify_status(resp.status(), resp.headers(), host, gate, clock).await);
    }
    Ok(resp.json().await?)
}

/// Exchange a cookie jar for a fresh token set via the reauthorize redirect.
pub async fn do_cookie_reauthorize(
    client: &reqwest::Client,
    reauthorize_url: &str,
    cookies: &str,
    host: &str,
    gate: &RateLimitGate,
    clock: &dyn Clock,
) -> Result<TokenResponse, UpstreamError> {
    let resp = client
        .get(reauthorize_url)
        .header(reqwest::header::COOKIE, cookies)
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(classify_status(resp.status(), resp.headers(), host, gate, clock).await);
    }
    Ok(resp.json().await?)
}

/// `redeem_code_callback`: exchange an authorization code for tokens,
/// producing the refresh token stored on the Account.
pub async fn exchange_code(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    code: &str,
    host: &str,
    gate: &RateLimitGate,
    clock: &dyn Clock,
) -> Result<TokenResponse, UpstreamError> {
    let resp = client
        .post(token_url)
        .form(&[("grant_type", "authorization_code"), ("client_id", client_id), ("code", code)])
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(classify_status(resp.status(), resp.headers(), host, gate, clock).await);
    }
    Ok(resp.json().await?)
}

/// Parses the `code` query parameter out of an OAuth redirect callback URL.
pub fn parse_callback_code(callback_url: &str) -> Option<String> {
    let query = callback_url.split_once('?')?.1;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=')?;
        if key == "code" {
            return Some(value.to_owned());
        }
    }
    None
}

/// Refresh with exponential backoff retries (grounded in `refresh_with_retries`).
#[allow(clippy::too_many_arguments)]
pub async fn refresh_with_retries(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    refresh_token: &str,
    host: &str,
    gate: &RateLimitGate,
    clock: &dyn Clock,
    max_retries: u32,
) -> Result<TokenResponse, UpstreamError> {
    let mut backoff = Duration::from_secs(1);
    let max_backoff = Duration::from_secs(60);

    for attempt in 0..=max_retries {
        match do_refresh(client, token_url, client_id, refresh_token, host, gate, clock).await {
            Ok(token) => return Ok(token),
            Err(e) if !e.is_transient() || attempt == max_retries => return Err(e),
            Err(e) => {
                tracing::debug!(attempt, err = %e, "refresh attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(max_backoff);
            }
        }
    }
    unreachable!("loop always returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_callback_code_extracts_code_param() {
        let url = "https://example.test/callback?state=abc&code=xyz123";
        assert_eq!(parse_callback_code(url).as_deref(), Some("xyz123"));
    }

    #[test]
    fn parse_callback_code_missing_returns_none() {
        let url = "https://example.test/callback?state=abc";
        assert_eq!(parse_callback_code(url), None);
    }
}
