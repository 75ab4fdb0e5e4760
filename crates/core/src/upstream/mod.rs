// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Upstream HTTP client (§4.F): pinned TLS, keep-alive pool, rate-limit
//! gate enforcement. No other component may hold its own `reqwest::Client`.

pub mod client;
mod tls;

pub use client::UpstreamClient;
pub use tls::{install_default_provider, pinned_tls_config};
