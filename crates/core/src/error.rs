// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy. Upstream calls return [`UpstreamError`]; engines compose
//! that with [`DomainError`] and [`InfrastructureError`] via [`AppError`] at
//! the boundaries that surface a message to a user or operator.

use thiserror::Error;

/// Every upstream HTTP operation returns this instead of throwing on 4xx/5xx.
#[derive(Debug, Error, Clone)]
pub enum UpstreamError {
    #[error("rate limited, retry at {retry_at}")]
    RateLimited { retry_at: i64 },
    #[error("upstream under maintenance")]
    Maintenance,
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("blocked by upstream edge")]
    Blocked,
    #[error("transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Maintenance | Self::Transport(_))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("user not registered")]
    NotRegistered,
    #[error("not found")]
    NotFound,
    #[error("duplicate alert")]
    DuplicateAlert,
    #[error("channel inaccessible: {reason}")]
    ChannelInaccessible { reason: String },
    #[error("too many accounts (cap {cap})")]
    TooManyAccounts { cap: u32 },
    #[error("account index too high (cap {cap})")]
    AccountNumberTooHigh { cap: u32 },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InfrastructureError {
    #[error("shared store unavailable")]
    SharedStoreUnavailable,
}

/// Boundary error for command handlers and scheduled jobs. Not used inside
/// the engines themselves, which match on the narrower variants directly.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        UpstreamError::Transport(e.to_string())
    }
}

impl From<rusqlite::Error> for InfrastructureError {
    fn from(_: rusqlite::Error) -> Self {
        InfrastructureError::SharedStoreUnavailable
    }
}
