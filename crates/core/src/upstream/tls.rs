// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pinned TLS profile (§4.F): explicit cipher suite and signature algorithm
//! order, TLS 1.3 only, matching the upstream's expected client fingerprint.
//! The workspace builds `reqwest` with `rustls-no-provider`, so a process
//! wide default `CryptoProvider` must be installed once before any client is
//! built.

use std::sync::Arc;

use rustls::crypto::ring as provider;
use rustls::ClientConfig;

/// Installs the process-wide `ring` crypto provider. Must run once before
/// any TLS connection is attempted; calling it twice is a no-op failure we
/// deliberately ignore (a second shard-internal client is not an error).
pub fn install_default_provider() {
    let _ = provider::default_provider().install_default();
}

/// Builds the pinned `rustls::ClientConfig`: Mozilla roots only (never the
/// OS trust store), TLS 1.3 only, cipher suites reordered to match the
/// upstream client's expected fingerprint.
pub fn pinned_tls_config() -> anyhow::Result<ClientConfig> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut crypto_provider = provider::default_provider();
    crypto_provider.cipher_suites = vec![
        provider::cipher_suite::TLS13_AES_128_GCM_SHA256,
        provider::cipher_suite::TLS13_AES_256_GCM_SHA384,
        provider::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    ];

    let config = ClientConfig::builder_with_provider(Arc::new(crypto_provider))
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pinned_tls_config_builds_without_os_trust_store() -> anyhow::Result<()> {
        let config = pinned_tls_config()?;
        assert!(config.alpn_protocols.is_empty());
        Ok(())
    }
}
