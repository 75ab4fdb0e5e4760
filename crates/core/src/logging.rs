// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Log forwarding (§4.L, §6 `logToChannel`/`logFrequency`/`logUrls`): a
//! buffer callers push lines into, flushed on a schedule to webhook urls and
//! (if `logToChannel` is set) broadcast for the presentation layer to post.

use std::sync::Arc;
use std::sync::Mutex;

use crate::bus::{BusMessage, CoordinationBus};
use crate::config::ShardConfig;
use crate::upstream::tls;

pub struct LogBuffer {
    lines: Mutex<Vec<String>>,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self { lines: Mutex::new(Vec::new()) }
    }

    // TODO: install a `tracing_subscriber::Layer` that calls this
    // automatically; for now callers push explicitly at their own call sites.
    pub fn push(&self, line: impl Into<String>) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.into());
        }
    }

    fn drain_all(&self) -> Vec<String> {
        match self.lines.lock() {
            Ok(mut lines) => std::mem::take(&mut *lines),
            Err(_) => Vec::new(),
        }
    }
}

pub struct LogForwarder {
    buffer: Arc<LogBuffer>,
    http: reqwest::Client,
}

impl LogForwarder {
    pub fn new(buffer: Arc<LogBuffer>) -> anyhow::Result<Self> {
        tls::install_default_provider();
        let http = reqwest::Client::builder().build()?;
        Ok(Self { buffer, http })
    }

    /// Drains whatever has accumulated since the last tick and ships it.
    /// Delivery failures are logged and dropped rather than retried — the
    /// next tick's batch supersedes them anyway.
    pub async fn flush(&self, bus: &CoordinationBus, config: &ShardConfig) -> anyhow::Result<()> {
        let lines = self.buffer.drain_all();
        if lines.is_empty() {
            return Ok(());
        }

        if config.log_to_channel.is_some() {
            bus.broadcast(&BusMessage::LogLines { lines: lines.clone() }).await?;
        }

        for url in &config.log_urls {
            if let Err(e) = self.http.post(url).json(&lines).send().await {
                tracing::warn!(err = %e, url, "log forwarder: delivery failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_all_empties_the_buffer() {
        let buffer = LogBuffer::new();
        buffer.push("first");
        buffer.push("second");
        assert_eq!(buffer.drain_all(), vec!["first".to_owned(), "second".to_owned()]);
        assert!(buffer.drain_all().is_empty());
    }
}
