/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Tag-indexed set of upstream transports
//!
//! Built once from the configured transport list; the first entry is the
//! default route.

use crate::config::types::TransportConfig;
use crate::core::error::{DnsError, Result};
use crate::network::upstream::{DnsTransport, StartStage, transport_from_config};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct TransportManager {
    /// Transports in configuration order
    transports: Vec<Arc<dyn DnsTransport>>,
    by_tag: HashMap<String, usize>,
}

impl TransportManager {
    /// Build every configured transport
    pub fn new(configs: &[TransportConfig]) -> Result<Self> {
        let transports = configs
            .iter()
            .map(transport_from_config)
            .collect::<Result<Vec<_>>>()?;
        Self::from_transports(transports)
    }

    pub fn from_transports(transports: Vec<Arc<dyn DnsTransport>>) -> Result<Self> {
        if transports.is_empty() {
            return Err(DnsError::config("no transports configured"));
        }
        let mut by_tag = HashMap::with_capacity(transports.len());
        for (index, transport) in transports.iter().enumerate() {
            if by_tag.insert(transport.tag().to_string(), index).is_some() {
                return Err(DnsError::config(format!(
                    "duplicate transport tag: {}",
                    transport.tag()
                )));
            }
        }
        Ok(Self { transports, by_tag })
    }

    /// Drive every transport through `stage`, stopping at the first failure
    pub fn start(&self, stage: StartStage) -> Result<()> {
        for transport in &self.transports {
            transport.start(stage)?;
        }
        if stage == StartStage::Start {
            info!(count = self.transports.len(), "Upstream transports started");
        }
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn DnsTransport>> {
        self.by_tag
            .get(tag)
            .map(|&index| self.transports[index].clone())
    }

    /// First configured transport
    pub fn default(&self) -> Arc<dyn DnsTransport> {
        self.transports[0].clone()
    }

    pub fn transports(&self) -> &[Arc<dyn DnsTransport>] {
        &self.transports
    }

    /// Drop shared connections of every transport, e.g. after a network change
    pub fn reset_all(&self) {
        for transport in &self.transports {
            transport.reset();
        }
        debug!(count = self.transports.len(), "Reset all upstream transports");
    }

    /// Close every transport concurrently
    ///
    /// All transports are closed even if some fail; the first failure is
    /// returned.
    pub async fn close(&self) -> Result<()> {
        let results = join_all(self.transports.iter().map(|t| async move {
            let res = t.close().await;
            if let Err(e) = &res {
                warn!(tag = %t.tag(), err = %e, "Transport did not close cleanly");
            }
            res
        }))
        .await;
        results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
    }
}
