/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over TCP
//!
//! Every query dials its own connection, writes one framed request and reads
//! one framed response. The same exchange backs the UDP truncation fallback.

use crate::core::error::{DnsError, Result, StageExt};
use crate::core::signal::Signal;
use crate::network::transport::{read_message, write_message};
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use hickory_proto::op::Message;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::timeout;

#[derive(Debug)]
pub struct TcpTransport {
    base: BaseTransport,
    server_addr: SocketAddr,
    timeout: Duration,
    shutdown_timeout: Duration,
    dialer: Arc<dyn Dialer>,
}

impl TcpTransport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            base: BaseTransport::new(&info.tag, TransportType::TCP),
            server_addr: info.server_addr,
            timeout: info.timeout,
            shutdown_timeout: info.shutdown_timeout,
            dialer,
        }
    }
}

#[async_trait]
impl DnsTransport for TcpTransport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::TCP
    }

    fn start(&self, stage: StartStage) -> Result<()> {
        if stage == StartStage::Start {
            self.base.set_started()?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.base.shutdown(self.shutdown_timeout).await
    }

    fn reset(&self) {}

    async fn exchange(&self, request: &Message) -> Result<Message> {
        let _lease = self.base.begin_query().ok_or(DnsError::TransportClosed)?;
        timeout(
            self.timeout,
            exchange_once(
                self.dialer.as_ref(),
                self.server_addr,
                request,
                self.base.close_context(),
            ),
        )
        .await
        .map_err(|_| DnsError::Timeout("TCP query"))?
    }
}

/// One query over a freshly dialed connection
///
/// Gives up with "transport closed" as soon as `close_ctx` fires.
pub(crate) async fn exchange_once(
    dialer: &dyn Dialer,
    server_addr: SocketAddr,
    request: &Message,
    close_ctx: &Signal,
) -> Result<Message> {
    let exchange = async {
        let mut stream = dialer
            .dial_tcp(server_addr)
            .await
            .stage("dial TCP connection")?;
        write_message(&mut stream, request.id(), request)
            .await
            .stage("write request")?;
        let response = read_message(&mut stream).await.stage("read response")?;
        if response.id() != request.id() {
            return Err(DnsError::protocol(format!(
                "response ID {} does not match query ID {}",
                response.id(),
                request.id()
            )));
        }
        Ok(response)
    };

    select! {
        res = exchange => res,
        _ = close_ctx.fired() => Err(DnsError::TransportClosed),
    }
}
