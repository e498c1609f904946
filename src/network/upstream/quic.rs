/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over QUIC (RFC 9250)
//!
//! One QUIC connection is shared through a [`Connector`]; every query opens
//! its own bidirectional stream and sends the message with ID 0. When the
//! shared connection turns out to be dead (idle timeout, stateless reset,
//! graceful close by the peer, rejected 0-RTT) the connection is reset and the
//! query is retried once on a new one.

use crate::core::error::{DnsError, Result, StageExt};
use crate::network::tls_config::ALPN_DOQ;
use crate::network::transport::quic_stream::QuicStream;
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::connector::{
    Connector, ConnectorCallbacks, DialFn, SameConnection,
};
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::utils::connect_quic;
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use futures::FutureExt;
use hickory_proto::op::Message;
use quinn::{ConnectionError, ReadError, ReadExactError, TransportErrorCode, VarInt, WriteError};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::select;
use tokio::time::timeout;
use tracing::debug;

/// Attempts per query, the first included
const MAX_ATTEMPTS: usize = 2;

pub struct QuicTransport {
    base: BaseTransport,
    timeout: Duration,
    shutdown_timeout: Duration,
    connector: Connector<quinn::Connection>,
}

impl QuicTransport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        let base = BaseTransport::new(&info.tag, TransportType::DoQ);
        let dial: DialFn<quinn::Connection> = {
            let server_addr = info.server_addr;
            let server_name = info.server_name.clone();
            let insecure = info.insecure_skip_verify;
            Box::new(move || {
                let dialer = dialer.clone();
                let server_name = server_name.clone();
                async move {
                    let socket = dialer
                        .dial_udp(server_addr)
                        .await
                        .stage("dial UDP socket")?;
                    let conn = connect_quic(socket, insecure, &server_name, &[ALPN_DOQ])
                        .await
                        .stage("establish QUIC connection")?;
                    debug!(server = %server_addr, "QUIC connection established");
                    Ok(conn)
                }
                .boxed()
            })
        };
        let connector = Connector::new(base.close_context().clone(), dial, quic_callbacks());

        Self {
            base,
            timeout: info.timeout,
            shutdown_timeout: info.shutdown_timeout,
            connector,
        }
    }
}

impl SameConnection for quinn::Connection {
    fn same_connection(&self, other: &Self) -> bool {
        self.stable_id() == other.stable_id()
    }
}

fn quic_callbacks() -> ConnectorCallbacks<quinn::Connection> {
    ConnectorCallbacks {
        is_closed: Box::new(|conn| conn.close_reason().is_some()),
        close: Box::new(|conn| conn.close(VarInt::from_u32(0), b"")),
        reset: Box::new(|conn| conn.close(VarInt::from_u32(0), b"")),
    }
}

#[async_trait]
impl DnsTransport for QuicTransport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::DoQ
    }

    fn start(&self, stage: StartStage) -> Result<()> {
        if stage == StartStage::Start {
            self.base.set_started()?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let drained = self.base.shutdown(self.shutdown_timeout).await;
        self.connector.close();
        drained
    }

    fn reset(&self) {
        self.connector.reset();
    }

    async fn exchange(&self, request: &Message) -> Result<Message> {
        let _lease = self.base.begin_query().ok_or(DnsError::TransportClosed)?;
        let exchange = exchange_with_retry(&self.connector, |conn| exchange_on(conn, request));
        select! {
            res = timeout(self.timeout, exchange) => {
                res.map_err(|_| DnsError::Timeout("DoQ query"))?
            }
            _ = self.base.close_context().fired() => Err(DnsError::TransportClosed),
        }
    }
}

impl Drop for QuicTransport {
    fn drop(&mut self) {
        self.connector.close();
    }
}

impl Debug for QuicTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicTransport")
            .field("base", &self.base)
            .field("connector", &self.connector)
            .finish()
    }
}

/// One query on its own stream of `conn`
async fn exchange_on(conn: quinn::Connection, request: &Message) -> Result<Message> {
    let mut stream = QuicStream::open(&conn).await.stage("open stream")?;
    stream
        .write_message(request, 0)
        .await
        .stage("write request")?;
    let mut response = stream.read_message().await.stage("read response")?;
    response.set_id(request.id());
    Ok(response)
}

/// Run `attempt` on the shared connection, resetting it and retrying once
/// when the failure means the connection itself is gone
///
/// Only the connection the attempt ran on is reset, so a replacement dialed
/// by a concurrent query survives.
pub(crate) async fn exchange_with_retry<T, F, Fut>(
    connector: &Connector<T>,
    mut attempt: F,
) -> Result<Message>
where
    T: Clone + Send + Sync + SameConnection + 'static,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<Message>>,
{
    let mut last_err = DnsError::TransportClosed;
    for round in 1..=MAX_ATTEMPTS {
        let conn = connector.get().await?;
        match attempt(conn.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) if is_retryable(&e) => {
                debug!(round, err = %e, "Shared QUIC connection is dead, redialing");
                connector.reset_stale(&conn);
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Whether `err` shows the shared connection is unusable rather than the query
pub fn is_retryable(err: &DnsError) -> bool {
    match err.root() {
        DnsError::QuicConnection(e) => is_dead_connection(e),
        DnsError::QuicWrite(WriteError::ConnectionLost(e)) => is_dead_connection(e),
        DnsError::QuicWrite(WriteError::ZeroRttRejected) => true,
        DnsError::QuicRead(ReadExactError::ReadError(ReadError::ConnectionLost(e))) => {
            is_dead_connection(e)
        }
        DnsError::QuicRead(ReadExactError::ReadError(ReadError::ZeroRttRejected)) => true,
        _ => false,
    }
}

fn is_dead_connection(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::TimedOut | ConnectionError::Reset | ConnectionError::LocallyClosed => true,
        ConnectionError::ApplicationClosed(close) => close.error_code == VarInt::from_u32(0),
        ConnectionError::ConnectionClosed(close) => close.error_code == TransportErrorCode::NO_ERROR,
        ConnectionError::TransportError(e) => e.code == TransportErrorCode::NO_ERROR,
        _ => false,
    }
}
