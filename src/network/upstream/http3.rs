/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over HTTPS on HTTP/3
//!
//! Same request shape and reset-on-timeout policy as the HTTP/2 transport,
//! carried over a shared QUIC connection.

use crate::core::error::{DnsError, Result, StageExt};
use crate::core::signal::Signal;
use crate::network::tls_config::ALPN_H3;
use crate::network::transport::pack_message;
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::connector::{Connector, ConnectorCallbacks, DialFn};
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::https::ResetTracker;
use crate::network::upstream::utils::{
    build_dns_post_request, check_status, connect_quic, get_buf_from_res,
};
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes};
use futures::FutureExt;
use h3::client::SendRequest;
use hickory_proto::op::Message;
use http::{HeaderMap, Version};
use quinn::VarInt;
use std::fmt::{Debug, Formatter};
use std::future::poll_fn;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

/// Shared HTTP/3 session
#[derive(Clone)]
pub(crate) struct H3Session {
    id: u32,
    sender: SendRequest<h3_quinn::OpenStreams, Bytes>,
    quic: quinn::Connection,
    closed: Signal,
}

impl H3Session {
    fn is_closed(&self) -> bool {
        self.closed.is_fired() || self.quic.close_reason().is_some()
    }

    fn close(&self) {
        self.closed.fire();
        self.quic.close(VarInt::from_u32(0), b"");
    }
}

pub struct Http3Transport {
    base: BaseTransport,
    server_addr: SocketAddr,
    request_uri: String,
    headers: HeaderMap,
    timeout: Duration,
    shutdown_timeout: Duration,
    connector: Connector<H3Session>,
    resets: ResetTracker,
}

impl Http3Transport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        let base = BaseTransport::new(&info.tag, TransportType::DoH3);
        let next_id = Arc::new(AtomicU32::new(0));
        let dial: DialFn<H3Session> = {
            let server_addr = info.server_addr;
            let server_name = info.server_name.clone();
            let insecure = info.insecure_skip_verify;
            Box::new(move || {
                let dialer = dialer.clone();
                let server_name = server_name.clone();
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                dial_session(dialer, server_addr, server_name, insecure, id).boxed()
            })
        };
        let connector = Connector::new(
            base.close_context().clone(),
            dial,
            ConnectorCallbacks {
                is_closed: Box::new(H3Session::is_closed),
                close: Box::new(H3Session::close),
                reset: Box::new(H3Session::close),
            },
        );

        Self {
            base,
            server_addr: info.server_addr,
            request_uri: info.request_uri.clone(),
            headers: info.headers.clone(),
            timeout: info.timeout,
            shutdown_timeout: info.shutdown_timeout,
            connector,
            resets: ResetTracker::default(),
        }
    }

    async fn exchange_h3(&self, request: &Message) -> Result<Message> {
        let session = self.connector.get().await?;
        let body = pack_message(request, 0)?;
        let http_request =
            build_dns_post_request(&self.request_uri, &self.headers, body.len(), Version::HTTP_3)?;

        let mut sender = session.sender.clone();
        let mut stream = sender
            .send_request(http_request)
            .await
            .map_err(|e| DnsError::http(format!("send request: {e}")))?;
        stream
            .send_data(Bytes::from(body))
            .await
            .map_err(|e| DnsError::http(format!("send request body: {e}")))?;
        stream
            .finish()
            .await
            .map_err(|e| DnsError::http(format!("finish request: {e}")))?;

        let response = stream
            .recv_response()
            .await
            .map_err(|e| DnsError::http(format!("read response: {e}")))?;
        let mut buf = get_buf_from_res(&response);
        while let Some(mut chunk) = stream
            .recv_data()
            .await
            .map_err(|e| DnsError::http(format!("read response body: {e}")))?
        {
            buf.put(chunk.copy_to_bytes(chunk.remaining()));
        }
        check_status(response.status(), &buf)?;

        let mut response = Message::from_vec(&buf)?;
        response.set_id(request.id());
        debug!(session = session.id, id = request.id(), "Received DoH3 response");
        Ok(response)
    }
}

async fn dial_session(
    dialer: Arc<dyn Dialer>,
    server_addr: SocketAddr,
    server_name: String,
    insecure: bool,
    id: u32,
) -> Result<H3Session> {
    let socket = dialer
        .dial_udp(server_addr)
        .await
        .stage("dial UDP socket")?;
    let quic = connect_quic(socket, insecure, &server_name, &[ALPN_H3])
        .await
        .stage("establish QUIC connection")?;
    let (mut driver, sender) = h3::client::new(h3_quinn::Connection::new(quic.clone()))
        .await
        .map_err(|e| DnsError::http(format!("HTTP/3 handshake: {e}")))?;

    let session = H3Session {
        id,
        sender,
        quic,
        closed: Signal::new(),
    };
    let closed = session.closed.clone();
    tokio::spawn(async move {
        select! {
            _ = poll_fn(|cx| driver.poll_close(cx)) => {
                debug!(session = id, "HTTP/3 session ended");
                closed.fire();
            }
            _ = closed.fired() => {
                debug!(session = id, "HTTP/3 session closed");
            }
        }
        let _ = poll_fn(|cx| driver.poll_close(cx)).await;
    });

    debug!(session = id, server = %server_addr, "HTTP/3 session established");
    Ok(session)
}

#[async_trait]
impl DnsTransport for Http3Transport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::DoH3
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
        let started = Instant::now();
        select! {
            res = timeout(self.timeout, self.exchange_h3(request)) => match res {
                Ok(res) => res,
                Err(_) => {
                    if self.resets.should_reset(started) {
                        warn!(tag = %self.base.tag(), "DoH3 query timed out, resetting session");
                        self.connector.reset();
                    }
                    Err(DnsError::Timeout("DoH3 query"))
                }
            },
            _ = self.base.close_context().fired() => Err(DnsError::TransportClosed),
        }
    }
}

impl Drop for Http3Transport {
    fn drop(&mut self) {
        self.connector.close();
    }
}

impl Debug for Http3Transport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http3Transport")
            .field("base", &self.base)
            .field("server_addr", &self.server_addr)
            .field("request_uri", &self.request_uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::upstream::test_util::{info, query};

    #[tokio::test]
    async fn test_lifecycle_without_server() {
        let info = info("h3://127.0.0.1/dns-query", Duration::from_millis(100));
        let transport = Http3Transport::new(&info, info.dialer());
        assert_eq!(transport.request_uri, "https://127.0.0.1/dns-query");

        let err = transport.exchange(&query("h3.example.", 1)).await.unwrap_err();
        assert!(err.is_transport_closed());

        transport.start(StartStage::Start).unwrap();
        transport.close().await.unwrap();
        let err = transport.exchange(&query("h3.example.", 1)).await.unwrap_err();
        assert!(err.is_transport_closed());
    }
}
