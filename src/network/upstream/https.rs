/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over HTTPS (RFC 8484) on HTTP/2
//!
//! One HTTP/2 session is shared through a [`Connector`] and every query is a
//! POST of the wire message with ID 0. A query that times out resets the
//! session, unless another query already reset it after this one started.

use crate::core::error::{DnsError, Result, StageExt};
use crate::core::signal::Signal;
use crate::network::tls_config::ALPN_H2;
use crate::network::transport::pack_message;
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::connector::{Connector, ConnectorCallbacks, DialFn};
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::utils::{
    build_dns_post_request, check_status, connect_tls, get_buf_from_res,
};
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use bytes::{BufMut, Bytes};
use futures::FutureExt;
use h2::client::SendRequest;
use hickory_proto::op::Message;
use http::{HeaderMap, Version};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

/// Shared HTTP/2 session
#[derive(Clone)]
pub(crate) struct H2Session {
    id: u32,
    sender: SendRequest<Bytes>,
    closed: Signal,
}

/// Reset-on-timeout bookkeeping shared by DoH transports
///
/// Only the first timed-out query of a generation resets the session;
/// queries that started before the latest reset leave the new session alone.
#[derive(Debug, Default)]
pub(crate) struct ResetTracker {
    last_reset: Mutex<Option<Instant>>,
}

impl ResetTracker {
    /// Returns `true` if the caller should reset the session now
    pub(crate) fn should_reset(&self, started: Instant) -> bool {
        let mut last = self.last_reset.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_some_and(|at| at >= started) {
            return false;
        }
        *last = Some(Instant::now());
        true
    }
}

pub struct HttpsTransport {
    base: BaseTransport,
    server_addr: SocketAddr,
    request_uri: String,
    headers: HeaderMap,
    timeout: Duration,
    shutdown_timeout: Duration,
    connector: Connector<H2Session>,
    resets: ResetTracker,
}

impl HttpsTransport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        let base = BaseTransport::new(&info.tag, TransportType::DoH);
        let next_id = Arc::new(AtomicU32::new(0));
        let dial: DialFn<H2Session> = {
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
                is_closed: Box::new(|session: &H2Session| session.closed.is_fired()),
                close: Box::new(|session: &H2Session| {
                    session.closed.fire();
                }),
                reset: Box::new(|session: &H2Session| {
                    session.closed.fire();
                }),
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

    async fn exchange_https(&self, request: &Message) -> Result<Message> {
        let session = self.connector.get().await?;
        let body = pack_message(request, 0)?;
        let http_request =
            build_dns_post_request(&self.request_uri, &self.headers, body.len(), Version::HTTP_2)?;

        let mut sender = session
            .sender
            .clone()
            .ready()
            .await
            .stage("open stream")?;
        let (response_future, mut send_stream) = sender
            .send_request(http_request, false)
            .stage("send request")?;
        send_stream
            .send_data(Bytes::from(body), true)
            .stage("send request body")?;

        let response = response_future.await.stage("read response")?;
        let status = response.status();
        let mut buf = get_buf_from_res(&response);
        let mut body = response.into_body();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.stage("read response body")?;
            let _ = body.flow_control().release_capacity(chunk.len());
            buf.put(chunk);
        }
        check_status(status, &buf)?;

        let mut response = Message::from_vec(&buf)?;
        response.set_id(request.id());
        debug!(session = session.id, id = request.id(), "Received DoH response");
        Ok(response)
    }
}

async fn dial_session(
    dialer: Arc<dyn Dialer>,
    server_addr: SocketAddr,
    server_name: String,
    insecure: bool,
    id: u32,
) -> Result<H2Session> {
    let tcp = dialer
        .dial_tcp(server_addr)
        .await
        .stage("dial TCP connection")?;
    let tls = connect_tls(tcp, insecure, &server_name, &[ALPN_H2])
        .await
        .stage("TLS handshake")?;
    let (sender, connection) = h2::client::Builder::new()
        .handshake(tls)
        .await
        .stage("HTTP/2 handshake")?;

    let session = H2Session {
        id,
        sender,
        closed: Signal::new(),
    };
    let closed = session.closed.clone();
    tokio::spawn(async move {
        select! {
            res = connection => {
                if let Err(e) = res {
                    debug!(session = id, err = %e, "HTTP/2 session failed");
                }
                closed.fire();
            }
            _ = closed.fired() => {
                debug!(session = id, "HTTP/2 session closed");
            }
        }
    });

    debug!(session = id, server = %server_addr, "HTTP/2 session established");
    Ok(session)
}

#[async_trait]
impl DnsTransport for HttpsTransport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::DoH
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
            res = timeout(self.timeout, self.exchange_https(request)) => match res {
                Ok(res) => res,
                Err(_) => {
                    if self.resets.should_reset(started) {
                        warn!(tag = %self.base.tag(), "DoH query timed out, resetting session");
                        self.connector.reset();
                    }
                    Err(DnsError::Timeout("DoH query"))
                }
            },
            _ = self.base.close_context().fired() => Err(DnsError::TransportClosed),
        }
    }
}

impl Drop for HttpsTransport {
    fn drop(&mut self) {
        self.connector.close();
    }
}

impl Debug for HttpsTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsTransport")
            .field("base", &self.base)
            .field("server_addr", &self.server_addr)
            .field("request_uri", &self.request_uri)
            .finish()
    }
}
