/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over UDP
//!
//! All queries share one connected socket obtained from a [`Connector`]. Each
//! query is registered under a fresh 16-bit ID, sent with that ID on the wire,
//! and answered by a background reader that routes datagrams back by ID. The
//! caller's original ID is restored on the answer. Truncated answers are
//! retried once over a fresh TCP connection.

use crate::core::error::{DnsError, Result, StageExt};
use crate::network::transport::pack_message;
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::connector::{Connection, Connector, DialFn};
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::tcp;
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use futures::FutureExt;
use hickory_proto::op::Message;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::oneshot;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

type UdpConnection = Connection<UdpSocket>;

pub struct UdpTransport {
    base: BaseTransport,
    server_addr: SocketAddr,
    timeout: Duration,
    shutdown_timeout: Duration,
    dialer: Arc<dyn Dialer>,
    connector: Connector<Arc<UdpConnection>>,
    /// Receive buffer size, only ever grows
    udp_size: Arc<AtomicUsize>,
    queries: Arc<QueryRegistry>,
}

impl UdpTransport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        let base = BaseTransport::new(&info.tag, TransportType::UDP);
        let udp_size = Arc::new(AtomicUsize::new(info.udp_size));
        let queries = Arc::new(QueryRegistry::default());

        let dial: DialFn<Arc<UdpConnection>> = {
            let dialer = dialer.clone();
            let udp_size = udp_size.clone();
            let queries = queries.clone();
            let server_addr = info.server_addr;
            let tag = info.tag.clone();
            Box::new(move || {
                dial_connection(
                    dialer.clone(),
                    server_addr,
                    udp_size.clone(),
                    queries.clone(),
                    tag.clone(),
                )
                .boxed()
            })
        };
        let connector = Connector::for_connections(base.close_context().clone(), dial);

        Self {
            base,
            server_addr: info.server_addr,
            timeout: info.timeout,
            shutdown_timeout: info.shutdown_timeout,
            dialer,
            connector,
            udp_size,
            queries,
        }
    }

    /// Current receive buffer size
    pub fn udp_size(&self) -> usize {
        self.udp_size.load(Ordering::Acquire)
    }

    /// Raise the receive buffer to the request's advertised EDNS payload size
    fn grow_udp_size(&self, request: &Message) {
        let Some(edns) = request.extensions() else {
            return;
        };
        let size = edns.max_payload() as usize;
        let previous = self.udp_size.fetch_max(size, Ordering::AcqRel);
        if size > previous {
            debug!(
                tag = %self.base.tag(),
                previous,
                size,
                "Growing UDP buffer, redialing"
            );
            self.connector.reset();
        }
    }

    async fn exchange_udp(&self, request: &Message) -> Result<Message> {
        self.grow_udp_size(request);
        let conn = self.connector.get().await?;

        let mut pending = self.queries.register()?;
        let packet = pack_message(request, pending.id())?;
        if let Err(e) = conn.get_ref().send(&packet).await {
            let err = DnsError::from(e).stage("write request");
            conn.close_with_error(err.replicate());
            return Err(err);
        }

        select! {
            res = pending.response() => {
                let mut response = res?;
                response.set_id(request.id());
                Ok(response)
            }
            _ = conn.closed() => Err(conn.close_error().unwrap_or(DnsError::ConnectionReset)),
            _ = self.base.close_context().fired() => Err(DnsError::TransportClosed),
        }
    }
}

#[async_trait]
impl DnsTransport for UdpTransport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::UDP
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
        let deadline = Instant::now() + self.timeout;

        let response = timeout_at(deadline, self.exchange_udp(request))
            .await
            .map_err(|_| DnsError::Timeout("UDP query"))??;
        if !response.truncated() {
            return Ok(response);
        }

        debug!(
            tag = %self.base.tag(),
            id = request.id(),
            "Truncated UDP response, retrying over TCP"
        );
        timeout_at(
            deadline,
            tcp::exchange_once(
                self.dialer.as_ref(),
                self.server_addr,
                request,
                self.base.close_context(),
            ),
        )
        .await
        .map_err(|_| DnsError::Timeout("TCP fallback query"))?
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        // Stops the reader task of the current socket.
        self.connector.close();
    }
}

impl Debug for UdpTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpTransport")
            .field("base", &self.base)
            .field("server_addr", &self.server_addr)
            .field("udp_size", &self.udp_size())
            .finish()
    }
}

async fn dial_connection(
    dialer: Arc<dyn Dialer>,
    server_addr: SocketAddr,
    udp_size: Arc<AtomicUsize>,
    queries: Arc<QueryRegistry>,
    tag: String,
) -> Result<Arc<UdpConnection>> {
    let socket = dialer
        .dial_udp(server_addr)
        .await
        .stage("dial UDP connection")?;
    let conn = Arc::new(Connection::new(socket));
    debug!(tag = %tag, server = %server_addr, "UDP connection established");

    tokio::spawn(recv_loop(conn.clone(), queries, udp_size, tag));
    Ok(conn)
}

/// Route incoming datagrams to their registered queries until the connection closes
async fn recv_loop(
    conn: Arc<UdpConnection>,
    queries: Arc<QueryRegistry>,
    udp_size: Arc<AtomicUsize>,
    tag: String,
) {
    let mut buf = Vec::new();
    loop {
        let size = udp_size.load(Ordering::Acquire);
        if buf.len() < size {
            buf.resize(size, 0);
        }

        let received = select! {
            _ = conn.closed() => break,
            res = conn.get_ref().recv(&mut buf) => res,
        };
        let len = match received {
            Ok(len) => len,
            Err(e) => {
                warn!(tag = %tag, err = %e, "UDP read failed, closing connection");
                conn.close_with_error(DnsError::from(e).stage("read response"));
                break;
            }
        };

        let response = match Message::from_vec(&buf[..len]) {
            Ok(response) => response,
            Err(e) => {
                debug!(tag = %tag, len, err = %e, "Discarding malformed UDP response");
                continue;
            }
        };

        let id = response.id();
        match queries.lookup(id) {
            Some(callback) => {
                if !callback.answer(response) {
                    debug!(tag = %tag, id, "Discarding duplicate UDP response");
                }
            }
            None => debug!(tag = %tag, id, "UDP response for unknown query"),
        }
    }
    debug!(tag = %tag, "UDP reader stopped");
}

/// Response slot of one registered query, filled at most once
pub struct UdpCallback {
    sender: Mutex<Option<oneshot::Sender<Message>>>,
}

impl UdpCallback {
    fn new(sender: oneshot::Sender<Message>) -> Self {
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver `response`; returns `false` if the query was already answered
    pub fn answer(&self, response: Message) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(sender) => {
                // The waiter may have given up already; the slot is spent either way.
                let _ = sender.send(response);
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    callbacks: HashMap<u16, Arc<UdpCallback>>,
    last_id: u16,
}

impl RegistryState {
    /// Scan forward from the last handed-out ID, wrapping at 65535
    fn next_available_query_id(&mut self) -> Result<u16> {
        let mut id = self.last_id;
        for _ in 0..=u16::MAX {
            id = id.wrapping_add(1);
            if !self.callbacks.contains_key(&id) {
                self.last_id = id;
                return Ok(id);
            }
        }
        Err(DnsError::NoAvailableQueryId)
    }
}

/// In-flight queries of one UDP transport keyed by wire ID
#[derive(Default)]
pub struct QueryRegistry {
    state: RwLock<RegistryState>,
}

impl QueryRegistry {
    /// Reserve an unused ID and its response slot
    pub fn register(self: &Arc<Self>) -> Result<PendingQuery> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let id = state.next_available_query_id()?;
            state.callbacks.insert(id, Arc::new(UdpCallback::new(tx)));
            id
        };
        Ok(PendingQuery {
            id,
            rx,
            registry: self.clone(),
        })
    }

    fn lookup(&self, id: u16) -> Option<Arc<UdpCallback>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .get(&id)
            .cloned()
    }

    fn remove(&self, id: u16) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .remove(&id);
    }

    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .callbacks
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A registered query; unregisters itself when dropped
pub struct PendingQuery {
    id: u16,
    rx: oneshot::Receiver<Message>,
    registry: Arc<QueryRegistry>,
}

impl PendingQuery {
    pub fn id(&self) -> u16 {
        self.id
    }

    pub async fn response(&mut self) -> Result<Message> {
        (&mut self.rx)
            .await
            .map_err(|_| DnsError::protocol("UDP query slot dropped"))
    }
}

impl Drop for PendingQuery {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::read_message;
    use crate::network::transport::write_message;
    use crate::network::upstream::test_util::{answer, first_a, info, query, udp_server};
    use hickory_proto::op::Edns;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    fn transport(addr: SocketAddr, timeout: Duration) -> Arc<UdpTransport> {
        let info = info(&format!("udp://{addr}"), timeout);
        let transport = Arc::new(UdpTransport::new(&info, info.dialer()));
        transport.start(StartStage::Start).unwrap();
        transport
    }

    #[tokio::test]
    async fn test_exchange_restores_caller_id() {
        let addr = udp_server(|req| vec![answer(req, Ipv4Addr::new(1, 2, 3, 4))]).await;
        let transport = transport(addr, Duration::from_secs(2));

        let response = transport.exchange(&query("example.com.", 4242)).await.unwrap();
        assert_eq!(response.id(), 4242);
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert!(transport.queries.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_queries_are_correlated() {
        let addr = udp_server(|req| vec![answer(req, Ipv4Addr::new(10, 0, 0, 1))]).await;
        let transport = transport(addr, Duration::from_secs(2));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let transport = transport.clone();
                tokio::spawn(async move {
                    let name = format!("q{i}.example.");
                    // every caller uses the same ID
                    let response = transport.exchange(&query(&name, 7)).await.unwrap();
                    assert_eq!(response.id(), 7);
                    assert_eq!(response.queries()[0].name().to_string(), name);
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_duplicate_response_ignored() {
        let addr = udp_server(|req| {
            vec![
                answer(req, Ipv4Addr::new(1, 1, 1, 1)),
                answer(req, Ipv4Addr::new(2, 2, 2, 2)),
            ]
        })
        .await;
        let transport = transport(addr, Duration::from_secs(2));

        let first = transport.exchange(&query("a.example.", 1)).await.unwrap();
        assert_eq!(first_a(&first), Some(Ipv4Addr::new(1, 1, 1, 1)));

        let second = transport.exchange(&query("b.example.", 2)).await.unwrap();
        assert_eq!(second.queries()[0].name().to_string(), "b.example.");
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_datagrams_are_skipped() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..len]).unwrap();

            server.send_to(&[0xde, 0xad, 0xbe], from).await.unwrap();
            let mut stray = answer(&request, Ipv4Addr::new(6, 6, 6, 6));
            stray.set_id(request.id().wrapping_add(100));
            server.send_to(&stray.to_vec().unwrap(), from).await.unwrap();
            let reply = answer(&request, Ipv4Addr::new(1, 2, 3, 4));
            server.send_to(&reply.to_vec().unwrap(), from).await.unwrap();
        });
        let transport = transport(addr, Duration::from_secs(2));

        let response = transport.exchange(&query("noisy.example.", 55)).await.unwrap();
        assert_eq!(response.id(), 55);
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[tokio::test]
    async fn test_socket_error_fails_every_waiting_query() {
        // nothing listens on this port once the socket is dropped
        let addr = UdpSocket::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let transport = transport(addr, Duration::from_secs(2));

        let (qa, qb) = (query("a.example.", 1), query("b.example.", 2));
        let started = Instant::now();
        let (a, b) = tokio::join!(transport.exchange(&qa), transport.exchange(&qb));
        assert!(started.elapsed() < Duration::from_secs(1));
        for err in [a.unwrap_err(), b.unwrap_err()] {
            assert!(!err.is_timeout());
            assert!(err.to_string().contains("refused"), "{err}");
        }
    }

    #[tokio::test]
    async fn test_truncated_response_retries_over_tcp() {
        let addr = udp_server(|req| {
            let mut truncated = answer(req, Ipv4Addr::new(9, 9, 9, 9));
            truncated.set_truncated(true);
            vec![truncated]
        })
        .await;
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_message(&mut stream).await.unwrap();
            let reply = answer(&request, Ipv4Addr::new(8, 8, 8, 8));
            write_message(&mut stream, reply.id(), &reply).await.unwrap();
        });

        let transport = transport(addr, Duration::from_secs(2));
        let response = transport.exchange(&query("big.example.", 99)).await.unwrap();
        assert!(!response.truncated());
        assert_eq!(response.id(), 99);
        assert_eq!(first_a(&response), Some(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[tokio::test]
    async fn test_timeout_unregisters_query() {
        let addr = udp_server(|_| Vec::new()).await;
        let transport = transport(addr, Duration::from_millis(100));

        let err = transport.exchange(&query("slow.example.", 5)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(transport.queries.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_queries_outside_started_state() {
        let addr = udp_server(|_| Vec::new()).await;
        let info = info(&format!("udp://{addr}"), Duration::from_secs(1));
        let transport = UdpTransport::new(&info, info.dialer());

        let err = transport.exchange(&query("a.example.", 1)).await.unwrap_err();
        assert!(err.is_transport_closed());

        transport.start(StartStage::Start).unwrap();
        transport.close().await.unwrap();
        let err = transport.exchange(&query("a.example.", 1)).await.unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_query() {
        let addr = udp_server(|_| Vec::new()).await;
        let transport = transport(addr, Duration::from_secs(10));

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.exchange(&query("a.example.", 1)).await })
        };
        sleep(Duration::from_millis(50)).await;

        transport.close().await.unwrap();
        let err = pending.await.unwrap().unwrap_err();
        assert!(err.is_transport_closed());
    }

    #[tokio::test]
    async fn test_edns_payload_grows_buffer() {
        let addr = udp_server(|req| vec![answer(req, Ipv4Addr::new(1, 2, 3, 4))]).await;
        let transport = transport(addr, Duration::from_secs(2));
        assert_eq!(transport.udp_size(), TransportInfo::DEFAULT_UDP_SIZE);

        let mut request = query("edns.example.", 3);
        let mut edns = Edns::new();
        edns.set_max_payload(4096);
        request.set_edns(edns);

        transport.exchange(&request).await.unwrap();
        assert_eq!(transport.udp_size(), 4096);

        // a smaller advertisement never shrinks it
        let mut request = query("edns.example.", 4);
        let mut edns = Edns::new();
        edns.set_max_payload(1232);
        request.set_edns(edns);
        transport.exchange(&request).await.unwrap();
        assert_eq!(transport.udp_size(), 4096);
    }

    #[test]
    fn test_query_ids_exhaust_and_recover() {
        let registry = Arc::new(QueryRegistry::default());
        let mut pending: Vec<_> = (0..=u16::MAX as usize)
            .map(|_| registry.register().unwrap())
            .collect();
        assert_eq!(registry.len(), 65536);
        assert!(matches!(
            registry.register(),
            Err(DnsError::NoAvailableQueryId)
        ));

        let released = pending.swap_remove(100);
        let freed = released.id();
        drop(released);
        assert_eq!(registry.register().unwrap().id(), freed);
    }

    #[test]
    fn test_ids_advance_past_last_used() {
        let registry = Arc::new(QueryRegistry::default());
        let first = registry.register().unwrap();
        let second = registry.register().unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 2);
        drop(first);
        // the freed ID is not reused until the counter wraps
        assert_eq!(registry.register().unwrap().id(), 3);
    }

    #[tokio::test]
    async fn test_callback_answers_at_most_once() {
        let registry = Arc::new(QueryRegistry::default());
        let mut pending = registry.register().unwrap();
        let callback = registry.lookup(pending.id()).unwrap();

        assert!(callback.answer(query("one.example.", 1)));
        assert!(!callback.answer(query("two.example.", 2)));

        let response = pending.response().await.unwrap();
        assert_eq!(response.queries()[0].name().to_string(), "one.example.");
    }
}
