/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! DNS over TLS
//!
//! Connections are kept in a small LIFO pool. A query takes one connection
//! out, uses it exclusively and puts it back only if the exchange succeeded;
//! a failed or cancelled exchange drops the connection. When the pooled
//! connection fails, the query is retried once on a freshly dialed one.

use crate::core::error::{DnsError, Result, StageExt};
use crate::network::transport::{read_message, write_message};
use crate::network::upstream::base::BaseTransport;
use crate::network::upstream::dialer::Dialer;
use crate::network::upstream::utils::connect_tls;
use crate::network::upstream::{DnsTransport, StartStage, TransportInfo, TransportType};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use hickory_proto::op::Message;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::select;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// Opens a ready-to-use stream (dialed and, for DoT, handshaken)
pub type StreamDialFn<S> = Box<dyn Fn() -> BoxFuture<'static, Result<S>> + Send + Sync>;

/// A pooled stream with its own query ID counter
pub struct PooledStream<S> {
    id: u32,
    stream: S,
    query_id: u16,
}

impl<S> PooledStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn exchange(&mut self, request: &Message) -> Result<Message> {
        self.query_id = self.query_id.wrapping_add(1);
        let wire_id = self.query_id;

        write_message(&mut self.stream, wire_id, request)
            .await
            .stage("write request")?;
        let mut response = read_message(&mut self.stream)
            .await
            .stage("read response")?;
        if response.id() != wire_id {
            return Err(DnsError::protocol(format!(
                "response ID {} does not match query ID {wire_id}",
                response.id()
            )));
        }
        response.set_id(request.id());
        Ok(response)
    }
}

/// LIFO pool of idle streams, one in-flight query per stream
pub struct StreamPool<S> {
    idle: Mutex<Vec<PooledStream<S>>>,
    max_idle: usize,
    dial: StreamDialFn<S>,
    next_id: AtomicU32,
}

impl<S> StreamPool<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(max_idle: usize, dial: StreamDialFn<S>) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle: max_idle.max(1),
            dial,
            next_id: AtomicU32::new(0),
        }
    }

    /// Exchange on a pooled stream, falling back to one fresh stream
    pub async fn exchange(&self, request: &Message) -> Result<Message> {
        if let Some(mut conn) = self.pop() {
            match conn.exchange(request).await {
                Ok(response) => {
                    self.push(conn);
                    return Ok(response);
                }
                Err(e) => {
                    debug!(conn_id = conn.id, err = %e, "Pooled stream failed, dialing a new one");
                }
            }
        }

        let stream = (self.dial)().await?;
        let mut conn = PooledStream {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            stream,
            query_id: 0,
        };
        let response = conn.exchange(request).await?;
        self.push(conn);
        Ok(response)
    }

    pub fn idle_len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every idle stream
    pub fn clear(&self) {
        let drained: Vec<_> = self.lock().drain(..).collect();
        debug!(count = drained.len(), "Dropping idle streams");
    }

    fn pop(&self) -> Option<PooledStream<S>> {
        self.lock().pop()
    }

    fn push(&self, conn: PooledStream<S>) {
        let mut idle = self.lock();
        if idle.len() < self.max_idle {
            idle.push(conn);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PooledStream<S>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct TlsTransport {
    base: BaseTransport,
    timeout: Duration,
    shutdown_timeout: Duration,
    pool: StreamPool<TlsStream<TcpStream>>,
}

impl TlsTransport {
    pub fn new(info: &TransportInfo, dialer: Arc<dyn Dialer>) -> Self {
        let dial: StreamDialFn<TlsStream<TcpStream>> = {
            let server_addr = info.server_addr;
            let server_name = info.server_name.clone();
            let insecure = info.insecure_skip_verify;
            Box::new(move || {
                let dialer = dialer.clone();
                let server_name = server_name.clone();
                async move {
                    let tcp = dialer
                        .dial_tcp(server_addr)
                        .await
                        .stage("dial TCP connection")?;
                    connect_tls(tcp, insecure, &server_name, &[])
                        .await
                        .stage("TLS handshake")
                }
                .boxed()
            })
        };

        Self {
            base: BaseTransport::new(&info.tag, TransportType::DoT),
            timeout: info.timeout,
            shutdown_timeout: info.shutdown_timeout,
            pool: StreamPool::new(info.tls_pool_size, dial),
        }
    }
}

#[async_trait]
impl DnsTransport for TlsTransport {
    fn tag(&self) -> &str {
        self.base.tag()
    }

    fn transport_type(&self) -> TransportType {
        TransportType::DoT
    }

    fn start(&self, stage: StartStage) -> Result<()> {
        if stage == StartStage::Start {
            self.base.set_started()?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let drained = self.base.shutdown(self.shutdown_timeout).await;
        self.pool.clear();
        drained
    }

    fn reset(&self) {
        self.pool.clear();
    }

    async fn exchange(&self, request: &Message) -> Result<Message> {
        let _lease = self.base.begin_query().ok_or(DnsError::TransportClosed)?;
        select! {
            res = timeout(self.timeout, self.pool.exchange(request)) => {
                res.map_err(|_| DnsError::Timeout("DoT query"))?
            }
            _ = self.base.close_context().fired() => Err(DnsError::TransportClosed),
        }
    }
}

impl Debug for TlsTransport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("base", &self.base)
            .field("idle", &self.pool.idle_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::upstream::test_util::{answer, first_a, query, tcp_server};
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    fn tcp_pool(addr: SocketAddr, max_idle: usize) -> StreamPool<TcpStream> {
        StreamPool::new(
            max_idle,
            Box::new(move || {
                async move { TcpStream::connect(addr).await.map_err(DnsError::from) }.boxed()
            }),
        )
    }

    #[tokio::test]
    async fn test_sequential_queries_reuse_one_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted =
            tcp_server(listener, |req| Some(answer(req, Ipv4Addr::new(7, 7, 7, 7)))).await;
        let pool = tcp_pool(addr, 8);

        for id in 100..105 {
            let response = pool.exchange(&query("dot.example.", id)).await.unwrap();
            assert_eq!(response.id(), id);
            assert_eq!(first_a(&response), Some(Ipv4Addr::new(7, 7, 7, 7)));
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn test_dead_pooled_stream_is_replaced() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // every connection answers once, then hangs up on the next query
        let served = Arc::new(AtomicUsize::new(0));
        let accepted = {
            let served = served.clone();
            tcp_server(listener, move |req| {
                served.fetch_add(1, Ordering::SeqCst);
                // wire IDs restart at 1 on every stream
                (req.id() == 1).then(|| answer(req, Ipv4Addr::new(1, 1, 1, 1)))
            })
            .await
        };
        let pool = tcp_pool(addr, 8);

        pool.exchange(&query("a.example.", 1)).await.unwrap();
        let response = pool.exchange(&query("b.example.", 2)).await.unwrap();
        assert_eq!(response.id(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(served.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fresh_stream_is_not_pooled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tcp_server(listener, |_| None).await;
        let pool = tcp_pool(addr, 8);

        assert!(pool.exchange(&query("a.example.", 1)).await.is_err());
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_exchange_drops_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // answers the first query of a connection, then reads and stays silent
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(first) = read_message(&mut stream).await else {
                        return;
                    };
                    let reply = answer(&first, Ipv4Addr::new(1, 1, 1, 1));
                    if write_message(&mut stream, reply.id(), &reply).await.is_err() {
                        return;
                    }
                    let _ = read_message(&mut stream).await;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        let pool = tcp_pool(addr, 8);
        pool.exchange(&query("warm.example.", 1)).await.unwrap();
        assert_eq!(pool.idle_len(), 1);

        let res = timeout(
            Duration::from_millis(50),
            pool.exchange(&query("x.example.", 2)),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(pool.idle_len(), 0);
    }

    #[tokio::test]
    async fn test_idle_streams_are_capped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tcp_server(listener, |req| Some(answer(req, Ipv4Addr::new(1, 1, 1, 1)))).await;
        let pool = Arc::new(tcp_pool(addr, 2));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.exchange(&query("c.example.", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(pool.idle_len() <= 2);

        pool.clear();
        assert_eq!(pool.idle_len(), 0);
    }
}
