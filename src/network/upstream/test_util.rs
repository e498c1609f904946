/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Loopback DNS servers and message builders for transport tests

use crate::config::types::TransportConfig;
use crate::network::transport::{read_message, write_message};
use crate::network::upstream::TransportInfo;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

pub fn query(name: &str, id: u16) -> Message {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_recursion_desired(true);
    msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
    msg
}

/// Response echoing the question with a single A record
pub fn answer(request: &Message, ip: Ipv4Addr) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.add_queries(request.queries().to_vec());
    if let Some(q) = request.queries().first() {
        msg.add_answer(Record::from_rdata(q.name().clone(), 60, RData::A(A::from(ip))));
    }
    msg
}

pub fn first_a(msg: &Message) -> Option<Ipv4Addr> {
    msg.answers().iter().find_map(|r| match r.data() {
        RData::A(a) => Some(a.0),
        _ => None,
    })
}

pub fn info(addr: &str, timeout: Duration) -> TransportInfo {
    let mut config = TransportConfig::with_addr("test", addr);
    config.timeout = Some(timeout);
    config.shutdown_timeout = Some(Duration::from_secs(1));
    TransportInfo::try_from(&config).unwrap()
}

/// UDP server answering each query with whatever `handler` returns
pub async fn udp_server<F>(handler: F) -> SocketAddr
where
    F: Fn(&Message) -> Vec<Message> + Send + 'static,
{
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65535];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(request) = Message::from_vec(&buf[..len]) else {
                continue;
            };
            for reply in handler(&request) {
                let _ = socket.send_to(&reply.to_vec().unwrap(), from).await;
            }
        }
    });
    addr
}

/// Framed TCP server, one handler call per query; returns accepted-connection count
pub async fn tcp_server<F>(listener: TcpListener, handler: F) -> Arc<AtomicUsize>
where
    F: Fn(&Message) -> Option<Message> + Send + Sync + 'static,
{
    let accepted = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);
    let counter = accepted.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Ok(request) = read_message(&mut stream).await {
                    // None closes the connection without answering
                    let Some(reply) = handler(&request) else {
                        return;
                    };
                    if write_message(&mut stream, reply.id(), &reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    accepted
}
