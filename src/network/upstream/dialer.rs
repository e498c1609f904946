/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Outbound socket creation
//!
//! Transports never open sockets themselves; they go through a [`Dialer`] so
//! routing options (SO_MARK, SO_BINDTODEVICE) are applied in one place and
//! tests can substitute their own.

use crate::core::error::{Result, StageExt};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt::Debug;
use std::net::SocketAddr;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

#[async_trait]
pub trait Dialer: Send + Sync + Debug {
    /// Open a TCP connection to `addr`
    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream>;

    /// Open a UDP socket connected to `addr`
    async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket>;
}

/// Dialer backed by plain OS sockets
#[derive(Debug, Clone, Default)]
pub struct SocketDialer {
    /// Linux SO_MARK socket option (for policy routing)
    so_mark: Option<u32>,
    /// Linux SO_BINDTODEVICE option (bind to specific interface)
    bind_to_device: Option<String>,
}

impl SocketDialer {
    pub fn new(so_mark: Option<u32>, bind_to_device: Option<String>) -> Self {
        Self {
            so_mark,
            bind_to_device,
        }
    }

    fn socket(&self, addr: SocketAddr, ty: Type, protocol: Protocol) -> Result<Socket> {
        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
        socket.set_nonblocking(true)?;

        #[cfg(target_os = "linux")]
        if let Some(so_mark) = self.so_mark {
            socket.set_mark(so_mark)?;
        }

        #[cfg(target_os = "linux")]
        if let Some(device) = &self.bind_to_device {
            socket.bind_device(Some(device.as_bytes()))?;
        }

        Ok(socket)
    }
}

#[async_trait]
impl Dialer for SocketDialer {
    async fn dial_tcp(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = self
            .socket(addr, Type::STREAM, Protocol::TCP)
            .stage("create TCP socket")?;
        socket.set_nodelay(true)?;

        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = socket.connect(addr).await.stage("connect TCP")?;
        Ok(stream)
    }

    async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        let socket = self
            .socket(addr, Type::DGRAM, Protocol::UDP)
            .stage("create UDP socket")?;
        // Fixes the peer so `send`/`recv` only talk to the server.
        socket.connect(&addr.into()).stage("connect UDP")?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}
