/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! ForgeDNS upstream transports
//!
//! Client side of the DNS forwarding path: one [`DnsTransport`] per upstream
//! server, speaking UDP, TCP, DNS over TLS, DNS over QUIC or DNS over HTTPS
//! (HTTP/2 and HTTP/3), with shared-connection reuse and graceful shutdown.
//!
//! [`DnsTransport`]: network::upstream::DnsTransport

pub mod config;
pub mod core;
pub mod network;
