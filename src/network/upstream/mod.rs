/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Upstream DNS transports
//!
//! One transport per configured upstream server, all behind [`DnsTransport`]:
//! - **UDP**: one shared connected socket, queries correlated by rewritten ID,
//!   truncated answers retried over a fresh TCP connection
//! - **TCP**: a fresh connection per query
//! - **DoT**: pooled TLS connections, one query at a time per connection
//! - **DoQ**: one shared QUIC connection, one stream per query
//! - **DoH**: one shared HTTP/2 (or HTTP/3) session, POST per query
//!
//! Every transport shares the lifecycle in [`base`]: queries are only admitted
//! while started, and `close` drains in-flight queries before returning.

use crate::config::types::{ConfigError, TransportConfig};
use crate::core::error::{DnsError, Result};
use crate::network::upstream::dialer::{Dialer, SocketDialer};
use crate::network::upstream::https::HttpsTransport;
use crate::network::upstream::http3::Http3Transport;
use crate::network::upstream::quic::QuicTransport;
use crate::network::upstream::tcp::TcpTransport;
use crate::network::upstream::tls::TlsTransport;
use crate::network::upstream::udp::UdpTransport;
use crate::network::upstream::utils::DEFAULT_DOH_PATH;
use async_trait::async_trait;
use hickory_proto::op::Message;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::{Host, Url};

pub mod base;
pub mod connector;
pub mod dialer;
pub mod https;
pub mod http3;
pub mod manager;
pub mod quic;
pub mod tcp;
pub mod tls;
pub mod udp;
#[cfg(test)]
mod test_util;
mod utils;

/// Supported upstream transport types
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportType {
    UDP,
    TCP,
    DoT,
    DoQ,
    DoH,
    DoH3,
}

impl TransportType {
    /// Returns the default port for each transport type
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::UDP | TransportType::TCP => 53,
            TransportType::DoT | TransportType::DoQ => 853,
            TransportType::DoH | TransportType::DoH3 => 443,
        }
    }

    fn from_scheme(scheme: &str, enable_http3: bool) -> Option<Self> {
        match scheme {
            "udp" => Some(TransportType::UDP),
            "tcp" => Some(TransportType::TCP),
            "tls" => Some(TransportType::DoT),
            "quic" | "doq" => Some(TransportType::DoQ),
            "https" | "doh" if enable_http3 => Some(TransportType::DoH3),
            "https" | "doh" => Some(TransportType::DoH),
            "h3" => Some(TransportType::DoH3),
            _ => None,
        }
    }

    fn is_http(&self) -> bool {
        matches!(self, TransportType::DoH | TransportType::DoH3)
    }
}

impl Display for TransportType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportType::UDP => "udp",
            TransportType::TCP => "tcp",
            TransportType::DoT => "tls",
            TransportType::DoQ => "quic",
            TransportType::DoH => "https",
            TransportType::DoH3 => "h3",
        };
        f.write_str(name)
    }
}

/// Startup phase a transport is being driven through
///
/// Transports only act on [`StartStage::Start`]; the other stages exist so a
/// host can drive every component through the same sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartStage {
    Initialize,
    Start,
    PostStart,
    Started,
}

impl StartStage {
    pub const ALL: [StartStage; 4] = [
        StartStage::Initialize,
        StartStage::Start,
        StartStage::PostStart,
        StartStage::Started,
    ];
}

/// Client transport to one upstream DNS server
#[async_trait]
pub trait DnsTransport: Send + Sync + Debug {
    fn tag(&self) -> &str;

    fn transport_type(&self) -> TransportType;

    /// Advance through a startup stage; queries are accepted after `Start`
    fn start(&self, stage: StartStage) -> Result<()>;

    /// Stop accepting queries, drain in-flight ones and release connections
    async fn close(&self) -> Result<()>;

    /// Drop shared connections so the next query dials fresh ones
    fn reset(&self);

    /// Send one query and wait for its answer
    ///
    /// The answer carries the request's transaction ID. Errors classify as
    /// transport closed (see [`DnsError::is_transport_closed`]), connection
    /// reset, or a protocol specific failure.
    async fn exchange(&self, request: &Message) -> Result<Message>;
}

/// Parsed and validated configuration of one transport
///
/// Created from [`TransportConfig`] via `TryFrom`, consumed by the transport
/// constructors.
#[derive(Debug, Clone)]
pub struct TransportInfo {
    tag: String,

    /// Protocol (detected from the URL scheme)
    transport_type: TransportType,

    /// Original address string from configuration (for logging)
    raw_addr: String,

    /// Address actually dialed
    server_addr: SocketAddr,

    /// Server hostname for TLS SNI and certificate validation
    server_name: String,

    /// DoH request path, empty for other protocols
    path: String,

    /// Full DoH request URI
    request_uri: String,

    timeout: Duration,
    shutdown_timeout: Duration,

    /// Skip TLS certificate verification (**INSECURE** - testing only)
    insecure_skip_verify: bool,

    /// Extra DoH request headers
    headers: HeaderMap,

    udp_size: usize,
    tls_pool_size: usize,

    so_mark: Option<u32>,
    bind_to_device: Option<String>,
}

impl TransportInfo {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_UDP_SIZE: usize = 2048;
    pub const DEFAULT_TLS_POOL_SIZE: usize = 8;

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn transport_type(&self) -> TransportType {
        self.transport_type
    }

    pub fn raw_addr(&self) -> &str {
        &self.raw_addr
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_uri(&self) -> &str {
        &self.request_uri
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dialer carrying this transport's socket options
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(SocketDialer::new(self.so_mark, self.bind_to_device.clone()))
    }
}

impl TryFrom<&TransportConfig> for TransportInfo {
    type Error = ConfigError;

    fn try_from(config: &TransportConfig) -> std::result::Result<Self, Self::Error> {
        let invalid = |reason: String| ConfigError::InvalidAddress {
            tag: config.tag.clone(),
            reason,
        };

        let (transport_type, host, url_port, url_path) =
            detect_transport_type(&config.addr, config.enable_http3.unwrap_or(false))
                .map_err(invalid)?;

        let port = config
            .port
            .or(url_port)
            .unwrap_or(transport_type.default_port());

        // Hosts of non-special schemes (udp://, tls://, ...) stay opaque text.
        let literal = match &host {
            Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Host::Domain(name) => name.parse::<IpAddr>().ok(),
        };
        let ip = config
            .dial_addr
            .or(literal)
            .ok_or_else(|| invalid(format!("host name '{host}' needs a dial_addr")))?;
        let host_name = match &host {
            Host::Domain(name) => name.clone(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };
        let server_name = config.server_name.clone().unwrap_or(host_name);

        let path = if !transport_type.is_http() {
            String::new()
        } else if url_path.is_empty() || url_path == "/" {
            DEFAULT_DOH_PATH.to_string()
        } else {
            url_path
        };
        let request_uri = if transport_type.is_http() {
            build_request_uri(&host, port, &path)
        } else {
            String::new()
        };

        let mut headers = HeaderMap::new();
        for (name, value) in config.headers.iter().flatten() {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| invalid(format!("bad header name '{name}': {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| invalid(format!("bad header value for '{name}': {e}")))?;
            headers.insert(name, value);
        }

        debug!(
            tag = %config.tag,
            kind = %transport_type,
            server = %SocketAddr::new(ip, port),
            server_name = %server_name,
            path = %path,
            "Parsed transport address"
        );

        Ok(TransportInfo {
            tag: config.tag.clone(),
            transport_type,
            raw_addr: config.addr.clone(),
            server_addr: SocketAddr::new(ip, port),
            server_name,
            path,
            request_uri,
            timeout: config.timeout.unwrap_or(Self::DEFAULT_TIMEOUT),
            shutdown_timeout: config
                .shutdown_timeout
                .unwrap_or(Self::DEFAULT_SHUTDOWN_TIMEOUT),
            insecure_skip_verify: config.insecure_skip_verify.unwrap_or(false),
            headers,
            udp_size: config
                .udp_size
                .map_or(Self::DEFAULT_UDP_SIZE, |size| size as usize),
            tls_pool_size: config
                .tls_pool_size
                .unwrap_or(Self::DEFAULT_TLS_POOL_SIZE)
                .max(1),
            so_mark: config.so_mark,
            bind_to_device: config.bind_to_device.clone(),
        })
    }
}

/// Detect the transport type from the config address
///
/// A bare address (no `//`) is treated as UDP.
fn detect_transport_type(
    addr: &str,
    enable_http3: bool,
) -> std::result::Result<(TransportType, Host, Option<u16>, String), String> {
    if !addr.contains("//") {
        return detect_transport_type(&format!("udp://{addr}"), enable_http3);
    }

    let url = Url::parse(addr).map_err(|e| format!("invalid URL '{addr}': {e}"))?;
    let transport_type = TransportType::from_scheme(url.scheme(), enable_http3)
        .ok_or_else(|| format!("unsupported scheme '{}'", url.scheme()))?;
    let host = url
        .host()
        .map(|h| h.to_owned())
        .ok_or_else(|| format!("no host in '{addr}'"))?;

    Ok((transport_type, host, url.port(), url.path().to_string()))
}

fn build_request_uri(host: &Host, port: u16, path: &str) -> String {
    if port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{port}{path}")
    }
}

/// Build the transport described by `info`
pub fn build_transport(info: &TransportInfo) -> Result<Arc<dyn DnsTransport>> {
    let dialer = info.dialer();
    let transport: Arc<dyn DnsTransport> = match info.transport_type {
        TransportType::UDP => Arc::new(UdpTransport::new(info, dialer)),
        TransportType::TCP => Arc::new(TcpTransport::new(info, dialer)),
        TransportType::DoT => Arc::new(TlsTransport::new(info, dialer)),
        TransportType::DoQ => Arc::new(QuicTransport::new(info, dialer)),
        TransportType::DoH => Arc::new(HttpsTransport::new(info, dialer)),
        TransportType::DoH3 => Arc::new(Http3Transport::new(info, dialer)),
    };
    Ok(transport)
}

/// Parse a config entry and build its transport
pub fn transport_from_config(config: &TransportConfig) -> Result<Arc<dyn DnsTransport>> {
    let info = TransportInfo::try_from(config).map_err(DnsError::from)?;
    build_transport(&info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(addr: &str) -> std::result::Result<TransportInfo, ConfigError> {
        TransportInfo::try_from(&TransportConfig::with_addr("test", addr))
    }

    #[test]
    fn test_detect_schemes_and_default_ports() {
        let cases = [
            ("8.8.8.8", TransportType::UDP, 53),
            ("udp://8.8.8.8", TransportType::UDP, 53),
            ("tcp://8.8.8.8:5353", TransportType::TCP, 5353),
            ("tls://1.1.1.1", TransportType::DoT, 853),
            ("quic://94.140.14.14", TransportType::DoQ, 853),
            ("doq://94.140.14.14:784", TransportType::DoQ, 784),
            ("https://1.1.1.1/dns-query", TransportType::DoH, 443),
            ("h3://1.1.1.1", TransportType::DoH3, 443),
        ];
        for (addr, kind, port) in cases {
            let info = info(addr).unwrap();
            assert_eq!(info.transport_type(), kind, "{addr}");
            assert_eq!(info.server_addr().port(), port, "{addr}");
        }
    }

    #[test]
    fn test_ipv6_literal() {
        let info = info("tcp://[2001:db8::1]:53").unwrap();
        assert_eq!(info.server_addr(), "[2001:db8::1]:53".parse().unwrap());
        assert_eq!(info.server_name(), "2001:db8::1");
    }

    #[test]
    fn test_doh_path_and_uri() {
        let info = info("https://1.1.1.1").unwrap();
        assert_eq!(info.path(), "/dns-query");
        assert_eq!(info.request_uri(), "https://1.1.1.1/dns-query");

        let info = self::info("https://1.1.1.1:8443/resolve").unwrap();
        assert_eq!(info.request_uri(), "https://1.1.1.1:8443/resolve");
    }

    #[test]
    fn test_host_name_with_dial_addr() {
        let mut config = TransportConfig::with_addr("cf", "https://cloudflare-dns.com/dns-query");
        assert!(TransportInfo::try_from(&config).is_err());

        config.dial_addr = Some("1.1.1.1".parse().unwrap());
        config.enable_http3 = Some(true);
        let info = TransportInfo::try_from(&config).unwrap();
        assert_eq!(info.transport_type(), TransportType::DoH3);
        assert_eq!(info.server_addr(), "1.1.1.1:443".parse().unwrap());
        assert_eq!(info.server_name(), "cloudflare-dns.com");
        assert_eq!(
            info.request_uri(),
            "https://cloudflare-dns.com/dns-query"
        );
    }

    #[test]
    fn test_rejects_bad_addresses() {
        assert!(info("ftp://1.1.1.1").is_err());
        assert!(info("tcp://").is_err());

        let mut config = TransportConfig::with_addr("h", "https://1.1.1.1");
        config.headers = Some([("bad header".to_string(), "x".to_string())].into());
        assert!(TransportInfo::try_from(&config).is_err());
    }

    #[test]
    fn test_defaults() {
        let info = info("udp://127.0.0.1").unwrap();
        assert_eq!(info.timeout(), TransportInfo::DEFAULT_TIMEOUT);
        assert_eq!(info.udp_size, TransportInfo::DEFAULT_UDP_SIZE);
        assert_eq!(info.tls_pool_size, TransportInfo::DEFAULT_TLS_POOL_SIZE);
        assert_eq!(info.shutdown_timeout, TransportInfo::DEFAULT_SHUTDOWN_TIMEOUT);
    }

    #[tokio::test]
    async fn test_build_transport_per_type() {
        for addr in [
            "udp://127.0.0.1",
            "tcp://127.0.0.1",
            "tls://127.0.0.1",
            "quic://127.0.0.1",
            "https://127.0.0.1",
            "h3://127.0.0.1",
        ] {
            let info = info(addr).unwrap();
            let transport = build_transport(&info).unwrap();
            assert_eq!(transport.transport_type(), info.transport_type());
            assert_eq!(transport.tag(), "test");
        }
    }
}
