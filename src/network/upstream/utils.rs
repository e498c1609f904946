/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Helpers shared by the encrypted transports
//!
//! - TLS session establishment over a dialed TCP stream
//! - QUIC connection setup over a dialed UDP socket
//! - DoH request construction and response buffering

use crate::core::error::{DnsError, Result};
use crate::network::tls_config::client_config;
use bytes::BytesMut;
use http::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Version};
use quinn::crypto::rustls::QuicClientConfig;
use quinn::{ClientConfig, Endpoint, EndpointConfig, TokioRuntime};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

/// Media type of a DNS wire-format message (RFC 8484 Section 6)
pub const DNS_MESSAGE_MIME: HeaderValue = HeaderValue::from_static("application/dns-message");

/// Default request path for DoH servers
pub const DEFAULT_DOH_PATH: &str = "/dns-query";

/// Upgrade a dialed TCP stream to TLS
pub(crate) async fn connect_tls(
    tcp_stream: TcpStream,
    skip_cert: bool,
    server_name: &str,
    alpn: &[&[u8]],
) -> Result<TlsStream<TcpStream>> {
    let connector = TlsConnector::from(Arc::new(client_config(skip_cert, alpn)));
    let dns_name = ServerName::try_from(server_name.to_string())
        .map_err(|_| DnsError::protocol(format!("invalid TLS server name '{server_name}'")))?;

    Ok(connector.connect(dns_name, tcp_stream).await?)
}

/// Establish a QUIC connection over a dialed (connected) UDP socket
pub(crate) async fn connect_quic(
    udp_socket: UdpSocket,
    skip_cert: bool,
    server_name: &str,
    alpn: &[&[u8]],
) -> Result<quinn::Connection> {
    let remote_addr = udp_socket.peer_addr()?;
    let mut endpoint = Endpoint::new(
        EndpointConfig::default(),
        None,
        udp_socket.into_std()?,
        Arc::new(TokioRuntime),
    )?;

    let crypto = QuicClientConfig::try_from(client_config(skip_cert, alpn))?;
    endpoint.set_default_client_config(ClientConfig::new(Arc::new(crypto)));

    Ok(endpoint.connect(remote_addr, server_name)?.await?)
}

/// Head of a DoH POST request for a `body_len` byte message (RFC 8484 Section 4.1)
pub fn build_dns_post_request(
    uri: &str,
    headers: &HeaderMap,
    body_len: usize,
    version: Version,
) -> Result<Request<()>> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .version(version);

    if let Some(map) = builder.headers_mut() {
        map.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        map.insert(CONTENT_TYPE, DNS_MESSAGE_MIME);
        map.insert(ACCEPT, DNS_MESSAGE_MIME);
        map.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    }

    builder
        .body(())
        .map_err(|e| DnsError::http(format!("failed to build request: {e}")))
}

/// Pre-size the response buffer from Content-Length
#[inline]
pub fn get_buf_from_res<T>(response: &Response<T>) -> BytesMut {
    let capacity = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(4096)
        .min(u16::MAX as usize);

    BytesMut::with_capacity(capacity)
}

/// Fail unless the server answered 200 OK; `body` is quoted in the error
pub fn check_status(status: http::StatusCode, body: &[u8]) -> Result<()> {
    if status != http::StatusCode::OK {
        return Err(DnsError::http(format!(
            "unexpected status {status}: {}",
            String::from_utf8_lossy(body)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderName;

    #[test]
    fn test_build_dns_post_request() {
        let mut extra = HeaderMap::new();
        extra.insert(
            HeaderName::from_static("x-client"),
            HeaderValue::from_static("forgedns"),
        );
        // the DoH content type always wins over a configured one
        extra.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let request = build_dns_post_request(
            "https://dns.example/dns-query",
            &extra,
            33,
            Version::HTTP_2,
        )
        .unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri().path(), "/dns-query");
        assert_eq!(request.version(), Version::HTTP_2);
        assert_eq!(request.headers()[CONTENT_TYPE], "application/dns-message");
        assert_eq!(request.headers()[ACCEPT], "application/dns-message");
        assert_eq!(request.headers()[CONTENT_LENGTH], "33");
        assert_eq!(request.headers()["x-client"], "forgedns");
    }

    #[test]
    fn test_check_status() {
        assert!(check_status(http::StatusCode::OK, b"").is_ok());
        let err = check_status(http::StatusCode::BAD_REQUEST, b"bad dns").unwrap_err();
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("bad dns"));
    }

    #[test]
    fn test_get_buf_from_res() {
        let response = Response::builder()
            .header(CONTENT_LENGTH, "120")
            .body(())
            .unwrap();
        assert!(get_buf_from_res(&response).capacity() >= 120);
    }
}
