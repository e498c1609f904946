/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Unified error handling for the transport layer
//!
//! Every exchange path returns [`DnsError`]. The outer router only needs to tell
//! three families apart: "transport closed", "connection reset" and everything
//! else (backend-specific I/O), so the first two have dedicated variants and
//! predicates that look through stage labels.

use crate::config::types::ConfigError;
use quinn::crypto::rustls::NoInitialCipherSuite;
use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};
use thiserror::Error;

/// Main error type for the transport layer
#[derive(Debug, Error)]
pub enum DnsError {
    /// The transport (or its connector) has been shut down
    #[error("transport closed")]
    TransportClosed,

    /// The shared connection was dropped on purpose so the next query redials
    #[error("connection reset")]
    ConnectionReset,

    /// A connection died earlier; carries the captured close reason
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Every 16-bit query ID is currently in flight
    #[error("no available query ID")]
    NoAvailableQueryId,

    /// Query deadline elapsed
    #[error("{0} timeout")]
    Timeout(&'static str),

    /// Stream frame declared a length below the DNS header size
    #[error("short read: frame length {0} is below the DNS header size")]
    ShortRead(usize),

    /// An error wrapped with the stage it happened in
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<DnsError>,
    },

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing or serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tokio runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// DNS protocol error
    #[error("DNS protocol error: {0}")]
    Protocol(String),

    /// DNS codec error
    #[error("DNS Hickory protocol error: {0}")]
    HickoryProtocol(#[from] hickory_proto::ProtoError),

    /// Quic endpoint refused to start a connection
    #[error("quic connect error: {0}")]
    QuicConnect(#[from] ConnectError),

    /// Quic connection level failure
    #[error("quic connection error: {0}")]
    QuicConnection(#[from] ConnectionError),

    /// Quic stream write failure
    #[error("quic write error: {0}")]
    QuicWrite(#[from] WriteError),

    /// Quic stream read failure
    #[error("quic read error: {0}")]
    QuicRead(#[from] ReadExactError),

    /// No initial cipher error
    #[error("No initial cipher error: {0}")]
    NoInitialCipherSuiteError(#[from] NoInitialCipherSuite),

    /// HTTP/2 session or stream failure
    #[error("h2 error: {0}")]
    H2(#[from] h2::Error),

    /// HTTP request construction or status failure
    #[error("http error: {0}")]
    Http(String),
}

impl DnsError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        DnsError::Config(msg.into())
    }

    /// Create a runtime error
    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        DnsError::Runtime(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        DnsError::Protocol(msg.into())
    }

    /// Create an http error
    pub fn http<S: Into<String>>(msg: S) -> Self {
        DnsError::Http(msg.into())
    }

    /// Wrap this error with a short stage label
    pub fn stage(self, stage: &'static str) -> Self {
        DnsError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost error below any stage labels
    pub fn root(&self) -> &DnsError {
        match self {
            DnsError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_transport_closed(&self) -> bool {
        matches!(self.root(), DnsError::TransportClosed)
    }

    pub fn is_connection_reset(&self) -> bool {
        matches!(self.root(), DnsError::ConnectionReset)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), DnsError::Timeout(_))
    }

    /// Produce an equivalent error for another observer of the same failure
    ///
    /// Close reasons are recorded once on a connection and handed to every
    /// query waiting on it. Classified variants keep their identity; anything
    /// else is carried as its rendered message.
    pub fn replicate(&self) -> DnsError {
        match self {
            DnsError::TransportClosed => DnsError::TransportClosed,
            DnsError::ConnectionReset => DnsError::ConnectionReset,
            DnsError::NoAvailableQueryId => DnsError::NoAvailableQueryId,
            DnsError::Timeout(what) => DnsError::Timeout(what),
            DnsError::ShortRead(len) => DnsError::ShortRead(*len),
            DnsError::ConnectionClosed(reason) => DnsError::ConnectionClosed(reason.clone()),
            DnsError::QuicConnection(e) => DnsError::QuicConnection(e.clone()),
            DnsError::Stage { stage, source } => source.replicate().stage(stage),
            other => DnsError::ConnectionClosed(other.to_string()),
        }
    }
}

/// Allow conversion from ConfigError to DnsError
impl From<ConfigError> for DnsError {
    fn from(e: ConfigError) -> Self {
        DnsError::Config(e.to_string())
    }
}

/// Attach a stage label to the error side of a result
pub trait StageExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T, E: Into<DnsError>> StageExt<T> for std::result::Result<T, E> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|e| e.into().stage(stage))
    }
}

/// Convenient type alias for Results using DnsError
pub type Result<T> = std::result::Result<T, DnsError>;
