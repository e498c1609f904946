/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! Configuration structure definitions
//!
//! Defines the schema for the transport configuration file (YAML format).

use crate::network::upstream::TransportInfo;
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Transport tag cannot be empty")]
    EmptyTransportTag,

    #[error("Duplicate transport tag: {0}")]
    DuplicateTransportTag(String),

    #[error("Invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("Invalid address for transport '{tag}': {reason}")]
    InvalidAddress { tag: String, reason: String },

    #[error("Timeout of transport '{0}' must be greater than zero")]
    ZeroTimeout(String),

    #[error("No transports configured")]
    NoTransports,
}

/// Main configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging configuration (level, file output)
    #[serde(default)]
    pub log: LogConfig,

    /// Upstream DNS transports, in priority order
    pub transports: Vec<TransportConfig>,
}

impl Config {
    /// Validate configuration
    ///
    /// Checks the log level, tag uniqueness and that every transport address
    /// parses into a dialable endpoint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.log.level.to_lowercase().as_str() {
            "off" | "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ConfigError::InvalidLogLevel(self.log.level.clone())),
        }

        if self.transports.is_empty() {
            return Err(ConfigError::NoTransports);
        }

        let mut tags = HashSet::new();
        for transport in &self.transports {
            if transport.tag.is_empty() {
                return Err(ConfigError::EmptyTransportTag);
            }
            if !tags.insert(transport.tag.as_str()) {
                return Err(ConfigError::DuplicateTransportTag(transport.tag.clone()));
            }
            if transport.timeout.is_some_and(|t| t.is_zero()) {
                return Err(ConfigError::ZeroTimeout(transport.tag.clone()));
            }
            TransportInfo::try_from(transport)?;
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: off, trace, debug, info, warn, error
    #[serde(default = "default_level")]
    pub level: String,

    /// Optional file path for log output (in addition to console)
    pub file: Option<String>,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            level: default_level(),
            file: None,
        }
    }
}

/// Default log level
fn default_level() -> String {
    "info".to_string()
}

/// One upstream DNS transport
///
/// Basic UDP configuration:
/// ```yaml
/// tag: google
/// addr: "8.8.8.8:53"
/// ```
///
/// DoH with an explicit dial address:
/// ```yaml
/// tag: cloudflare
/// addr: "https://cloudflare-dns.com/dns-query"
/// dial_addr: 1.1.1.1
/// timeout: 5s
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Unique identifier used by the router and in logs
    pub tag: String,

    /// Server address in URL format
    ///
    /// - `udp://8.8.8.8:53` or `8.8.8.8` - DNS over UDP
    /// - `tcp://8.8.8.8:53` - DNS over TCP
    /// - `tls://1.1.1.1:853` - DNS over TLS
    /// - `quic://94.140.14.14:853` - DNS over QUIC
    /// - `https://1.1.1.1/dns-query` - DNS over HTTPS (HTTP/2)
    /// - `h3://1.1.1.1/dns-query` - DNS over HTTPS (HTTP/3)
    pub addr: String,

    /// IP address to dial when `addr` carries a host name
    pub dial_addr: Option<IpAddr>,

    /// Override the server port
    pub port: Option<u16>,

    /// TLS server name (defaults to the host of `addr`)
    pub server_name: Option<String>,

    /// Query timeout (default 5s)
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub timeout: Option<Duration>,

    /// How long `close` waits for in-flight queries (default 5s)
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub shutdown_timeout: Option<Duration>,

    /// Skip TLS certificate verification (**INSECURE**, testing only!)
    pub insecure_skip_verify: Option<bool>,

    /// Use HTTP/3 for an `https://` address
    pub enable_http3: Option<bool>,

    /// Extra HTTP headers sent with every DoH request
    pub headers: Option<HashMap<String, String>>,

    /// Initial UDP receive buffer size (default 2048)
    pub udp_size: Option<u16>,

    /// Maximum number of idle connections kept by the DoT pool (default 8)
    pub tls_pool_size: Option<usize>,

    /// Linux SO_MARK socket option for policy routing
    pub so_mark: Option<u32>,

    /// Linux SO_BINDTODEVICE - bind socket to specific network interface
    pub bind_to_device: Option<String>,
}

impl TransportConfig {
    /// Minimal configuration for an address, everything else defaulted
    pub fn with_addr(tag: &str, addr: &str) -> Self {
        Self {
            tag: tag.to_string(),
            addr: addr.to_string(),
            dial_addr: None,
            port: None,
            server_name: None,
            timeout: None,
            shutdown_timeout: None,
            insecure_skip_verify: None,
            enable_http3: None,
            headers: None,
            udp_size: None,
            tls_pool_size: None,
            so_mark: None,
            bind_to_device: None,
        }
    }
}

/// Parse a duration such as `500ms`, `5s`, `2m` or a bare number of seconds
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;
    match unit.trim() {
        "" | "s" => Some(Duration::from_secs(number)),
        "ms" => Some(Duration::from_millis(number)),
        "m" => Some(Duration::from_secs(number.checked_mul(60)?)),
        _ => None,
    }
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(Raw::Text(text)) => parse_duration(&text)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {text}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("5h"), None);
        assert_eq!(parse_duration("fast"), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);
    }

    #[test]
    fn test_deserialize_and_validate() {
        let yaml = r#"
log:
  level: debug
transports:
  - tag: local
    addr: "udp://127.0.0.1:53"
    timeout: 2s
  - tag: doh
    addr: "https://cloudflare-dns.com/dns-query"
    dial_addr: 1.1.1.1
    shutdown_timeout: 1500ms
    headers:
      X-Client: forgedns
"#;
        let config: Config = serde_yml::from_str(yaml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.transports.len(), 2);
        assert_eq!(config.transports[0].timeout, Some(Duration::from_secs(2)));
        assert_eq!(
            config.transports[1].shutdown_timeout,
            Some(Duration::from_millis(1500))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_tag() {
        let config = Config {
            log: LogConfig::default(),
            transports: vec![
                TransportConfig::with_addr("a", "udp://127.0.0.1"),
                TransportConfig::with_addr("a", "tcp://127.0.0.1"),
            ],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateTransportTag(tag)) if tag == "a"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_level_and_host() {
        let mut config = Config {
            log: LogConfig {
                level: "loud".to_string(),
                file: None,
            },
            transports: vec![TransportConfig::with_addr("a", "udp://127.0.0.1")],
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));

        config.log.level = "info".to_string();
        config.transports = vec![TransportConfig::with_addr("b", "tls://dns.example")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAddress { .. })
        ));
    }
}
