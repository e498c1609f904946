/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

//! TLS client configuration for secure DNS transports
//!
//! Two base configurations are built lazily and cached:
//! - Secure mode: validates certificates against the bundled webpki roots
//! - Insecure mode: skips certificate validation (for testing only)
//!
//! Each transport clones one and sets its own ALPN protocol list.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error, RootCertStore, SignatureScheme};
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Once};

/// ALPN for DNS over QUIC (RFC 9250)
pub const ALPN_DOQ: &[u8] = b"doq";
/// ALPN for DNS over HTTPS on HTTP/2
pub const ALPN_H2: &[u8] = b"h2";
/// ALPN for DNS over HTTPS on HTTP/3
pub const ALPN_H3: &[u8] = b"h3";

lazy_static::lazy_static! {
    /// Secure TLS configuration with certificate validation
    static ref SECURE_CONFIG: ClientConfig = build_secure_config();

    /// Insecure TLS configuration (no certificate validation)
    static ref INSECURE_CONFIG: ClientConfig = build_insecure_config();
}

static DEFAULT_PROVIDER: Once = Once::new();

/// Install ring as the process-wide rustls provider (first caller wins)
pub fn install_default_provider() {
    DEFAULT_PROVIDER.call_once(|| {
        // Another component may already have installed a provider.
        let _ = ring::default_provider().install_default();
    })
}

fn build_secure_config() -> ClientConfig {
    install_default_provider();
    let root_store = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config.enable_early_data = true;
    config
}

/// **WARNING**: Skips all certificate validation. Use only for testing!
fn build_insecure_config() -> ClientConfig {
    install_default_provider();
    let mut config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification))
        .with_no_client_auth();
    config.enable_early_data = true;
    config
}

/// Client configuration for one transport
///
/// `alpn` is empty for plain DoT.
pub(crate) fn client_config(insecure: bool, alpn: &[&[u8]]) -> ClientConfig {
    let mut config = if insecure {
        INSECURE_CONFIG.clone()
    } else {
        SECURE_CONFIG.clone()
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    config
}

/// Certificate verifier that accepts any certificate (INSECURE!)
struct NoCertVerification;

impl Debug for NoCertVerification {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "NoCertVerification")
    }
}

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
