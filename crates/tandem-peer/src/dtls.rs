//! Secure-transport context and handshake seam
//!
//! A [`SecureContext`] holds the session's certificate and key. It is created
//! once per session and shared read-only by every path listener. Each listener
//! drives its own [`Handshake`], obtained from a [`HandshakeFactory`].

use bytes::Bytes;
use rcgen::CertifiedKey;
use sha2::{Digest, Sha256};
use tandem_protocol::Fingerprint;
use thiserror::Error;

/// Subject alternative name on the self-signed certificate
const CERTIFICATE_NAME: &str = "tandem";

#[derive(Error, Debug)]
pub enum DtlsError {
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("record rejected: {0}")]
    Record(String),
}

pub struct SecureContext {
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
    fingerprint: Fingerprint,
}

impl SecureContext {
    /// Generate a fresh self-signed certificate and its fingerprint
    pub fn generate() -> Result<Self, DtlsError> {
        let CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec![CERTIFICATE_NAME.to_string()])?;
        let certificate_der = cert.der().to_vec();
        let fingerprint = Fingerprint::sha256(certificate_fingerprint(&certificate_der));

        Ok(Self {
            certificate_der,
            private_key_der: key_pair.serialize_der(),
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// PKCS#8 DER
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }
}

impl std::fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureContext")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// SHA-256 over the DER certificate, upper-case hex pairs joined by colons
/// (RFC 8122)
pub fn certificate_fingerprint(certificate_der: &[u8]) -> String {
    Sha256::digest(certificate_der)
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Per-path handshake state machine
pub trait Handshake: Send {
    /// Feed one inbound handshake record, returning records to send back
    fn handle_record(&mut self, record: &[u8]) -> Result<Vec<Bytes>, DtlsError>;

    fn is_established(&self) -> bool;

    /// Protect an outbound media packet
    fn protect(&self, packet: &[u8]) -> Result<Bytes, DtlsError>;

    /// Unprotect an inbound media packet
    fn unprotect(&self, packet: &[u8]) -> Result<Bytes, DtlsError>;
}

pub trait HandshakeFactory: Send + Sync {
    /// Start a handshake for one path. `validation_secret` is the session
    /// password, pre-shared through the session description.
    fn start(&self, context: &SecureContext, validation_secret: &str) -> Box<dyn Handshake>;
}

/// Handshake for paths that are already secured below this layer (or
/// loopback testing). Established from the start; media passes unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl HandshakeFactory for Passthrough {
    fn start(&self, _context: &SecureContext, _validation_secret: &str) -> Box<dyn Handshake> {
        Box::new(PassthroughHandshake)
    }
}

struct PassthroughHandshake;

impl Handshake for PassthroughHandshake {
    fn handle_record(&mut self, record: &[u8]) -> Result<Vec<Bytes>, DtlsError> {
        tracing::trace!(len = record.len(), "Ignoring handshake record");
        Ok(Vec::new())
    }

    fn is_established(&self) -> bool {
        true
    }

    fn protect(&self, packet: &[u8]) -> Result<Bytes, DtlsError> {
        Ok(Bytes::copy_from_slice(packet))
    }

    fn unprotect(&self, packet: &[u8]) -> Result<Bytes, DtlsError> {
        Ok(Bytes::copy_from_slice(packet))
    }
}
