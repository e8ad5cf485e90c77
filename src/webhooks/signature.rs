//! Webhook signature verification (HMAC-SHA256).
//!
//! GitHub signs each delivery body with the shared webhook secret and sends
//! the result in `X-Hub-Signature-256` as `sha256=<hex digest>`. The digest is
//! compared in constant time by the `hmac` crate.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// The only algorithm accepted in the signature header.
pub const ALGORITHM: &str = "sha256";

/// Why a signature was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,

    #[error("signature header is not algorithm=hexdigest")]
    Malformed,

    #[error("unsupported signature algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("signature does not match payload")]
    Mismatch,
}

/// A parsed `algorithm=hexdigest` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureHeader {
    pub algorithm: String,
    pub digest: Vec<u8>,
}

impl SignatureHeader {
    /// Parses the header value. Whitespace around the value is ignored; the
    /// algorithm is matched case-sensitively later by [`verify`].
    pub fn parse(header: &str) -> Result<Self, SignatureError> {
        let header = header.trim();
        if header.is_empty() {
            return Err(SignatureError::Missing);
        }
        let (algorithm, hex_digest) = header.split_once('=').ok_or(SignatureError::Malformed)?;
        if algorithm.is_empty() || hex_digest.is_empty() {
            return Err(SignatureError::Malformed);
        }
        let digest = hex::decode(hex_digest).map_err(|_| SignatureError::Malformed)?;
        Ok(SignatureHeader {
            algorithm: algorithm.to_string(),
            digest,
        })
    }
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length, so this only fails for fixed-size MACs.
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC-SHA256 accepts keys of any length"),
    }
}

/// Computes the raw HMAC-SHA256 of `payload`.
pub fn compute_signature(payload: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Signs `payload` and renders the header value GitHub would send.
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    format!("{}={}", ALGORITHM, hex::encode(compute_signature(payload, secret)))
}

/// Verifies `header` (the raw `X-Hub-Signature-256` value, if present) against
/// `payload` under `secret`.
pub fn verify(payload: &[u8], header: Option<&str>, secret: &[u8]) -> Result<(), SignatureError> {
    let parsed = SignatureHeader::parse(header.ok_or(SignatureError::Missing)?)?;
    if parsed.algorithm != ALGORITHM {
        return Err(SignatureError::UnsupportedAlgorithm(parsed.algorithm));
    }
    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.verify_slice(&parsed.digest)
        .map_err(|_| SignatureError::Mismatch)
}
