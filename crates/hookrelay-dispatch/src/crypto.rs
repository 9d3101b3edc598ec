//! HMAC primitives shared by inbound verification and outbound signing.
//!
//! - HMAC-SHA256 / HMAC-SHA512 computation
//! - hex / base64 signature encodings
//! - constant-time comparison

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Hash function behind an HMAC signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Some(Self::Sha256),
            "sha512" | "sha-512" => Some(Self::Sha512),
            _ => None,
        }
    }
}

/// Text encoding of a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureEncoding {
    #[default]
    Hex,
    Base64,
}

impl SignatureEncoding {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hex => "hex",
            Self::Base64 => "base64",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "hex" => Some(Self::Hex),
            "base64" => Some(Self::Base64),
            _ => None,
        }
    }

    #[must_use]
    pub fn encode(&self, bytes: &[u8]) -> String {
        match self {
            Self::Hex => hex::encode(bytes),
            Self::Base64 => BASE64.encode(bytes),
        }
    }

    /// Decode a signature; `None` when the text is not valid for this encoding.
    #[must_use]
    pub fn decode(&self, text: &str) -> Option<Vec<u8>> {
        match self {
            Self::Hex => hex::decode(text.trim()).ok(),
            Self::Base64 => BASE64.decode(text.trim()).ok(),
        }
    }
}

/// Compute a raw HMAC over the concatenation of `parts`.
#[must_use]
pub fn compute_hmac(algorithm: HashAlgorithm, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    // HMAC accepts keys of any length, so `new_from_slice` cannot fail here.
    match algorithm {
        HashAlgorithm::Sha256 => {
            let mut mac = match <HmacSha256 as Mac>::new_from_slice(key) {
                Ok(mac) => mac,
                Err(_) => return Vec::new(),
            };
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        HashAlgorithm::Sha512 => {
            let mut mac = match <HmacSha512 as Mac>::new_from_slice(key) {
                Ok(mac) => mac,
                Err(_) => return Vec::new(),
            };
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
    }
}

/// Compute an outbound webhook signature.
///
/// The signature covers `{timestamp}.{body}` to prevent replay attacks.
#[must_use]
pub fn compute_hmac_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    algorithm: HashAlgorithm,
    encoding: SignatureEncoding,
) -> String {
    let mac = compute_hmac(
        algorithm,
        secret.as_bytes(),
        &[timestamp.as_bytes(), b".", body],
    );
    encoding.encode(&mac)
}

/// Build the signature header value for every currently valid secret.
///
/// Format: `t={timestamp},v1={sig}[,v1={sig}...]`. Receivers accept the
/// request when any `v1` entry matches, which lets secrets rotate without
/// downtime.
#[must_use]
pub fn build_signature_header(
    secrets: &[&str],
    timestamp: &str,
    body: &[u8],
    algorithm: HashAlgorithm,
    encoding: SignatureEncoding,
) -> String {
    let mut value = format!("t={timestamp}");
    for secret in secrets {
        value.push_str(",v1=");
        value.push_str(&compute_hmac_signature(
            secret, timestamp, body, algorithm, encoding,
        ));
    }
    value
}

/// Verify a signature header produced by [`build_signature_header`].
#[must_use]
pub fn verify_signature_header(
    header: &str,
    secret: &str,
    body: &[u8],
    algorithm: HashAlgorithm,
    encoding: SignatureEncoding,
) -> bool {
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", ts)) => timestamp = Some(ts),
            Some(("v1", sig)) => candidates.push(sig),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return false;
    };

    let computed = compute_hmac_signature(secret, timestamp, body, algorithm, encoding);
    candidates
        .iter()
        .any(|candidate| constant_time_eq(candidate.as_bytes(), computed.as_bytes()))
}

/// Constant-time byte comparison to prevent timing attacks.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}

/// Hex-encoded SHA-256 digest.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::Digest;
    hex::encode(Sha256::digest(data))
}
