//! Webhook signature schemes.
//!
//! Every supported POS signs the raw request body with HMAC-SHA256 under the
//! subscription secret; they differ only in how the digest is encoded.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const HEX_PREFIX: &str = "sha256=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// Lower-case hex digest, optionally prefixed with `sha256=`.
    HexHmacSha256,
    /// Standard base64 digest.
    Base64HmacSha256,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is empty")]
    Missing,
    #[error("signature is not valid {encoding}")]
    InvalidFormat { encoding: &'static str },
    #[error("signature verification failed")]
    Mismatch,
}

fn digest(payload: &[u8], secret: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, so construction cannot fail.
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return Vec::new(),
    };
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Produces the signature a system would send for `payload`.
pub fn sign(scheme: SignatureScheme, payload: &[u8], secret: &str) -> String {
    let digest = digest(payload, secret);
    match scheme {
        SignatureScheme::HexHmacSha256 => hex::encode(digest),
        SignatureScheme::Base64HmacSha256 => STANDARD.encode(digest),
    }
}

/// Verifies `signature` in constant time.
pub fn verify(
    scheme: SignatureScheme,
    payload: &[u8],
    signature: &str,
    secret: &str,
) -> Result<(), SignatureError> {
    let signature = signature.trim();
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }

    let provided = match scheme {
        SignatureScheme::HexHmacSha256 => {
            let raw = signature.strip_prefix(HEX_PREFIX).unwrap_or(signature);
            hex::decode(raw).map_err(|_| SignatureError::InvalidFormat { encoding: "hex" })?
        }
        SignatureScheme::Base64HmacSha256 => STANDARD
            .decode(signature)
            .map_err(|_| SignatureError::InvalidFormat { encoding: "base64" })?,
    };

    let expected = digest(payload, secret);
    if expected.ct_eq(&provided).into() {
        Ok(())
    } else {
        debug!(payload_size = payload.len(), "Webhook signature mismatch");
        Err(SignatureError::Mismatch)
    }
}

/// Boolean form used by adapters.
pub fn is_valid(scheme: SignatureScheme, payload: &[u8], signature: &str, secret: &str) -> bool {
    verify(scheme, payload, signature, secret).is_ok()
}
