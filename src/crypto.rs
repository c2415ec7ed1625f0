//! Credential sealing with AES-256-GCM.
//!
//! Stored credentials are serialized to JSON and encrypted with the tenant and system
//! bound in as additional authenticated data, so a row copied to another tenant or
//! system fails to open. Layout: `0x01 | nonce(12) | ciphertext+tag`.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::adapters::Credentials;
use crate::systems::ExternalSystemType;

const SEALED_VERSION: u8 = 0x01;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 1 + NONCE_LEN;
const KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("sealed payload is truncated")]
    Truncated,
    #[error("sealed payload is empty")]
    Empty,
    #[error("credential payload is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 256-bit key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CryptoKey(Vec<u8>);

impl CryptoKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CryptoKey([REDACTED])")
    }
}

pub fn encrypt_bytes(key: &CryptoKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let mut sealed_body = key
        .cipher()
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    let mut sealed = Vec::with_capacity(HEADER_LEN + sealed_body.len());
    sealed.push(SEALED_VERSION);
    sealed.extend_from_slice(&nonce);
    sealed.append(&mut sealed_body);
    Ok(sealed)
}

/// Opens a sealed payload. Bytes without the version marker are returned unchanged so
/// rows written before encryption was enabled stay readable.
pub fn decrypt_bytes(key: &CryptoKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let Some(&version) = sealed.first() else {
        return Err(CryptoError::Empty);
    };
    if version != SEALED_VERSION {
        return Ok(sealed.to_vec());
    }
    if sealed.len() < HEADER_LEN + TAG_LEN {
        return Err(CryptoError::Truncated);
    }

    let (header, body) = sealed.split_at(HEADER_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(&header[1..]), Payload { msg: body, aad })
        .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))
}

pub fn is_sealed(payload: &[u8]) -> bool {
    payload.len() >= HEADER_LEN + TAG_LEN && payload[0] == SEALED_VERSION
}

fn credential_aad(tenant_id: Uuid, system: ExternalSystemType) -> String {
    format!("{tenant_id}:{system}")
}

pub fn seal_credentials(
    key: &CryptoKey,
    tenant_id: Uuid,
    system: ExternalSystemType,
    credentials: &Credentials,
) -> Result<Vec<u8>, CryptoError> {
    let plaintext = serde_json::to_vec(credentials)?;
    encrypt_bytes(key, credential_aad(tenant_id, system).as_bytes(), &plaintext)
}

pub fn open_credentials(
    key: &CryptoKey,
    tenant_id: Uuid,
    system: ExternalSystemType,
    sealed: &[u8],
) -> Result<Credentials, CryptoError> {
    let plaintext = decrypt_bytes(key, credential_aad(tenant_id, system).as_bytes(), sealed)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> CryptoKey {
        CryptoKey::new(vec![7u8; 32]).expect("valid test key")
    }

    #[test]
    fn credentials_open_only_for_their_owner() {
        let tenant = Uuid::new_v4();
        let creds = Credentials {
            refresh_token: Some("r-1".to_string()),
            merchant_id: Some("m-9".to_string()),
            ..Credentials::with_access_token("a-1")
        };

        let sealed = seal_credentials(&key(), tenant, ExternalSystemType::Square, &creds).unwrap();
        assert!(is_sealed(&sealed));
        assert!(!String::from_utf8_lossy(&sealed).contains("a-1"));

        let opened = open_credentials(&key(), tenant, ExternalSystemType::Square, &sealed).unwrap();
        assert_eq!(opened, creds);

        assert!(open_credentials(&key(), tenant, ExternalSystemType::Toast, &sealed).is_err());
        assert!(
            open_credentials(&key(), Uuid::new_v4(), ExternalSystemType::Square, &sealed).is_err()
        );
    }

    #[test]
    fn plaintext_rows_remain_readable() {
        let tenant = Uuid::new_v4();
        let legacy = br#"{"access_token":"plain"}"#;
        let opened = open_credentials(&key(), tenant, ExternalSystemType::Clover, legacy).unwrap();
        assert_eq!(opened.access_token.as_deref(), Some("plain"));
    }

    #[test]
    fn tampering_is_detected() {
        let mut sealed = encrypt_bytes(&key(), b"aad", b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            decrypt_bytes(&key(), b"aad", &sealed),
            Err(CryptoError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn nonces_differ_between_seals() {
        let first = encrypt_bytes(&key(), b"aad", b"same").unwrap();
        let second = encrypt_bytes(&key(), b"aad", b"same").unwrap();
        assert_ne!(first[1..HEADER_LEN], second[1..HEADER_LEN]);
    }

    #[test]
    fn malformed_inputs() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(matches!(decrypt_bytes(&key(), b"", &[]), Err(CryptoError::Empty)));
        assert!(matches!(
            decrypt_bytes(&key(), b"", &[SEALED_VERSION, 1, 2]),
            Err(CryptoError::Truncated)
        ));
    }
}
