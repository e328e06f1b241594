//! Transport crypto: HMAC-SHA256 signatures and RSA-OAEP encryption.
//!
//! The agent signs or encrypts the gzip-compressed batch, never both.
//! Signatures travel hex-encoded in the `HashSHA256` header and are
//! recomputed server-side over the raw received body. Encryption uses
//! OAEP with SHA-256; since OAEP caps the plaintext at
//! `key_size - 2*hash_len - 2` bytes, payloads are split into
//! max-capacity blocks and the ciphertext blocks are concatenated.

use std::path::Path;

use hmac::{Hmac, Mac};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// OAEP overhead for SHA-256: two hash lengths plus two bytes.
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("ciphertext length {0} is not a positive multiple of the key size {1}")]
    BadCiphertextLength(usize, usize),

    #[error("failed to read key file: {0}")]
    KeyFile(#[from] std::io::Error),

    #[error("failed to parse PEM key: {0}")]
    KeyFormat(String),
}

/// Hex-encoded HMAC-SHA256 of `payload` under `key`.
pub fn sign(key: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex-encoded HMAC-SHA256 signature in constant time.
///
/// An undecodable signature counts as a mismatch.
pub fn verify(key: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Encrypt `data` for `key` with RSA-OAEP(SHA-256), chunked to the
/// key's OAEP capacity.
pub fn encrypt(key: &RsaPublicKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let chunk_len = key.size() - OAEP_OVERHEAD;
    let mut rng = rand::thread_rng();
    let mut out = Vec::with_capacity(data.len().div_ceil(chunk_len) * key.size());
    for block in data.chunks(chunk_len) {
        out.extend(key.encrypt(&mut rng, Oaep::new::<Sha256>(), block)?);
    }
    Ok(out)
}

/// Decrypt a concatenation of OAEP blocks produced by [`encrypt`].
pub fn decrypt(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let block_len = key.size();
    if data.is_empty() || data.len() % block_len != 0 {
        return Err(CryptoError::BadCiphertextLength(data.len(), block_len));
    }
    let mut out = Vec::with_capacity(data.len());
    for block in data.chunks(block_len) {
        out.extend(key.decrypt(Oaep::new::<Sha256>(), block)?);
    }
    Ok(out)
}

/// Load an RSA public key from a PEM file (SPKI).
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, CryptoError> {
    let pem = std::fs::read_to_string(path)?;
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| CryptoError::KeyFormat(e.to_string()))
}

/// Load an RSA private key from a PEM file (PKCS#8, with PKCS#1 fallback).
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, CryptoError> {
    let pem = std::fs::read_to_string(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|e| CryptoError::KeyFormat(e.to_string()))
}
