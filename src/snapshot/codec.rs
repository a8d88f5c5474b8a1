//! Snapshot byte layering.
//!
//! An image is encoded as deterministic JSON (records sorted by key
//! name), gzip-compressed, and then, when a secret key is configured,
//! sealed with AES-256-GCM. The random nonce is prepended to the
//! ciphertext. The layering is recorded in the file suffix:
//! `.json.aes.gz` for encrypted images, `.json.gz` otherwise.

use std::io::{Read, Write};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

pub const SUFFIX_ENCRYPTED: &str = ".json.aes.gz";
pub const SUFFIX_COMPRESSED: &str = ".json.gz";
pub const SUFFIX_PLAIN: &str = ".json";

const NONCE_LEN: usize = 12;

/// Derive the 32-byte AEAD key from the configured secret.
pub fn derive_key(secret: &str) -> [u8; 32] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    key
}

pub fn compress(plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(plaintext)?;
    Ok(encoder.finish()?)
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Seal with AES-256-GCM; the nonce is prepended to the ciphertext.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Internal(format!("AES-256-GCM encryption failed: {}", e)))?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Internal(
            "snapshot too short for AES-256-GCM".to_string(),
        ));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    cipher
        .decrypt(GenericArray::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Internal(format!("AES-256-GCM decryption failed: {}", e)))
}

/// Apply the outbound layering and return the bytes plus the suffix the
/// image should be stored under.
pub fn encode(json: &[u8], key: Option<&[u8; 32]>) -> Result<(Vec<u8>, &'static str)> {
    let compressed = compress(json)?;
    match key {
        Some(key) => Ok((encrypt(key, &compressed)?, SUFFIX_ENCRYPTED)),
        None => Ok((compressed, SUFFIX_COMPRESSED)),
    }
}

/// Undo the layering recorded in `name`'s suffix.
pub fn decode(name: &str, data: &[u8], key: Option<&[u8; 32]>) -> Result<Vec<u8>> {
    if name.ends_with(SUFFIX_ENCRYPTED) {
        let key = key.ok_or_else(|| {
            Error::Internal(format!("{}: encrypted snapshot but no secret key", name))
        })?;
        decompress(&decrypt(key, data)?)
    } else if name.ends_with(SUFFIX_COMPRESSED) {
        decompress(data)
    } else if name.ends_with(SUFFIX_PLAIN) {
        Ok(data.to_vec())
    } else {
        Err(Error::Internal(format!(
            "{}: unrecognized snapshot suffix",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_round_trip() {
        let data = b"some snapshot payload, repeated enough to compress well \
                     some snapshot payload, repeated enough to compress well";
        let compressed = compress(data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_encrypt_round_trip() {
        let key = derive_key("hunter2");
        let sealed = encrypt(&key, b"payload").unwrap();
        assert_ne!(sealed, b"payload");
        assert_eq!(decrypt(&key, &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_decrypt_rejects_wrong_key() {
        let sealed = encrypt(&derive_key("right"), b"payload").unwrap();
        assert!(decrypt(&derive_key("wrong"), &sealed).is_err());
    }

    #[test]
    fn test_decrypt_rejects_tampering() {
        let key = derive_key("k");
        let mut sealed = encrypt(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xff;
        assert!(decrypt(&key, &sealed).is_err());
    }

    #[test]
    fn test_encode_decode_layering() {
        let json = br#"{"version":1}"#;

        let (bytes, suffix) = encode(json, None).unwrap();
        assert_eq!(suffix, SUFFIX_COMPRESSED);
        let name = format!("20260101000000000{}", suffix);
        assert_eq!(decode(&name, &bytes, None).unwrap(), json);

        let key = derive_key("secret");
        let (bytes, suffix) = encode(json, Some(&key)).unwrap();
        assert_eq!(suffix, SUFFIX_ENCRYPTED);
        let name = format!("20260101000000000{}", suffix);
        assert_eq!(decode(&name, &bytes, Some(&key)).unwrap(), json);
        // without the key the image is unreadable
        assert!(decode(&name, &bytes, None).is_err());
    }

    #[test]
    fn test_plain_decode() {
        assert_eq!(
            decode("x.json", br#"{"a":1}"#, None).unwrap(),
            br#"{"a":1}"#
        );
        assert!(decode("x.bin", b"data", None).is_err());
    }
}
