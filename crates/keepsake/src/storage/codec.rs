//! At-rest encoding for persisted payloads
//!
//! A payload starts as the JSON of a record or backup. On write it is
//! compressed with zstd and, when a key is configured, sealed with
//! ChaCha20-Poly1305. The stored text carries a prefix naming its layers, so
//! rows written under other settings still load:
//!
//! - no prefix: plain JSON
//! - `z1:` base64 of the zstd-compressed JSON
//! - `e1:` base64 of `nonce || ciphertext`; the first plaintext byte says
//!   whether the rest is compressed
//!
//! The record checksum is computed over the content before encoding and is
//! verified after decoding.

use std::fmt;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};

use crate::config::StorageConfig;
use crate::error::{KeepsakeError, Result};

const COMPRESSED_PREFIX: &str = "z1:";
const SEALED_PREFIX: &str = "e1:";

pub const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const FLAG_RAW: u8 = 0;
const FLAG_ZSTD: u8 = 1;

const ZSTD_LEVEL: i32 = 3;

#[derive(Clone)]
pub struct PayloadCodec {
    compress: bool,
    cipher: Option<ChaCha20Poly1305>,
}

impl fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("compress", &self.compress)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}

impl Default for PayloadCodec {
    /// Compressed, unencrypted
    fn default() -> Self {
        Self::new(true, None)
    }
}

impl PayloadCodec {
    pub fn new(compress: bool, key: Option<&[u8; KEY_LEN]>) -> Self {
        Self {
            compress,
            cipher: key.map(|k| ChaCha20Poly1305::new(Key::from_slice(k))),
        }
    }

    /// Plain JSON in and out
    pub fn plain() -> Self {
        Self::new(false, None)
    }

    /// Build from storage settings, reading the key from the environment
    /// variable named by `encryption_key_env`.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        let key = match std::env::var(&config.encryption_key_env) {
            Ok(value) if !value.trim().is_empty() => Some(parse_key(value.trim())?),
            _ => None,
        };

        match key {
            Some(_) => tracing::info!("Payload encryption enabled"),
            None => tracing::info!(
                "{} is not set, payloads are stored unencrypted",
                config.encryption_key_env
            ),
        }

        Ok(Self::new(config.compress_payloads, key.as_ref()))
    }

    /// A fresh random key, base64 encoded for the environment variable
    pub fn generate_key() -> String {
        STANDARD.encode(ChaCha20Poly1305::generate_key(&mut OsRng))
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn encode(&self, json: &str) -> Result<String> {
        let (flag, body) = if self.compress {
            let compressed = zstd::encode_all(json.as_bytes(), ZSTD_LEVEL).map_err(|e| {
                KeepsakeError::Serialization(format!("Failed to compress payload: {e}"))
            })?;
            (FLAG_ZSTD, compressed)
        } else {
            (FLAG_RAW, json.as_bytes().to_vec())
        };

        let Some(cipher) = &self.cipher else {
            return Ok(if flag == FLAG_ZSTD {
                format!("{COMPRESSED_PREFIX}{}", STANDARD.encode(body))
            } else {
                json.to_string()
            });
        };

        let mut plaintext = Vec::with_capacity(body.len() + 1);
        plaintext.push(flag);
        plaintext.extend_from_slice(&body);

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| KeepsakeError::Serialization("Failed to encrypt payload".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(format!("{SEALED_PREFIX}{}", STANDARD.encode(sealed)))
    }

    /// Undo `encode`. Failures are `CorruptRecord` errors for row `id`.
    pub fn decode(&self, id: &str, stored: &str) -> Result<String> {
        if let Some(encoded) = stored.strip_prefix(SEALED_PREFIX) {
            let cipher = self
                .cipher
                .as_ref()
                .ok_or_else(|| corrupt(id, "payload is encrypted but no key is configured"))?;
            let sealed = STANDARD
                .decode(encoded)
                .map_err(|e| corrupt(id, format!("invalid base64: {e}")))?;
            if sealed.len() < NONCE_LEN + TAG_LEN {
                return Err(corrupt(id, "encrypted payload is truncated"));
            }

            let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
            let plaintext = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| corrupt(id, "decryption failed (wrong key or tampered payload)"))?;

            return match plaintext.split_first() {
                Some((&FLAG_RAW, body)) => utf8(id, body.to_vec()),
                Some((&FLAG_ZSTD, body)) => decompress(id, body),
                Some((flag, _)) => Err(corrupt(id, format!("unknown payload flag {flag}"))),
                None => Err(corrupt(id, "empty plaintext")),
            };
        }

        if let Some(encoded) = stored.strip_prefix(COMPRESSED_PREFIX) {
            let body = STANDARD
                .decode(encoded)
                .map_err(|e| corrupt(id, format!("invalid base64: {e}")))?;
            return decompress(id, &body);
        }

        Ok(stored.to_string())
    }
}

/// Parse a base64 key of exactly `KEY_LEN` bytes
pub fn parse_key(encoded: &str) -> Result<[u8; KEY_LEN]> {
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| KeepsakeError::Config(format!("Encryption key is not valid base64: {e}")))?;
    <[u8; KEY_LEN]>::try_from(bytes.as_slice()).map_err(|_| {
        KeepsakeError::Config(format!(
            "Encryption key must be {KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

fn decompress(id: &str, body: &[u8]) -> Result<String> {
    let bytes =
        zstd::decode_all(body).map_err(|e| corrupt(id, format!("decompression failed: {e}")))?;
    utf8(id, bytes)
}

fn utf8(id: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| corrupt(id, format!("payload is not UTF-8: {e}")))
}

fn corrupt(id: &str, reason: impl Into<String>) -> KeepsakeError {
    KeepsakeError::CorruptRecord {
        id: id.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7; KEY_LEN];
    const OTHER_KEY: [u8; KEY_LEN] = [9; KEY_LEN];
    const JSON: &str = r#"{"content":"the spare key is under the blue pot"}"#;

    #[test]
    fn test_plain_codec_stores_json_as_is() {
        let codec = PayloadCodec::plain();
        assert_eq!(codec.encode(JSON).unwrap(), JSON);
        assert_eq!(codec.decode("r1", JSON).unwrap(), JSON);
    }

    #[test]
    fn test_compressed_payload() {
        let codec = PayloadCodec::default();
        let stored = codec.encode(JSON).unwrap();

        assert!(stored.starts_with(COMPRESSED_PREFIX));
        assert_eq!(codec.decode("r1", &stored).unwrap(), JSON);
    }

    #[test]
    fn test_sealed_payload_hides_content() {
        let codec = PayloadCodec::new(true, Some(&KEY));
        let stored = codec.encode(JSON).unwrap();

        assert!(stored.starts_with(SEALED_PREFIX));
        assert!(!stored.contains("spare key"));
        assert_eq!(codec.decode("r1", &stored).unwrap(), JSON);

        let uncompressed = PayloadCodec::new(false, Some(&KEY));
        let stored = uncompressed.encode(JSON).unwrap();
        assert_eq!(uncompressed.decode("r1", &stored).unwrap(), JSON);
    }

    #[test]
    fn test_nonces_differ_between_writes() {
        let codec = PayloadCodec::new(true, Some(&KEY));
        assert_ne!(codec.encode(JSON).unwrap(), codec.encode(JSON).unwrap());
    }

    mod failures {
        use super::*;

        #[test]
        fn test_wrong_key_is_corrupt() {
            let stored = PayloadCodec::new(true, Some(&KEY)).encode(JSON).unwrap();
            let err = PayloadCodec::new(true, Some(&OTHER_KEY))
                .decode("r1", &stored)
                .unwrap_err();
            match err {
                KeepsakeError::CorruptRecord { id, reason } => {
                    assert_eq!(id, "r1");
                    assert!(reason.contains("decryption failed"), "got: {reason}");
                }
                other => panic!("expected CorruptRecord, got {other:?}"),
            }
        }

        #[test]
        fn test_sealed_payload_without_key_is_corrupt() {
            let stored = PayloadCodec::new(true, Some(&KEY)).encode(JSON).unwrap();
            let err = PayloadCodec::default().decode("r1", &stored).unwrap_err();
            assert!(err.to_string().contains("no key"), "got: {err}");
        }

        #[test]
        fn test_tampered_ciphertext_is_corrupt() {
            let codec = PayloadCodec::new(false, Some(&KEY));
            let stored = codec.encode(JSON).unwrap();
            let mut sealed = STANDARD.decode(&stored[SEALED_PREFIX.len()..]).unwrap();
            let last = sealed.len() - 1;
            sealed[last] ^= 0x01;
            let tampered = format!("{SEALED_PREFIX}{}", STANDARD.encode(sealed));

            assert!(matches!(
                codec.decode("r1", &tampered),
                Err(KeepsakeError::CorruptRecord { .. })
            ));
        }

        #[test]
        fn test_garbage_compressed_payload_is_corrupt() {
            let stored = format!("{COMPRESSED_PREFIX}{}", STANDARD.encode(b"not zstd at all"));
            let err = PayloadCodec::default().decode("r1", &stored).unwrap_err();
            assert!(err.to_string().contains("decompression failed"), "got: {err}");
        }
    }

    mod fallback {
        use super::*;

        #[test]
        fn test_keyed_codec_reads_older_rows() {
            let codec = PayloadCodec::new(true, Some(&KEY));
            assert_eq!(codec.decode("r1", JSON).unwrap(), JSON);

            let compressed = PayloadCodec::default().encode(JSON).unwrap();
            assert_eq!(codec.decode("r1", &compressed).unwrap(), JSON);
        }
    }

    mod keys {
        use super::*;

        #[test]
        fn test_generated_key_parses() {
            let key = parse_key(&PayloadCodec::generate_key()).unwrap();
            assert_eq!(key.len(), KEY_LEN);
        }

        #[test]
        fn test_short_key_is_rejected() {
            let err = parse_key(&STANDARD.encode([1u8; 16])).unwrap_err();
            assert!(matches!(err, KeepsakeError::Config(_)));
            assert!(parse_key("%%%").is_err());
        }

        #[test]
        fn test_missing_env_var_means_unencrypted() {
            let mut config = StorageConfig::default();
            config.encryption_key_env = format!("KEEPSAKE_UNSET_{}", uuid::Uuid::new_v4().simple());
            let codec = PayloadCodec::from_config(&config).unwrap();
            assert!(!codec.is_encrypted());
        }
    }
}
