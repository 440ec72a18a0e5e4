/**
 * Template Codec
 * Seals feature vectors into storable templates and opens them again.
 *
 * Blob layout (all of it base64 on the wire):
 *   scheme (1) | key version (4, BE) | created at (8, BE) | nonce (12) | ciphertext + tag
 * The first 13 bytes are bound to the ciphertext as associated data, so the
 * metadata cannot be edited without failing authentication.
 */

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::Zeroizing;

use crate::error::{FaceError, FaceResult};
use crate::extractor::FeatureVector;

pub const KEY_LEN: usize = 32;
pub const SCHEME_NAME: &str = "AES-256-GCM/f64le-v1";

const SCHEME_ID: u8 = 0x01;
const HEADER_LEN: usize = 1 + 4 + 8;
const TAG_LEN: usize = 16;
const LENGTH_PREFIX: usize = 4;

/// Process-wide symmetric key, provisioned from a secret store.
pub struct TemplateKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    version: u32,
}

impl TemplateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN], version: u32) -> Self {
        Self {
            bytes: Zeroizing::new(bytes),
            version,
        }
    }

    pub fn from_base64(encoded: &str, version: u32) -> FaceResult<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|_| FaceError::Config("template key is not valid base64".into()))?,
        );
        if decoded.len() != KEY_LEN {
            return Err(FaceError::Config(format!(
                "template key must be {KEY_LEN} bytes, found {}",
                decoded.len()
            )));
        }

        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(&decoded);
        let key = Self::from_bytes(bytes, version);
        // `bytes` was copied into the Zeroizing wrapper above
        zeroize::Zeroize::zeroize(&mut bytes);
        Ok(key)
    }

    pub fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Debug for TemplateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Opaque, authenticated ciphertext of one feature vector plus its metadata.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedTemplate {
    key_version: u32,
    created_at: u64,
    blob: Vec<u8>,
}

impl EncryptedTemplate {
    /// Parse a template from its stored string form.
    pub fn decode(encoded: &str) -> FaceResult<Self> {
        let blob = STANDARD
            .decode(encoded.trim())
            .map_err(|_| FaceError::Crypto("template is not valid base64".into()))?;
        Self::from_blob(blob)
    }

    fn from_blob(blob: Vec<u8>) -> FaceResult<Self> {
        if blob.len() < HEADER_LEN + NONCE_LEN + TAG_LEN + LENGTH_PREFIX {
            return Err(FaceError::Crypto(format!(
                "template truncated ({} bytes)",
                blob.len()
            )));
        }
        if blob[0] != SCHEME_ID {
            return Err(FaceError::Crypto(format!(
                "unsupported template scheme {:#04x}",
                blob[0]
            )));
        }

        let key_version = u32::from_be_bytes([blob[1], blob[2], blob[3], blob[4]]);
        let mut created = [0u8; 8];
        created.copy_from_slice(&blob[5..HEADER_LEN]);

        Ok(Self {
            key_version,
            created_at: u64::from_be_bytes(created),
            blob,
        })
    }

    pub fn encode(&self) -> String {
        STANDARD.encode(&self.blob)
    }

    pub fn scheme(&self) -> &'static str {
        SCHEME_NAME
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::try_from(self.created_at).ok()?, 0)
    }
}

impl fmt::Debug for EncryptedTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptedTemplate")
            .field("scheme", &SCHEME_NAME)
            .field("key_version", &self.key_version)
            .field("created_at", &self.created_at)
            .field("len", &self.blob.len())
            .finish()
    }
}

pub struct TemplateCodec {
    key: LessSafeKey,
    key_version: u32,
    rng: SystemRandom,
}

impl TemplateCodec {
    pub fn new(key: TemplateKey) -> FaceResult<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, &key.bytes[..])
            .map_err(|_| FaceError::Config("template key rejected by AES-256-GCM".into()))?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
            key_version: key.version,
            rng: SystemRandom::new(),
        })
    }

    pub fn key_version(&self) -> u32 {
        self.key_version
    }

    pub fn encrypt(&self, vector: &FeatureVector) -> FaceResult<EncryptedTemplate> {
        let values = vector.as_slice();
        let count = u32::try_from(values.len())
            .map_err(|_| FaceError::Input("feature vector too long".into()))?;

        let mut in_out = Zeroizing::new(Vec::with_capacity(
            LENGTH_PREFIX + values.len() * 8 + TAG_LEN,
        ));
        in_out.extend_from_slice(&count.to_le_bytes());
        for value in values {
            in_out.extend_from_slice(&value.to_le_bytes());
        }

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let header = header_bytes(self.key_version, created_at);

        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| FaceError::Internal("system RNG unavailable".into()))?;

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::from(&header[..]),
                &mut *in_out,
            )
            .map_err(|_| FaceError::Internal("template sealing failed".into()))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + NONCE_LEN + in_out.len());
        blob.extend_from_slice(&header);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&in_out);

        Ok(EncryptedTemplate {
            key_version: self.key_version,
            created_at,
            blob,
        })
    }

    /// Open a template. Either the whole vector comes back or an error does.
    pub fn decrypt(&self, template: &EncryptedTemplate) -> FaceResult<FeatureVector> {
        if template.key_version != self.key_version {
            return Err(FaceError::Crypto(format!(
                "template sealed under key version {}, active key is {}",
                template.key_version, self.key_version
            )));
        }

        let (header, rest) = template.blob.split_at(HEADER_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| FaceError::Crypto("malformed nonce".into()))?;

        let mut in_out = Zeroizing::new(sealed.to_vec());
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(header), &mut in_out[..])
            .map_err(|_| FaceError::Crypto("authentication tag mismatch".into()))?;

        decode_vector(plaintext)
    }
}

fn header_bytes(key_version: u32, created_at: u64) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = SCHEME_ID;
    header[1..5].copy_from_slice(&key_version.to_be_bytes());
    header[5..].copy_from_slice(&created_at.to_be_bytes());
    header
}

fn decode_vector(plaintext: &[u8]) -> FaceResult<FeatureVector> {
    if plaintext.len() < LENGTH_PREFIX {
        return Err(FaceError::Crypto("plaintext missing length prefix".into()));
    }
    let (prefix, body) = plaintext.split_at(LENGTH_PREFIX);
    let count = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if count.checked_mul(8) != Some(body.len()) {
        return Err(FaceError::Crypto(format!(
            "length prefix {count} disagrees with {} payload bytes",
            body.len()
        )));
    }

    let values = body
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            f64::from_le_bytes(raw)
        })
        .collect();

    FeatureVector::new(values).map_err(|e| FaceError::Crypto(format!("invalid vector: {e}")))
}
