// src/security/mod.rs
pub mod envelope;

use std::num::NonZeroUsize;
use std::sync::Arc;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use lru::LruCache;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};
use zeroize::Zeroize;

use crate::config::EncryptionConfig;
use crate::error::{MixerError, MixerResult};
use crate::events::{EventBus, MixerEvent};
use crate::store::Store;
use crate::types::AuditRecord;
use envelope::{DataType, EncryptedField, EnvelopeMetadata, ALGORITHM};

const KEY_CACHE_CAPACITY: usize = 10;
const PBKDF2_ITERATIONS: u32 = 100_000;
const MAX_PLAINTEXT_BYTES: usize = 1024 * 1024;
const COMPRESSION_THRESHOLD_BYTES: usize = 100;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// AES-256-GCM with a 128-bit IV, per the on-disk envelope format — the
/// crate's default `Aes256Gcm` alias is hardcoded to a 96-bit nonce.
type Cipher = AesGcm<Aes256, U16>;

/// A versioned derived key, tracked so `decrypt` can reject unknown
/// `key_version`s instead of silently deriving a key for any string.
#[derive(Debug, Clone)]
pub struct EncryptionKeyVersion {
    pub version_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub retired_at: Option<chrono::DateTime<Utc>>,
}

/// Envelope-encrypts and decrypts selected persisted fields with versioned,
/// derived keys.
pub struct EncryptionManager {
    config: EncryptionConfig,
    versions: RwLock<Vec<EncryptionKeyVersion>>,
    current_version: RwLock<String>,
    key_cache: Mutex<LruCache<String, [u8; 32]>>,
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
}

impl EncryptionManager {
    pub fn new(config: EncryptionConfig, store: Arc<dyn Store>, events: Arc<EventBus>) -> MixerResult<Self> {
        config.validate()?;
        let initial_version = new_version_id();
        let versions = vec![EncryptionKeyVersion {
            version_id: initial_version.clone(),
            created_at: Utc::now(),
            retired_at: None,
        }];

        Ok(Self {
            config,
            versions: RwLock::new(versions),
            current_version: RwLock::new(initial_version),
            key_cache: Mutex::new(LruCache::new(NonZeroUsize::new(KEY_CACHE_CAPACITY).unwrap())),
            store,
            events,
        })
    }

    pub async fn current_version(&self) -> String {
        self.current_version.read().await.clone()
    }

    /// Derive (or fetch from cache) the 32-byte key for `version_id`.
    async fn key_for_version(&self, version_id: &str) -> [u8; 32] {
        let mut cache = self.key_cache.lock().await;
        if let Some(key) = cache.get(version_id) {
            return *key;
        }
        let key = derive_key(&self.config.master_key, version_id);
        cache.put(version_id.to_string(), key);
        key
    }

    async fn is_known_version(&self, version_id: &str) -> bool {
        self.versions.read().await.iter().any(|v| v.version_id == version_id)
    }

    /// Encrypt `plaintext`, tagging the envelope with `data_type`. Uses the
    /// current key version unless `key_version` names an existing one.
    pub async fn encrypt(
        &self,
        plaintext: &[u8],
        data_type: DataType,
        key_version: Option<&str>,
    ) -> MixerResult<EncryptedField> {
        if plaintext.len() > MAX_PLAINTEXT_BYTES {
            return Err(MixerError::Validation(format!(
                "plaintext of {} bytes exceeds the 1 MiB pre-compression limit",
                plaintext.len()
            )));
        }

        let version_id = match key_version {
            Some(v) if self.is_known_version(v).await => v.to_string(),
            Some(v) => {
                return Err(MixerError::DecryptionFailed(format!(
                    "unknown key_version: {v}"
                )))
            }
            None => self.current_version().await,
        };

        let checksum = hex::encode(Sha256::digest(plaintext));
        let original_length = plaintext.len() as u32;

        let payload = if self.config.compression_enabled && plaintext.len() > COMPRESSION_THRESHOLD_BYTES {
            gzip(plaintext)
        } else {
            plaintext.to_vec()
        };

        let mut key_bytes = self.key_for_version(&version_id).await;
        let cipher = Cipher::new(Key::<Cipher>::from_slice(&key_bytes));
        key_bytes.zeroize();

        let mut iv = [0u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let nonce = GenericArray::<u8, U16>::from_slice(&iv);

        let mut ciphertext_and_tag = cipher
            .encrypt(nonce, payload.as_ref())
            .map_err(|e| MixerError::Configuration(format!("encryption failed: {e}")))?;
        let tag = ciphertext_and_tag.split_off(ciphertext_and_tag.len() - TAG_LEN);

        Ok(EncryptedField {
            encrypted_value: general_purpose::STANDARD.encode(ciphertext_and_tag),
            iv: general_purpose::STANDARD.encode(iv),
            tag: general_purpose::STANDARD.encode(tag),
            algorithm: ALGORITHM.to_string(),
            key_version: version_id,
            data_type,
            created_at: Utc::now(),
            metadata: EnvelopeMetadata {
                original_length,
                checksum,
            },
        })
    }

    /// Decrypt `field`. Any tampering with ciphertext/iv/tag, an unknown
    /// `key_version`, an algorithm mismatch, or (when
    /// `integrity_check_enabled`) a checksum mismatch yields
    /// `MixerError::DecryptionFailed` — never recovered locally.
    pub async fn decrypt(&self, field: &EncryptedField) -> MixerResult<Vec<u8>> {
        if field.algorithm != ALGORITHM {
            return Err(MixerError::DecryptionFailed(format!(
                "unsupported algorithm: {}",
                field.algorithm
            )));
        }
        if !self.is_known_version(&field.key_version).await {
            return Err(MixerError::DecryptionFailed(format!(
                "unknown key_version: {}",
                field.key_version
            )));
        }

        let ciphertext = general_purpose::STANDARD
            .decode(&field.encrypted_value)
            .map_err(|e| MixerError::DecryptionFailed(format!("invalid ciphertext encoding: {e}")))?;
        let iv = general_purpose::STANDARD
            .decode(&field.iv)
            .map_err(|e| MixerError::DecryptionFailed(format!("invalid iv encoding: {e}")))?;
        let tag = general_purpose::STANDARD
            .decode(&field.tag)
            .map_err(|e| MixerError::DecryptionFailed(format!("invalid tag encoding: {e}")))?;

        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(MixerError::DecryptionFailed("malformed iv or tag length".to_string()));
        }

        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);

        let mut key_bytes = self.key_for_version(&field.key_version).await;
        let cipher = Cipher::new(Key::<Cipher>::from_slice(&key_bytes));
        key_bytes.zeroize();
        let nonce = GenericArray::<u8, U16>::from_slice(&iv);

        let payload = cipher
            .decrypt(nonce, combined.as_ref())
            .map_err(|_| MixerError::DecryptionFailed("authentication tag mismatch".to_string()))?;

        let plaintext = if payload.starts_with(&GZIP_MAGIC) {
            gunzip(&payload).map_err(|e| MixerError::DecryptionFailed(format!("decompression failed: {e}")))?
        } else {
            payload
        };

        if self.config.integrity_check_enabled {
            let checksum = hex::encode(Sha256::digest(&plaintext));
            if checksum != field.metadata.checksum {
                return Err(MixerError::DecryptionFailed("checksum mismatch".to_string()));
            }
        }

        Ok(plaintext)
    }

    /// Allocate a new key version and make it current. Existing envelopes
    /// are rewrapped lazily via `reencrypt`, not eagerly here. Writes an
    /// `AuditRecord` and publishes `MixerEvent::KeyRotated` so the rotation
    /// is observable the same way a `RecoveryManager` auto-fix is.
    pub async fn rotate(&self) -> MixerResult<String> {
        let new_version = new_version_id();
        {
            let mut versions = self.versions.write().await;
            versions.push(EncryptionKeyVersion {
                version_id: new_version.clone(),
                created_at: Utc::now(),
                retired_at: None,
            });
        }
        *self.current_version.write().await = new_version.clone();

        let audit_version = new_version.clone();
        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(txn.append_audit(AuditRecord {
                    id: uuid::Uuid::new_v4(),
                    entity_id: uuid::Uuid::nil(),
                    action: "KEY_ROTATED".to_string(),
                    detail: format!("rotated to key_version {audit_version}"),
                    created_at: Utc::now(),
                }))
            }))
            .await?;
        self.events.publish(MixerEvent::KeyRotated { version_id: new_version.clone() });

        Ok(new_version)
    }

    /// Decrypt then re-encrypt under `new_version`. Used by the field
    /// migration utility after a rotation.
    pub async fn reencrypt(&self, field: &EncryptedField, new_version: &str) -> MixerResult<EncryptedField> {
        if !self.is_known_version(new_version).await {
            return Err(MixerError::Configuration(format!(
                "cannot reencrypt to unknown key_version: {new_version}"
            )));
        }
        let plaintext = self.decrypt(field).await?;
        self.encrypt(&plaintext, field.data_type, Some(new_version)).await
    }
}

fn new_version_id() -> String {
    let unix_ms = Utc::now().timestamp_millis();
    let mut rand_bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut rand_bytes);
    format!("v{}_{}", unix_ms, hex::encode(rand_bytes))
}

fn derive_key(master_key: &[u8], version_id: &str) -> [u8; 32] {
    let mut salt_input = Vec::with_capacity(version_id.len() + master_key.len());
    salt_input.extend_from_slice(version_id.as_bytes());
    salt_input.extend_from_slice(master_key);
    let salt = Sha256::digest(&salt_input);

    let mut key = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(master_key, &salt, PBKDF2_ITERATIONS, &mut key);
    key
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("in-memory gzip write cannot fail");
    encoder.finish().expect("in-memory gzip finish cannot fail")
}

fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
