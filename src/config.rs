// src/config.rs
use std::time::Duration;

/// Every tunable named in the process configuration surface. Constructed
/// programmatically by the embedding application — this crate does not own
/// deployment-time config loading (env/file parsing is out of scope).
#[derive(Debug, Clone)]
pub struct MixerConfig {
    pub max_concurrent_mixes: usize,
    pub min_pool_size: u32,
    pub min_coinjoin_participants: usize,
    pub phase_delay: Duration,
    pub max_mixing_time: Duration,
    pub max_retry_attempts: u32,
    pub integrity_check_interval: Duration,
    pub monitoring_interval: Duration,
    pub max_inconsistent_records: usize,
    pub shutdown_timeout: Duration,
    pub scheduler_skew: Duration,
    pub coordination_timeout: Duration,
    pub signing_timeout: Duration,
    pub unused_retention: Duration,
    pub suspicion_threshold: rust_decimal::Decimal,
    /// Lower/upper bound on a PoolMixing chunk, expressed as a fraction of
    /// the mix's `input_amount`. Not named in spec §6's process
    /// configuration table, but required by §4.1's "sizes drawn uniformly
    /// from `[min_chunk, max_chunk]`" — added here as a tunable rather than
    /// a hardcoded constant, matching the rest of this struct's convention.
    pub pool_min_chunk_fraction: rust_decimal::Decimal,
    pub pool_max_chunk_fraction: rust_decimal::Decimal,
    pub encryption: EncryptionConfig,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_mixes: 100,
            min_pool_size: 10,
            min_coinjoin_participants: 3,
            phase_delay: Duration::from_millis(30_000),
            max_mixing_time: Duration::from_millis(3_600_000),
            max_retry_attempts: 3,
            integrity_check_interval: Duration::from_millis(3_600_000),
            monitoring_interval: Duration::from_millis(300_000),
            max_inconsistent_records: 10,
            shutdown_timeout: Duration::from_secs(30),
            scheduler_skew: Duration::from_secs(5),
            coordination_timeout: Duration::from_secs(120),
            signing_timeout: Duration::from_secs(60),
            unused_retention: Duration::from_secs(7 * 24 * 3600),
            suspicion_threshold: rust_decimal::Decimal::new(1_000_000, 0),
            pool_min_chunk_fraction: rust_decimal::Decimal::new(10, 2),
            pool_max_chunk_fraction: rust_decimal::Decimal::new(40, 2),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Encryption-specific options, nested under `encryption.*` in spec §6.
#[derive(Clone)]
pub struct EncryptionConfig {
    pub master_key: Vec<u8>,
    pub key_rotation_days: u32,
    pub compression_enabled: bool,
    pub integrity_check_enabled: bool,
}

impl std::fmt::Debug for EncryptionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionConfig")
            .field("master_key", &"<redacted>")
            .field("key_rotation_days", &self.key_rotation_days)
            .field("compression_enabled", &self.compression_enabled)
            .field("integrity_check_enabled", &self.integrity_check_enabled)
            .finish()
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            master_key: Vec::new(),
            key_rotation_days: 90,
            compression_enabled: true,
            integrity_check_enabled: true,
        }
    }
}

impl EncryptionConfig {
    pub fn validate(&self) -> Result<(), crate::error::MixerError> {
        if self.master_key.len() < 32 {
            return Err(crate::error::MixerError::Configuration(
                "encryption.master_key must be at least 32 bytes".to_string(),
            ));
        }
        if self.key_rotation_days == 0 || self.key_rotation_days > 365 {
            return Err(crate::error::MixerError::Configuration(
                "encryption.key_rotation_days must be in 1..=365".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = MixerConfig::default();
        assert_eq!(cfg.max_concurrent_mixes, 100);
        assert_eq!(cfg.min_pool_size, 10);
        assert_eq!(cfg.min_coinjoin_participants, 3);
        assert_eq!(cfg.max_retry_attempts, 3);
        assert_eq!(cfg.encryption.key_rotation_days, 90);
    }

    #[test]
    fn encryption_config_rejects_short_master_key() {
        let mut enc = EncryptionConfig::default();
        enc.master_key = vec![0u8; 16];
        assert!(enc.validate().is_err());
        enc.master_key = vec![0u8; 32];
        assert!(enc.validate().is_ok());
    }
}
