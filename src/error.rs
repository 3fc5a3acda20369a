use uuid::Uuid;

/// Crate-wide result alias, mirroring the rest of the error-handling stack.
pub type MixerResult<T> = Result<T, MixerError>;

/// Every error kind named by the mixing engine's error handling design.
///
/// Variants map to a stable `code()` used as the `error_code` surfaced by
/// `status()` on terminal `Failed` requests — never the `Display` string,
/// which may carry detail not meant for external consumption.
#[derive(thiserror::Error, Debug)]
pub enum MixerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("transient gateway error: {0}")]
    TransientGateway(String),

    #[error("permanent gateway error: {0}")]
    PermanentGateway(String),

    #[error("strategy downgrade: {0}")]
    StrategyDowngrade(String),

    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("mixing timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("mix request {0} not found")]
    NotFound(Uuid),

    #[error("store error: {0}")]
    Store(String),

    #[error("encryption configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MixerError {
    /// Stable, non-sensitive machine code for external consumers.
    pub fn code(&self) -> &'static str {
        match self {
            MixerError::Validation(_) => "VALIDATION_ERROR",
            MixerError::AdmissionRejected(_) => "ADMISSION_REJECTED",
            MixerError::TransientGateway(_) => "TRANSIENT_GATEWAY_ERROR",
            MixerError::PermanentGateway(_) => "PERMANENT_GATEWAY_ERROR",
            MixerError::StrategyDowngrade(_) => "STRATEGY_DOWNGRADE",
            MixerError::IntegrityViolation(_) => "INTEGRITY_VIOLATION",
            MixerError::DecryptionFailed(_) => "DECRYPTION_FAILED",
            MixerError::Timeout { .. } => "TIMEOUT",
            MixerError::NotFound(_) => "NOT_FOUND",
            MixerError::Store(_) => "STORE_ERROR",
            MixerError::Configuration(_) => "CONFIGURATION_ERROR",
            MixerError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Whether a phase encountering this error should retry rather than fail.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MixerError::TransientGateway(_))
    }
}

impl From<serde_json::Error> for MixerError {
    fn from(e: serde_json::Error) -> Self {
        MixerError::Serialization(e.to_string())
    }
}
