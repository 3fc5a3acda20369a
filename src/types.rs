// src/types.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::security::envelope::EncryptedField;

/// Currencies the mixer accepts. New currencies only need an entry here and
/// a `BlockchainGateway` implementation — nothing in the engine switches on
/// this enum beyond routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    BTC,
    ETH,
    USDT,
    SOL,
}

/// One entry of a `MixRequest`'s output list: a destination address and its
/// share of the mixed amount, in basis points (1/100th of a percent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTarget {
    pub address: String,
    pub percent_basis_points: u16,
}

/// Lifecycle states of a `MixRequest`. See spec §3 for the transition rules
/// enforced by `MixingEngine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MixStatus {
    Pending,
    Deposited,
    Pooling,
    Mixing,
    Completed,
    Failed,
    Cancelled,
}

impl MixStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MixStatus::Completed | MixStatus::Failed | MixStatus::Cancelled)
    }
}

/// The unit of work accepted by the mixing engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixRequest {
    pub id: Uuid,
    pub currency: Currency,
    pub input_amount: Decimal,
    pub deposit_address: String,
    pub output_addresses: Vec<OutputTarget>,
    pub delay_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: MixStatus,
    pub retry_count: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,

    /// Sensitive fields, always stored as envelopes — never plaintext.
    pub ip_address: Option<EncryptedField>,
    pub user_agent: Option<EncryptedField>,
    pub referrer: Option<EncryptedField>,
    pub notes: Option<EncryptedField>,
}

impl MixRequest {
    /// Sum of output basis points; a valid request sums to exactly 10000.
    pub fn total_basis_points(&self) -> u32 {
        self.output_addresses.iter().map(|o| o.percent_basis_points as u32).sum()
    }

    pub fn validate(&self) -> Result<(), crate::error::MixerError> {
        if self.total_basis_points() != 10_000 {
            return Err(crate::error::MixerError::Validation(format!(
                "output percentages sum to {} bp, expected 10000",
                self.total_basis_points()
            )));
        }
        if self.expires_at <= self.created_at {
            return Err(crate::error::MixerError::Validation(
                "expires_at must be after created_at".to_string(),
            ));
        }
        if self.input_amount <= Decimal::ZERO {
            return Err(crate::error::MixerError::Validation(
                "input_amount must be positive".to_string(),
            ));
        }
        if self.output_addresses.is_empty() {
            return Err(crate::error::MixerError::Validation(
                "output_addresses must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 1:1 with a `MixRequest`. Owned exclusively by it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositAddress {
    pub mix_request_id: Uuid,
    pub address: String,
    pub currency: Currency,
    pub used: bool,
    pub created_at: DateTime<Utc>,
}

/// Kind of a process wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletKind {
    Hot,
    Pool,
    Cold,
}

/// Operational status of a wallet row, independent of its balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletStatus {
    Active,
    Maintenance,
    Disabled,
}

/// A pool or hot wallet. Process-wide shared; mutated only inside a `Store`
/// transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub address: String,
    pub currency: Currency,
    pub kind: WalletKind,
    pub balance: Decimal,
    pub is_active: bool,
    pub is_locked: bool,
    pub status: WalletStatus,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Wallet {
    pub fn is_selectable(&self) -> bool {
        self.is_active && !self.is_locked && self.status == WalletStatus::Active
    }
}

/// Status of a single broadcast/confirmation attempt for one output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputTxStatus {
    Pending,
    Broadcast,
    Confirmed,
    Failed,
}

/// One per `output_addresses` entry, per broadcast attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputTransaction {
    pub id: Uuid,
    pub mix_request_id: Uuid,
    pub output_index: usize,
    pub address: String,
    pub amount: Decimal,
    pub txid: Option<String>,
    pub status: OutputTxStatus,
    pub scheduled_for: DateTime<Utc>,
}

/// Strategy chosen for a mix at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    CoinJoin,
    PoolMixing,
    FastMix,
}

/// Anonymity level associated with a chosen strategy, surfaced at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymityLevel {
    Low,
    Medium,
    High,
}

impl Strategy {
    pub fn anonymity(&self) -> AnonymityLevel {
        match self {
            Strategy::CoinJoin => AnonymityLevel::High,
            Strategy::PoolMixing => AnonymityLevel::Medium,
            Strategy::FastMix => AnonymityLevel::Low,
        }
    }

    pub fn eta_minutes(&self) -> i64 {
        match self {
            Strategy::CoinJoin => 30,
            Strategy::PoolMixing => 45,
            Strategy::FastMix => 15,
        }
    }
}

/// Phase of the currently executing strategy. Meaning depends on `Strategy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    // CoinJoin
    Coordination,
    Signing,
    Broadcast,
    // PoolMixing
    PoolEntry,
    Mixing,
    Distribution,
    // FastMix
    Obfuscation,
    Transfer,
}

/// In-memory-only execution state for an admitted mix. Exclusively owned by
/// `MixingEngine` for the duration of the mix; never persisted as a whole
/// (its terminal outcome is folded back into the `MixRequest` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MixingContext {
    pub mix_request_id: Uuid,
    pub session_id: Uuid,
    pub mixing_id: Uuid,
    pub strategy: Strategy,
    pub current_phase: Phase,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: DateTime<Utc>,
    pub retry_count: u32,
    pub participants: Vec<Uuid>,
    pub chunks: Vec<Decimal>,
    pub broadcast_txids: Vec<String>,
    pub intermediate_addresses: Vec<String>,
}

impl MixingContext {
    pub fn new(mix_request_id: Uuid, strategy: Strategy, now: DateTime<Utc>) -> Self {
        let initial_phase = match strategy {
            Strategy::CoinJoin => Phase::Coordination,
            Strategy::PoolMixing => Phase::PoolEntry,
            Strategy::FastMix => Phase::Obfuscation,
        };
        Self {
            mix_request_id,
            session_id: Uuid::new_v4(),
            mixing_id: Uuid::new_v4(),
            strategy,
            current_phase: initial_phase,
            progress: 0,
            started_at: now,
            estimated_completion: now + chrono::Duration::minutes(strategy.eta_minutes()),
            retry_count: 0,
            participants: Vec::new(),
            chunks: Vec::new(),
            broadcast_txids: Vec::new(),
            intermediate_addresses: Vec::new(),
        }
    }

    /// The address a `FastMix` transfer phase pays out from: the last hop
    /// created during obfuscation, not a transaction-hash record.
    pub fn last_intermediate_address(&self) -> Option<&str> {
        self.intermediate_addresses.last().map(|s| s.as_str())
    }
}

/// Per-currency liquidity pool snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PoolStats {
    pub currency: Currency,
    pub size: Decimal,
    pub active_participants: usize,
    pub average_wait_secs: u64,
}

/// Append-only audit record, written by `RecoveryManager` auto-fixes and by
/// `EncryptionManager::rotate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub action: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

/// Severity of an integrity issue detected by `RecoveryManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> MixRequest {
        let now = Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::BTC,
            input_amount: Decimal::new(100, 2),
            deposit_address: "addr1".to_string(),
            output_addresses: vec![OutputTarget {
                address: "out1".to_string(),
                percent_basis_points: 10_000,
            }],
            delay_seconds: 3600,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
            status: MixStatus::Pending,
            retry_count: 0,
            error_code: None,
            error_message: None,
            updated_at: now,
            ip_address: None,
            user_agent: None,
            referrer: None,
            notes: None,
        }
    }

    #[test]
    fn validates_basis_points_sum() {
        let mut req = sample_request();
        assert!(req.validate().is_ok());
        req.output_addresses.push(OutputTarget {
            address: "out2".to_string(),
            percent_basis_points: 1,
        });
        assert!(req.validate().is_err());
    }

    #[test]
    fn validates_expiry_ordering() {
        let mut req = sample_request();
        req.expires_at = req.created_at;
        assert!(req.validate().is_err());
    }

    #[test]
    fn strategy_anonymity_mapping() {
        assert_eq!(Strategy::CoinJoin.anonymity(), AnonymityLevel::High);
        assert_eq!(Strategy::PoolMixing.anonymity(), AnonymityLevel::Medium);
        assert_eq!(Strategy::FastMix.anonymity(), AnonymityLevel::Low);
    }

    #[test]
    fn fast_mix_uses_last_intermediate_address() {
        let ctx_request_id = Uuid::new_v4();
        let mut ctx = MixingContext::new(ctx_request_id, Strategy::FastMix, Utc::now());
        ctx.intermediate_addresses.push("hop1".to_string());
        ctx.intermediate_addresses.push("hop2".to_string());
        assert_eq!(ctx.last_intermediate_address(), Some("hop2"));
    }
}
