// src/recovery/mod.rs
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::config::MixerConfig;
use crate::error::MixerResult;
use crate::events::{EventBus, MixerEvent};
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::types::{AuditRecord, MixStatus, Severity};

/// Every integrity issue kind `RecoveryManager` can detect, matching the
/// taxonomy below: what it is, how bad it is, and whether an
/// automatic fix exists at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueKind {
    BalanceMismatchNegative,
    BalanceMismatchAnomalousHigh,
    MissingDepositAddress,
    OrphanedOutputTransaction,
    OrphanedDepositAddress,
    StuckMixing,
    UnconfirmedDeposited,
    DuplicateWalletAddress,
    DuplicateDepositAddress,
}

impl IssueKind {
    pub fn severity(&self) -> Severity {
        match self {
            IssueKind::BalanceMismatchNegative => Severity::Critical,
            IssueKind::BalanceMismatchAnomalousHigh => Severity::Medium,
            IssueKind::MissingDepositAddress => Severity::High,
            IssueKind::OrphanedOutputTransaction => Severity::Medium,
            IssueKind::OrphanedDepositAddress => Severity::Low,
            IssueKind::StuckMixing => Severity::High,
            IssueKind::UnconfirmedDeposited => Severity::Medium,
            IssueKind::DuplicateWalletAddress => Severity::Critical,
            IssueKind::DuplicateDepositAddress => Severity::High,
        }
    }

    pub fn auto_fixable(&self) -> bool {
        matches!(
            self,
            IssueKind::MissingDepositAddress
                | IssueKind::OrphanedOutputTransaction
                | IssueKind::OrphanedDepositAddress
                | IssueKind::StuckMixing
                | IssueKind::DuplicateDepositAddress
        )
    }
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub kind: IssueKind,
    pub entity_id: Uuid,
    pub detail: String,
    /// Whether `apply_autofixes` may act on this specific issue. Usually
    /// just `kind.auto_fixable()`, but some kinds are only fixable under a
    /// condition evaluated at detection time (e.g. `MissingDepositAddress`
    /// only for a `Pending` request).
    pub auto_fixable: bool,
}

/// Fixed staleness threshold for the `StuckMixing` detector (spec §3/§4.4:
/// "MIXING stuck >2h is an integrity alarm"). Deliberately not tied to
/// `max_mixing_time` — that is the engine's own hard per-mix ceiling
/// (enforced by the supervisor task, default 1h) and a different concept
/// from this scan's staleness window on `updated_at`.
const STUCK_MIXING_THRESHOLD: chrono::Duration = chrono::Duration::hours(2);

/// Periodic consistency checker over the `Store`. `full_scan` covers the
/// entire taxonomy (hourly, per `integrity_check_interval`); `quick_scan`
/// covers only the cheap status checks (every `monitoring_interval`).
/// Auto-fixes run inside one `Store` transaction each and abort entirely —
/// no partial fixes — if the scan turns up more than
/// `max_inconsistent_records` issues, on the theory that that many
/// simultaneous problems points at something systemic an automated pass
/// should not touch.
pub struct RecoveryManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    config: Arc<MixerConfig>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        telemetry: Arc<Telemetry>,
        config: Arc<MixerConfig>,
    ) -> Self {
        Self { store, events, telemetry, config }
    }

    pub async fn quick_scan(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        issues.extend(self.status_inconsistencies().await?);
        issues.extend(self.missing_deposit_addresses().await?);
        for issue in &issues {
            self.events.publish(MixerEvent::IntegrityIssueFound {
                entity_id: issue.entity_id,
                kind: format!("{:?}", issue.kind),
                severity: issue.kind.severity(),
            });
        }
        Ok(issues)
    }

    pub async fn full_scan(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        issues.extend(self.status_inconsistencies().await?);
        issues.extend(self.missing_deposit_addresses().await?);
        issues.extend(self.balance_mismatches().await?);
        issues.extend(self.orphaned_records().await?);
        issues.extend(self.duplicate_addresses().await?);
        for issue in &issues {
            self.events.publish(MixerEvent::IntegrityIssueFound {
                entity_id: issue.entity_id,
                kind: format!("{:?}", issue.kind),
                severity: issue.kind.severity(),
            });
        }
        Ok(issues)
    }

    async fn status_inconsistencies(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        let now = Utc::now();

        for request in self.store.list_mix_requests_by_status(MixStatus::Mixing).await? {
            if now.signed_duration_since(request.updated_at) > STUCK_MIXING_THRESHOLD {
                issues.push(Issue {
                    kind: IssueKind::StuckMixing,
                    entity_id: request.id,
                    detail: format!("stuck in Mixing since {}", request.updated_at),
                    auto_fixable: IssueKind::StuckMixing.auto_fixable(),
                });
            }
        }

        for request in self.store.list_mix_requests_by_status(MixStatus::Deposited).await? {
            if let Some(addr) = self.store.get_deposit_address(request.id).await? {
                if !addr.used
                    && now.signed_duration_since(request.updated_at)
                        > chrono::Duration::from_std(self.config.monitoring_interval).unwrap_or_default()
                {
                    issues.push(Issue {
                        kind: IssueKind::UnconfirmedDeposited,
                        entity_id: request.id,
                        detail: "Deposited but deposit address still unused".to_string(),
                        auto_fixable: IssueKind::UnconfirmedDeposited.auto_fixable(),
                    });
                }
            }
        }
        Ok(issues)
    }

    async fn missing_deposit_addresses(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        for status in [MixStatus::Pending, MixStatus::Deposited, MixStatus::Pooling] {
            for request in self.store.list_mix_requests_by_status(status).await? {
                if self.store.get_deposit_address(request.id).await?.is_none() {
                    issues.push(Issue {
                        kind: IssueKind::MissingDepositAddress,
                        entity_id: request.id,
                        detail: "non-terminal mix request has no deposit address".to_string(),
                        // Auto-fix only cancels a Pending request — Deposited/
                        // Pooling rows got this far with a deposit address at
                        // some point, so a missing row there needs a human,
                        // not an automatic cancellation.
                        auto_fixable: status == MixStatus::Pending,
                    });
                }
            }
        }
        Ok(issues)
    }

    async fn balance_mismatches(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        for wallet in self.store.list_wallets().await? {
            if wallet.balance < rust_decimal::Decimal::ZERO {
                issues.push(Issue {
                    kind: IssueKind::BalanceMismatchNegative,
                    entity_id: wallet.id,
                    detail: format!("balance {} is negative", wallet.balance),
                    auto_fixable: IssueKind::BalanceMismatchNegative.auto_fixable(),
                });
            } else if wallet.balance.abs() > self.config.suspicion_threshold {
                issues.push(Issue {
                    kind: IssueKind::BalanceMismatchAnomalousHigh,
                    entity_id: wallet.id,
                    detail: format!("balance {} exceeds suspicion threshold", wallet.balance),
                    auto_fixable: IssueKind::BalanceMismatchAnomalousHigh.auto_fixable(),
                });
            }
        }
        Ok(issues)
    }

    async fn orphaned_records(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.unused_retention).unwrap_or_default();

        for addr in self.store.orphaned_deposit_addresses(cutoff).await? {
            issues.push(Issue {
                kind: IssueKind::OrphanedDepositAddress,
                entity_id: addr.mix_request_id,
                detail: format!("deposit address {} has no active owning mix", addr.address),
                auto_fixable: IssueKind::OrphanedDepositAddress.auto_fixable(),
            });
        }
        for tx in self.store.orphaned_output_transactions().await? {
            issues.push(Issue {
                kind: IssueKind::OrphanedOutputTransaction,
                entity_id: tx.id,
                detail: format!("output transaction {} has no owning mix request", tx.id),
                auto_fixable: IssueKind::OrphanedOutputTransaction.auto_fixable(),
            });
        }
        Ok(issues)
    }

    async fn duplicate_addresses(&self) -> MixerResult<Vec<Issue>> {
        let mut issues = Vec::new();
        for (address, wallets) in self.store.duplicate_wallet_addresses().await? {
            for wallet in wallets {
                issues.push(Issue {
                    kind: IssueKind::DuplicateWalletAddress,
                    entity_id: wallet.id,
                    detail: format!("address {address} shared by more than one wallet"),
                    auto_fixable: IssueKind::DuplicateWalletAddress.auto_fixable(),
                });
            }
        }
        for (address, mut addrs) in self.store.duplicate_deposit_addresses().await? {
            // Retain one row per duplicate group: the `used` one if there is
            // one, else the earliest by `created_at`. Only the rest are
            // flagged for deletion.
            addrs.sort_by_key(|a| a.created_at);
            let keep_index = addrs.iter().position(|a| a.used).unwrap_or(0);
            for (i, addr) in addrs.into_iter().enumerate() {
                if i == keep_index {
                    continue;
                }
                issues.push(Issue {
                    kind: IssueKind::DuplicateDepositAddress,
                    entity_id: addr.mix_request_id,
                    detail: format!("address {address} shared by more than one deposit address row"),
                    auto_fixable: IssueKind::DuplicateDepositAddress.auto_fixable(),
                });
            }
        }
        Ok(issues)
    }

    /// Applies every auto-fixable issue in `issues` inside one transaction.
    /// Aborts the entire batch (returns `Ok(false)`, no partial effects) if
    /// `issues.len()` exceeds `max_inconsistent_records`.
    pub async fn apply_autofixes(&self, issues: &[Issue]) -> MixerResult<bool> {
        if issues.len() > self.config.max_inconsistent_records {
            self.events.publish(MixerEvent::IntegrityScanAborted {
                found: issues.len(),
                max_allowed: self.config.max_inconsistent_records,
            });
            return Ok(false);
        }

        let fixable: Vec<Issue> = issues.iter().filter(|i| i.auto_fixable).cloned().collect();
        if fixable.is_empty() {
            return Ok(true);
        }

        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    for issue in &fixable {
                        match issue.kind {
                            IssueKind::MissingDepositAddress => {
                                if let Some(mut request) = txn.get_mix_request(issue.entity_id).await? {
                                    request.status = MixStatus::Cancelled;
                                    request.error_code = Some("MISSING_DEPOSIT_ADDRESS".to_string());
                                    request.error_message = Some(issue.detail.clone());
                                    request.updated_at = Utc::now();
                                    txn.put_mix_request(request).await?;
                                }
                            }
                            IssueKind::StuckMixing => {
                                if let Some(mut request) = txn.get_mix_request(issue.entity_id).await? {
                                    request.status = MixStatus::Pooling;
                                    request.updated_at = Utc::now();
                                    txn.put_mix_request(request).await?;
                                }
                            }
                            IssueKind::OrphanedOutputTransaction => {
                                txn.delete_output_transaction(issue.entity_id).await?;
                            }
                            IssueKind::OrphanedDepositAddress | IssueKind::DuplicateDepositAddress => {
                                txn.delete_deposit_address(issue.entity_id).await?;
                            }
                            _ => {}
                        }
                        txn.append_audit(AuditRecord {
                            id: Uuid::new_v4(),
                            entity_id: issue.entity_id,
                            action: format!("{:?}", issue.kind),
                            detail: issue.detail.clone(),
                            created_at: Utc::now(),
                        })
                        .await?;
                    }
                    Ok(())
                })
            }))
            .await?;

        for issue in issues.iter().filter(|i| i.auto_fixable) {
            self.events.publish(MixerEvent::IntegrityAutoFixed {
                entity_id: issue.entity_id,
                kind: format!("{:?}", issue.kind),
            });
        }
        self.telemetry.incr("integrity_autofixes").await;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{Currency, MixRequest, OutputTarget};
    use std::time::Duration;

    fn stuck_request() -> MixRequest {
        let now = Utc::now() - chrono::Duration::hours(2) - chrono::Duration::seconds(5);
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::BTC,
            input_amount: rust_decimal::Decimal::new(100, 2),
            deposit_address: "addr".to_string(),
            output_addresses: vec![OutputTarget { address: "out".to_string(), percent_basis_points: 10_000 }],
            delay_seconds: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(3),
            status: MixStatus::Mixing,
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

    fn setup() -> (RecoveryManager, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let (bus, _rx) = EventBus::new(32);
        let events = Arc::new(bus);
        let telemetry = Arc::new(Telemetry::new());
        let mut config = MixerConfig::default();
        config.max_mixing_time = Duration::from_secs(3600);
        let config = Arc::new(config);
        (RecoveryManager::new(store.clone(), events, telemetry, config), store)
    }

    #[tokio::test]
    async fn detects_and_autofixes_stuck_mixing() {
        let (recovery, store) = setup();
        let request = stuck_request();
        let id = request.id;
        store
            .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_mix_request(request))))
            .await
            .unwrap();

        let issues = recovery.full_scan().await.unwrap();
        assert!(issues.iter().any(|i| i.kind == IssueKind::StuckMixing && i.entity_id == id));

        let applied = recovery.apply_autofixes(&issues).await.unwrap();
        assert!(applied);

        let fixed = store.get_mix_request(id).await.unwrap().unwrap();
        assert_eq!(fixed.status, MixStatus::Pooling);
    }

    #[tokio::test]
    async fn autofix_batch_aborts_when_over_the_limit() {
        let (recovery, store) = setup();
        for _ in 0..3 {
            let request = stuck_request();
            store
                .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_mix_request(request))))
                .await
                .unwrap();
        }
        let issues = recovery.full_scan().await.unwrap();
        let fake_limit_issues: Vec<Issue> = issues
            .into_iter()
            .chain((0..20).map(|_| Issue {
                kind: IssueKind::OrphanedOutputTransaction,
                entity_id: Uuid::new_v4(),
                detail: "synthetic".to_string(),
                auto_fixable: IssueKind::OrphanedOutputTransaction.auto_fixable(),
            }))
            .collect();

        let applied = recovery.apply_autofixes(&fake_limit_issues).await.unwrap();
        assert!(!applied);
    }

    fn request_with_status(status: MixStatus) -> MixRequest {
        let now = Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::BTC,
            input_amount: rust_decimal::Decimal::new(100, 2),
            deposit_address: "addr".to_string(),
            output_addresses: vec![OutputTarget { address: "out".to_string(), percent_basis_points: 10_000 }],
            delay_seconds: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(3),
            status,
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

    #[tokio::test]
    async fn missing_deposit_address_autofixes_pending_but_not_deposited() {
        let (recovery, store) = setup();
        let pending = request_with_status(MixStatus::Pending);
        let deposited = request_with_status(MixStatus::Deposited);
        let pending_id = pending.id;
        let deposited_id = deposited.id;
        store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    txn.put_mix_request(pending).await?;
                    txn.put_mix_request(deposited).await
                })
            }))
            .await
            .unwrap();

        let issues = recovery.full_scan().await.unwrap();
        let pending_issue = issues.iter().find(|i| i.entity_id == pending_id).unwrap();
        let deposited_issue = issues.iter().find(|i| i.entity_id == deposited_id).unwrap();
        assert!(pending_issue.auto_fixable);
        assert!(!deposited_issue.auto_fixable);

        recovery.apply_autofixes(&issues).await.unwrap();

        let fixed_pending = store.get_mix_request(pending_id).await.unwrap().unwrap();
        assert_eq!(fixed_pending.status, MixStatus::Cancelled);
        assert!(fixed_pending.error_message.is_some());

        let untouched_deposited = store.get_mix_request(deposited_id).await.unwrap().unwrap();
        assert_eq!(untouched_deposited.status, MixStatus::Deposited);
    }

    #[tokio::test]
    async fn duplicate_deposit_addresses_retain_the_used_row() {
        let (recovery, store) = setup();
        let now = Utc::now();
        let keep = crate::types::DepositAddress {
            mix_request_id: Uuid::new_v4(),
            address: "shared".to_string(),
            currency: Currency::BTC,
            used: true,
            created_at: now,
        };
        let drop_unused = crate::types::DepositAddress {
            mix_request_id: Uuid::new_v4(),
            address: "shared".to_string(),
            currency: Currency::BTC,
            used: false,
            created_at: now - chrono::Duration::seconds(5),
        };
        let keep_id = keep.mix_request_id;
        let drop_id = drop_unused.mix_request_id;
        store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    txn.put_deposit_address(keep).await?;
                    txn.put_deposit_address(drop_unused).await
                })
            }))
            .await
            .unwrap();

        let issues = recovery.full_scan().await.unwrap();
        assert!(!issues.iter().any(|i| i.kind == IssueKind::DuplicateDepositAddress && i.entity_id == keep_id));
        assert!(issues.iter().any(|i| i.kind == IssueKind::DuplicateDepositAddress && i.entity_id == drop_id));

        recovery.apply_autofixes(&issues).await.unwrap();
        assert!(store.get_deposit_address(keep_id).await.unwrap().is_some());
        assert!(store.get_deposit_address(drop_id).await.unwrap().is_none());
    }
}
