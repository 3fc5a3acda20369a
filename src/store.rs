// src/store.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MixerError, MixerResult};
use crate::types::{
    AuditRecord, DepositAddress, MixRequest, MixStatus, OutputTransaction, Wallet,
};

/// A single, serializable unit of work against the store. `transaction`
/// hands the closure a `&mut dyn StoreTxn` and commits its effects only if
/// the closure returns `Ok`; any `Err` rolls the whole unit back. Reads
/// inside a transaction observe its own uncommitted writes (read-your-writes)
/// and nothing weaker than snapshot isolation against concurrent
/// transactions — `InMemoryStore` gets this by holding one lock for the
/// transaction's entire lifetime rather than anything more permissive.
#[async_trait]
pub trait StoreTxn: Send {
    async fn get_mix_request(&mut self, id: Uuid) -> MixerResult<Option<MixRequest>>;
    async fn put_mix_request(&mut self, request: MixRequest) -> MixerResult<()>;

    async fn get_deposit_address(&mut self, mix_request_id: Uuid) -> MixerResult<Option<DepositAddress>>;
    async fn put_deposit_address(&mut self, addr: DepositAddress) -> MixerResult<()>;
    async fn delete_deposit_address(&mut self, mix_request_id: Uuid) -> MixerResult<()>;

    async fn get_wallet(&mut self, id: Uuid) -> MixerResult<Option<Wallet>>;
    async fn put_wallet(&mut self, wallet: Wallet) -> MixerResult<()>;

    async fn get_output_transaction(&mut self, id: Uuid) -> MixerResult<Option<OutputTransaction>>;
    async fn put_output_transaction(&mut self, tx: OutputTransaction) -> MixerResult<()>;
    async fn delete_output_transaction(&mut self, id: Uuid) -> MixerResult<()>;

    async fn append_audit(&mut self, record: AuditRecord) -> MixerResult<()>;
}

/// Capability trait the engine programs against. `InMemoryStore` is the only
/// implementation this crate ships — a real deployment backs it with a
/// relational store, but that persistence wiring is out of scope for this
/// crate.
#[async_trait]
pub trait Store: Send + Sync {
    async fn transaction<'a>(
        &'a self,
        f: Box<dyn FnOnce(&mut dyn StoreTxn) -> MixerResult<()> + Send + 'a>,
    ) -> MixerResult<()>;

    async fn get_mix_request(&self, id: Uuid) -> MixerResult<Option<MixRequest>>;
    async fn list_mix_requests_by_status(&self, status: MixStatus) -> MixerResult<Vec<MixRequest>>;

    /// Wallets ordered `balance DESC, last_used_at ASC`, restricted to a
    /// currency and to `Wallet::is_selectable`.
    async fn select_candidate_wallets(
        &self,
        currency: crate::types::Currency,
    ) -> MixerResult<Vec<Wallet>>;

    async fn get_deposit_address(&self, mix_request_id: Uuid) -> MixerResult<Option<DepositAddress>>;
    async fn list_deposit_addresses(&self) -> MixerResult<Vec<DepositAddress>>;

    /// `DepositAddress` rows whose owning `MixRequest` no longer exists, or
    /// is terminal and past `unused_retention` — a left-anti-join shape.
    async fn orphaned_deposit_addresses(
        &self,
        retention_cutoff: DateTime<Utc>,
    ) -> MixerResult<Vec<DepositAddress>>;

    async fn list_output_transactions(&self, mix_request_id: Uuid) -> MixerResult<Vec<OutputTransaction>>;

    /// `OutputTransaction` rows whose `mix_request_id` has no matching
    /// `MixRequest` row at all.
    async fn orphaned_output_transactions(&self) -> MixerResult<Vec<OutputTransaction>>;

    /// Addresses shared by more than one `Wallet` row (`GROUP BY address
    /// HAVING COUNT(*) > 1`).
    async fn duplicate_wallet_addresses(&self) -> MixerResult<Vec<(String, Vec<Wallet>)>>;

    /// Addresses shared by more than one `DepositAddress` row.
    async fn duplicate_deposit_addresses(&self) -> MixerResult<Vec<(String, Vec<DepositAddress>)>>;

    async fn list_wallets(&self) -> MixerResult<Vec<Wallet>>;

    async fn audit_log(&self) -> MixerResult<Vec<AuditRecord>>;
}

#[derive(Default, Clone)]
struct Tables {
    mix_requests: HashMap<Uuid, MixRequest>,
    deposit_addresses: HashMap<Uuid, DepositAddress>,
    wallets: HashMap<Uuid, Wallet>,
    output_transactions: HashMap<Uuid, OutputTransaction>,
    audit_log: Vec<AuditRecord>,
}

/// Reference `Store` used by tests and by the composition root when no
/// external persistence layer is wired up. A single mutex guarding all
/// tables gives every transaction exclusive access for its duration —
/// stricter than snapshot isolation, which is all the trait promises.
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { tables: Arc::new(Mutex::new(Tables::default())) }
    }

    pub async fn seed_wallet(&self, wallet: Wallet) {
        self.tables.lock().await.wallets.insert(wallet.id, wallet);
    }

    /// Test convenience: read a wallet without going through the `Store`
    /// trait's `Option`-returning API.
    pub async fn get_wallet_direct(&self, id: Uuid) -> Wallet {
        self.tables.lock().await.wallets.get(&id).cloned().expect("wallet not seeded")
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

struct InMemoryTxn<'a> {
    tables: &'a mut Tables,
}

#[async_trait]
impl<'a> StoreTxn for InMemoryTxn<'a> {
    async fn get_mix_request(&mut self, id: Uuid) -> MixerResult<Option<MixRequest>> {
        Ok(self.tables.mix_requests.get(&id).cloned())
    }

    async fn put_mix_request(&mut self, request: MixRequest) -> MixerResult<()> {
        self.tables.mix_requests.insert(request.id, request);
        Ok(())
    }

    async fn get_deposit_address(&mut self, mix_request_id: Uuid) -> MixerResult<Option<DepositAddress>> {
        Ok(self.tables.deposit_addresses.get(&mix_request_id).cloned())
    }

    async fn put_deposit_address(&mut self, addr: DepositAddress) -> MixerResult<()> {
        self.tables.deposit_addresses.insert(addr.mix_request_id, addr);
        Ok(())
    }

    async fn delete_deposit_address(&mut self, mix_request_id: Uuid) -> MixerResult<()> {
        self.tables.deposit_addresses.remove(&mix_request_id);
        Ok(())
    }

    async fn get_wallet(&mut self, id: Uuid) -> MixerResult<Option<Wallet>> {
        Ok(self.tables.wallets.get(&id).cloned())
    }

    async fn put_wallet(&mut self, wallet: Wallet) -> MixerResult<()> {
        self.tables.wallets.insert(wallet.id, wallet);
        Ok(())
    }

    async fn get_output_transaction(&mut self, id: Uuid) -> MixerResult<Option<OutputTransaction>> {
        Ok(self.tables.output_transactions.get(&id).cloned())
    }

    async fn put_output_transaction(&mut self, tx: OutputTransaction) -> MixerResult<()> {
        self.tables.output_transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn delete_output_transaction(&mut self, id: Uuid) -> MixerResult<()> {
        self.tables.output_transactions.remove(&id);
        Ok(())
    }

    async fn append_audit(&mut self, record: AuditRecord) -> MixerResult<()> {
        self.tables.audit_log.push(record);
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn transaction<'b>(
        &'b self,
        f: Box<dyn FnOnce(&mut dyn StoreTxn) -> MixerResult<()> + Send + 'b>,
    ) -> MixerResult<()> {
        let mut guard = self.tables.lock().await;
        let snapshot = guard.clone();
        let mut txn = InMemoryTxn { tables: &mut guard };
        match f(&mut txn) {
            Ok(()) => Ok(()),
            Err(e) => {
                *guard = snapshot;
                Err(e)
            }
        }
    }

    async fn get_mix_request(&self, id: Uuid) -> MixerResult<Option<MixRequest>> {
        Ok(self.tables.lock().await.mix_requests.get(&id).cloned())
    }

    async fn list_mix_requests_by_status(&self, status: MixStatus) -> MixerResult<Vec<MixRequest>> {
        Ok(self
            .tables
            .lock()
            .await
            .mix_requests
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect())
    }

    async fn select_candidate_wallets(
        &self,
        currency: crate::types::Currency,
    ) -> MixerResult<Vec<Wallet>> {
        let tables = self.tables.lock().await;
        let mut wallets: Vec<Wallet> = tables
            .wallets
            .values()
            .filter(|w| w.currency == currency && w.is_selectable())
            .cloned()
            .collect();
        wallets.sort_by(|a, b| {
            b.balance
                .cmp(&a.balance)
                .then_with(|| a.last_used_at.cmp(&b.last_used_at))
        });
        Ok(wallets)
    }

    async fn get_deposit_address(&self, mix_request_id: Uuid) -> MixerResult<Option<DepositAddress>> {
        Ok(self.tables.lock().await.deposit_addresses.get(&mix_request_id).cloned())
    }

    async fn list_deposit_addresses(&self) -> MixerResult<Vec<DepositAddress>> {
        Ok(self.tables.lock().await.deposit_addresses.values().cloned().collect())
    }

    async fn orphaned_deposit_addresses(
        &self,
        retention_cutoff: DateTime<Utc>,
    ) -> MixerResult<Vec<DepositAddress>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .deposit_addresses
            .values()
            .filter(|addr| match tables.mix_requests.get(&addr.mix_request_id) {
                None => true,
                Some(req) => req.status.is_terminal() && req.updated_at < retention_cutoff,
            })
            .cloned()
            .collect())
    }

    async fn list_output_transactions(&self, mix_request_id: Uuid) -> MixerResult<Vec<OutputTransaction>> {
        Ok(self
            .tables
            .lock()
            .await
            .output_transactions
            .values()
            .filter(|tx| tx.mix_request_id == mix_request_id)
            .cloned()
            .collect())
    }

    async fn orphaned_output_transactions(&self) -> MixerResult<Vec<OutputTransaction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .output_transactions
            .values()
            .filter(|tx| !tables.mix_requests.contains_key(&tx.mix_request_id))
            .cloned()
            .collect())
    }

    async fn duplicate_wallet_addresses(&self) -> MixerResult<Vec<(String, Vec<Wallet>)>> {
        let tables = self.tables.lock().await;
        let mut by_address: HashMap<String, Vec<Wallet>> = HashMap::new();
        for wallet in tables.wallets.values() {
            by_address.entry(wallet.address.clone()).or_default().push(wallet.clone());
        }
        Ok(by_address.into_iter().filter(|(_, ws)| ws.len() > 1).collect())
    }

    async fn duplicate_deposit_addresses(&self) -> MixerResult<Vec<(String, Vec<DepositAddress>)>> {
        let tables = self.tables.lock().await;
        let mut by_address: HashMap<String, Vec<DepositAddress>> = HashMap::new();
        for addr in tables.deposit_addresses.values() {
            by_address.entry(addr.address.clone()).or_default().push(addr.clone());
        }
        Ok(by_address.into_iter().filter(|(_, a)| a.len() > 1).collect())
    }

    async fn list_wallets(&self) -> MixerResult<Vec<Wallet>> {
        Ok(self.tables.lock().await.wallets.values().cloned().collect())
    }

    async fn audit_log(&self) -> MixerResult<Vec<AuditRecord>> {
        Ok(self.tables.lock().await.audit_log.clone())
    }
}

/// Convenience used throughout the engine: run a transaction and surface a
/// `Store` error if the closure itself never ran (can't happen for
/// `InMemoryStore`, but keeps call sites trait-generic).
pub async fn require_mix_request(store: &dyn Store, id: Uuid) -> MixerResult<MixRequest> {
    store.get_mix_request(id).await?.ok_or(MixerError::NotFound(id))
}
