// src/pool/mod.rs
use std::collections::HashSet;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MixerError, MixerResult};
use crate::events::{EventBus, MixerEvent};
use crate::store::Store;
use crate::types::{Currency, PoolStats, Wallet, WalletStatus};

/// Liquidity pool operations: admission into a pool, transactional chunk
/// processing, and wallet selection for payouts. Holds no balances itself —
/// `Wallet` rows in the `Store` are the source of truth; `PoolManager` only
/// enforces the invariants around how they're read and mutated.
pub struct PoolManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    min_pool_size: u32,
    /// Mixes currently holding a chunk lock, keyed by mix request id — guards
    /// against two concurrent chunks of the same mix double-booking a
    /// wallet before the transaction that processes the first one commits.
    locked_mixes: Mutex<HashSet<Uuid>>,
}

impl PoolManager {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, min_pool_size: u32) -> Self {
        Self { store, events, min_pool_size, locked_mixes: Mutex::new(HashSet::new()) }
    }

    /// Current size and participation for a currency's pool. Size is the
    /// sum of selectable pool-kind wallet balances.
    pub async fn stats(&self, currency: Currency) -> MixerResult<PoolStats> {
        let wallets = self.store.list_wallets().await?;
        let pool_wallets: Vec<&Wallet> = wallets
            .iter()
            .filter(|w| w.currency == currency && w.kind == crate::types::WalletKind::Pool)
            .collect();
        let size: Decimal = pool_wallets.iter().map(|w| w.balance).sum();
        let active = pool_wallets.iter().filter(|w| w.is_selectable()).count();
        Ok(PoolStats { currency, size, active_participants: active, average_wait_secs: 0 })
    }

    /// Admits a mix into the pool, emitting `pool:depleted`/`pool:overflow`
    /// when the resulting size crosses below `min_pool_size` or doubles it.
    pub async fn enter(&self, currency: Currency, amount: Decimal) -> MixerResult<()> {
        let stats_before = self.stats(currency).await?;
        let projected = stats_before.size + amount;
        if projected < Decimal::from(self.min_pool_size) {
            self.events.publish(MixerEvent::PoolDepleted { currency, size: projected });
        }
        if stats_before.size > Decimal::ZERO && projected > stats_before.size * Decimal::from(2) {
            self.events.publish(MixerEvent::PoolOverflow { currency, size: projected });
        }
        Ok(())
    }

    /// Wallets eligible to fund a payout, ordered `balance DESC, last_used_at
    /// ASC`, restricted to `is_selectable` rows of the given currency.
    pub async fn select_wallets(&self, currency: Currency) -> MixerResult<Vec<Wallet>> {
        self.store.select_candidate_wallets(currency).await
    }

    /// Debits `from_wallet` and credits the implicit pool balance for one
    /// chunk of a PoolMixing mix, inside a single `Store` transaction so the
    /// debit either fully lands or not at all — never a partial update that
    /// leaves the wallet negative. Concurrent chunks belonging to the same
    /// `mix_request_id` are serialized via `locked_mixes` so a chunk is
    /// counted exactly once.
    pub async fn process_chunk(
        &self,
        mix_request_id: Uuid,
        from_wallet: Uuid,
        amount: Decimal,
    ) -> MixerResult<()> {
        {
            let mut locked = self.locked_mixes.lock().await;
            if !locked.insert(mix_request_id) {
                return Err(MixerError::AdmissionRejected(format!(
                    "mix {mix_request_id} already has a chunk in flight"
                )));
            }
        }

        let result = self
            .store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    let mut wallet = txn
                        .get_wallet(from_wallet)
                        .await?
                        .ok_or(MixerError::NotFound(from_wallet))?;
                    if !wallet.is_selectable() {
                        return Err(MixerError::AdmissionRejected(format!(
                            "wallet {from_wallet} is not selectable"
                        )));
                    }
                    if wallet.balance < amount {
                        return Err(MixerError::AdmissionRejected(format!(
                            "wallet {from_wallet} balance {} below chunk amount {amount}",
                            wallet.balance
                        )));
                    }
                    wallet.balance -= amount;
                    wallet.last_used_at = Some(chrono::Utc::now());
                    txn.put_wallet(wallet).await
                })
            }))
            .await;

        self.locked_mixes.lock().await.remove(&mix_request_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::WalletKind;

    fn wallet(currency: Currency, balance: Decimal) -> Wallet {
        Wallet {
            id: Uuid::new_v4(),
            address: format!("w-{}", Uuid::new_v4()),
            currency,
            kind: WalletKind::Pool,
            balance,
            is_active: true,
            is_locked: false,
            status: WalletStatus::Active,
            last_used_at: None,
        }
    }

    #[tokio::test]
    async fn process_chunk_never_lets_balance_go_negative() {
        let store = Arc::new(InMemoryStore::new());
        let (bus, _rx) = EventBus::new(16);
        let pool = PoolManager::new(store.clone(), Arc::new(bus), 10);

        let w = wallet(Currency::BTC, Decimal::new(100, 2));
        let wallet_id = w.id;
        store.seed_wallet(w).await;

        let mix_id = Uuid::new_v4();
        let result = pool.process_chunk(mix_id, wallet_id, Decimal::new(200, 2)).await;
        assert!(result.is_err());

        let stored = store.get_wallet_direct(wallet_id).await;
        assert_eq!(stored.balance, Decimal::new(100, 2));
    }

    #[tokio::test]
    async fn process_chunk_debits_exactly_once() {
        let store = Arc::new(InMemoryStore::new());
        let (bus, _rx) = EventBus::new(16);
        let pool = PoolManager::new(store.clone(), Arc::new(bus), 10);

        let w = wallet(Currency::BTC, Decimal::new(1000, 2));
        let wallet_id = w.id;
        store.seed_wallet(w).await;

        let mix_id = Uuid::new_v4();
        pool.process_chunk(mix_id, wallet_id, Decimal::new(300, 2)).await.unwrap();

        let stored = store.get_wallet_direct(wallet_id).await;
        assert_eq!(stored.balance, Decimal::new(700, 2));
    }

    #[tokio::test]
    async fn chunk_lock_is_released_after_completion_for_reuse() {
        let store = Arc::new(InMemoryStore::new());
        let (bus, _rx) = EventBus::new(16);
        let pool = PoolManager::new(store.clone(), Arc::new(bus), 10);

        let w = wallet(Currency::BTC, Decimal::new(1000, 2));
        let wallet_id = w.id;
        store.seed_wallet(w).await;
        let mix_id = Uuid::new_v4();

        pool.process_chunk(mix_id, wallet_id, Decimal::new(100, 2)).await.unwrap();
        pool.process_chunk(mix_id, wallet_id, Decimal::new(100, 2)).await.unwrap();

        let stored = store.get_wallet_direct(wallet_id).await;
        assert_eq!(stored.balance, Decimal::new(800, 2));
    }
}
