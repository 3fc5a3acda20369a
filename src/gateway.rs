// src/gateway.rs
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::MixerResult;
use crate::types::Currency;

/// A participant's signed contribution to a CoinJoin transaction.
#[derive(Debug, Clone)]
pub struct PartialSignature {
    pub participant: Uuid,
    pub signature: Vec<u8>,
}

/// Chain-facing capability the mixing engine programs against. Implementors
/// own everything node/RPC-specific; the engine only ever sees these six
/// operations. `MockGateway` is the only implementation this crate ships —
/// wiring to a real node is out of scope for this crate.
#[async_trait]
pub trait BlockchainGateway: Send + Sync {
    /// Broadcasts a raw transaction, returning its txid.
    async fn broadcast(&self, currency: Currency, raw_tx: &[u8]) -> MixerResult<String>;

    /// Confirmation depth for a previously broadcast txid. `0` until it
    /// first appears in a block.
    async fn get_confirmations(&self, currency: Currency, txid: &str) -> MixerResult<u32>;

    /// Assembles an unsigned CoinJoin transaction template from a set of
    /// participant inputs and the combined output list, returning bytes
    /// each participant signs independently.
    async fn build_coinjoin(
        &self,
        currency: Currency,
        participants: &[Uuid],
        chunk_amount: Decimal,
    ) -> MixerResult<Vec<u8>>;

    /// One participant's signature over a CoinJoin template.
    async fn sign_partial(
        &self,
        currency: Currency,
        template: &[u8],
        participant: Uuid,
    ) -> MixerResult<PartialSignature>;

    /// Combines partial signatures into a final, broadcastable transaction.
    async fn combine(
        &self,
        currency: Currency,
        template: &[u8],
        signatures: &[PartialSignature],
    ) -> MixerResult<Vec<u8>>;

    /// Deposits seen on a given address since it was allocated, newest last.
    async fn observe_deposits(&self, currency: Currency, address: &str) -> MixerResult<Vec<Decimal>>;
}

#[derive(Default)]
struct MockState {
    confirmations: HashMap<String, u32>,
    deposits: HashMap<String, Vec<Decimal>>,
    broadcast_log: Vec<(Currency, String)>,
}

/// Deterministic in-memory gateway used by tests. Every broadcast confirms
/// immediately; `observe_deposits` and `confirmations` are seeded directly
/// by test setup rather than simulated.
pub struct MockGateway {
    state: Arc<Mutex<MockState>>,
    auto_confirm: u32,
}

impl MockGateway {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(MockState::default())), auto_confirm: 6 }
    }

    pub fn with_auto_confirm(auto_confirm: u32) -> Self {
        Self { state: Arc::new(Mutex::new(MockState::default())), auto_confirm }
    }

    pub async fn seed_deposit(&self, address: &str, amount: Decimal) {
        self.state
            .lock()
            .await
            .deposits
            .entry(address.to_string())
            .or_default()
            .push(amount);
    }

    pub async fn broadcast_log(&self) -> Vec<(Currency, String)> {
        self.state.lock().await.broadcast_log.clone()
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockchainGateway for MockGateway {
    async fn broadcast(&self, currency: Currency, raw_tx: &[u8]) -> MixerResult<String> {
        let txid = format!("mock-{:x}", md5_like_digest(raw_tx));
        let mut state = self.state.lock().await;
        state.confirmations.insert(txid.clone(), self.auto_confirm);
        state.broadcast_log.push((currency, txid.clone()));
        Ok(txid)
    }

    async fn get_confirmations(&self, _currency: Currency, txid: &str) -> MixerResult<u32> {
        Ok(self.state.lock().await.confirmations.get(txid).copied().unwrap_or(0))
    }

    async fn build_coinjoin(
        &self,
        _currency: Currency,
        participants: &[Uuid],
        chunk_amount: Decimal,
    ) -> MixerResult<Vec<u8>> {
        let mut template = chunk_amount.to_string().into_bytes();
        for p in participants {
            template.extend_from_slice(p.as_bytes());
        }
        Ok(template)
    }

    async fn sign_partial(
        &self,
        _currency: Currency,
        template: &[u8],
        participant: Uuid,
    ) -> MixerResult<PartialSignature> {
        let mut signature = template.to_vec();
        signature.extend_from_slice(participant.as_bytes());
        Ok(PartialSignature { participant, signature })
    }

    async fn combine(
        &self,
        _currency: Currency,
        template: &[u8],
        signatures: &[PartialSignature],
    ) -> MixerResult<Vec<u8>> {
        let mut combined = template.to_vec();
        for sig in signatures {
            combined.extend_from_slice(&sig.signature);
        }
        Ok(combined)
    }

    async fn observe_deposits(&self, _currency: Currency, address: &str) -> MixerResult<Vec<Decimal>> {
        Ok(self.state.lock().await.deposits.get(address).cloned().unwrap_or_default())
    }
}

/// Cheap content hash for deterministic mock txids. Not cryptographic —
/// `MockGateway` only needs stable, distinct ids per payload.
fn md5_like_digest(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn broadcast_then_confirmations_are_visible() {
        let gw = MockGateway::new();
        let txid = gw.broadcast(Currency::BTC, b"payload").await.unwrap();
        assert_eq!(gw.get_confirmations(Currency::BTC, &txid).await.unwrap(), 6);
    }

    #[tokio::test]
    async fn coinjoin_round_trip_combines_all_signatures() {
        let gw = MockGateway::new();
        let participants = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let template = gw
            .build_coinjoin(Currency::BTC, &participants, Decimal::new(100, 2))
            .await
            .unwrap();
        let mut sigs = Vec::new();
        for p in &participants {
            sigs.push(gw.sign_partial(Currency::BTC, &template, *p).await.unwrap());
        }
        let combined = gw.combine(Currency::BTC, &template, &sigs).await.unwrap();
        assert!(combined.len() > template.len());
    }

    #[tokio::test]
    async fn seeded_deposits_are_observable() {
        let gw = MockGateway::new();
        gw.seed_deposit("addr1", Decimal::new(500, 2)).await;
        let deposits = gw.observe_deposits(Currency::BTC, "addr1").await.unwrap();
        assert_eq!(deposits, vec![Decimal::new(500, 2)]);
    }
}
