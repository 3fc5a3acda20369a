// src/mixing/mod.rs
pub mod context;
pub mod strategy;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use uuid::Uuid;

use crate::config::MixerConfig;
use crate::error::{MixerError, MixerResult};
use crate::events::{EventBus, MixerEvent};
use crate::gateway::BlockchainGateway;
use crate::pool::PoolManager;
use crate::scheduler::{PayoutExecutor, Scheduler};
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::types::{
    Currency, DepositAddress, MixRequest, MixStatus, MixingContext, OutputTransaction,
    OutputTxStatus, Phase, Strategy,
};

/// Point-in-time view of an admitted mix: its durable `MixRequest` row plus,
/// while a supervisor task is still running it, a snapshot of its
/// in-process `MixingContext`.
#[derive(Debug, Clone)]
pub struct MixStatusView {
    pub request: MixRequest,
    pub context: Option<MixingContext>,
}

enum ContextCommand {
    Status(oneshot::Sender<MixingContext>),
    Stop(oneshot::Sender<()>),
}

/// Admits `MixRequest`s, picks a mixing strategy, and drives each admitted
/// mix through its phase machine. Each admitted mix runs in its own
/// supervisor task that privately owns the live `MixingContext` — `status`
/// and `stop` reach it by sending a command over a per-mix channel rather
/// than through a shared lock over mixing state, so one mix's processing
/// never blocks another's.
pub struct MixingEngine {
    store: Arc<dyn Store>,
    gateway: Arc<dyn BlockchainGateway>,
    pool: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    events: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    config: Arc<MixerConfig>,
    handles: Mutex<HashMap<Uuid, mpsc::Sender<ContextCommand>>>,
    admission: Arc<Semaphore>,
}

impl MixingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn BlockchainGateway>,
        pool: Arc<PoolManager>,
        scheduler: Arc<Scheduler>,
        events: Arc<EventBus>,
        telemetry: Arc<Telemetry>,
        config: Arc<MixerConfig>,
    ) -> Arc<Self> {
        let admission = Arc::new(Semaphore::new(config.max_concurrent_mixes));
        Arc::new(Self {
            store,
            gateway,
            pool,
            scheduler,
            events,
            telemetry,
            config,
            handles: Mutex::new(HashMap::new()),
            admission,
        })
    }

    /// Validates, admits under the concurrency cap, persists, and spawns the
    /// supervisor task that drives the mix to completion or failure.
    pub async fn submit(self: &Arc<Self>, request: MixRequest) -> MixerResult<Uuid> {
        request.validate()?;

        let permit = Arc::clone(&self.admission)
            .try_acquire_owned()
            .map_err(|_| MixerError::AdmissionRejected("max_concurrent_mixes reached".to_string()))?;

        let id = request.id;
        let deposit_address = DepositAddress {
            mix_request_id: id,
            address: request.deposit_address.clone(),
            currency: request.currency,
            used: false,
            created_at: request.created_at,
        };

        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    txn.put_mix_request(request).await?;
                    txn.put_deposit_address(deposit_address).await
                })
            }))
            .await?;

        let (tx, rx) = mpsc::channel(8);
        self.handles.lock().await.insert(id, tx);
        self.telemetry.incr("mixes_submitted").await;

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            engine.run(id, rx).await;
            engine.handles.lock().await.remove(&id);
        });

        Ok(id)
    }

    /// Rebuilds a supervisor task for every persisted `MixRequest` that is
    /// not in a terminal status, so a restart picks each one up from its
    /// persisted phase instead of abandoning it mid-mix. Unlike `submit`,
    /// admission here awaits a permit rather than rejecting outright — the
    /// set of mixes to resume is fixed at call time, not bounded by
    /// concurrent caller pressure.
    pub async fn resume_all(self: &Arc<Self>) -> MixerResult<usize> {
        let mut resumed = 0;
        for status in [MixStatus::Pending, MixStatus::Deposited, MixStatus::Pooling, MixStatus::Mixing] {
            for request in self.store.list_mix_requests_by_status(status).await? {
                self.resume_one(request.id).await;
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    async fn resume_one(self: &Arc<Self>, id: Uuid) {
        let permit = match Arc::clone(&self.admission).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let (tx, rx) = mpsc::channel(8);
        self.handles.lock().await.insert(id, tx);

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            engine.run(id, rx).await;
            engine.handles.lock().await.remove(&id);
        });
    }

    pub async fn status(&self, id: Uuid) -> MixerResult<MixStatusView> {
        let request = crate::store::require_mix_request(self.store.as_ref(), id).await?;

        let handle = self.handles.lock().await.get(&id).cloned();
        let context = match handle {
            Some(sender) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                if sender.send(ContextCommand::Status(reply_tx)).await.is_ok() {
                    reply_rx.await.ok()
                } else {
                    None
                }
            }
            None => None,
        };

        Ok(MixStatusView { request, context })
    }

    /// Requests the supervisor task stop at its next checkpoint, and marks
    /// the request `Cancelled` if it hasn't already reached a terminal
    /// status.
    pub async fn stop(&self, id: Uuid) -> MixerResult<()> {
        let handle = self.handles.lock().await.get(&id).cloned();
        if let Some(sender) = handle {
            let (reply_tx, reply_rx) = oneshot::channel();
            if sender.send(ContextCommand::Stop(reply_tx)).await.is_ok() {
                let _ = reply_rx.await;
            }
        }

        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    if let Some(mut request) = txn.get_mix_request(id).await? {
                        if !request.status.is_terminal() {
                            request.status = MixStatus::Cancelled;
                            request.updated_at = Utc::now();
                            txn.put_mix_request(request).await?;
                        }
                    }
                    Ok(())
                })
            }))
            .await
    }

    async fn run(self: Arc<Self>, id: Uuid, mut commands: mpsc::Receiver<ContextCommand>) {
        let outcome = tokio::time::timeout(self.config.max_mixing_time, self.drive(id, &mut commands)).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.fail(id, &err).await;
            }
            Err(_) => {
                let elapsed_secs = self.config.max_mixing_time.as_secs();
                self.events.publish(MixerEvent::MixTimeout { mix_request_id: id, elapsed_secs });
                self.fail(id, &MixerError::Timeout { elapsed_secs }).await;
            }
        }

        // Drain any late Status/Stop requests so callers don't hang.
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                ContextCommand::Status(_) => {}
                ContextCommand::Stop(reply) => {
                    let _ = reply.send(());
                }
            }
        }
    }

    async fn fail(&self, id: Uuid, error: &MixerError) {
        let code = error.code().to_string();
        let message = error.to_string();
        let _ = self
            .store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    if let Some(mut request) = txn.get_mix_request(id).await? {
                        if !request.status.is_terminal() {
                            request.status = MixStatus::Failed;
                            request.error_code = Some(code.clone());
                            request.error_message = Some(message.clone());
                            request.updated_at = Utc::now();
                            txn.put_mix_request(request).await?;
                        }
                    }
                    Ok(())
                })
            }))
            .await;
        self.events.publish(MixerEvent::MixFailed { mix_request_id: id, error_code: error.code().to_string() });
        self.telemetry.incr("mixes_failed").await;
    }

    async fn checkpoint(commands: &mut mpsc::Receiver<ContextCommand>, ctx: &MixingContext) -> MixerResult<()> {
        if let Ok(cmd) = commands.try_recv() {
            match cmd {
                ContextCommand::Status(reply) => {
                    let _ = reply.send(ctx.clone());
                }
                ContextCommand::Stop(reply) => {
                    let _ = reply.send(());
                    return Err(MixerError::AdmissionRejected("stopped".to_string()));
                }
            }
        }
        Ok(())
    }

    /// Drives a mix from whatever status it was persisted at — `Pending` for
    /// a fresh submission, or `Deposited`/`Pooling`/`Mixing` for a mix picked
    /// back up by `resume_all` after a restart. Each branch only runs the
    /// phases its persisted status hasn't already passed.
    async fn drive(self: &Arc<Self>, id: Uuid, commands: &mut mpsc::Receiver<ContextCommand>) -> MixerResult<()> {
        let request = crate::store::require_mix_request(self.store.as_ref(), id).await?;

        if request.status == MixStatus::Pending {
            self.await_deposit(&request, commands).await?;
            self.transition(id, MixStatus::Deposited).await?;
            self.mark_deposit_used(id).await?;
            self.transition(id, MixStatus::Pooling).await?;
        } else if request.status == MixStatus::Deposited {
            self.mark_deposit_used(id).await?;
            self.transition(id, MixStatus::Pooling).await?;
        }

        let final_ctx = self.run_mixing_with_retries(id, &request, commands).await?;

        self.schedule_payouts(&request).await?;
        self.transition(id, MixStatus::Completed).await?;
        self.events.publish(MixerEvent::MixCompleted { mix_request_id: id, strategy: final_ctx.strategy });
        self.telemetry.incr("mixes_completed").await;
        Ok(())
    }

    /// Runs the strategy-selection-through-phase-machine attempt, retrying
    /// on a retryable error with `60s * retry_count` linear backoff up to
    /// `max_retry_attempts`. Each attempt re-reads the pooling band and
    /// re-selects a strategy, since the peer set may have changed since the
    /// previous attempt.
    async fn run_mixing_with_retries(
        &self,
        id: Uuid,
        request: &MixRequest,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<MixingContext> {
        loop {
            match self.execute_mixing_attempt(request, commands).await {
                Ok(ctx) => return Ok(ctx),
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    let retry_count = self.increment_retry_count(id).await?;
                    if retry_count > self.config.max_retry_attempts {
                        return Err(err);
                    }
                    let backoff = Duration::from_secs(60 * retry_count as u64);
                    tracing::warn!(
                        mix_request_id = %id,
                        retry_count,
                        error = %err,
                        "mixing phase failed, retrying after linear backoff"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    async fn execute_mixing_attempt(
        &self,
        request: &MixRequest,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<MixingContext> {
        let peers = self.store.list_mix_requests_by_status(MixStatus::Pooling).await?;
        let now = Utc::now();
        let band = strategy::band_candidates(request, &peers, now);
        let pool_stats = self.pool.stats(request.currency).await?;
        let chosen = strategy::select_strategy(
            band.len(),
            pool_stats.size,
            self.config.min_coinjoin_participants,
            self.config.min_pool_size,
        );

        self.transition(request.id, MixStatus::Mixing).await?;
        let mut ctx = MixingContext::new(request.id, chosen, Utc::now());
        ctx.participants = band.iter().map(|r| r.id).chain(std::iter::once(request.id)).collect();

        match chosen {
            Strategy::CoinJoin => self.run_coinjoin(request, ctx, commands).await,
            Strategy::PoolMixing => self.run_pool_mixing(request, ctx, commands).await,
            Strategy::FastMix => self.run_fast_mix(request, ctx, commands).await,
        }
    }

    /// Bumps `retry_count` on the persisted request and returns the new
    /// value, so backoff duration and the retry-attempt ceiling are both
    /// driven off durable state rather than an in-process counter that
    /// would reset across a crash.
    async fn increment_retry_count(&self, id: Uuid) -> MixerResult<u32> {
        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    let mut request = txn.get_mix_request(id).await?.ok_or(MixerError::NotFound(id))?;
                    request.retry_count += 1;
                    request.updated_at = Utc::now();
                    txn.put_mix_request(request).await
                })
            }))
            .await?;
        let request = crate::store::require_mix_request(self.store.as_ref(), id).await?;
        Ok(request.retry_count)
    }

    async fn await_deposit(
        &self,
        request: &MixRequest,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<()> {
        loop {
            let deposits = self.gateway.observe_deposits(request.currency, &request.deposit_address).await?;
            let total: rust_decimal::Decimal = deposits.into_iter().sum();
            if total >= request.input_amount {
                return Ok(());
            }
            if Utc::now() >= request.expires_at {
                return Err(MixerError::Timeout { elapsed_secs: request.delay_seconds });
            }
            let ctx = MixingContext::new(request.id, Strategy::FastMix, Utc::now());
            Self::checkpoint(commands, &ctx).await?;
            tokio::time::sleep(self.config.phase_delay).await;
        }
    }

    async fn mark_deposit_used(&self, id: Uuid) -> MixerResult<()> {
        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    if let Some(mut addr) = txn.get_deposit_address(id).await? {
                        addr.used = true;
                        txn.put_deposit_address(addr).await?;
                    }
                    Ok(())
                })
            }))
            .await
    }

    async fn transition(&self, id: Uuid, status: MixStatus) -> MixerResult<()> {
        self.store
            .transaction(Box::new(move |txn| {
                futures::executor::block_on(async {
                    let mut request = txn.get_mix_request(id).await?.ok_or(MixerError::NotFound(id))?;
                    request.status = status;
                    request.updated_at = Utc::now();
                    txn.put_mix_request(request).await
                })
            }))
            .await
    }

    async fn run_coinjoin(
        &self,
        request: &MixRequest,
        mut ctx: MixingContext,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<MixingContext> {
        ctx.current_phase = Phase::Coordination;
        Self::checkpoint(commands, &ctx).await?;
        tokio::time::sleep(self.config.coordination_timeout.min(self.config.phase_delay)).await;

        if ctx.participants.len() < self.config.min_coinjoin_participants {
            let pool_stats = self.pool.stats(request.currency).await?;
            let downgraded = strategy::downgrade_after_coordination_timeout(
                ctx.participants.len(),
                pool_stats.size,
                self.config.min_coinjoin_participants,
                self.config.min_pool_size,
            );
            self.events.publish(MixerEvent::StrategyDowngraded {
                mix_request_id: request.id,
                from: Strategy::CoinJoin,
                to: downgraded,
            });
            let mut new_ctx = MixingContext::new(request.id, downgraded, ctx.started_at);
            new_ctx.participants = ctx.participants.clone();
            return match downgraded {
                Strategy::PoolMixing => self.run_pool_mixing(request, new_ctx, commands).await,
                Strategy::FastMix => self.run_fast_mix(request, new_ctx, commands).await,
                Strategy::CoinJoin => Err(MixerError::StrategyDowngrade(
                    "coordination timed out with no viable fallback".to_string(),
                )),
            };
        }

        ctx.current_phase = Phase::Signing;
        ctx.progress = context::progress_for_phase(Strategy::CoinJoin, Phase::Signing);
        Self::checkpoint(commands, &ctx).await?;
        tokio::time::sleep(self.config.signing_timeout.min(self.config.phase_delay)).await;

        let template = self
            .gateway
            .build_coinjoin(request.currency, &ctx.participants, request.input_amount)
            .await?;
        let mut signatures = Vec::new();
        for participant in &ctx.participants {
            signatures.push(self.gateway.sign_partial(request.currency, &template, *participant).await?);
        }
        let combined = self.gateway.combine(request.currency, &template, &signatures).await?;

        ctx.current_phase = Phase::Broadcast;
        ctx.progress = context::progress_for_phase(Strategy::CoinJoin, Phase::Broadcast);
        Self::checkpoint(commands, &ctx).await?;
        let txid = self.gateway.broadcast(request.currency, &combined).await?;
        ctx.broadcast_txids.push(txid);

        Ok(ctx)
    }

    async fn run_pool_mixing(
        &self,
        request: &MixRequest,
        mut ctx: MixingContext,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<MixingContext> {
        ctx.current_phase = Phase::PoolEntry;
        Self::checkpoint(commands, &ctx).await?;
        self.pool.enter(request.currency, request.input_amount).await?;
        tokio::time::sleep(self.config.phase_delay).await;

        ctx.current_phase = Phase::Mixing;
        ctx.progress = context::progress_for_phase(Strategy::PoolMixing, Phase::Mixing);
        let wallets = self.pool.select_wallets(request.currency).await?;
        if wallets.is_empty() {
            return Err(MixerError::PermanentGateway(format!(
                "no selectable pool wallets for {:?}",
                request.currency
            )));
        }
        let chunks = split_into_chunks(
            request.input_amount,
            self.config.pool_min_chunk_fraction,
            self.config.pool_max_chunk_fraction,
        );
        for (i, chunk) in chunks.into_iter().enumerate() {
            Self::checkpoint(commands, &ctx).await?;
            let wallet = &wallets[i % wallets.len()];
            self.pool.process_chunk(request.id, wallet.id, chunk).await?;
            ctx.chunks.push(chunk);
            tokio::time::sleep(random_duration_upto(self.config.phase_delay / 4)).await;
        }

        ctx.current_phase = Phase::Distribution;
        ctx.progress = context::progress_for_phase(Strategy::PoolMixing, Phase::Distribution);
        Self::checkpoint(commands, &ctx).await?;

        Ok(ctx)
    }

    async fn run_fast_mix(
        &self,
        request: &MixRequest,
        mut ctx: MixingContext,
        commands: &mut mpsc::Receiver<ContextCommand>,
    ) -> MixerResult<MixingContext> {
        ctx.current_phase = Phase::Obfuscation;
        for hop in 0..3 {
            Self::checkpoint(commands, &ctx).await?;
            ctx.intermediate_addresses.push(format!("hop-{}-{}", request.id, hop));
            tokio::time::sleep(self.config.phase_delay.max(std::time::Duration::from_millis(1))).await;
        }

        ctx.current_phase = Phase::Transfer;
        ctx.progress = context::progress_for_phase(Strategy::FastMix, Phase::Transfer);
        Self::checkpoint(commands, &ctx).await?;

        if let Some(address) = ctx.last_intermediate_address() {
            let txid = self.gateway.broadcast(request.currency, address.as_bytes()).await?;
            ctx.broadcast_txids.push(txid);
        }

        Ok(ctx)
    }

    async fn schedule_payouts(&self, request: &MixRequest) -> MixerResult<()> {
        for (index, output) in request.output_addresses.iter().enumerate() {
            let share = request.input_amount * rust_decimal::Decimal::from(output.percent_basis_points)
                / rust_decimal::Decimal::from(10_000u32);
            let delay = chrono::Duration::seconds(request.delay_seconds as i64);
            let fire_at = Utc::now() + delay;

            let tx = OutputTransaction {
                id: Uuid::new_v4(),
                mix_request_id: request.id,
                output_index: index,
                address: output.address.clone(),
                amount: share,
                txid: None,
                status: OutputTxStatus::Pending,
                scheduled_for: fire_at,
            };
            self.store
                .transaction(Box::new(move |txn| {
                    futures::executor::block_on(txn.put_output_transaction(tx))
                }))
                .await?;

            self.scheduler.schedule(request.id, index, fire_at).await;
            self.events.publish(MixerEvent::PayoutScheduled {
                mix_request_id: request.id,
                output_index: index,
                fire_at,
            });
        }
        Ok(())
    }
}

/// Splits `total` into randomly-sized chunks, each drawn uniformly from
/// `[min_fraction, max_fraction]` of `total`, except the last chunk, which
/// absorbs whatever remains so the chunks always sum to exactly `total`
/// regardless of rounding in the earlier draws.
fn split_into_chunks(total: Decimal, min_fraction: Decimal, max_fraction: Decimal) -> Vec<Decimal> {
    let chunk_count = rand::thread_rng().gen_range(2..=4usize);
    let mut chunks = Vec::with_capacity(chunk_count);
    let mut remaining = total;

    for _ in 0..chunk_count - 1 {
        let lo = (total * min_fraction).min(remaining).max(Decimal::ZERO);
        let hi = (total * max_fraction).min(remaining).max(lo);
        let chunk = random_decimal_between(lo, hi);
        chunks.push(chunk);
        remaining -= chunk;
    }
    chunks.push(remaining);
    chunks
}

/// Draws a `Decimal` uniformly from `[lo, hi]` at cent granularity.
fn random_decimal_between(lo: Decimal, hi: Decimal) -> Decimal {
    let cents_lo = (lo * Decimal::from(100)).round_dp(0).mantissa() as i64;
    let cents_hi = (hi * Decimal::from(100)).round_dp(0).mantissa() as i64;
    let (cents_lo, cents_hi) = if cents_lo <= cents_hi { (cents_lo, cents_hi) } else { (cents_hi, cents_lo) };
    let cents = rand::thread_rng().gen_range(cents_lo..=cents_hi);
    Decimal::new(cents, 2)
}

/// Draws a `Duration` uniformly from `[0, max]`.
fn random_duration_upto(max: Duration) -> Duration {
    if max.is_zero() {
        return max;
    }
    let millis = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
    Duration::from_millis(millis)
}

/// Runs one scheduled payout: looks up the pending `OutputTransaction`,
/// broadcasts it through the gateway, and records the resulting txid.
#[async_trait]
impl PayoutExecutor for MixingEngine {
    async fn execute(&self, mix_request_id: Uuid, output_index: usize) -> MixerResult<()> {
        let txs = self.store.list_output_transactions(mix_request_id).await?;
        let mut tx = txs
            .into_iter()
            .find(|t| t.output_index == output_index)
            .ok_or(MixerError::NotFound(mix_request_id))?;

        let request = crate::store::require_mix_request(self.store.as_ref(), mix_request_id).await?;
        let txid = self.gateway.broadcast(request.currency, tx.address.as_bytes()).await?;
        tx.txid = Some(txid);
        tx.status = OutputTxStatus::Broadcast;

        self.store
            .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_output_transaction(tx))))
            .await?;
        self.events.publish(MixerEvent::PayoutFired { mix_request_id, output_index });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockGateway;
    use crate::store::InMemoryStore;
    use crate::types::OutputTarget;
    use std::time::Duration;

    fn test_config() -> MixerConfig {
        let mut config = MixerConfig::default();
        config.phase_delay = Duration::from_millis(1);
        config.coordination_timeout = Duration::from_millis(1);
        config.signing_timeout = Duration::from_millis(1);
        config.max_mixing_time = Duration::from_secs(5);
        config.min_pool_size = 10;
        config.min_coinjoin_participants = 3;
        config
    }

    fn sample_request(amount: rust_decimal::Decimal, deposit_address: &str) -> MixRequest {
        let now = Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::BTC,
            input_amount: amount,
            deposit_address: deposit_address.to_string(),
            output_addresses: vec![OutputTarget { address: "out1".to_string(), percent_basis_points: 10_000 }],
            delay_seconds: 0,
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

    async fn build_engine() -> (Arc<MixingEngine>, Arc<InMemoryStore>, Arc<MockGateway>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let (bus, _rx) = EventBus::new(64);
        let events = Arc::new(bus);
        let pool = Arc::new(PoolManager::new(store.clone(), events.clone(), 10));
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(0), 3));
        let telemetry = Arc::new(Telemetry::new());
        let config = Arc::new(test_config());
        let engine = MixingEngine::new(store.clone(), gateway.clone(), pool, scheduler, events, telemetry, config);
        (engine, store, gateway)
    }

    #[tokio::test]
    async fn fast_mix_submission_completes_with_low_pool_and_no_peers() {
        let (engine, _store, gateway) = build_engine().await;
        let request = sample_request(rust_decimal::Decimal::new(100, 2), "addr-fastmix");
        gateway.seed_deposit("addr-fastmix", rust_decimal::Decimal::new(100, 2)).await;

        let id = engine.submit(request).await.unwrap();

        let mut status = engine.status(id).await.unwrap();
        let mut attempts = 0;
        while status.request.status != MixStatus::Completed && attempts < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = engine.status(id).await.unwrap();
            attempts += 1;
        }

        assert_eq!(status.request.status, MixStatus::Completed);
    }

    #[tokio::test]
    async fn admission_is_rejected_once_concurrency_cap_is_reached() {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(MockGateway::new());
        let (bus, _rx) = EventBus::new(64);
        let events = Arc::new(bus);
        let pool = Arc::new(PoolManager::new(store.clone(), events.clone(), 10));
        let scheduler = Arc::new(Scheduler::new(Duration::from_secs(0), 3));
        let telemetry = Arc::new(Telemetry::new());
        let mut config = test_config();
        config.max_concurrent_mixes = 1;
        config.max_mixing_time = Duration::from_secs(60);
        let config = Arc::new(config);
        let engine = MixingEngine::new(store, gateway.clone(), pool, scheduler, events, telemetry, config);

        let first = sample_request(rust_decimal::Decimal::new(100, 2), "addr-a");
        let second = sample_request(rust_decimal::Decimal::new(100, 2), "addr-b");
        engine.submit(first).await.unwrap();
        let result = engine.submit(second).await;
        assert!(matches!(result, Err(MixerError::AdmissionRejected(_))));
    }

    #[test]
    fn split_into_chunks_always_sums_exactly_to_the_total() {
        let total = rust_decimal::Decimal::new(10_000, 2);
        for _ in 0..50 {
            let chunks = split_into_chunks(total, rust_decimal::Decimal::new(10, 2), rust_decimal::Decimal::new(40, 2));
            assert!((2..=4).contains(&chunks.len()));
            let sum: rust_decimal::Decimal = chunks.iter().sum();
            assert_eq!(sum, total);
        }
    }

    #[tokio::test]
    async fn increment_retry_count_persists_and_returns_the_new_value() {
        let (engine, store, _gateway) = build_engine().await;
        let request = sample_request(rust_decimal::Decimal::new(100, 2), "addr-retry");
        let id = request.id;
        store
            .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_mix_request(request))))
            .await
            .unwrap();

        let first = engine.increment_retry_count(id).await.unwrap();
        let second = engine.increment_retry_count(id).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        let persisted = crate::store::require_mix_request(store.as_ref(), id).await.unwrap();
        assert_eq!(persisted.retry_count, 2);
    }

    #[tokio::test]
    async fn resume_all_picks_up_a_pooling_request_and_completes_it() {
        let (engine, store, _gateway) = build_engine().await;
        let request = sample_request(rust_decimal::Decimal::new(100, 2), "addr-resume");
        let request = MixRequest { status: MixStatus::Pooling, ..request };
        let id = request.id;
        store
            .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_mix_request(request))))
            .await
            .unwrap();

        let resumed = engine.resume_all().await.unwrap();
        assert_eq!(resumed, 1);

        let mut status = engine.status(id).await.unwrap();
        let mut attempts = 0;
        while status.request.status != MixStatus::Completed && attempts < 200 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = engine.status(id).await.unwrap();
            attempts += 1;
        }
        assert_eq!(status.request.status, MixStatus::Completed);
    }

    #[tokio::test]
    async fn resume_all_does_not_touch_already_terminal_requests() {
        let (engine, store, _gateway) = build_engine().await;
        let request = sample_request(rust_decimal::Decimal::new(100, 2), "addr-done");
        let request = MixRequest { status: MixStatus::Completed, ..request };
        store
            .transaction(Box::new(move |txn| futures::executor::block_on(txn.put_mix_request(request))))
            .await
            .unwrap();

        let resumed = engine.resume_all().await.unwrap();
        assert_eq!(resumed, 0);
    }
}
