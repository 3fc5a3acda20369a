// src/lib.rs
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod mixing;
pub mod pool;
pub mod recovery;
pub mod scheduler;
pub mod security;
pub mod store;
pub mod telemetry;
pub mod types;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::MixerConfig;
use crate::error::MixerResult;
use crate::events::EventBus;
use crate::gateway::BlockchainGateway;
use crate::mixing::{MixStatusView, MixingEngine};
use crate::pool::PoolManager;
use crate::recovery::{Issue, RecoveryManager};
use crate::scheduler::Scheduler;
use crate::security::EncryptionManager;
use crate::store::Store;
use crate::telemetry::Telemetry;
use crate::types::MixRequest;

/// Top-level composition root: owns every shared capability and the three
/// long-running subsystems (`MixingEngine`, `Scheduler`, `RecoveryManager`),
/// and wires them together the way a manager-of-managers composition root
/// wires its component managers — one struct, constructed
/// once, handed out as capability-injected `Arc`s rather than reached for as
/// globals.
#[derive(Clone)]
pub struct MixerService {
    config: Arc<MixerConfig>,
    store: Arc<dyn Store>,
    gateway: Arc<dyn BlockchainGateway>,
    events: Arc<EventBus>,
    telemetry: Arc<Telemetry>,
    encryption: Arc<EncryptionManager>,
    pool: Arc<PoolManager>,
    scheduler: Arc<Scheduler>,
    engine: Arc<MixingEngine>,
    recovery: Arc<RecoveryManager>,
}

impl MixerService {
    /// Assembles every subsystem from injected capabilities. Background
    /// loops (scheduler ticks, recovery scans) are started separately by
    /// `run_background_tasks`, not here — construction never spawns.
    pub fn new(
        config: MixerConfig,
        store: Arc<dyn Store>,
        gateway: Arc<dyn BlockchainGateway>,
    ) -> MixerResult<(Self, tokio::sync::mpsc::Receiver<events::MixerEvent>)> {
        let config = Arc::new(config);
        let (bus, receiver) = EventBus::new(1024);
        let events = Arc::new(bus);
        let telemetry = Arc::new(Telemetry::new());
        let encryption = Arc::new(EncryptionManager::new(config.encryption.clone(), store.clone(), events.clone())?);

        let pool = Arc::new(PoolManager::new(store.clone(), events.clone(), config.min_pool_size));
        let scheduler = Arc::new(Scheduler::new(config.scheduler_skew, config.max_retry_attempts));
        let engine = MixingEngine::new(
            store.clone(),
            gateway.clone(),
            pool.clone(),
            scheduler.clone(),
            events.clone(),
            telemetry.clone(),
            config.clone(),
        );
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            events.clone(),
            telemetry.clone(),
            config.clone(),
        ));

        Ok((
            Self {
                config,
                store,
                gateway,
                events,
                telemetry,
                encryption,
                pool,
                scheduler,
                engine,
                recovery,
            },
            receiver,
        ))
    }

    /// Spawns the scheduler-tick and integrity-scan background loops. Returns
    /// their join handles so an embedder can await or abort them during
    /// shutdown; `MixerService` does not track them itself — the engine's
    /// own `stop`/`cancel` path is the part of shutdown this crate owns.
    pub fn run_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        {
            let scheduler = self.scheduler.clone();
            let store = self.store.clone();
            let engine = self.engine.clone();
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    let _ = scheduler.tick(chrono::Utc::now(), store.as_ref(), engine.as_ref()).await;
                }
            }));
        }

        {
            let recovery = self.recovery.clone();
            let monitoring_interval = self.config.monitoring_interval;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(monitoring_interval);
                loop {
                    interval.tick().await;
                    if let Ok(issues) = recovery.quick_scan().await {
                        let _ = recovery.apply_autofixes(&issues).await;
                    }
                }
            }));
        }

        {
            let recovery = self.recovery.clone();
            let integrity_check_interval = self.config.integrity_check_interval;
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(integrity_check_interval);
                loop {
                    interval.tick().await;
                    if let Ok(issues) = recovery.full_scan().await {
                        let _ = recovery.apply_autofixes(&issues).await;
                    }
                }
            }));
        }

        handles
    }

    /// Admits a validated mix request. See `MixingEngine::submit`.
    pub async fn submit(&self, request: MixRequest) -> MixerResult<Uuid> {
        self.engine.submit(request).await
    }

    /// Resumes every persisted non-terminal `MixRequest` from its persisted
    /// phase. Call once after construction, before new traffic is admitted
    /// and before `run_background_tasks` starts firing scheduled payouts for
    /// requests this process doesn't yet know about.
    pub async fn resume_all(&self) -> MixerResult<usize> {
        self.engine.resume_all().await
    }

    /// Pure read of a mix's current lifecycle state, phase, and progress.
    pub async fn status(&self, id: Uuid) -> MixerResult<MixStatusView> {
        self.engine.status(id).await
    }

    /// Stops admitting new work for this mix and checkpoints it as
    /// `Cancelled` if it has not already reached a terminal status.
    pub async fn cancel(&self, id: Uuid) -> MixerResult<()> {
        self.engine.stop(id).await
    }

    /// Runs one integrity scan immediately, outside the background cadence
    /// — used by operational tooling and by tests that don't want to wait
    /// on `integrity_check_interval`.
    pub async fn run_integrity_scan(&self) -> MixerResult<Vec<Issue>> {
        self.recovery.full_scan().await
    }

    pub fn encryption(&self) -> &Arc<EncryptionManager> {
        &self.encryption
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    pub fn gateway(&self) -> &Arc<dyn BlockchainGateway> {
        &self.gateway
    }

    pub async fn health(&self) -> telemetry::HealthReport {
        self.telemetry.health().await
    }
}
