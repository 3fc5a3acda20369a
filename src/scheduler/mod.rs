// src/scheduler/mod.rs
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MixerError, MixerResult};
use crate::store::Store;
use crate::types::MixStatus;

/// One payout waiting to fire. Identity is `(mix_request_id, output_index)`
/// — `schedule` is a no-op if that pair is already queued.
#[derive(Debug, Clone)]
struct Job {
    mix_request_id: Uuid,
    output_index: usize,
    fire_at: DateTime<Utc>,
    attempt: u32,
}

/// Executes one payout job. `MixingEngine` supplies the real implementation
/// (build, broadcast, record an `OutputTransaction`); tests can stub it.
#[async_trait]
pub trait PayoutExecutor: Send + Sync {
    async fn execute(&self, mix_request_id: Uuid, output_index: usize) -> MixerResult<()>;
}

/// Time-indexed payout queue. A background `run` loop wakes on a fixed
/// cadence, pops every job whose `fire_at` has passed, and hands it to the
/// configured `PayoutExecutor` — never earlier than `fire_at`. `scheduler_skew`
/// bounds how late a fire is allowed to drift before it's logged as
/// suspicious; it never advances a job's due time.
pub struct Scheduler {
    jobs: Mutex<Vec<Job>>,
    known: Mutex<HashSet<(Uuid, usize)>>,
    skew: std::time::Duration,
    max_retry_attempts: u32,
}

impl Scheduler {
    pub fn new(skew: std::time::Duration, max_retry_attempts: u32) -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            known: Mutex::new(HashSet::new()),
            skew,
            max_retry_attempts,
        }
    }

    /// Returns `true` if a new job was queued, `false` if `(mix_request_id,
    /// output_index)` was already scheduled.
    pub async fn schedule(&self, mix_request_id: Uuid, output_index: usize, fire_at: DateTime<Utc>) -> bool {
        let key = (mix_request_id, output_index);
        let mut known = self.known.lock().await;
        if !known.insert(key) {
            return false;
        }
        self.jobs.lock().await.push(Job { mix_request_id, output_index, fire_at, attempt: 0 });
        true
    }

    pub async fn pending_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    /// Pops and fires every job due at `now`, never earlier than its
    /// `fire_at`, and skipping jobs whose `MixRequest` has since gone
    /// `Cancelled`/`Failed`. On executor failure the job is re-queued under
    /// the standard linear backoff, up to `max_retry_attempts`; past that it
    /// is dropped.
    pub async fn tick(
        &self,
        now: DateTime<Utc>,
        store: &dyn Store,
        executor: &dyn PayoutExecutor,
    ) -> MixerResult<()> {
        let due: Vec<Job> = {
            let mut jobs = self.jobs.lock().await;
            let (due, remaining): (Vec<Job>, Vec<Job>) =
                jobs.drain(..).partition(|job| job.fire_at <= now);
            *jobs = remaining;
            due
        };

        let mut first_error = None;

        for job in due {
            let lateness = now.signed_duration_since(job.fire_at);
            if lateness > chrono::Duration::from_std(self.skew).unwrap_or_default() {
                tracing::debug!(
                    mix_request_id = %job.mix_request_id,
                    output_index = job.output_index,
                    lateness_ms = lateness.num_milliseconds(),
                    "payout fired later than scheduler_skew"
                );
            }
            let request = store.get_mix_request(job.mix_request_id).await?;
            let skip = match request {
                None => true,
                Some(ref r) => matches!(r.status, MixStatus::Cancelled | MixStatus::Failed),
            };
            if skip {
                self.known.lock().await.remove(&(job.mix_request_id, job.output_index));
                continue;
            }

            match executor.execute(job.mix_request_id, job.output_index).await {
                Ok(()) => {
                    self.known.lock().await.remove(&(job.mix_request_id, job.output_index));
                }
                Err(err) if err.is_retryable() => {
                    if job.attempt < self.max_retry_attempts {
                        let backoff = chrono::Duration::seconds(60 * (job.attempt as i64 + 1));
                        let next_attempt = job.attempt + 1;
                        let mut jobs = self.jobs.lock().await;
                        jobs.push(Job {
                            fire_at: now + backoff,
                            attempt: next_attempt,
                            ..job
                        });
                    } else {
                        self.known.lock().await.remove(&(job.mix_request_id, job.output_index));
                        first_error.get_or_insert(MixerError::PermanentGateway(format!(
                            "payout for {} output {} exhausted retries",
                            job.mix_request_id, job.output_index
                        )));
                    }
                }
                Err(err) => {
                    self.known.lock().await.remove(&(job.mix_request_id, job.output_index));
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::{Currency, MixRequest, MixStatus, OutputTarget};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct CountingExecutor {
        calls: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl PayoutExecutor for CountingExecutor {
        async fn execute(&self, _mix_request_id: Uuid, _output_index: usize) -> MixerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sample_request(status: MixStatus) -> MixRequest {
        let now = Utc::now();
        MixRequest {
            id: Uuid::new_v4(),
            currency: Currency::BTC,
            input_amount: rust_decimal::Decimal::new(100, 2),
            deposit_address: "addr".to_string(),
            output_addresses: vec![OutputTarget { address: "out".to_string(), percent_basis_points: 10_000 }],
            delay_seconds: 0,
            created_at: now,
            expires_at: now + chrono::Duration::hours(1),
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
    async fn schedule_is_idempotent_on_mix_and_output_index() {
        let scheduler = Scheduler::new(std::time::Duration::from_secs(0), 3);
        let mix_id = Uuid::new_v4();
        let now = Utc::now();
        assert!(scheduler.schedule(mix_id, 0, now).await);
        assert!(!scheduler.schedule(mix_id, 0, now).await);
        assert_eq!(scheduler.pending_count().await, 1);
    }

    #[tokio::test]
    async fn tick_fires_only_due_jobs() {
        let scheduler = Scheduler::new(std::time::Duration::from_secs(0), 3);
        let store = InMemoryStore::new();
        let request = sample_request(MixStatus::Mixing);
        let mix_id = request.id;
        store.transaction(Box::new(move |txn| {
            futures::executor::block_on(txn.put_mix_request(request))
        })).await.unwrap();

        let now = Utc::now();
        scheduler.schedule(mix_id, 0, now - chrono::Duration::seconds(5)).await;
        scheduler.schedule(mix_id, 1, now + chrono::Duration::hours(1)).await;

        let calls = StdArc::new(AtomicUsize::new(0));
        let executor = CountingExecutor { calls: StdArc::clone(&calls) };
        scheduler.tick(now, &store, &executor).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count().await, 1);
    }

    #[tokio::test]
    async fn tick_skips_jobs_for_cancelled_mix() {
        let scheduler = Scheduler::new(std::time::Duration::from_secs(0), 3);
        let store = InMemoryStore::new();
        let request = sample_request(MixStatus::Cancelled);
        let mix_id = request.id;
        store.transaction(Box::new(move |txn| {
            futures::executor::block_on(txn.put_mix_request(request))
        })).await.unwrap();

        let now = Utc::now();
        scheduler.schedule(mix_id, 0, now - chrono::Duration::seconds(1)).await;

        let calls = StdArc::new(AtomicUsize::new(0));
        let executor = CountingExecutor { calls: StdArc::clone(&calls) };
        scheduler.tick(now, &store, &executor).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn tick_never_fires_a_job_before_its_fire_at() {
        let scheduler = Scheduler::new(std::time::Duration::from_secs(30), 3);
        let store = InMemoryStore::new();
        let request = sample_request(MixStatus::Mixing);
        let mix_id = request.id;
        store.transaction(Box::new(move |txn| {
            futures::executor::block_on(txn.put_mix_request(request))
        })).await.unwrap();

        let now = Utc::now();
        scheduler.schedule(mix_id, 0, now + chrono::Duration::seconds(10)).await;

        let calls = StdArc::new(AtomicUsize::new(0));
        let executor = CountingExecutor { calls: StdArc::clone(&calls) };
        scheduler.tick(now, &store, &executor).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "job due in 10s must not fire at tick time");
        assert_eq!(scheduler.pending_count().await, 1);

        scheduler.tick(now + chrono::Duration::seconds(11), &store, &executor).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
