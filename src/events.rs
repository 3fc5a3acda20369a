// src/events.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::{Currency, Severity, Strategy};

/// Every observable occurrence the engine's components emit. Deliberately
/// flat rather than per-source enums — one bounded channel, one backpressure
/// policy, one place a consumer subscribes.
#[derive(Debug, Clone)]
pub enum MixerEvent {
    PoolDepleted { currency: Currency, size: Decimal },
    PoolOverflow { currency: Currency, size: Decimal },
    MixTimeout { mix_request_id: Uuid, elapsed_secs: u64 },
    MixCompleted { mix_request_id: Uuid, strategy: Strategy },
    MixFailed { mix_request_id: Uuid, error_code: String },
    StrategyDowngraded { mix_request_id: Uuid, from: Strategy, to: Strategy },
    IntegrityIssueFound { entity_id: Uuid, kind: String, severity: Severity },
    IntegrityAutoFixed { entity_id: Uuid, kind: String },
    IntegrityScanAborted { found: usize, max_allowed: usize },
    PayoutScheduled { mix_request_id: Uuid, output_index: usize, fire_at: DateTime<Utc> },
    PayoutFired { mix_request_id: Uuid, output_index: usize },
    KeyRotated { version_id: String },
}

/// Bounded `tokio::sync::mpsc` pair. `capacity` bounds how far a slow
/// consumer can lag before producers start seeing `TrySendError::Full` —
/// there is no implicit unbounded global bus, matching the design note that
/// event fan-out must apply explicit backpressure rather than buffer
/// without limit.
pub struct EventBus {
    sender: tokio::sync::mpsc::Sender<MixerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<MixerEvent>) {
        let (sender, receiver) = tokio::sync::mpsc::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Never blocks. A full channel means the consumer is behind; the event
    /// is dropped and logged rather than stalling the producer.
    pub fn publish(&self, event: MixerEvent) {
        if let Err(err) = self.sender.try_send(event) {
            tracing::warn!(error = %err, "event bus full, dropping event");
        }
    }

    pub fn sender(&self) -> tokio::sync::mpsc::Sender<MixerEvent> {
        self.sender.clone()
    }
}
