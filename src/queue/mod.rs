//! Durable job queue with at-least-once delivery.
//!
//! Consumers take jobs on a lease rather than popping them: an acked lease
//! removes the job, a nacked or expired lease returns it to the front of
//! the pending order. A consumer crash therefore loses no work, at the cost
//! of possible duplicate delivery, which settlement handles idempotently.

mod sled;
#[cfg(feature = "zeromq-queue")]
mod zeromq;

pub use self::sled::{QueueStats, SledJobQueue};
#[cfg(feature = "zeromq-queue")]
pub use self::zeromq::{ZmqJobQueue, ZmqQueueConfig};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;
use crate::protocol::TranscriptionJob;

/// A time-bounded claim on one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub token: Uuid,
    pub consumer_id: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(consumer_id: &str, lease_for: Duration) -> Self {
        Self {
            token: Uuid::new_v4(),
            consumer_id: consumer_id.to_string(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(lease_for)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30)),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// A leased job handed to a consumer.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub job: TranscriptionJob,
    pub lease: Lease,
}

/// Pluggable queue backend.
///
/// Both backends speak MessagePack on the wire and share these semantics:
/// FIFO by submission, capacity counted over unsettled (pending + leased)
/// jobs, lease/ack/nack as the only state transitions.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Submit a job. Fails with `QueueError::Full` at capacity; the caller
    /// decides whether to surface or retry, the queue never blocks.
    async fn enqueue(&self, job: TranscriptionJob) -> Result<Uuid, QueueError>;

    /// Claim the oldest pending job for `lease_for`. `None` when nothing is
    /// pending. The returned job is already marked dispatched.
    async fn lease(
        &self,
        consumer_id: &str,
        lease_for: Duration,
    ) -> Result<Option<QueueEntry>, QueueError>;

    /// Settle a leased job permanently. The token must match the job's
    /// current lease; acking an unknown, already-settled, or re-leased job
    /// (stale token) is a no-op, so a consumer whose lease expired mid-run
    /// cannot remove another consumer's claim.
    async fn ack(&self, job_id: Uuid, token: Uuid) -> Result<(), QueueError>;

    /// Return a leased job to the front of the pending order. Fails with
    /// `NotLeased` when the job is not leased or the token is stale.
    async fn nack(&self, job_id: Uuid, token: Uuid) -> Result<(), QueueError>;

    /// Unsettled jobs (pending plus leased). This is what capacity counts.
    async fn pending_count(&self) -> Result<usize, QueueError>;

    /// Jobs waiting for a consumer, excluding leased ones. This is the place
    /// in line a fresh submission holds.
    async fn queued_count(&self) -> Result<usize, QueueError>;
}
