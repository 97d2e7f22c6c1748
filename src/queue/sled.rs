//! Embedded-durable queue backend on sled.
//!
//! Layout: a `pending` tree keyed by big-endian sequence number (so
//! iteration order is submission order) and a `leased` tree keyed by job id.
//! A nacked or expired lease reinserts the job under its original sequence
//! number, which puts it back at the front of the pending order for free.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::protocol::TranscriptionJob;

use super::{JobQueue, Lease, QueueEntry};

#[derive(Serialize, Deserialize)]
struct LeasedRecord {
    seq: u64,
    job: TranscriptionJob,
    lease: Lease,
}

/// Snapshot of queue depth by state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
}

pub struct SledJobQueue {
    db: sled::Db,
    pending: sled::Tree,
    leased: sled::Tree,
    /// Next sequence number. Initialized past everything on disk so restarts
    /// never reuse a key.
    counter: AtomicU64,
    max_size: usize,
    /// Serializes multi-step mutations (sweep + pop, count + insert).
    gate: Mutex<()>,
}

impl SledJobQueue {
    pub fn new(path: &Path, max_size: usize) -> Result<Self, QueueError> {
        let db = sled::open(path)?;
        Self::from_db(db, max_size)
    }

    /// In-memory queue for tests; nothing touches disk.
    pub fn new_temp(max_size: usize) -> Result<Self, QueueError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, max_size)
    }

    fn from_db(db: sled::Db, max_size: usize) -> Result<Self, QueueError> {
        let pending = db.open_tree("pending")?;
        let leased = db.open_tree("leased")?;

        let mut next_seq = 0u64;
        if let Some((key, _)) = pending.last()? {
            next_seq = Self::decode_seq(&key) + 1;
        }
        for item in leased.iter() {
            let (_, value) = item?;
            let record: LeasedRecord = rmp_serde::from_slice(&value)?;
            next_seq = next_seq.max(record.seq + 1);
        }

        debug!(next_seq, "queue opened");
        Ok(Self {
            db,
            pending,
            leased,
            counter: AtomicU64::new(next_seq),
            max_size,
            gate: Mutex::new(()),
        })
    }

    fn decode_seq(key: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let len = key.len().min(8);
        buf[8 - len..].copy_from_slice(&key[..len]);
        u64::from_be_bytes(buf)
    }

    fn unsettled(&self) -> usize {
        self.pending.len() + self.leased.len()
    }

    /// Return every expired lease to the pending tree. Called under the gate.
    fn sweep_expired(&self) -> Result<(), QueueError> {
        let mut expired = Vec::new();
        for item in self.leased.iter() {
            let (key, value) = item?;
            let record: LeasedRecord = rmp_serde::from_slice(&value)?;
            if record.lease.is_expired() {
                expired.push((key, record));
            }
        }
        for (key, mut record) in expired {
            warn!(job = %record.job.id, consumer = %record.lease.consumer_id,
                "lease expired, returning job to pending");
            record.job.make_pending();
            self.pending.insert(
                record.seq.to_be_bytes(),
                rmp_serde::to_vec(&record.job)?,
            )?;
            self.leased.remove(key)?;
        }
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.pending.len(),
            leased: self.leased.len(),
        }
    }

    /// Force everything to disk.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.db.flush_async().await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for SledJobQueue {
    async fn enqueue(&self, job: TranscriptionJob) -> Result<Uuid, QueueError> {
        let _gate = self.gate.lock().await;
        if self.unsettled() >= self.max_size {
            return Err(QueueError::Full {
                limit: self.max_size,
            });
        }
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = job.id;
        self.pending
            .insert(seq.to_be_bytes(), rmp_serde::to_vec(&job)?)?;
        debug!(job = %id, seq, "job enqueued");
        Ok(id)
    }

    async fn lease(
        &self,
        consumer_id: &str,
        lease_for: Duration,
    ) -> Result<Option<QueueEntry>, QueueError> {
        let _gate = self.gate.lock().await;
        self.sweep_expired()?;

        let Some((key, value)) = self.pending.first()? else {
            return Ok(None);
        };
        let mut job: TranscriptionJob = rmp_serde::from_slice(&value)?;
        job.mark_dispatched();
        let lease = Lease::new(consumer_id, lease_for);
        let record = LeasedRecord {
            seq: Self::decode_seq(&key),
            job: job.clone(),
            lease: lease.clone(),
        };
        self.leased
            .insert(job.id.as_bytes(), rmp_serde::to_vec(&record)?)?;
        self.pending.remove(key)?;
        debug!(job = %job.id, consumer = consumer_id, attempt = job.attempts, "job leased");
        Ok(Some(QueueEntry { job, lease }))
    }

    async fn ack(&self, job_id: Uuid, token: Uuid) -> Result<(), QueueError> {
        let _gate = self.gate.lock().await;
        let Some(value) = self.leased.get(job_id.as_bytes())? else {
            return Ok(());
        };
        let record: LeasedRecord = rmp_serde::from_slice(&value)?;
        if record.lease.token != token {
            warn!(job = %job_id, "stale ack ignored; lease was re-issued");
            return Ok(());
        }
        self.leased.remove(job_id.as_bytes())?;
        debug!(job = %job_id, "job acked");
        Ok(())
    }

    async fn nack(&self, job_id: Uuid, token: Uuid) -> Result<(), QueueError> {
        let _gate = self.gate.lock().await;
        let Some(value) = self.leased.get(job_id.as_bytes())? else {
            return Err(QueueError::NotLeased { id: job_id });
        };
        let mut record: LeasedRecord = rmp_serde::from_slice(&value)?;
        if record.lease.token != token {
            return Err(QueueError::NotLeased { id: job_id });
        }
        self.leased.remove(job_id.as_bytes())?;
        record.job.make_pending();
        self.pending.insert(
            record.seq.to_be_bytes(),
            rmp_serde::to_vec(&record.job)?,
        )?;
        debug!(job = %job_id, "job nacked, returned to pending");
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, QueueError> {
        Ok(self.unsettled())
    }

    async fn queued_count(&self) -> Result<usize, QueueError> {
        Ok(self.pending.len())
    }
}
