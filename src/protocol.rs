//! Shared data model: jobs, chunks, transcripts, status events, and the
//! wire envelopes exchanged with external worker processes.
//!
//! Everything that crosses a queue or process boundary serializes as
//! MessagePack via `to_bytes`/`from_bytes`.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::strategy::Strategy;

/// A bounded span of audio cut from a capture session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioChunk {
    /// Position of this chunk within its session, starting at 0.
    pub index: u64,
    /// Absolute sample offset of the first sample, from session start.
    pub start_sample: u64,
    /// Absolute sample offset one past the last sample.
    pub end_sample: u64,
    /// Mono f32 samples.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub captured_at: DateTime<Utc>,
}

impl AudioChunk {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }
}

/// What a transcription job carries: either in-memory samples or a path to
/// an audio file on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobPayload {
    Chunk(AudioChunk),
    File(PathBuf),
}

impl JobPayload {
    /// File payloads that are not already WAV go through a conversion
    /// sub-phase before transcription.
    pub fn needs_conversion(&self) -> bool {
        match self {
            Self::Chunk(_) => false,
            Self::File(path) => !path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("wav")),
        }
    }
}

/// Lifecycle state of a job inside the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Leased by a consumer and being processed.
    Dispatched,
    /// Finished with a transcript.
    Succeeded,
    /// Finished without a transcript. `terminal` distinguishes an exhausted
    /// retry budget or model error from a transient state.
    Failed { terminal: bool, error: String },
}

/// A unit of transcription work flowing through a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionJob {
    pub id: Uuid,
    pub payload: JobPayload,
    pub strategy: Strategy,
    pub created_at: DateTime<Utc>,
    /// Dispatch count. Incremented each time a consumer leases the job.
    pub attempts: u32,
    /// Retry budget: the job may be re-dispatched this many times after its
    /// first attempt before failing terminally.
    pub max_attempts: u32,
    pub status: JobStatus,
}

impl TranscriptionJob {
    pub fn new(payload: JobPayload, strategy: Strategy, max_attempts: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            strategy,
            created_at: Utc::now(),
            attempts: 0,
            max_attempts,
            status: JobStatus::Pending,
        }
    }

    /// Transition Pending -> Dispatched, counting the dispatch.
    pub fn mark_dispatched(&mut self) {
        self.attempts += 1;
        self.status = JobStatus::Dispatched;
    }

    /// Return the job to Pending (lease released or expired).
    pub fn make_pending(&mut self) {
        self.status = JobStatus::Pending;
    }

    /// Record a failure. A non-retryable error fails terminally at once;
    /// a retryable one fails terminally only once the dispatch budget
    /// (1 initial + `max_attempts` retries) is spent.
    pub fn record_failure(&mut self, error: impl Into<String>, retryable: bool) {
        let terminal = !retryable || self.attempts > self.max_attempts;
        self.status = JobStatus::Failed {
            terminal,
            error: error.into(),
        };
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            JobStatus::Succeeded | JobStatus::Failed { terminal: true, .. }
        )
    }
}

/// Per-chunk outcome recorded in a finished transcript. `text` of `None`
/// marks a gap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub index: u64,
    pub text: Option<String>,
    pub error: Option<String>,
    pub timing_ms: u64,
    pub attempts: u32,
}

/// The result of a transcription session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: Uuid,
    pub strategy: Strategy,
    pub text: String,
    pub audio_duration_ms: u64,
    pub chunks: Vec<ChunkRecord>,
    pub success: bool,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// Timing metrics captured once per finished session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub session_id: Uuid,
    pub strategy: Strategy,
    pub audio_duration_ms: u64,
    pub transcription_time_ms: u64,
    /// Time spent waiting in the queue before first dispatch. Streaming
    /// sessions have no queue residence.
    pub queue_time_ms: Option<u64>,
    pub chunk_count: usize,
    pub recorded_at: DateTime<Utc>,
}

/// Observable progress of a session, emitted over the event channel.
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Job accepted; `position` is its place in line (1 = next up).
    Queued { id: Uuid, position: usize },
    Processing { id: Uuid },
    /// Non-WAV file payload being converted before transcription.
    Converting { id: Uuid },
    Transcribing { id: Uuid },
    /// A streaming chunk finished out of band.
    ChunkTranscribed { index: u64, text: String },
    Complete { transcript: Transcript },
    Failed { id: Uuid, error: String },
}

/// Request sent to an external worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerRequest {
    Transcribe {
        job_id: Uuid,
        payload: JobPayload,
        model_params: HashMap<String, String>,
    },
    /// Health probe; a live worker answers with `Pong`.
    Ping,
}

/// Response from an external worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerResponse {
    Transcript {
        job_id: Uuid,
        text: String,
        timing_ms: u64,
    },
    Error {
        job_id: Uuid,
        message: String,
        retryable: bool,
    },
    Pong,
}

impl WorkerRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl WorkerResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
