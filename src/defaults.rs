//! Shared default values used across the crate.
//!
//! Centralizing these prevents drift between config defaults, documentation,
//! and tests.

/// Sample rate expected from capture, in Hz.
pub const SAMPLE_RATE: u32 = 16_000;

/// Duration of each streaming chunk, in seconds.
pub const CHUNK_DURATION_S: f32 = 5.0;

/// Overlap carried from the previous chunk into the next, in seconds.
/// Zero disables overlap and boundary deduplication has nothing to do.
pub const CHUNK_OVERLAP_S: f32 = 0.0;

/// Capacity of the circular sample buffer, in seconds of audio.
/// Five minutes at 16 kHz mono f32 is ~19 MB.
pub const BUFFER_CAPACITY_S: f32 = 300.0;

/// Maximum number of unsettled jobs a queue accepts before rejecting
/// new submissions.
pub const MAX_QUEUE_SIZE: usize = 100;

/// Maximum dispatch attempts for a batch job before it fails terminally.
pub const MAX_RETRIES: u32 = 10;

/// Transient-failure retries per streaming chunk before it becomes a gap.
pub const MAX_CHUNK_RETRIES: u32 = 2;

/// Streaming chunks transcribed concurrently.
pub const MAX_CONCURRENT_CHUNKS: usize = 2;

/// Recordings longer than this (in seconds) use the streaming strategy,
/// provided audio arrives in chunks.
pub const STREAMING_THRESHOLD_S: f32 = 5.0;

/// How long a stopping streaming session waits for in-flight chunks, in ms.
pub const GRACE_TIMEOUT_MS: u64 = 10_000;

/// Interval between worker health probes, in ms.
pub const HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;

/// Consecutive failed probes before a worker is marked unhealthy.
pub const HEALTH_FAILURE_THRESHOLD: u32 = 3;

/// First restart delay for a crashed worker, in ms. Doubles per restart.
pub const BACKOFF_INITIAL_MS: u64 = 1_000;

/// Ceiling for the worker restart delay, in ms.
pub const BACKOFF_MAX_MS: u64 = 60_000;

/// Number of external worker processes in advanced mode.
pub const WORKER_COUNT: usize = 2;

/// How long to wait for a worker's response to one request, in ms.
pub const RESPONSE_TIMEOUT_MS: u64 = 30_000;

/// How long a lease holds a job before it returns to pending, in ms.
pub const LEASE_TIMEOUT_MS: u64 = 30_000;

/// Consumer poll interval when the queue is empty, in ms.
pub const POLL_INTERVAL_MS: u64 = 100;

/// Deadline for a single integrated-mode transcription, in ms.
pub const SUBMIT_TIMEOUT_MS: u64 = 30_000;

/// Delay between transient-failure retries of a streaming chunk, in ms.
pub const RETRY_DELAY_MS: u64 = 50;

/// Placeholder inserted where a streaming chunk permanently failed.
pub const GAP_MARKER: &str = "[gap]";

/// Longest word run considered when deduplicating overlapped chunk
/// boundaries.
pub const DEDUP_MAX_WORDS: usize = 8;
