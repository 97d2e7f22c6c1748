//! scribeq - speech-to-text job scheduling
//!
//! Streaming chunk pipelines for long recordings, durable batch queues for
//! everything else, and a worker pool for running transcription out of
//! process.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod batch;
pub mod buffer;
pub mod config;
pub mod defaults;
pub mod error;
pub mod executor;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod sink;
pub mod strategy;
pub mod streaming;
pub mod worker;

// Core seams (jobs in → text out)
pub use executor::{Executor, ExecutorOutput, IntegratedExecutor, MockExecutor, PooledExecutor};
pub use model::{MockModel, ModelFailure, SpeechModel};
pub use queue::{JobQueue, Lease, QueueEntry, SledJobQueue};
#[cfg(feature = "zeromq-queue")]
pub use queue::{ZmqJobQueue, ZmqQueueConfig};
pub use sink::{MemorySink, StorageSink};

// Coordinators and the scheduler on top of them
pub use batch::BatchCoordinator;
pub use scheduler::{Scheduler, SessionCommand, SessionInput, SessionRequest};
pub use streaming::{SessionControl, SessionOutcome, StreamingCoordinator};
pub use worker::{WorkerId, WorkerPoolManager, WorkerState};

// Data model
pub use protocol::{
    AudioChunk, ChunkRecord, JobPayload, JobStatus, PerformanceRecord, StatusEvent, Transcript,
    TranscriptionJob,
};
pub use strategy::{SessionContext, SessionParams, Strategy, select_strategy};

// Error handling
pub use error::{Result, ScribeqError};

// Config
pub use config::Config;
