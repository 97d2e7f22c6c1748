//! Top-level session scheduler.
//!
//! One command channel in, one status channel out. Each `Start` selects a
//! strategy, runs the matching coordinator to its terminal event, persists
//! the outcome exactly once, and returns to waiting. One session at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::BatchCoordinator;
use crate::config::Config;
use crate::error::{Result, ScribeqError};
use crate::executor::Executor;
use crate::protocol::{
    AudioChunk, JobPayload, PerformanceRecord, StatusEvent, Transcript,
};
use crate::queue::JobQueue;
use crate::sink::StorageSink;
use crate::strategy::{SessionContext, SessionParams, Strategy};
use crate::streaming::{SessionControl, SessionOutcome, StreamingCoordinator};

/// Where a session's audio comes from.
pub enum SessionInput {
    /// Capture delivers sample batches over this channel.
    Live(mpsc::Receiver<Vec<f32>>),
    /// A recording already on disk.
    File(PathBuf),
}

pub struct SessionRequest {
    pub params: SessionParams,
    pub input: SessionInput,
}

pub enum SessionCommand {
    Start(Box<SessionRequest>),
    Stop,
    Cancel,
}

pub struct Scheduler {
    config: Config,
    executor: Arc<dyn Executor>,
    queue: Arc<dyn JobQueue>,
    sink: Arc<dyn StorageSink>,
    events: mpsc::Sender<StatusEvent>,
}

impl Scheduler {
    pub fn new(
        config: Config,
        executor: Arc<dyn Executor>,
        queue: Arc<dyn JobQueue>,
        sink: Arc<dyn StorageSink>,
        events: mpsc::Sender<StatusEvent>,
    ) -> Self {
        Self {
            config,
            executor,
            queue,
            sink,
            events,
        }
    }

    /// Serve commands until the channel closes. Returns early only on a
    /// storage failure; session-level failures are events, not errors.
    pub async fn run(&self, mut commands: mpsc::Receiver<SessionCommand>) -> Result<()> {
        while let Some(command) = commands.recv().await {
            match command {
                SessionCommand::Start(request) => {
                    self.run_session(*request, &mut commands).await?;
                }
                // No session running; nothing to stop or cancel.
                SessionCommand::Stop | SessionCommand::Cancel => {
                    warn!("stop/cancel with no active session, ignoring");
                }
            }
        }
        Ok(())
    }

    async fn run_session(
        &self,
        request: SessionRequest,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<()> {
        let context = SessionContext::new(request.params, &self.config.strategy);
        info!(session = %context.id, strategy = %context.strategy, "session starting");

        let started = Instant::now();
        let outcome = match (context.strategy, request.input) {
            (Strategy::Streaming, SessionInput::Live(samples_rx)) => {
                self.run_streaming(&context, samples_rx, commands).await?
            }
            (Strategy::Streaming, SessionInput::File(_)) => {
                // Streaming is meaningless without incremental capture.
                let error = "streaming strategy requires live capture".to_string();
                let _ = self
                    .events
                    .send(StatusEvent::Failed {
                        id: context.id,
                        error: error.clone(),
                    })
                    .await;
                warn!(session = %context.id, "{error}");
                return Ok(());
            }
            (Strategy::Batch, input) => self.run_batch(&context, input, commands).await?,
        };

        if let Some((transcript, queue_time_ms)) = outcome {
            let metrics = PerformanceRecord {
                session_id: context.id,
                strategy: context.strategy,
                audio_duration_ms: transcript.audio_duration_ms,
                transcription_time_ms: started.elapsed().as_millis() as u64,
                queue_time_ms,
                chunk_count: transcript.chunks.len(),
                recorded_at: Utc::now(),
            };
            self.sink.persist(&transcript, &metrics).await?;
            info!(session = %context.id, "session persisted");
        }
        Ok(())
    }

    /// Drive a streaming session, forwarding stop/cancel commands into it.
    async fn run_streaming(
        &self,
        context: &SessionContext,
        samples_rx: mpsc::Receiver<Vec<f32>>,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<Option<(Transcript, Option<u64>)>> {
        let coordinator = StreamingCoordinator::new(
            Arc::clone(&self.executor),
            self.config.chunking.clone(),
        );
        let (control_tx, control_rx) = mpsc::channel(4);
        let events = self.events.clone();
        let session_id = context.id;
        let mut session = tokio::spawn(async move {
            coordinator
                .run(session_id, samples_rx, control_rx, events)
                .await
        });

        let mut commands_closed = false;
        loop {
            tokio::select! {
                joined = &mut session => {
                    let outcome = joined.map_err(|e| ScribeqError::Session {
                        message: format!("session task failed: {e}"),
                    })??;
                    return Ok(match outcome {
                        SessionOutcome::Completed(transcript) => Some((transcript, None)),
                        SessionOutcome::Cancelled => None,
                    });
                }
                command = commands.recv(), if !commands_closed => {
                    match command {
                        Some(SessionCommand::Stop) => {
                            let _ = control_tx.send(SessionControl::Stop).await;
                        }
                        None => {
                            commands_closed = true;
                            let _ = control_tx.send(SessionControl::Stop).await;
                        }
                        Some(SessionCommand::Cancel) => {
                            let _ = control_tx.send(SessionControl::Cancel).await;
                        }
                        Some(SessionCommand::Start(_)) => {
                            warn!("session already running, ignoring start");
                        }
                    }
                }
            }
        }
    }

    /// Run a batch session: collect the audio, queue it as one job, consume
    /// until that job settles.
    async fn run_batch(
        &self,
        context: &SessionContext,
        input: SessionInput,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Result<Option<(Transcript, Option<u64>)>> {
        let payload = match input {
            SessionInput::File(path) => JobPayload::File(path),
            SessionInput::Live(samples_rx) => {
                match self.collect_recording(samples_rx, commands).await {
                    Some(chunk) => JobPayload::Chunk(chunk),
                    // Cancelled during capture.
                    None => return Ok(None),
                }
            }
        };

        // Batch work runs through the durable queue even in integrated
        // mode, so a crash between submit and settle loses nothing.
        let (internal_tx, mut internal_rx) = mpsc::channel(64);
        let coordinator = Arc::new(BatchCoordinator::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.executor),
            internal_tx,
            self.config.queue.clone(),
        ));
        let job_id = coordinator.submit(payload).await.map_err(ScribeqError::from)?;
        let submitted = Instant::now();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        let mut queue_time_ms = None;
        let result = loop {
            let Some(event) = internal_rx.recv().await else {
                break None;
            };
            if let StatusEvent::Processing { id } = &event
                && *id == job_id
                && queue_time_ms.is_none()
            {
                queue_time_ms = Some(submitted.elapsed().as_millis() as u64);
            }
            let terminal = match &event {
                StatusEvent::Complete { transcript } if transcript.session_id == job_id => {
                    Some(Some(transcript.clone()))
                }
                StatusEvent::Failed { id, error } if *id == job_id => {
                    Some(Some(failure_transcript(job_id, error.clone())))
                }
                _ => None,
            };
            let _ = self.events.send(event).await;
            if let Some(outcome) = terminal {
                break outcome;
            }
        };

        let _ = shutdown_tx.send(true);
        consumer
            .await
            .map_err(|e| ScribeqError::Session {
                message: format!("batch consumer failed: {e}"),
            })?
            .map_err(ScribeqError::from)?;

        info!(session = %context.id, job = %job_id, "batch session settled");
        Ok(result.map(|t| (t, queue_time_ms)))
    }

    /// Buffer a live recording until stop. `None` means cancelled.
    async fn collect_recording(
        &self,
        mut samples_rx: mpsc::Receiver<Vec<f32>>,
        commands: &mut mpsc::Receiver<SessionCommand>,
    ) -> Option<AudioChunk> {
        let mut samples: Vec<f32> = Vec::new();
        loop {
            tokio::select! {
                maybe_samples = samples_rx.recv() => {
                    match maybe_samples {
                        Some(batch) => samples.extend_from_slice(&batch),
                        None => break,
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(SessionCommand::Stop) | None => break,
                        Some(SessionCommand::Cancel) => return None,
                        Some(SessionCommand::Start(_)) => {
                            warn!("session already running, ignoring start");
                        }
                    }
                }
            }
        }
        // Audio the capture side already sent still belongs to the take.
        while let Ok(batch) = samples_rx.try_recv() {
            samples.extend_from_slice(&batch);
        }
        let end = samples.len() as u64;
        Some(AudioChunk {
            index: 0,
            start_sample: 0,
            end_sample: end,
            samples,
            sample_rate: self.config.chunking.sample_rate,
            captured_at: Utc::now(),
        })
    }
}

fn failure_transcript(session_id: Uuid, error: String) -> Transcript {
    Transcript {
        session_id,
        strategy: Strategy::Batch,
        text: String::new(),
        audio_duration_ms: 0,
        chunks: Vec::new(),
        success: false,
        error: Some(error),
        completed_at: Utc::now(),
    }
}
