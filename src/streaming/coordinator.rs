//! Streaming coordinator: cuts live audio into chunks, transcribes them with
//! bounded parallelism while capture continues, and assembles the ordered
//! transcript when the session stops.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::buffer::{ChunkBuffer, ChunkBufferConfig, PoppedChunk};
use crate::config::ChunkingConfig;
use crate::defaults::RETRY_DELAY_MS;
use crate::error::Result;
use crate::executor::Executor;
use crate::protocol::{AudioChunk, JobPayload, StatusEvent, Transcript};
use crate::strategy::Strategy;

use super::assembler::TranscriptAssembler;

/// Caller's control over a running session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    /// Finish: transcribe the remaining tail and assemble.
    Stop,
    /// Abandon: no transcript, in-flight work is discarded.
    Cancel,
}

#[derive(Debug)]
pub enum SessionOutcome {
    Completed(Transcript),
    Cancelled,
}

struct ChunkOutcome {
    index: u64,
    attempts: u32,
    result: std::result::Result<(String, u64), String>,
}

pub struct StreamingCoordinator {
    executor: Arc<dyn Executor>,
    config: ChunkingConfig,
}

impl StreamingCoordinator {
    pub fn new(executor: Arc<dyn Executor>, config: ChunkingConfig) -> Self {
        Self { executor, config }
    }

    /// Drive one session: samples in, transcript out.
    ///
    /// Runs until `Stop` arrives (or the sample channel closes, which means
    /// the same), then waits up to the grace timeout for in-flight chunks.
    /// Chunks that miss the grace deadline become gaps. `Cancel` returns
    /// immediately with nothing.
    pub async fn run(
        &self,
        session_id: Uuid,
        mut samples_rx: mpsc::Receiver<Vec<f32>>,
        mut control_rx: mpsc::Receiver<SessionControl>,
        events: mpsc::Sender<StatusEvent>,
    ) -> Result<SessionOutcome> {
        let mut buffer = ChunkBuffer::new(ChunkBufferConfig {
            sample_rate: self.config.sample_rate,
            capacity_s: self.config.buffer_capacity_s,
            chunk_duration_s: self.config.chunk_duration_s,
            chunk_overlap_s: self.config.chunk_overlap_s,
        });
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_chunks.max(1)));
        let (outcome_tx, mut outcome_rx) = mpsc::channel::<ChunkOutcome>(64);
        let mut assembler = TranscriptAssembler::new(self.config.dedup_boundaries);
        let mut in_flight: HashSet<u64> = HashSet::new();

        info!(session = %session_id, "streaming session started");

        loop {
            tokio::select! {
                maybe_samples = samples_rx.recv() => {
                    match maybe_samples {
                        Some(samples) => {
                            buffer.write(&samples);
                            self.drain_ready(
                                session_id, &mut buffer, &mut assembler,
                                &mut in_flight, &semaphore, &outcome_tx,
                            )?;
                        }
                        // Capture ended; same as an explicit stop.
                        None => break,
                    }
                }
                maybe_control = control_rx.recv() => {
                    match maybe_control {
                        Some(SessionControl::Cancel) => {
                            info!(session = %session_id, "session cancelled");
                            return Ok(SessionOutcome::Cancelled);
                        }
                        Some(SessionControl::Stop) | None => break,
                    }
                }
                Some(outcome) = outcome_rx.recv() => {
                    Self::record(&mut assembler, &mut in_flight, &events, outcome).await;
                }
            }
        }

        // Audio already captured still counts: drain whatever the capture
        // side managed to send before the stop.
        while let Ok(samples) = samples_rx.try_recv() {
            buffer.write(&samples);
            self.drain_ready(
                session_id, &mut buffer, &mut assembler,
                &mut in_flight, &semaphore, &outcome_tx,
            )?;
        }

        // Tail below one chunk still gets transcribed.
        if let Some(chunk) = buffer.flush()? {
            in_flight.insert(chunk.index);
            self.dispatch(chunk, &semaphore, &outcome_tx);
        }
        drop(outcome_tx);

        let grace = Duration::from_millis(self.config.grace_timeout_ms);
        let deadline = tokio::time::Instant::now() + grace;
        while !in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, outcome_rx.recv()).await {
                Ok(Some(outcome)) => {
                    Self::record(&mut assembler, &mut in_flight, &events, outcome).await;
                }
                Ok(None) => break,
                Err(_) => {
                    for index in in_flight.drain() {
                        warn!(session = %session_id, chunk = index, "chunk missed grace deadline");
                        assembler.add_gap(index, "did not finish before stop deadline".to_string(), 0);
                    }
                }
            }
        }

        let (text, chunks) = assembler.assemble();
        let audio_duration_ms = if self.config.sample_rate == 0 {
            0
        } else {
            buffer.written() * 1000 / self.config.sample_rate as u64
        };
        let transcript = Transcript {
            session_id,
            strategy: Strategy::Streaming,
            text,
            audio_duration_ms,
            chunks,
            success: true,
            error: None,
            completed_at: Utc::now(),
        };
        let _ = events
            .send(StatusEvent::Complete {
                transcript: transcript.clone(),
            })
            .await;
        info!(session = %session_id, chunks = transcript.chunks.len(), "streaming session complete");
        Ok(SessionOutcome::Completed(transcript))
    }

    /// Emit every chunk the buffer has ready. Chunks whose audio was
    /// overwritten (capture outran transcription) go straight to the
    /// assembler as gaps so the index range stays contiguous.
    fn drain_ready(
        &self,
        session_id: Uuid,
        buffer: &mut ChunkBuffer,
        assembler: &mut TranscriptAssembler,
        in_flight: &mut HashSet<u64>,
        semaphore: &Arc<Semaphore>,
        outcome_tx: &mpsc::Sender<ChunkOutcome>,
    ) -> Result<()> {
        while let Some(popped) = buffer.pop_ready_chunk()? {
            match popped {
                PoppedChunk::Ready(chunk) => {
                    in_flight.insert(chunk.index);
                    self.dispatch(chunk, semaphore, outcome_tx);
                }
                PoppedChunk::Overwritten { index } => {
                    warn!(session = %session_id, chunk = index,
                        "chunk audio overwritten before transcription");
                    assembler.add_gap(
                        index,
                        "audio overwritten before transcription".to_string(),
                        0,
                    );
                }
            }
        }
        Ok(())
    }

    /// Spawn one chunk's transcription. The semaphore is acquired inside the
    /// task so dispatch never blocks capture.
    fn dispatch(
        &self,
        chunk: AudioChunk,
        semaphore: &Arc<Semaphore>,
        outcome_tx: &mpsc::Sender<ChunkOutcome>,
    ) {
        let executor = Arc::clone(&self.executor);
        let semaphore = Arc::clone(semaphore);
        let outcome_tx = outcome_tx.clone();
        let max_retries = self.config.max_chunk_retries;

        tokio::spawn(async move {
            let index = chunk.index;
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            let payload = JobPayload::Chunk(chunk);

            let mut attempts = 0u32;
            let outcome = loop {
                attempts += 1;
                match executor.submit(&payload).await {
                    Ok(output) => {
                        break ChunkOutcome {
                            index,
                            attempts,
                            result: Ok((output.text, output.timing_ms)),
                        };
                    }
                    Err(error) if error.is_retryable() && attempts <= max_retries => {
                        debug!(chunk = index, attempt = attempts, %error, "chunk retry");
                        tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
                    }
                    Err(error) => {
                        break ChunkOutcome {
                            index,
                            attempts,
                            result: Err(error.to_string()),
                        };
                    }
                }
            };
            // Receiver gone means the session was cancelled.
            let _ = outcome_tx.send(outcome).await;
        });
    }

    async fn record(
        assembler: &mut TranscriptAssembler,
        in_flight: &mut HashSet<u64>,
        events: &mpsc::Sender<StatusEvent>,
        outcome: ChunkOutcome,
    ) {
        in_flight.remove(&outcome.index);
        match outcome.result {
            Ok((text, timing_ms)) => {
                let _ = events
                    .send(StatusEvent::ChunkTranscribed {
                        index: outcome.index,
                        text: text.clone(),
                    })
                    .await;
                assembler.add_success(outcome.index, text, timing_ms, outcome.attempts);
            }
            Err(error) => {
                warn!(chunk = outcome.index, %error, "chunk permanently failed");
                assembler.add_gap(outcome.index, error, outcome.attempts);
            }
        }
    }
}
