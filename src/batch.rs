//! Batch coordinator: one durable job per recording, consumed sequentially.
//!
//! The consumer leases one job at a time from the queue, runs it through an
//! executor, and settles it: ack on success or terminal failure, nack to
//! retry. All status a caller sees is projected from that flow as events;
//! none of it is stored.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::Utc;

use crate::config::QueueConfig;
use crate::error::{ExecutorError, QueueError};
use crate::executor::{Executor, ExecutorOutput};
use crate::protocol::{
    ChunkRecord, JobPayload, JobStatus, StatusEvent, Transcript, TranscriptionJob,
};
use crate::queue::{JobQueue, Lease, QueueEntry};
use crate::strategy::Strategy;

pub struct BatchCoordinator {
    queue: Arc<dyn JobQueue>,
    executor: Arc<dyn Executor>,
    events: mpsc::Sender<StatusEvent>,
    config: QueueConfig,
    /// Ids this consumer already settled, so a duplicate delivery (lease
    /// expiry raced with a slow executor) is dropped instead of re-run.
    settled: Mutex<HashSet<Uuid>>,
}

impl BatchCoordinator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        executor: Arc<dyn Executor>,
        events: mpsc::Sender<StatusEvent>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            executor,
            events,
            config,
            settled: Mutex::new(HashSet::new()),
        }
    }

    /// Enqueue one recording as a durable job. Emits `Queued` with the
    /// job's place in line. A full queue is the caller's problem.
    pub async fn submit(&self, payload: JobPayload) -> Result<Uuid, QueueError> {
        let job = TranscriptionJob::new(payload, Strategy::Batch, self.config.max_retries);
        let id = self.queue.enqueue(job).await?;
        // Place in line counts only jobs still waiting, not the one a
        // consumer is already working on.
        let position = self.queue.queued_count().await?;
        let _ = self.events.send(StatusEvent::Queued { id, position }).await;
        info!(job = %id, position, "batch job submitted");
        Ok(id)
    }

    /// Consume the queue one job at a time until `shutdown` flips.
    pub async fn run_consumer(
        &self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let lease_for = Duration::from_millis(self.config.lease_timeout_ms);
        let poll = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                debug!("batch consumer stopping");
                return Ok(());
            }

            match self.queue.lease("batch-consumer", lease_for).await? {
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Some(entry) => self.process(entry).await?,
            }
        }
    }

    async fn process(&self, entry: QueueEntry) -> Result<(), QueueError> {
        let QueueEntry { job, lease } = entry;

        if self.settled.lock().await.contains(&job.id) {
            debug!(job = %job.id, "duplicate delivery of settled job, dropping");
            return self.queue.ack(job.id, lease.token).await;
        }

        let _ = self
            .events
            .send(StatusEvent::Processing { id: job.id })
            .await;
        if job.payload.needs_conversion() {
            let _ = self
                .events
                .send(StatusEvent::Converting { id: job.id })
                .await;
        }
        let _ = self
            .events
            .send(StatusEvent::Transcribing { id: job.id })
            .await;

        let outcome = self.executor.submit(&job.payload).await;
        settle(
            self.queue.as_ref(),
            &self.events,
            &self.settled,
            job,
            &lease,
            outcome,
        )
        .await
    }
}

/// Settle one leased job against its executor outcome. The single place
/// where success, retry, and terminal failure are decided:
///
/// - success: ack, emit `Complete`
/// - retryable failure within budget: nack (job returns to pending)
/// - anything else: ack, emit `Failed`
///
/// The ack carries the lease token, so a consumer whose lease was re-issued
/// mid-run cannot settle someone else's claim. The `settled` set is checked
/// here, under its lock, so a duplicate delivery that raced past the
/// pre-dispatch check still emits its terminal event only once.
pub(crate) async fn settle(
    queue: &dyn JobQueue,
    events: &mpsc::Sender<StatusEvent>,
    settled: &Mutex<HashSet<Uuid>>,
    mut job: TranscriptionJob,
    lease: &Lease,
    outcome: Result<ExecutorOutput, ExecutorError>,
) -> Result<(), QueueError> {
    match outcome {
        Ok(output) => {
            let first = settled.lock().await.insert(job.id);
            job.status = JobStatus::Succeeded;
            queue.ack(job.id, lease.token).await?;
            if first {
                let transcript = batch_transcript(&job, &output);
                let _ = events.send(StatusEvent::Complete { transcript }).await;
                info!(job = %job.id, attempts = job.attempts, "batch job complete");
            } else {
                debug!(job = %job.id, "duplicate result for settled job, dropping");
            }
            Ok(())
        }
        Err(error) => {
            job.record_failure(error.to_string(), error.is_retryable());
            match &job.status {
                JobStatus::Failed { terminal: false, .. } => {
                    warn!(job = %job.id, attempt = job.attempts, %error, "job failed, retrying");
                    match queue.nack(job.id, lease.token).await {
                        Ok(()) => Ok(()),
                        // Lease expired under us; the queue already took
                        // the job back.
                        Err(QueueError::NotLeased { .. }) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
                _ => {
                    let first = settled.lock().await.insert(job.id);
                    queue.ack(job.id, lease.token).await?;
                    if first {
                        warn!(job = %job.id, attempts = job.attempts, %error, "job failed terminally");
                        let _ = events
                            .send(StatusEvent::Failed {
                                id: job.id,
                                error: error.to_string(),
                            })
                            .await;
                    }
                    Ok(())
                }
            }
        }
    }
}

fn batch_transcript(job: &TranscriptionJob, output: &ExecutorOutput) -> Transcript {
    let audio_duration_ms = match &job.payload {
        JobPayload::Chunk(chunk) => chunk.duration_ms(),
        JobPayload::File(_) => 0,
    };
    Transcript {
        session_id: job.id,
        strategy: Strategy::Batch,
        text: output.text.clone(),
        audio_duration_ms,
        chunks: vec![ChunkRecord {
            index: 0,
            text: Some(output.text.clone()),
            error: None,
            timing_ms: output.timing_ms,
            attempts: job.attempts,
        }],
        success: true,
        error: None,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::MockExecutor;
    use crate::queue::SledJobQueue;
    use std::path::PathBuf;

    fn harness(
        executor: MockExecutor,
        max_retries: u32,
        max_queue_size: usize,
    ) -> (
        BatchCoordinator,
        mpsc::Receiver<StatusEvent>,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let queue = Arc::new(SledJobQueue::new_temp(max_queue_size).unwrap());
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let config = QueueConfig {
            max_queue_size,
            max_retries,
            lease_timeout_ms: 30_000,
            poll_interval_ms: 5,
        };
        let coordinator = BatchCoordinator::new(queue, Arc::new(executor), events_tx, config);
        (coordinator, events_rx, shutdown_tx, shutdown_rx)
    }

    async fn drain_until<F>(rx: &mut mpsc::Receiver<StatusEvent>, mut pred: F) -> StatusEvent
    where
        F: FnMut(&StatusEvent) -> bool,
    {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn job_flows_to_complete() {
        let (coordinator, mut events, shutdown_tx, shutdown_rx) =
            harness(MockExecutor::new().with_response("hello"), 3, 10);
        let coordinator = Arc::new(coordinator);

        let id = coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        match drain_until(&mut events, |e| matches!(e, StatusEvent::Queued { .. })).await {
            StatusEvent::Queued { id: qid, position } => {
                assert_eq!(qid, id);
                assert_eq!(position, 1);
            }
            _ => unreachable!(),
        }
        match drain_until(&mut events, |e| matches!(e, StatusEvent::Complete { .. })).await {
            StatusEvent::Complete { transcript } => {
                assert_eq!(transcript.text, "hello");
                assert!(transcript.success);
            }
            _ => unreachable!(),
        }

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn conversion_phase_projected_for_non_wav_files() {
        let (coordinator, mut events, shutdown_tx, shutdown_rx) =
            harness(MockExecutor::new(), 3, 10);
        let coordinator = Arc::new(coordinator);
        coordinator
            .submit(JobPayload::File(PathBuf::from("a.mp3")))
            .await
            .unwrap();

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        drain_until(&mut events, |e| matches!(e, StatusEvent::Converting { .. })).await;
        drain_until(&mut events, |e| matches!(e, StatusEvent::Complete { .. })).await;

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transient_failures_retry_then_fail_terminally() {
        // max_retries = 3: four dispatches total, all timing out.
        let executor = MockExecutor::new()
            .with_error(ExecutorError::Timeout)
            .with_error(ExecutorError::Timeout)
            .with_error(ExecutorError::Timeout)
            .with_error(ExecutorError::Timeout);
        let (coordinator, mut events, shutdown_tx, shutdown_rx) = harness(executor, 3, 10);
        let coordinator = Arc::new(coordinator);
        let id = coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        match drain_until(&mut events, |e| matches!(e, StatusEvent::Failed { .. })).await {
            StatusEvent::Failed { id: fid, error } => {
                assert_eq!(fid, id);
                assert!(error.contains("timed out"));
            }
            _ => unreachable!(),
        }

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn model_error_fails_without_retry() {
        let executor = MockExecutor::new()
            .with_error(ExecutorError::Model("corrupt".to_string()))
            .with_response("should never be reached");
        let (coordinator, mut events, shutdown_tx, shutdown_rx) = harness(executor, 5, 10);
        let coordinator = Arc::new(coordinator);
        coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        drain_until(&mut events, |e| matches!(e, StatusEvent::Failed { .. })).await;

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn submit_surfaces_queue_full() {
        let (coordinator, _events, _shutdown_tx, _shutdown_rx) =
            harness(MockExecutor::new(), 3, 2);
        coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();
        coordinator
            .submit(JobPayload::File(PathBuf::from("b.wav")))
            .await
            .unwrap();
        let err = coordinator
            .submit(JobPayload::File(PathBuf::from("c.wav")))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Full { limit: 2 }));
    }

    #[tokio::test]
    async fn queued_position_excludes_the_job_in_flight() {
        let (coordinator, mut events, _shutdown_tx, _shutdown_rx) =
            harness(MockExecutor::new(), 3, 10);
        coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();
        // A consumer takes the first job; the next submission is next in line.
        coordinator
            .queue
            .lease("batch-consumer", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let id = coordinator
            .submit(JobPayload::File(PathBuf::from("b.wav")))
            .await
            .unwrap();
        let event = drain_until(&mut events, |e| {
            matches!(e, StatusEvent::Queued { id: qid, .. } if *qid == id)
        })
        .await;
        match event {
            StatusEvent::Queued { position, .. } => assert_eq!(position, 1),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn duplicate_settlement_emits_one_completion() {
        let queue = SledJobQueue::new_temp(10).unwrap();
        let (events_tx, mut events_rx) = mpsc::channel(16);
        let settled = Mutex::new(HashSet::new());
        let job = TranscriptionJob::new(
            JobPayload::File(PathBuf::from("a.wav")),
            Strategy::Batch,
            3,
        );
        queue.enqueue(job).await.unwrap();

        // A lease expiry race leaves two consumers holding the same job.
        let first = queue.lease("a", Duration::ZERO).await.unwrap().unwrap();
        let second = queue.lease("b", Duration::from_secs(30)).await.unwrap().unwrap();

        settle(
            &queue,
            &events_tx,
            &settled,
            second.job.clone(),
            &second.lease,
            Ok(ExecutorOutput {
                text: "once".to_string(),
                timing_ms: 1,
            }),
        )
        .await
        .unwrap();
        settle(
            &queue,
            &events_tx,
            &settled,
            first.job.clone(),
            &first.lease,
            Ok(ExecutorOutput {
                text: "twice".to_string(),
                timing_ms: 1,
            }),
        )
        .await
        .unwrap();

        match events_rx.try_recv().unwrap() {
            StatusEvent::Complete { transcript } => assert_eq!(transcript.text, "once"),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(events_rx.try_recv().is_err());
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retries_count_across_redeliveries() {
        // One timeout, then success: the job completes on its second dispatch.
        let executor = MockExecutor::new()
            .with_error(ExecutorError::Unavailable)
            .with_response("second time lucky");
        let (coordinator, mut events, shutdown_tx, shutdown_rx) = harness(executor, 3, 10);
        let coordinator = Arc::new(coordinator);
        coordinator
            .submit(JobPayload::File(PathBuf::from("a.wav")))
            .await
            .unwrap();

        let consumer = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.run_consumer(shutdown_rx).await })
        };

        match drain_until(&mut events, |e| matches!(e, StatusEvent::Complete { .. })).await {
            StatusEvent::Complete { transcript } => {
                assert_eq!(transcript.text, "second time lucky");
                assert_eq!(transcript.chunks[0].attempts, 2);
            }
            _ => unreachable!(),
        }

        shutdown_tx.send(true).unwrap();
        consumer.await.unwrap().unwrap();
    }
}
