//! Worker pool manager: owns the worker slots, keeps them healthy, and in
//! advanced mode consumes the job queue by assigning leases to idle workers.
//!
//! One slot, one process. A slot whose process fails its probe threshold is
//! marked unhealthy, killed, and relaunched after an exponential backoff.
//! A worker lost mid-job is never nacked here; its lease simply expires and
//! the queue redelivers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{QueueConfig, WorkerConfig};
use crate::error::{ExecutorError, QueueError, WorkerError};
use crate::executor::ExecutorOutput;
use crate::protocol::{StatusEvent, WorkerRequest, WorkerResponse};
use crate::queue::{JobQueue, QueueEntry};

use super::handle::{WorkerHandle, WorkerId, WorkerState};
use super::transport::{WorkerLauncher, WorkerTransport};

struct WorkerEntry {
    handle: WorkerHandle,
    transport: Arc<dyn WorkerTransport>,
}

pub struct WorkerPoolManager {
    workers: Mutex<HashMap<WorkerId, WorkerEntry>>,
    launcher: Arc<dyn WorkerLauncher>,
    config: WorkerConfig,
}

impl WorkerPoolManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: WorkerConfig) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            launcher,
            config,
        }
    }

    /// Launch the configured number of workers. All start in `Starting`;
    /// the health loop confirms them into rotation.
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut workers = self.workers.lock().await;
        for slot in 0..self.config.worker_count {
            let id = WorkerId(slot as u32);
            let transport = self.launcher.launch(id).await?;
            workers.insert(
                id,
                WorkerEntry {
                    handle: WorkerHandle::new(
                        id,
                        Duration::from_millis(self.config.backoff_initial_ms),
                        Duration::from_millis(self.config.backoff_max_ms),
                    ),
                    transport,
                },
            );
            info!(worker = %id, "worker launched");
        }
        Ok(())
    }

    /// Probe every worker that is not busy, applying state transitions.
    pub async fn probe_once(self: &Arc<Self>) {
        let probe_timeout = Duration::from_millis(self.config.health_check_interval_ms);
        let targets: Vec<(WorkerId, Arc<dyn WorkerTransport>)> = {
            let workers = self.workers.lock().await;
            workers
                .iter()
                .filter(|(_, e)| {
                    matches!(e.handle.state(), WorkerState::Starting | WorkerState::Idle)
                })
                .map(|(id, e)| (*id, Arc::clone(&e.transport)))
                .collect()
        };

        for (id, transport) in targets {
            let result = transport.request(WorkerRequest::Ping, probe_timeout).await;
            let mut workers = self.workers.lock().await;
            let Some(entry) = workers.get_mut(&id) else {
                continue;
            };
            // The worker may have been claimed while we pinged.
            if entry.handle.state() == WorkerState::Busy {
                continue;
            }
            match result {
                Ok(WorkerResponse::Pong) => entry.handle.record_pong(),
                Ok(other) => {
                    warn!(worker = %id, "unexpected probe reply: {other:?}");
                    self.note_probe_failure(entry);
                }
                Err(e) => {
                    debug!(worker = %id, "probe failed: {e}");
                    self.note_probe_failure(entry);
                }
            }
        }
    }

    fn note_probe_failure(self: &Arc<Self>, entry: &mut WorkerEntry) {
        let failures = entry.handle.record_probe_failure();
        if failures >= self.config.health_failure_threshold {
            let backoff = entry.handle.mark_unhealthy();
            warn!(worker = %entry.handle.id, failures, ?backoff, "worker unhealthy, restarting");
            let pool = Arc::clone(self);
            let id = entry.handle.id;
            let transport = Arc::clone(&entry.transport);
            tokio::spawn(async move {
                pool.restart_worker(id, transport, backoff).await;
            });
        }
    }

    /// Kill the old process and launch a replacement after `backoff`.
    /// Launch failures retry with their own doubling delay.
    async fn restart_worker(
        self: Arc<Self>,
        id: WorkerId,
        old_transport: Arc<dyn WorkerTransport>,
        backoff: Duration,
    ) {
        old_transport.shutdown().await;
        let max = Duration::from_millis(self.config.backoff_max_ms);
        let mut delay = backoff;
        loop {
            tokio::time::sleep(delay).await;
            match self.launcher.launch(id).await {
                Ok(transport) => {
                    let mut workers = self.workers.lock().await;
                    if let Some(entry) = workers.get_mut(&id) {
                        if entry.handle.state() == WorkerState::Terminated {
                            transport.shutdown().await;
                            return;
                        }
                        entry.transport = transport;
                        entry.handle.mark_restarted();
                        info!(worker = %id, restarts = entry.handle.restarts(), "worker restarted");
                    }
                    return;
                }
                Err(e) => {
                    error!(worker = %id, "relaunch failed: {e}");
                    delay = (delay * 2).min(max);
                }
            }
        }
    }

    /// Run health probes until `shutdown` flips.
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.health_check_interval_ms,
        ));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.probe_once().await,
                _ = shutdown.changed() => {
                    debug!("health loop stopping");
                    return;
                }
            }
        }
    }

    /// Claim an idle worker for one assignment. `None` when every worker is
    /// busy, starting, or down.
    pub async fn claim_idle(&self) -> Option<(WorkerId, Arc<dyn WorkerTransport>)> {
        let mut workers = self.workers.lock().await;
        let mut ids: Vec<WorkerId> = workers.keys().copied().collect();
        ids.sort();
        for id in ids {
            let entry = workers.get_mut(&id)?;
            if entry.handle.begin_assignment().is_ok() {
                return Some((id, Arc::clone(&entry.transport)));
            }
        }
        None
    }

    /// Return a worker to rotation after its assignment finished.
    pub async fn release(&self, id: WorkerId) {
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.handle.complete_assignment();
        }
    }

    /// A claimed worker failed its assignment at the transport level. The
    /// failure counts toward its probe threshold.
    pub async fn report_failure(self: &Arc<Self>, id: WorkerId) {
        let mut workers = self.workers.lock().await;
        if let Some(entry) = workers.get_mut(&id) {
            entry.handle.complete_assignment();
            self.note_probe_failure(entry);
        }
    }

    /// Number of workers currently in the given state.
    pub async fn count_in_state(&self, state: WorkerState) -> usize {
        let workers = self.workers.lock().await;
        workers
            .values()
            .filter(|e| e.handle.state() == state)
            .count()
    }

    /// Terminate every worker for good.
    pub async fn shutdown_all(&self) {
        let mut workers = self.workers.lock().await;
        for entry in workers.values_mut() {
            entry.handle.mark_terminated();
            entry.transport.shutdown().await;
        }
        info!("worker pool shut down");
    }

    /// Consume the queue, assigning each leased job to an idle worker.
    /// Runs until `shutdown` flips. Jobs whose worker dies mid-flight are
    /// left to lease expiry.
    pub async fn run_dispatcher(
        self: Arc<Self>,
        queue: Arc<dyn JobQueue>,
        events: mpsc::Sender<StatusEvent>,
        queue_config: QueueConfig,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        let lease_for = Duration::from_millis(queue_config.lease_timeout_ms);
        let poll = Duration::from_millis(queue_config.poll_interval_ms);
        let settled: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));

        loop {
            if *shutdown.borrow() {
                debug!("dispatcher stopping");
                return Ok(());
            }

            let Some((worker_id, transport)) = self.claim_idle().await else {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            };

            let entry = match queue.lease(&worker_id.to_string(), lease_for).await? {
                Some(entry) => entry,
                None => {
                    self.release(worker_id).await;
                    tokio::select! {
                        _ = tokio::time::sleep(poll) => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            let pool = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let events = events.clone();
            let settled = Arc::clone(&settled);
            let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
            tokio::spawn(async move {
                let QueueEntry { job, lease } = entry;

                if settled.lock().await.contains(&job.id) {
                    let _ = queue.ack(job.id, lease.token).await;
                    pool.release(worker_id).await;
                    return;
                }

                let _ = events.send(StatusEvent::Processing { id: job.id }).await;
                if job.payload.needs_conversion() {
                    let _ = events.send(StatusEvent::Converting { id: job.id }).await;
                }
                let _ = events.send(StatusEvent::Transcribing { id: job.id }).await;

                let request = WorkerRequest::Transcribe {
                    job_id: job.id,
                    payload: job.payload.clone(),
                    model_params: HashMap::new(),
                };
                match transport.request(request, response_timeout).await {
                    Ok(response) => {
                        pool.release(worker_id).await;
                        let outcome = response_to_outcome(response);
                        if let Err(e) = crate::batch::settle(
                            queue.as_ref(),
                            &events,
                            settled.as_ref(),
                            job,
                            &lease,
                            outcome,
                        )
                        .await
                        {
                            warn!("settlement failed: {e}");
                        }
                    }
                    Err(e) => {
                        // Worker lost or hung mid-job. No nack: the lease
                        // expires and the queue redelivers.
                        warn!(worker = %worker_id, job = %job.id, "worker failed mid-job: {e}");
                        pool.report_failure(worker_id).await;
                    }
                }
            });
        }
    }
}

fn response_to_outcome(response: WorkerResponse) -> Result<ExecutorOutput, ExecutorError> {
    match response {
        WorkerResponse::Transcript { text, timing_ms, .. } => {
            Ok(ExecutorOutput { text, timing_ms })
        }
        WorkerResponse::Error {
            message, retryable, ..
        } => {
            if retryable {
                Err(ExecutorError::Unavailable)
            } else {
                Err(ExecutorError::Model(message))
            }
        }
        WorkerResponse::Pong => Err(ExecutorError::Model(
            "worker sent pong to a transcribe request".to_string(),
        )),
    }
}
