//! Worker-backed executor: each submission claims an idle worker from the
//! pool for one request/response round trip.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::{ExecutorError, WorkerError};
use crate::protocol::{JobPayload, WorkerRequest, WorkerResponse};
use crate::worker::WorkerPoolManager;

use super::{Executor, ExecutorOutput};

pub struct PooledExecutor {
    pool: Arc<WorkerPoolManager>,
    response_timeout: Duration,
}

impl PooledExecutor {
    pub fn new(pool: Arc<WorkerPoolManager>, response_timeout: Duration) -> Self {
        Self {
            pool,
            response_timeout,
        }
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    async fn submit(&self, payload: &JobPayload) -> Result<ExecutorOutput, ExecutorError> {
        let Some((worker_id, transport)) = self.pool.claim_idle().await else {
            return Err(ExecutorError::Unavailable);
        };

        let request = WorkerRequest::Transcribe {
            job_id: Uuid::new_v4(),
            payload: payload.clone(),
            model_params: HashMap::new(),
        };

        match transport.request(request, self.response_timeout).await {
            Ok(WorkerResponse::Transcript { text, timing_ms, .. }) => {
                self.pool.release(worker_id).await;
                Ok(ExecutorOutput { text, timing_ms })
            }
            Ok(WorkerResponse::Error {
                message, retryable, ..
            }) => {
                self.pool.release(worker_id).await;
                if retryable {
                    Err(ExecutorError::Unavailable)
                } else {
                    Err(ExecutorError::Model(message))
                }
            }
            Ok(WorkerResponse::Pong) => {
                self.pool.release(worker_id).await;
                Err(ExecutorError::Model(
                    "worker sent pong to a transcribe request".to_string(),
                ))
            }
            Err(WorkerError::Timeout) => {
                warn!(worker = %worker_id, "worker timed out on assignment");
                self.pool.report_failure(worker_id).await;
                Err(ExecutorError::Timeout)
            }
            Err(e) => {
                warn!(worker = %worker_id, "worker transport failed: {e}");
                self.pool.report_failure(worker_id).await;
                Err(ExecutorError::Unavailable)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::worker::{MockLauncher, WorkerLauncher, WorkerState, WorkerTransport};
    use std::path::PathBuf;

    async fn pool_with_idle_workers(count: usize) -> (Arc<WorkerPoolManager>, Arc<MockLauncher>) {
        let launcher = Arc::new(MockLauncher::new());
        let pool = Arc::new(WorkerPoolManager::new(
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            WorkerConfig {
                worker_count: count,
                health_check_interval_ms: 10,
                health_failure_threshold: 2,
                backoff_initial_ms: 1,
                backoff_max_ms: 8,
                response_timeout_ms: 1_000,
            },
        ));
        pool.start().await.unwrap();
        pool.probe_once().await;
        (pool, launcher)
    }

    fn payload() -> JobPayload {
        JobPayload::File(PathBuf::from("a.wav"))
    }

    #[tokio::test]
    async fn submits_through_an_idle_worker() {
        let (pool, _launcher) = pool_with_idle_workers(1).await;
        let executor = PooledExecutor::new(Arc::clone(&pool), Duration::from_secs(1));

        let out = executor.submit(&payload()).await.unwrap();
        assert_eq!(out.text, "mock worker transcription");
        // Worker released afterwards.
        assert_eq!(pool.count_in_state(WorkerState::Idle).await, 1);
    }

    #[tokio::test]
    async fn no_idle_worker_means_unavailable() {
        let (pool, _launcher) = pool_with_idle_workers(1).await;
        let (_claimed, _transport) = pool.claim_idle().await.unwrap();

        let executor = PooledExecutor::new(Arc::clone(&pool), Duration::from_secs(1));
        assert_eq!(
            executor.submit(&payload()).await.unwrap_err(),
            ExecutorError::Unavailable
        );
    }

    #[tokio::test]
    async fn worker_error_maps_by_retryability() {
        let (pool, launcher) = pool_with_idle_workers(1).await;
        let transport = &launcher.transports().await[0];
        transport
            .push_response(Ok(WorkerResponse::Error {
                job_id: Uuid::new_v4(),
                message: "transient".to_string(),
                retryable: true,
            }))
            .await;
        transport
            .push_response(Ok(WorkerResponse::Error {
                job_id: Uuid::new_v4(),
                message: "bad audio".to_string(),
                retryable: false,
            }))
            .await;

        let executor = PooledExecutor::new(Arc::clone(&pool), Duration::from_secs(1));
        assert_eq!(
            executor.submit(&payload()).await.unwrap_err(),
            ExecutorError::Unavailable
        );
        assert_eq!(
            executor.submit(&payload()).await.unwrap_err(),
            ExecutorError::Model("bad audio".to_string())
        );
    }

    #[tokio::test]
    async fn transport_loss_reports_the_worker() {
        let (pool, launcher) = pool_with_idle_workers(1).await;
        launcher.transports().await[0].shutdown().await;

        let executor = PooledExecutor::new(Arc::clone(&pool), Duration::from_secs(1));
        assert_eq!(
            executor.submit(&payload()).await.unwrap_err(),
            ExecutorError::Unavailable
        );
        // The failure counted toward the worker's health threshold.
        assert_eq!(pool.count_in_state(WorkerState::Idle).await, 1);
    }
}
