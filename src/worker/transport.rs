//! Transport to external worker processes.
//!
//! Wire format over stdio: one request or response per line, hex-encoded
//! MessagePack. Hex keeps the framing trivially line-safe at the cost of 2x
//! size, which is negligible next to model inference time.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::protocol::{WorkerRequest, WorkerResponse};

use super::handle::WorkerId;

/// One request/response round trip to a worker. Implementations serialize
/// concurrent callers internally; the pool never shares a worker anyway.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn request(
        &self,
        request: WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerResponse, WorkerError>;

    /// Tear the worker down. Idempotent.
    async fn shutdown(&self);
}

/// Launches worker processes. The seam that lets tests run the pool against
/// scripted in-memory workers.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, id: WorkerId) -> Result<Arc<dyn WorkerTransport>, WorkerError>;
}

/// Command line used to start worker processes.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Spawns real worker processes and speaks the stdio wire format to them.
pub struct ProcessLauncher {
    command: WorkerCommand,
}

impl ProcessLauncher {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, id: WorkerId) -> Result<Arc<dyn WorkerTransport>, WorkerError> {
        let transport = ProcessTransport::spawn(id, &self.command).await?;
        Ok(Arc::new(transport))
    }
}

struct ProcessIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// A live worker process with piped stdio.
pub struct ProcessTransport {
    id: WorkerId,
    child: Mutex<Child>,
    io: Mutex<ProcessIo>,
}

impl ProcessTransport {
    pub async fn spawn(id: WorkerId, command: &WorkerCommand) -> Result<Self, WorkerError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| WorkerError::Spawn {
                message: format!("{} ({})", e, command.program),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| WorkerError::Spawn {
            message: "no stdin pipe".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| WorkerError::Spawn {
            message: "no stdout pipe".to_string(),
        })?;

        // Relay worker stderr into our logs so crashes leave a trace.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker = %id, "{line}");
                }
            });
        }

        debug!(worker = %id, program = %command.program, "worker process spawned");
        Ok(Self {
            id,
            child: Mutex::new(child),
            io: Mutex::new(ProcessIo {
                stdin,
                stdout: BufReader::new(stdout),
            }),
        })
    }

    async fn round_trip(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        let encoded = request.to_bytes().map_err(|e| WorkerError::Protocol {
            message: format!("encode: {e}"),
        })?;
        let mut line = hex::encode(encoded);
        line.push('\n');

        let mut io = self.io.lock().await;
        io.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|_| WorkerError::Closed)?;
        io.stdin.flush().await.map_err(|_| WorkerError::Closed)?;

        let mut reply = String::new();
        let read = io
            .stdout
            .read_line(&mut reply)
            .await
            .map_err(|_| WorkerError::Closed)?;
        if read == 0 {
            return Err(WorkerError::Closed);
        }

        let bytes = hex::decode(reply.trim()).map_err(|e| WorkerError::Protocol {
            message: format!("bad hex frame: {e}"),
        })?;
        WorkerResponse::from_bytes(&bytes).map_err(|e| WorkerError::Protocol {
            message: format!("decode: {e}"),
        })
    }
}

#[async_trait]
impl WorkerTransport for ProcessTransport {
    async fn request(
        &self,
        request: WorkerRequest,
        timeout: Duration,
    ) -> Result<WorkerResponse, WorkerError> {
        match tokio::time::timeout(timeout, self.round_trip(&request)).await {
            Ok(result) => result,
            Err(_) => Err(WorkerError::Timeout),
        }
    }

    async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(worker = %self.id, "kill failed (already dead?): {e}");
        }
    }
}

/// Scripted in-memory worker for pool tests.
pub struct MockTransport {
    responses: Mutex<Vec<Result<WorkerResponse, WorkerError>>>,
    fail_pings: AtomicBool,
    shut_down: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
            fail_pings: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub async fn push_response(&self, response: Result<WorkerResponse, WorkerError>) {
        self.responses.lock().await.push(response);
    }

    /// Make health probes fail from now on, simulating a hung process.
    pub fn set_fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerTransport for MockTransport {
    async fn request(
        &self,
        request: WorkerRequest,
        _timeout: Duration,
    ) -> Result<WorkerResponse, WorkerError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(WorkerError::Closed);
        }
        match request {
            WorkerRequest::Ping => {
                if self.fail_pings.load(Ordering::SeqCst) {
                    Err(WorkerError::Timeout)
                } else {
                    Ok(WorkerResponse::Pong)
                }
            }
            WorkerRequest::Transcribe { job_id, .. } => {
                let mut responses = self.responses.lock().await;
                if responses.is_empty() {
                    Ok(WorkerResponse::Transcript {
                        job_id,
                        text: "mock worker transcription".to_string(),
                        timing_ms: 1,
                    })
                } else {
                    responses.remove(0)
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Launcher that hands out `MockTransport`s and counts launches, so restart
/// behavior is observable.
pub struct MockLauncher {
    launches: AtomicU32,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self {
            launches: AtomicU32::new(0),
            transports: Mutex::new(Vec::new()),
        }
    }

    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// Transports handed out so far, in launch order.
    pub async fn transports(&self) -> Vec<Arc<MockTransport>> {
        self.transports.lock().await.clone()
    }
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLauncher for MockLauncher {
    async fn launch(&self, _id: WorkerId) -> Result<Arc<dyn WorkerTransport>, WorkerError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(MockTransport::new());
        self.transports.lock().await.push(Arc::clone(&transport));
        Ok(transport)
    }
}
