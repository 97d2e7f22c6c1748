//! Per-worker bookkeeping: identity, lifecycle state, failure counters, and
//! restart backoff.

use std::time::{Duration, Instant};

use crate::error::WorkerError;

/// Stable identity of a worker slot. Survives process restarts; the slot
/// keeps its id when its process is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Process launched, not yet confirmed responsive.
    Starting,
    /// Responsive and free to take an assignment.
    Idle,
    /// Processing one job. Health probes pause while busy.
    Busy,
    /// Failed its probe threshold; a restart is pending.
    Unhealthy,
    /// Shut down for good.
    Terminated,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "Starting",
            Self::Idle => "Idle",
            Self::Busy => "Busy",
            Self::Unhealthy => "Unhealthy",
            Self::Terminated => "Terminated",
        };
        write!(f, "{name}")
    }
}

/// Mutable record for one worker slot. Owned by the pool manager; all
/// transitions go through these methods so invalid ones cannot happen.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    state: WorkerState,
    consecutive_failures: u32,
    restarts: u32,
    current_backoff: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
    last_heartbeat: Option<Instant>,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            id,
            state: WorkerState::Starting,
            consecutive_failures: 0,
            restarts: 0,
            current_backoff: initial_backoff,
            initial_backoff,
            max_backoff,
            last_heartbeat: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.last_heartbeat
    }

    /// Claim this worker for a job. Only an Idle worker may be claimed.
    pub fn begin_assignment(&mut self) -> Result<(), WorkerError> {
        if self.state != WorkerState::Idle {
            return Err(WorkerError::NotIdle {
                state: self.state.to_string(),
            });
        }
        self.state = WorkerState::Busy;
        Ok(())
    }

    /// Return the worker after its job finished (either way).
    pub fn complete_assignment(&mut self) {
        if self.state == WorkerState::Busy {
            self.state = WorkerState::Idle;
        }
    }

    /// A probe came back. Confirms a Starting worker and clears the failure
    /// streak; a healthy answer also resets the restart backoff.
    pub fn record_pong(&mut self) {
        if matches!(self.state, WorkerState::Starting | WorkerState::Unhealthy) {
            self.state = WorkerState::Idle;
        }
        self.consecutive_failures = 0;
        self.current_backoff = self.initial_backoff;
        self.last_heartbeat = Some(Instant::now());
    }

    /// A probe failed. Returns the new failure streak length.
    pub fn record_probe_failure(&mut self) -> u32 {
        self.consecutive_failures += 1;
        self.consecutive_failures
    }

    /// Take the worker out of rotation and reserve its restart delay.
    /// Each call doubles the next delay, capped at the maximum.
    pub fn mark_unhealthy(&mut self) -> Duration {
        self.state = WorkerState::Unhealthy;
        let backoff = self.current_backoff;
        self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
        backoff
    }

    /// A replacement process was launched for this slot.
    pub fn mark_restarted(&mut self) {
        self.state = WorkerState::Starting;
        self.consecutive_failures = 0;
        self.restarts += 1;
    }

    pub fn mark_terminated(&mut self) {
        self.state = WorkerState::Terminated;
    }
}
