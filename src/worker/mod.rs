//! External worker processes: identity and lifecycle (`handle`), the stdio
//! wire transport (`transport`), and the pool manager that keeps them
//! healthy and fed (`pool`).

mod handle;
mod pool;
mod transport;

pub use handle::{WorkerHandle, WorkerId, WorkerState};
pub use pool::WorkerPoolManager;
pub use transport::{
    MockLauncher, MockTransport, ProcessLauncher, ProcessTransport, WorkerCommand,
    WorkerLauncher, WorkerTransport,
};
