//! The job worker engine.
//!
//! [`Worker`] owns the poll loop, the concurrency limiter, the supervisor
//! that restarts the loop after faults, and the startup reconciliation
//! passes (orphan recovery and stale job reaping).

mod dispatch;
mod engine;
mod handler;
mod limiter;
mod reaper;
mod recovery;
mod scheduler;
mod state;
mod supervisor;

pub use dispatch::CompletionCallback;
pub use engine::{DrainReport, Worker, WorkerBuilder};
pub use handler::{CommandHandler, HandlerRegistry, JobHandler};
pub use limiter::{ActiveJobGuard, ConcurrencyLimiter};
pub use reaper::{ReapReport, StaleJobReaper};
pub use recovery::{OrphanRecovery, PAYLOAD_EXTERNAL_OPERATION_ID, PAYLOAD_RESUME, RecoveryReport};
pub use scheduler::CycleOutcome;
pub use state::{RunState, WorkerState, WorkerStats};
pub use supervisor::BackoffPolicy;
