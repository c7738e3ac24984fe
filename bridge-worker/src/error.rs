use bridge_common::store::StoreError;
use thiserror::Error;

/// Fatal membership failures. A peer that cannot join or prove liveness
/// must stop doing work; these terminate the process after a best-effort
/// leave.
#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("failed to join the peer fleet: {0}")]
    Join(#[source] StoreError),
    #[error("failed to renew peer lease: {0}")]
    Renew(#[source] StoreError),
}

/// Errors from the scheduler's own machinery. Transient store failures
/// during a poll cycle are logged and skipped, not surfaced here.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("scheduler task panicked: {0}")]
    TaskPanic(String),
}

/// Terminal result of a registered membership child task.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Membership(#[from] MembershipError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("task panicked: {0}")]
    Panic(String),
}
