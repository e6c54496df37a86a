//! Error type surfaced by queue operations.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use jobq_core::DomainError;

use crate::store::StoreError;

pub type QueueResult<T> = Result<T, QueueError>;

const TRANSIENT_ATTEMPTS: u32 = 3;
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// A domain rule was violated, or the store failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueueError {
    /// Worth retrying: lock contention or a store hiccup.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Domain(_) => false,
            QueueError::Store(e) => e.is_transient(),
        }
    }

    /// Process exit code for a handled failure.
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, QueueError::Domain(DomainError::NotFound(_)))
    }
}

/// Run `op` again with doubling backoff while it fails transiently, up to
/// `TRANSIENT_ATTEMPTS` tries.
pub(crate) async fn retry_transient<T, F, Fut>(what: &str, mut op: F) -> QueueResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = QueueResult<T>>,
{
    let mut delay = TRANSIENT_BACKOFF;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < TRANSIENT_ATTEMPTS => {
                warn!(operation = what, attempt, error = %e, "transient store error, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}
