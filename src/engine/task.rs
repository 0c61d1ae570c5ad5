use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::errors::{EngineError, EngineResult};
use crate::store::Quote;

/// Handle to a quote request running on its own tokio task.
///
/// Dropping the handle detaches the request; call [`EstimationTask::cancel`]
/// to stop it.
pub struct EstimationTask {
    handle: JoinHandle<EngineResult<Quote>>,
    cancel: CancellationToken,
}

impl EstimationTask {
    pub(crate) fn new(handle: JoinHandle<EngineResult<Quote>>, cancel: CancellationToken) -> Self {
        Self { handle, cancel }
    }

    /// Stop waiting on external calls. Nothing is persisted for a cancelled
    /// request.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> EngineResult<Quote> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Err(EngineError::Cancelled),
            Err(err) => Err(EngineError::internal(format!("estimation task panicked: {err}"))),
        }
    }
}
