//! Durable correlation records for dispatched work.

use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

use crate::store::{PendingCorrelation, Store};
use crate::types::{CorrelationId, Error, Result, StepExecutionId, WorkerId};

/// Pairs replies on the shared payload-response queue with the step
/// execution that produced them.
#[derive(Debug, Clone)]
pub struct CorrelationRegistry {
    store: Store,
    grace: Duration,
    retry_interval: Duration,
}

impl CorrelationRegistry {
    pub fn new(store: Store, grace: Duration, retry_interval: Duration) -> Self {
        Self {
            store,
            grace,
            retry_interval,
        }
    }

    pub async fn register(
        &self,
        correlation_id: CorrelationId,
        step_execution_id: StepExecutionId,
        worker_id: WorkerId,
    ) -> Result<PendingCorrelation> {
        self.store
            .correlations
            .create(PendingCorrelation {
                id: correlation_id,
                step_execution_id,
                worker_id,
                created_at: Some(Utc::now()),
            })
            .await
    }

    /// Look up `correlation_id`, retrying for the grace period so a reply
    /// racing its own registration still matches. `None` means unknown.
    pub async fn resolve(&self, correlation_id: &CorrelationId) -> Result<Option<PendingCorrelation>> {
        let deadline = Instant::now() + self.grace;
        loop {
            match self.store.correlations.get(correlation_id).await {
                Ok(pending) => return Ok(Some(pending)),
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                tracing::warn!(correlation_id = %correlation_id, "unknown correlation id, reply discarded");
                return Ok(None);
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Remove a settled correlation. Missing records are fine.
    pub async fn complete(&self, correlation_id: &CorrelationId) -> Result<()> {
        match self.store.correlations.delete(correlation_id).await {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
