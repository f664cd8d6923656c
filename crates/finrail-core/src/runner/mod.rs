//! Operation runner: the single entry point for guarded financial
//! operations.
//!
//! Business code hands the runner a resource key, a service name, an
//! aggregate reference, and a unit of work. The runner serializes
//! conflicting work through the lock manager, gates execution through the
//! circuit breaker, records the resulting domain events, and reports the
//! outcome back to the breaker:
//!
//! ```text
//! acquire lock --> breaker admission --> work --> append events
//!      |                 |                |             |
//!  ResourceBusy     CircuitOpen      record failure   fatal if it fails
//!                                    + release        then success + release
//! ```
//!
//! The ordering guarantees that no two concurrent callers run conflicting
//! work on the same resource, a failing service is not hammered by
//! retries, and every state change that reports success has a durable
//! event behind it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::breaker::CircuitBreakerRegistry;
use crate::events::{EventDraft, EventStore, EventStoreError, FinancialEvent};
use crate::kv::KvError;
use crate::lock::{LockError, LockManager};

#[cfg(test)]
mod tests;

/// What a guarded operation targets.
#[derive(Debug, Clone)]
pub struct OperationRequest {
    /// Resource key to lock, e.g. `"property:42:invest"`.
    pub resource: String,

    /// Service name for circuit admission, e.g. `"finance.investments"`.
    pub service: String,

    /// Aggregate type the resulting events belong to.
    pub aggregate_type: String,

    /// Aggregate id the resulting events belong to.
    pub aggregate_id: String,

    /// User on whose behalf the operation runs, stamped onto events that
    /// do not carry their own user.
    pub user_id: Option<String>,

    /// Lock TTL override; the lock manager's default applies otherwise.
    pub ttl: Option<Duration>,
}

impl OperationRequest {
    /// Creates a request with no user attribution and the default TTL.
    #[must_use]
    pub fn new(
        resource: impl Into<String>,
        service: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            service: service.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            user_id: None,
            ttl: None,
        }
    }

    /// Attributes the operation to a user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Overrides the lock TTL for this operation.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// A successfully guarded operation: the work's value plus the events that
/// now document it.
#[derive(Debug)]
pub struct OperationOutcome<T> {
    /// Value returned by the unit of work.
    pub value: T,

    /// Events appended for this operation, in append order.
    pub events: Vec<FinancialEvent>,
}

/// Errors from a guarded operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OperationError {
    /// The resource lock could not be acquired; retry later or inform the
    /// caller.
    #[error("resource busy: {resource}")]
    ResourceBusy {
        /// Resource key that stayed locked.
        resource: String,
    },

    /// The service's circuit is open; the operation was rejected without
    /// executing.
    #[error("circuit open for service {service}")]
    CircuitOpen {
        /// Service whose circuit rejected the operation.
        service: String,
    },

    /// The lock's backing store failed.
    #[error("lock store error: {0}")]
    LockStore(#[from] KvError),

    /// The audit event could not be durably recorded. Fatal: the operation
    /// must not report success without its event.
    #[error("event append failed: {0}")]
    EventAppend(#[from] EventStoreError),

    /// The unit of work itself failed.
    #[error("operation failed: {0}")]
    Work(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl From<LockError> for OperationError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Store(e) => Self::LockStore(e),
            LockError::ResourceBusy { resource } => Self::ResourceBusy { resource },
        }
    }
}

/// Composes the lock manager, breaker registry, and event store into one
/// guarded execution path.
///
/// Constructed once at startup with the three services it wraps; business
/// controllers share it by `Arc`.
pub struct OperationRunner {
    locks: Arc<LockManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<EventStore>,
}

impl OperationRunner {
    /// Creates a runner over the given services.
    #[must_use]
    pub const fn new(
        locks: Arc<LockManager>,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            locks,
            breakers,
            events,
        }
    }

    /// The lock manager this runner wraps.
    #[must_use]
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The breaker registry this runner wraps.
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// The event store this runner wraps.
    #[must_use]
    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    /// Runs `work` under lock, breaker, and event recording.
    ///
    /// `work` returns its business value together with the event drafts
    /// documenting what it did; the runner appends them only after the work
    /// succeeds. The lock is released on every exit path.
    ///
    /// # Errors
    ///
    /// [`OperationError::ResourceBusy`] and [`OperationError::CircuitOpen`]
    /// are expected outcomes for the caller to decide about. Store and
    /// append failures, and `work`'s own error, propagate as hard errors.
    pub async fn run<T, E, F, Fut>(
        &self,
        request: OperationRequest,
        work: F,
    ) -> Result<OperationOutcome<T>, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Vec<EventDraft>), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let ttl = request.ttl.unwrap_or(self.locks.config().default_ttl);
        let lock_config = self.locks.config();
        let (max_retries, retry_delay) = (lock_config.max_retries, lock_config.retry_delay);

        let Some(token) = self
            .locks
            .acquire(&request.resource, ttl, max_retries, retry_delay)
            .await?
        else {
            debug!(resource = %request.resource, "operation rejected: resource busy");
            return Err(OperationError::ResourceBusy {
                resource: request.resource,
            });
        };

        if !self.breakers.can_execute(&request.service) {
            debug!(service = %request.service, "operation rejected: circuit open");
            self.release_quietly(&request.resource, &token).await;
            return Err(OperationError::CircuitOpen {
                service: request.service,
            });
        }

        self.locks.arm_extender(&request.resource, &token, ttl);

        match work().await {
            Ok((value, drafts)) => {
                let appended = self.append_all(&request, drafts);
                match appended {
                    Ok(events) => {
                        self.breakers.record_success(&request.service);
                        self.release_quietly(&request.resource, &token).await;
                        Ok(OperationOutcome { value, events })
                    },
                    Err(err) => {
                        // A financial change must not report success without
                        // its audit trail.
                        error!(
                            resource = %request.resource,
                            aggregate = %format!("{}/{}", request.aggregate_type, request.aggregate_id),
                            error = %err,
                            "event append failed; failing the operation"
                        );
                        self.breakers.record_failure(&request.service, &err.to_string());
                        self.release_quietly(&request.resource, &token).await;
                        Err(OperationError::EventAppend(err))
                    },
                }
            },
            Err(err) => {
                self.breakers.record_failure(&request.service, &err.to_string());
                self.release_quietly(&request.resource, &token).await;
                Err(OperationError::Work(Box::new(err)))
            },
        }
    }

    /// Like [`run`](Self::run), but a busy resource or open circuit yields
    /// `fallback()` instead of an error.
    ///
    /// # Errors
    ///
    /// Store, append, and work failures still propagate.
    pub async fn run_with_fallback<T, E, F, Fut, FB>(
        &self,
        request: OperationRequest,
        work: F,
        fallback: FB,
    ) -> Result<OperationOutcome<T>, OperationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Vec<EventDraft>), E>>,
        E: std::error::Error + Send + Sync + 'static,
        FB: FnOnce() -> T,
    {
        match self.run(request, work).await {
            Err(OperationError::ResourceBusy { .. } | OperationError::CircuitOpen { .. }) => {
                Ok(OperationOutcome {
                    value: fallback(),
                    events: Vec::new(),
                })
            },
            other => other,
        }
    }

    fn append_all(
        &self,
        request: &OperationRequest,
        drafts: Vec<EventDraft>,
    ) -> Result<Vec<FinancialEvent>, EventStoreError> {
        let mut events = Vec::with_capacity(drafts.len());
        for mut draft in drafts {
            if draft.user_id.is_none() {
                draft.user_id.clone_from(&request.user_id);
            }
            let event = self
                .events
                .append(&request.aggregate_type, &request.aggregate_id, draft)?;
            events.push(event);
        }
        Ok(events)
    }

    async fn release_quietly(&self, resource: &str, token: &str) {
        if let Err(err) = self.locks.release(resource, token).await {
            // The TTL reclaims the lock; nothing more to do here.
            warn!(resource, error = %err, "failed to release operation lock");
        }
    }
}
