//! Registry of circuits keyed by service name.

// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{info, warn};

use super::circuit::{Circuit, CircuitConfig, CircuitState, Transition};
use super::BreakerError;
use crate::audit::{AuditLog, CircuitLogRecord};
use crate::notify::{CoreNotification, Notifier};
use crate::task::{self, TaskGuard};

struct CircuitEntry {
    circuit: Circuit,
    /// Armed while the circuit is open; aborted on any transition out.
    reset_task: Option<TaskGuard>,
}

/// Per-service circuit breakers with shared defaults.
///
/// Circuits are created lazily on first use and live for the process
/// lifetime. The registry is an explicitly constructed service object:
/// create one at startup and hand out clones of the `Arc` it lives in.
pub struct CircuitBreakerRegistry {
    circuits: Arc<Mutex<HashMap<String, CircuitEntry>>>,
    defaults: CircuitConfig,
    audit: Arc<AuditLog>,
    notifier: Arc<dyn Notifier>,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose lazily-created circuits use `defaults`.
    #[must_use]
    pub fn new(defaults: CircuitConfig, audit: Arc<AuditLog>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            circuits: Arc::new(Mutex::new(HashMap::new())),
            defaults,
            audit,
            notifier,
        }
    }

    /// Registers `service` with a non-default configuration.
    ///
    /// Intended for startup wiring; replaces any existing circuit for the
    /// service, discarding its counters.
    pub fn configure(&self, service: &str, config: CircuitConfig) {
        let mut circuits = self.circuits.lock().unwrap();
        circuits.insert(
            service.to_string(),
            CircuitEntry {
                circuit: Circuit::new(service, config),
                reset_task: None,
            },
        );
    }

    /// Whether a call to `service` is admitted right now.
    ///
    /// True in the closed and half-open states. An open circuit whose reset
    /// deadline has passed flips to half-open on this check.
    pub fn can_execute(&self, service: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap();
        let entry = Self::entry_mut(&mut circuits, service, &self.defaults);
        let (admitted, transition) = entry.circuit.can_execute_at(Instant::now());
        if let Some(transition) = transition {
            entry.reset_task = None;
            self.log_transition(&transition, serde_json::json!({"trigger": "admission_check"}));
        }
        admitted
    }

    /// Records a successful call to `service`.
    pub fn record_success(&self, service: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let entry = Self::entry_mut(&mut circuits, service, &self.defaults);
        if let Some(transition) = entry.circuit.record_success_at(Instant::now()) {
            entry.reset_task = None;
            self.log_transition(&transition, serde_json::json!({"trigger": "recovery"}));
        }
    }

    /// Records a failed call to `service`.
    ///
    /// `error` is stored with any resulting transition for the audit trail.
    pub fn record_failure(&self, service: &str, error: &str) {
        let mut circuits = self.circuits.lock().unwrap();
        let entry = Self::entry_mut(&mut circuits, service, &self.defaults);
        if let Some(transition) = entry.circuit.record_failure_at(Instant::now()) {
            self.log_transition(&transition, serde_json::json!({"last_error": error}));
            if transition.current == CircuitState::Open {
                self.arm_reset(entry, service);
            }
        }
    }

    /// Current state of `service`'s circuit, if one exists yet.
    #[must_use]
    pub fn state(&self, service: &str) -> Option<CircuitState> {
        let circuits = self.circuits.lock().unwrap();
        circuits.get(service).map(|e| e.circuit.state())
    }

    /// Manual operator override back to closed.
    ///
    /// Clears counters and cancels any pending reset timer. Returns `true`
    /// if a circuit existed for the service.
    pub fn reset(&self, service: &str) -> bool {
        let mut circuits = self.circuits.lock().unwrap();
        let Some(entry) = circuits.get_mut(service) else {
            return false;
        };
        entry.reset_task = None;
        if let Some(transition) = entry.circuit.force_closed() {
            self.log_transition(&transition, serde_json::json!({"trigger": "operator_reset"}));
        }
        true
    }

    /// Services with a circuit, in no particular order.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let circuits = self.circuits.lock().unwrap();
        circuits.keys().cloned().collect()
    }

    /// Runs `work` under the breaker for `service`.
    ///
    /// Rejected immediately with [`BreakerError::CircuitOpen`] while the
    /// circuit is open, without invoking `work`. Otherwise the outcome is
    /// recorded and `work`'s error is passed through.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::CircuitOpen`] when rejected, or
    /// [`BreakerError::Operation`] wrapping `work`'s error.
    pub async fn execute_with_breaker<T, E, F, Fut>(
        &self,
        service: &str,
        work: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        if !self.can_execute(service) {
            return Err(BreakerError::CircuitOpen {
                service: service.to_string(),
            });
        }
        match work().await {
            Ok(value) => {
                self.record_success(service);
                Ok(value)
            },
            Err(error) => {
                self.record_failure(service, &error.to_string());
                Err(BreakerError::Operation(error))
            },
        }
    }

    /// Like [`execute_with_breaker`](Self::execute_with_breaker), but any
    /// rejection or failure is absorbed by `fallback`.
    pub async fn execute_with_fallback<T, E, F, Fut, FB>(
        &self,
        service: &str,
        work: F,
        fallback: FB,
    ) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        FB: FnOnce() -> T,
    {
        match self.execute_with_breaker(service, work).await {
            Ok(value) => value,
            Err(_) => fallback(),
        }
    }

    fn entry_mut<'a>(
        circuits: &'a mut HashMap<String, CircuitEntry>,
        service: &str,
        defaults: &CircuitConfig,
    ) -> &'a mut CircuitEntry {
        circuits
            .entry(service.to_string())
            .or_insert_with(|| CircuitEntry {
                circuit: Circuit::new(service, defaults.clone()),
                reset_task: None,
            })
    }

    /// Arms the one-shot open-to-half-open timer for `service`.
    fn arm_reset(&self, entry: &mut CircuitEntry, service: &str) {
        let circuits = Arc::clone(&self.circuits);
        let audit = Arc::clone(&self.audit);
        let notifier = Arc::clone(&self.notifier);
        let service = service.to_string();
        let delay = entry.circuit.config().reset_timeout;

        entry.reset_task = Some(task::spawn_after(delay, async move {
            let mut circuits = circuits.lock().unwrap();
            if let Some(entry) = circuits.get_mut(&service) {
                if let Some(transition) = entry.circuit.try_half_open_at(Instant::now()) {
                    // The guard being dropped here is this task's own; the
                    // remaining work is synchronous, so the abort is a no-op.
                    entry.reset_task = None;
                    persist_transition(
                        &audit,
                        &*notifier,
                        &transition,
                        serde_json::json!({"trigger": "reset_timer"}),
                    );
                }
            }
        }));
    }

    fn log_transition(&self, transition: &Transition, detail: serde_json::Value) {
        persist_transition(&self.audit, &*self.notifier, transition, detail);
    }
}

/// Writes a transition to the audit log (best-effort) and broadcasts it.
fn persist_transition(
    audit: &AuditLog,
    notifier: &dyn Notifier,
    transition: &Transition,
    detail: serde_json::Value,
) {
    info!(
        service = %transition.service,
        previous = %transition.previous,
        current = %transition.current,
        failure_count = transition.failure_count,
        "circuit transition"
    );

    let record = CircuitLogRecord::new(
        transition.service.clone(),
        transition.previous.as_str(),
        transition.current.as_str(),
        transition.failure_count,
        detail,
    );
    if let Err(err) = audit.record_circuit_transition(&record) {
        // Observability loss never fails the guarded operation.
        warn!(service = %transition.service, error = %err, "failed to persist circuit transition");
    }

    notifier.notify(CoreNotification::CircuitTransition {
        service: transition.service.clone(),
        previous: transition.previous.as_str().to_string(),
        current: transition.current.as_str().to_string(),
        failure_count: transition.failure_count,
    });
}
