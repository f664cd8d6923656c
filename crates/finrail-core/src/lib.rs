//! finrail-core: resilience and consistency core for financial operations.
//!
//! Money-moving operations (investment creation, ROI distribution, wallet
//! adjustments, secondary-market settlement) run across multiple server
//! instances at once. This crate provides the three mechanisms that make
//! that safe, plus the facade that composes them:
//!
//! - [`lock`]: distributed mutual exclusion over named resources, backed by
//!   a shared key-value store with atomic conditional operations.
//! - [`breaker`]: per-service circuit breakers that isolate repeated
//!   failures and probe for recovery.
//! - [`events`]: an append-only, versioned event store that is both the
//!   audit trail and the sole source of truth for aggregate state.
//! - [`runner`]: the guarded execution path business code actually calls,
//!   wrapping a unit of work with lock acquisition, breaker admission, and
//!   event recording.
//!
//! Supporting modules: [`kv`] (the backing-store contract with a real and
//! an in-memory implementation), [`audit`] (best-effort durable history),
//! [`notify`] (outbound state-change notifications), [`task`] (cancellable
//! scheduled tasks), and [`config`].
//!
//! # Wiring
//!
//! Everything is an explicitly constructed service object; there is no
//! global state. Typical startup:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use finrail_core::audit::AuditLog;
//! use finrail_core::breaker::CircuitBreakerRegistry;
//! use finrail_core::config::CoreConfig;
//! use finrail_core::events::EventStore;
//! use finrail_core::lock::LockManager;
//! use finrail_core::notify::BroadcastNotifier;
//! use finrail_core::runner::OperationRunner;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! # let rt = tokio::runtime::Runtime::new()?;
//! # rt.block_on(async {
//! let config = CoreConfig::from_file(std::path::Path::new("finrail.toml"))?;
//! let notifier = Arc::new(BroadcastNotifier::default());
//! let audit = Arc::new(AuditLog::open(&config.audit_db)?);
//!
//! let locks = Arc::new(LockManager::new(
//!     config.kv.build(),
//!     Arc::clone(&audit),
//!     notifier.clone(),
//!     config.lock.clone(),
//! ));
//! let breakers = Arc::new(CircuitBreakerRegistry::new(
//!     config.breaker.clone(),
//!     Arc::clone(&audit),
//!     notifier.clone(),
//! ));
//! let events = Arc::new(EventStore::open(&config.events_db, notifier.clone())?);
//!
//! let runner = OperationRunner::new(locks, breakers, events);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # })?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod breaker;
pub mod config;
pub mod events;
pub mod kv;
pub mod lock;
pub mod notify;
pub mod runner;
pub mod task;

pub use breaker::{BreakerError, CircuitBreakerRegistry, CircuitConfig, CircuitState};
pub use config::{ConfigError, CoreConfig, KvBackendConfig};
pub use events::{AggregateState, EventDraft, EventStore, EventType, FinancialEvent};
pub use lock::{LockConfig, LockError, LockManager, WithLockError};
pub use notify::{BroadcastNotifier, CoreNotification, Notifier, NullNotifier};
pub use runner::{OperationError, OperationOutcome, OperationRequest, OperationRunner};
