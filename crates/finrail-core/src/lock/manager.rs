//! Lock manager implementation.

// TTLs are far below u64::MAX milliseconds.
// Mutex poisoning indicates a panic in another thread, which is unrecoverable.
#![allow(clippy::cast_possible_truncation, clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{LockError, WithLockError};
use crate::audit::{AuditLog, LockHistoryRecord};
use crate::kv::KvStore;
use crate::notify::{CoreNotification, Notifier};
use crate::task::{self, TaskGuard};

/// Lock manager tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// TTL used by the scoped API when the caller does not pass one.
    #[serde(default = "default_ttl")]
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// Additional acquisition attempts after the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between acquisition attempts.
    #[serde(default = "default_retry_delay")]
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// How often local bookkeeping for expired locks is swept.
    #[serde(default = "default_sweep_interval")]
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// Identifier recorded as the owner in lock history.
    #[serde(default = "default_owner")]
    pub owner: String,
}

const fn default_ttl() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

const fn default_sweep_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_owner() -> String {
    format!("instance-{}", std::process::id())
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl: default_ttl(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            sweep_interval: default_sweep_interval(),
            owner: default_owner(),
        }
    }
}

/// Floor for the auto-extension cadence.
const MIN_EXTEND_PERIOD: Duration = Duration::from_millis(50);

struct TrackedLock {
    token: String,
    expires_at: Instant,
    /// Armed by the scoped API while its work runs; held only so dropping
    /// the tracking entry aborts the extension task.
    #[allow(dead_code)]
    extender: Option<TaskGuard>,
}

/// Distributed lock manager over a shared key-value store.
///
/// One instance per process, constructed explicitly at startup and shared
/// by reference. The manager tracks the locks this process believes it
/// holds so their timers can be cleaned up even when a holder forgets to
/// release; the shared store itself needs no cleanup because entries
/// self-expire.
pub struct LockManager {
    kv: Arc<dyn KvStore>,
    audit: Arc<AuditLog>,
    notifier: Arc<dyn Notifier>,
    config: LockConfig,
    tracked: Arc<Mutex<HashMap<String, TrackedLock>>>,
    _sweeper: TaskGuard,
}

impl LockManager {
    /// Creates a manager and starts its background sweep task.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        audit: Arc<AuditLog>,
        notifier: Arc<dyn Notifier>,
        config: LockConfig,
    ) -> Self {
        let tracked: Arc<Mutex<HashMap<String, TrackedLock>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let sweeper = {
            let tracked = Arc::clone(&tracked);
            task::spawn_periodic(config.sweep_interval, move || {
                let tracked = Arc::clone(&tracked);
                async move {
                    let now = Instant::now();
                    let mut map = tracked.lock().unwrap();
                    let before = map.len();
                    map.retain(|_, lock| lock.expires_at > now);
                    let swept = before - map.len();
                    if swept > 0 {
                        debug!(swept, "swept local state for expired locks");
                    }
                    true
                }
            })
        };

        Self {
            kv,
            audit,
            notifier,
            config,
            tracked,
            _sweeper: sweeper,
        }
    }

    /// Configuration in effect.
    #[must_use]
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Number of locks this process currently tracks as held.
    #[must_use]
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    /// Attempts to acquire `resource` for `ttl`.
    ///
    /// Makes `max_retries + 1` attempts with a fixed `retry_delay` between
    /// them. Returns the holder token on success and `None` once the retry
    /// budget is exhausted; the outcome either way is recorded in lock
    /// history. Exhaustion is an expected outcome for the caller to decide
    /// about, not an error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backing store fails.
    pub async fn acquire(
        &self,
        resource: &str,
        ttl: Duration,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<Option<String>, LockError> {
        let token = Uuid::new_v4().to_string();

        for attempt in 0..=max_retries {
            if self.kv.set_nx_px(resource, &token, ttl).await? {
                debug!(resource, attempt, "lock acquired");
                self.track(resource, &token, ttl);
                self.record_attempt(resource, &token, ttl, true);
                self.notifier.notify(CoreNotification::LockAcquired {
                    resource: resource.to_string(),
                    token: token.clone(),
                    ttl_ms: ttl.as_millis() as u64,
                });
                return Ok(Some(token));
            }
            if attempt < max_retries {
                tokio::time::sleep(retry_delay).await;
            }
        }

        debug!(resource, max_retries, "lock acquisition exhausted retries");
        self.record_attempt(resource, &token, ttl, false);
        Ok(None)
    }

    /// Releases `resource` if `token` still holds it.
    ///
    /// The delete is conditional on the stored token, so releasing a lock
    /// that already expired and was reacquired elsewhere is a no-op.
    /// Returns whether the release took effect. Local tracking for the
    /// token is dropped either way, cancelling any extension task.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backing store fails.
    pub async fn release(&self, resource: &str, token: &str) -> Result<bool, LockError> {
        let released = self.kv.del_if_equal(resource, token).await?;

        {
            let mut tracked = self.tracked.lock().unwrap();
            if tracked.get(resource).is_some_and(|l| l.token == token) {
                tracked.remove(resource);
            }
        }

        if released {
            if let Err(err) = self.audit.mark_lock_released(resource, token, Utc::now()) {
                warn!(resource, error = %err, "failed to stamp lock release in history");
            }
            self.notifier.notify(CoreNotification::LockReleased {
                resource: resource.to_string(),
                token: token.to_string(),
            });
        } else {
            debug!(resource, "release was a no-op; token no longer holds the lock");
        }

        Ok(released)
    }

    /// Resets the TTL of `resource` if `token` still holds it.
    ///
    /// # Errors
    ///
    /// Returns an error only if the backing store fails.
    pub async fn extend(
        &self,
        resource: &str,
        token: &str,
        ttl: Duration,
    ) -> Result<bool, LockError> {
        let extended = self.kv.pexpire_if_equal(resource, token, ttl).await?;
        if extended {
            let mut tracked = self.tracked.lock().unwrap();
            if let Some(lock) = tracked.get_mut(resource) {
                if lock.token == token {
                    lock.expires_at = Instant::now() + ttl;
                }
            }
        }
        Ok(extended)
    }

    /// Runs `work` while holding `resource`, using the configured retry
    /// budget.
    ///
    /// While `work` runs, a periodic task keeps extending the lock so a
    /// long-running unit of work is not preempted by TTL expiry. The lock
    /// is released and the extension task cancelled on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::ResourceBusy`] (wrapped) when the lock cannot
    /// be acquired, a store error if the backing store fails, or
    /// [`WithLockError::Work`] carrying `work`'s own error.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        resource: &str,
        ttl: Duration,
        work: F,
    ) -> Result<T, WithLockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let token = self
            .acquire(
                resource,
                ttl,
                self.config.max_retries,
                self.config.retry_delay,
            )
            .await
            .map_err(WithLockError::Lock)?
            .ok_or_else(|| {
                WithLockError::Lock(LockError::ResourceBusy {
                    resource: resource.to_string(),
                })
            })?;

        self.arm_extender(resource, &token, ttl);

        let result = work().await;

        if let Err(err) = self.release(resource, &token).await {
            // The TTL reclaims the lock; losing this release is not fatal.
            warn!(resource, error = %err, "failed to release lock after work");
        }

        result.map_err(WithLockError::Work)
    }

    /// Like [`with_lock`](Self::with_lock), but a busy resource invokes
    /// `fallback` instead of failing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the backing store fails, or
    /// [`WithLockError::Work`] carrying `work`'s own error.
    pub async fn with_lock_or_else<T, E, F, Fut, FB>(
        &self,
        resource: &str,
        ttl: Duration,
        work: F,
        fallback: FB,
    ) -> Result<T, WithLockError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        FB: FnOnce() -> T,
    {
        match self.with_lock(resource, ttl, work).await {
            Err(WithLockError::Lock(LockError::ResourceBusy { .. })) => Ok(fallback()),
            other => other,
        }
    }

    /// Arms the periodic auto-extension task for a held lock.
    ///
    /// The task stops on its own when the token no longer holds the lock
    /// and is aborted when the lock's tracking entry is dropped.
    pub(crate) fn arm_extender(&self, resource: &str, token: &str, ttl: Duration) {
        let period = (ttl / 2).max(MIN_EXTEND_PERIOD);
        let kv = Arc::clone(&self.kv);
        let tracked = Arc::clone(&self.tracked);
        let resource_key = resource.to_string();
        let token_value = token.to_string();

        let guard = task::spawn_periodic(period, move || {
            let kv = Arc::clone(&kv);
            let tracked = Arc::clone(&tracked);
            let resource = resource_key.clone();
            let token = token_value.clone();
            async move {
                match kv.pexpire_if_equal(&resource, &token, ttl).await {
                    Ok(true) => {
                        let mut map = tracked.lock().unwrap();
                        if let Some(lock) = map.get_mut(&resource) {
                            if lock.token == token {
                                lock.expires_at = Instant::now() + ttl;
                            }
                        }
                        true
                    },
                    Ok(false) => {
                        debug!(resource, "extension stopped; token no longer holds the lock");
                        false
                    },
                    Err(err) => {
                        // Transient store trouble; keep trying until the
                        // lock is released or expires.
                        warn!(resource, error = %err, "lock extension attempt failed");
                        true
                    },
                }
            }
        });

        let mut map = self.tracked.lock().unwrap();
        if let Some(lock) = map.get_mut(resource) {
            if lock.token == token {
                lock.extender = Some(guard);
            }
        }
    }

    fn track(&self, resource: &str, token: &str, ttl: Duration) {
        let mut tracked = self.tracked.lock().unwrap();
        tracked.insert(
            resource.to_string(),
            TrackedLock {
                token: token.to_string(),
                expires_at: Instant::now() + ttl,
                extender: None,
            },
        );
    }

    fn record_attempt(&self, resource: &str, token: &str, ttl: Duration, acquired: bool) {
        let record = LockHistoryRecord::new(
            resource,
            token,
            self.config.owner.clone(),
            ttl.as_millis() as u64,
            acquired,
        );
        if let Err(err) = self.audit.record_lock_attempt(&record) {
            // Observability loss never fails the lock operation.
            warn!(resource, error = %err, "failed to record lock attempt");
        }
    }
}
