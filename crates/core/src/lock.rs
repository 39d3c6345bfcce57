//! System-wide exclusive access to the measurement resource.
//!
//! The lock is a lease: a record with an owner, a fencing token and an expiry.
//! A holder that crashes stops renewing and its lease becomes reclaimable once
//! it expires. The previous holder then sees [`LockError::Lost`] on its next
//! renewal and must treat its in-flight measurement as failed.
//!
//! Storage is abstracted behind [`LeaseStore`]. [`MemoryLeaseStore`] serves a
//! single process; the Postgres store in `joulegate-db` serves a fleet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Timestamp;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default lease lifetime.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(300);

/// Default bound on how long `acquire` waits under contention.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Resource name guarding the isolated measurement socket.
pub fn socket_resource(socket_id: u32) -> String {
    format!("measurement-socket-{socket_id}")
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Measurement resource busy after waiting {waited_ms} ms")]
    Busy { waited_ms: u64 },

    #[error("Lease on {resource} expired or was reclaimed by another holder")]
    Lost { resource: String },

    #[error("Lock store unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Lease store
// ---------------------------------------------------------------------------

/// One granted lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub resource: String,
    pub owner: String,
    /// Fencing token, unique per acquisition.
    pub token: Uuid,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Persistent backing for leases.
///
/// Implementations must make `try_acquire` atomic: at most one unexpired
/// lease exists per resource.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant a lease if the resource is free or its lease has expired.
    async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LockError>;

    /// Extend `lease`. `None` when the lease expired or the token no longer matches.
    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError>;

    /// Delete `lease` if its token still matches. Returns whether a row was removed.
    async fn release(&self, lease: &Lease) -> Result<bool, LockError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), LockError>;
}

pub(crate) fn ttl_delta(ttl: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX / 1000))
}

/// In-process lease store. Only serialises workers sharing one process.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current lease on `resource`, expired or not.
    pub fn current(&self, resource: &str) -> Option<Lease> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .cloned()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = leases.get(resource) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let lease = Lease {
            resource: resource.to_string(),
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl_delta(ttl),
        };
        leases.insert(resource.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(&lease.resource) {
            Some(current) if current.token == lease.token && current.expires_at > now => {
                current.expires_at = now + ttl_delta(ttl);
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get(&lease.resource) {
            Some(current) if current.token == lease.token => {
                leases.remove(&lease.resource);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), LockError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resource lock
// ---------------------------------------------------------------------------

/// Proof of holding the resource. Release it with [`ResourceLock::release`].
///
/// Dropping an unreleased handle schedules a best-effort release on the
/// current Tokio runtime.
pub struct LockHandle {
    lease: Lease,
    store: Arc<dyn LeaseStore>,
    released: bool,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("lease", &self.lease)
            .field("released", &self.released)
            .finish()
    }
}

impl LockHandle {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn token(&self) -> Uuid {
        self.lease.token
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let lease = self.lease.clone();
        let store = Arc::clone(&self.store);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(
                    resource = %lease.resource,
                    token = %lease.token,
                    "Lock handle dropped without release, releasing in background",
                );
                runtime.spawn(async move {
                    if let Err(e) = store.release(&lease).await {
                        tracing::error!(
                            resource = %lease.resource,
                            error = %e,
                            "Background lease release failed",
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    resource = %lease.resource,
                    "Lock handle dropped outside a runtime, lease will expire",
                );
            }
        }
    }
}

/// Named exclusive resource backed by a [`LeaseStore`].
#[derive(Clone)]
pub struct ResourceLock {
    store: Arc<dyn LeaseStore>,
    resource: String,
    lease_ttl: Duration,
    poll_interval: Duration,
}

impl ResourceLock {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        resource: impl Into<String>,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            store,
            resource: resource.into(),
            lease_ttl,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn lease_ttl(&self) -> Duration {
        self.lease_ttl
    }

    /// Wait up to `timeout` for the resource.
    ///
    /// Store failures are returned immediately rather than retried.
    pub async fn acquire(&self, owner: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        let start = Instant::now();
        loop {
            if let Some(lease) = self
                .store
                .try_acquire(&self.resource, owner, self.lease_ttl)
                .await?
            {
                tracing::info!(
                    resource = %self.resource,
                    owner,
                    token = %lease.token,
                    waited_ms = start.elapsed().as_millis() as u64,
                    "Resource lock acquired",
                );
                return Ok(LockHandle {
                    lease,
                    store: Arc::clone(&self.store),
                    released: false,
                });
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                let waited_ms = elapsed.as_millis() as u64;
                tracing::warn!(resource = %self.resource, owner, waited_ms, "Resource lock busy");
                return Err(LockError::Busy { waited_ms });
            }
            tokio::time::sleep(self.poll_interval.min(timeout - elapsed)).await;
        }
    }

    /// Extend the lease held by `handle`.
    pub async fn renew(&self, handle: &mut LockHandle) -> Result<(), LockError> {
        match self.store.renew(&handle.lease, self.lease_ttl).await? {
            Some(lease) => {
                handle.lease = lease;
                Ok(())
            }
            None => {
                // The store no longer knows this token; nothing left to release.
                handle.released = true;
                tracing::error!(
                    resource = %self.resource,
                    token = %handle.lease.token,
                    "Resource lease lost",
                );
                Err(LockError::Lost {
                    resource: self.resource.clone(),
                })
            }
        }
    }

    /// Renew every third of the lease lifetime until a renewal fails.
    ///
    /// Never resolves while the lease is held. Run it beside work that must
    /// not outlive the lease and abandon the work when it returns.
    pub async fn keep_alive(&self, handle: &mut LockHandle) -> LockError {
        let interval = (self.lease_ttl / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(interval).await;
            if let Err(e) = self.renew(handle).await {
                return e;
            }
        }
    }

    /// Release the lease. A token mismatch is logged, not an error.
    pub async fn release(&self, mut handle: LockHandle) -> Result<(), LockError> {
        handle.released = true;
        let removed = self.store.release(&handle.lease).await?;
        if removed {
            tracing::info!(
                resource = %self.resource,
                token = %handle.lease.token,
                "Resource lock released",
            );
        } else {
            tracing::warn!(
                resource = %self.resource,
                token = %handle.lease.token,
                "Lease was already gone at release",
            );
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), LockError> {
        self.store.ping().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
