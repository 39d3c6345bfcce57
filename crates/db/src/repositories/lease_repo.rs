//! Repository for the `resource_leases` table.
//!
//! All expiry comparisons use the database clock (`NOW()`) so that workers
//! with drifting clocks still agree on who holds a lease.

use std::time::Duration;

use async_trait::async_trait;
use joulegate_core::lock::{Lease, LeaseStore, LockError};
use joulegate_core::types::Timestamp;
use sqlx::PgPool;
use uuid::Uuid;

/// Column list for `resource_leases` queries.
const COLUMNS: &str = "resource, owner, token, acquired_at, expires_at";

#[derive(Debug, sqlx::FromRow)]
struct LeaseRow {
    resource: String,
    owner: String,
    token: Uuid,
    acquired_at: Timestamp,
    expires_at: Timestamp,
}

impl From<LeaseRow> for Lease {
    fn from(row: LeaseRow) -> Self {
        Self {
            resource: row.resource,
            owner: row.owner,
            token: row.token,
            acquired_at: row.acquired_at,
            expires_at: row.expires_at,
        }
    }
}

/// Provides lease operations on `resource_leases`.
pub struct LeaseRepo;

impl LeaseRepo {
    /// Insert a lease, or take over one whose expiry has passed.
    ///
    /// Returns `None` while another holder's lease is live.
    pub async fn try_acquire(
        pool: &PgPool,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, sqlx::Error> {
        let query = format!(
            "INSERT INTO resource_leases (resource, owner, token, acquired_at, expires_at)
             VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
             ON CONFLICT (resource) DO UPDATE SET
                owner = EXCLUDED.owner,
                token = EXCLUDED.token,
                acquired_at = EXCLUDED.acquired_at,
                expires_at = EXCLUDED.expires_at
             WHERE resource_leases.expires_at <= NOW()
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, LeaseRow>(&query)
            .bind(resource)
            .bind(owner)
            .bind(Uuid::new_v4())
            .bind(ttl.as_secs_f64())
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Lease::from))
    }

    /// Push out the expiry of a live lease with a matching token.
    pub async fn renew(
        pool: &PgPool,
        resource: &str,
        token: Uuid,
        ttl: Duration,
    ) -> Result<Option<Lease>, sqlx::Error> {
        let query = format!(
            "UPDATE resource_leases
             SET expires_at = NOW() + make_interval(secs => $3)
             WHERE resource = $1 AND token = $2 AND expires_at > NOW()
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, LeaseRow>(&query)
            .bind(resource)
            .bind(token)
            .bind(ttl.as_secs_f64())
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Lease::from))
    }

    /// Delete the lease if the token still matches. Returns `true` if removed.
    pub async fn release(pool: &PgPool, resource: &str, token: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM resource_leases WHERE resource = $1 AND token = $2")
            .bind(resource)
            .bind(token)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Current lease row for `resource`, live or expired.
    pub async fn find(pool: &PgPool, resource: &str) -> Result<Option<Lease>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM resource_leases WHERE resource = $1");
        let row = sqlx::query_as::<_, LeaseRow>(&query)
            .bind(resource)
            .fetch_optional(pool)
            .await?;
        Ok(row.map(Lease::from))
    }
}

/// [`LeaseStore`] backed by PostgreSQL, shared by every worker process.
#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> LockError {
    tracing::error!(error = %e, "Lease store query failed");
    LockError::Unavailable(e.to_string())
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LockError> {
        LeaseRepo::try_acquire(&self.pool, resource, owner, ttl)
            .await
            .map_err(unavailable)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>, LockError> {
        LeaseRepo::renew(&self.pool, &lease.resource, lease.token, ttl)
            .await
            .map_err(unavailable)
    }

    async fn release(&self, lease: &Lease) -> Result<bool, LockError> {
        LeaseRepo::release(&self.pool, &lease.resource, lease.token)
            .await
            .map_err(unavailable)
    }

    async fn ping(&self) -> Result<(), LockError> {
        crate::health_check(&self.pool).await.map_err(unavailable)
    }
}
