//! Per-form publish lease.
//!
//! The lease row in `form_publish_leases` is the lock: inserting it succeeds
//! for exactly one contender, across processes. A lease older than the
//! caller's TTL is considered abandoned (its holder crashed) and may be
//! taken over.

use chrono::{Duration, Utc};
use formgen_ids::{FormId, LeaseId};
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::types::PublishLease;
use crate::{parse_id, FormDb};

impl FormDb {
    /// Take the publish lease for `form_id`, or fail with `Locked` if a live
    /// lease is held elsewhere.
    pub async fn try_acquire_publish_lease(
        &self,
        form_id: &FormId,
        ttl: Duration,
    ) -> Result<PublishLease> {
        let now = Utc::now();
        let cutoff = Self::format_ts(now - ttl);

        let stolen = sqlx::query(
            "DELETE FROM form_publish_leases WHERE form_id = $1 AND acquired_at < $2",
        )
        .bind(form_id.as_str())
        .bind(&cutoff)
        .execute(&self.pool)
        .await?;
        if stolen.rows_affected() > 0 {
            warn!(form_id = %form_id, "Took over abandoned publish lease");
        }

        let lease_id = LeaseId::new();
        let inserted = sqlx::query(
            r#"
            INSERT INTO form_publish_leases (form_id, lease_id, acquired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (form_id) DO NOTHING
            "#,
        )
        .bind(form_id.as_str())
        .bind(lease_id.as_str())
        .bind(Self::format_ts(now))
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() != 1 {
            return Err(DbError::Locked(format!(
                "a publish of form {} is already in progress",
                form_id
            )));
        }

        debug!(form_id = %form_id, lease_id = %lease_id, "Publish lease acquired");
        Ok(PublishLease {
            form_id: form_id.clone(),
            lease_id,
            acquired_at: now,
        })
    }

    /// Release a lease. Returns false if it was no longer ours (taken over
    /// after expiry).
    pub async fn release_publish_lease(&self, lease: &PublishLease) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM form_publish_leases WHERE form_id = $1 AND lease_id = $2",
        )
        .bind(lease.form_id.as_str())
        .bind(lease.lease_id.as_str())
        .execute(&self.pool)
        .await?;
        let released = result.rows_affected() == 1;
        if released {
            debug!(form_id = %lease.form_id, lease_id = %lease.lease_id, "Publish lease released");
        } else {
            warn!(form_id = %lease.form_id, lease_id = %lease.lease_id, "Publish lease was already gone");
        }
        Ok(released)
    }

    /// Push the lease's expiry forward. Returns false if it was no longer
    /// ours.
    pub async fn renew_publish_lease(&self, lease: &PublishLease) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE form_publish_leases SET acquired_at = $1 WHERE form_id = $2 AND lease_id = $3",
        )
        .bind(Self::now_text())
        .bind(lease.form_id.as_str())
        .bind(lease.lease_id.as_str())
        .execute(&self.pool)
        .await?;
        let renewed = result.rows_affected() == 1;
        if renewed {
            debug!(form_id = %lease.form_id, lease_id = %lease.lease_id, "Publish lease renewed");
        }
        Ok(renewed)
    }

    /// Current holder of the lease, if any.
    pub async fn current_publish_lease(&self, form_id: &FormId) -> Result<Option<PublishLease>> {
        let row = sqlx::query(
            "SELECT form_id, lease_id, acquired_at FROM form_publish_leases WHERE form_id = $1",
        )
        .bind(form_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(PublishLease {
                form_id: parse_id(&row.try_get::<String, _>("form_id")?)?,
                lease_id: parse_id(&row.try_get::<String, _>("lease_id")?)?,
                acquired_at: Self::parse_ts(&row.try_get::<String, _>("acquired_at")?)?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();
        let ttl = Duration::minutes(15);

        let lease = db.try_acquire_publish_lease(&form_id, ttl).await.unwrap();
        let err = db.try_acquire_publish_lease(&form_id, ttl).await.unwrap_err();
        assert!(matches!(err, DbError::Locked(_)));

        // Other forms are independent
        db.try_acquire_publish_lease(&FormId::new(), ttl).await.unwrap();

        assert!(db.release_publish_lease(&lease).await.unwrap());
        assert!(db.current_publish_lease(&form_id).await.unwrap().is_none());
        db.try_acquire_publish_lease(&form_id, ttl).await.unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_lease_is_taken_over() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();

        let stale = db
            .try_acquire_publish_lease(&form_id, Duration::minutes(15))
            .await
            .unwrap();
        sqlx::query("UPDATE form_publish_leases SET acquired_at = $1 WHERE form_id = $2")
            .bind(FormDb::format_ts(Utc::now() - Duration::hours(2)))
            .bind(form_id.as_str())
            .execute(db.pool())
            .await
            .unwrap();

        let fresh = db
            .try_acquire_publish_lease(&form_id, Duration::minutes(15))
            .await
            .unwrap();
        assert_ne!(fresh.lease_id, stale.lease_id);

        // The old holder no longer owns it
        assert!(!db.release_publish_lease(&stale).await.unwrap());
        let current = db.current_publish_lease(&form_id).await.unwrap().unwrap();
        assert_eq!(current.lease_id, fresh.lease_id);
    }

    #[tokio::test]
    async fn test_renewed_lease_is_not_taken_over() {
        let db = FormDb::open_in_memory().await.unwrap();
        let form_id = FormId::new();
        let ttl = Duration::minutes(15);

        let lease = db.try_acquire_publish_lease(&form_id, ttl).await.unwrap();
        sqlx::query("UPDATE form_publish_leases SET acquired_at = $1 WHERE form_id = $2")
            .bind(FormDb::format_ts(Utc::now() - Duration::hours(2)))
            .bind(form_id.as_str())
            .execute(db.pool())
            .await
            .unwrap();

        assert!(db.renew_publish_lease(&lease).await.unwrap());
        let err = db.try_acquire_publish_lease(&form_id, ttl).await.unwrap_err();
        assert!(matches!(err, DbError::Locked(_)));

        assert!(db.release_publish_lease(&lease).await.unwrap());
        assert!(!db.renew_publish_lease(&lease).await.unwrap());
    }
}
