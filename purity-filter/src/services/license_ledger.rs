//! License ledger
//!
//! Usage counters only move forward: increments are a single atomic
//! statement and full-record upserts keep the larger of the two counters.

use async_trait::async_trait;
use chrono::Utc;
use purity_common::db::{License, TRIAL_EXPIRED_REASON};
use purity_common::retry::retry_on_lock;
use purity_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// License lookup and usage accounting
#[async_trait]
pub trait LicenseLedger: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<License>>;

    async fn get_by_billing_account(&self, stripe_id: &str) -> Result<Option<License>>;

    /// Upsert the full record by id. Never lowers `request_count`.
    async fn update(&self, license: &License) -> Result<()>;

    /// Atomically add `count` to the usage counter and return the new value
    async fn add_usage(&self, id: &str, count: u64) -> Result<u64>;

    /// Mark a trial license as expired and return the stored record
    async fn expire_trial(&self, license: &License) -> Result<License>;
}

const LICENSE_COLUMNS: &str =
    "id, email, stripe_id, subscription_id, is_valid, validity_reason, request_count, is_trial";

fn row_to_license(row: &SqliteRow) -> Result<License> {
    let request_count: i64 = row.try_get("request_count")?;

    Ok(License {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        stripe_id: row.try_get("stripe_id")?,
        subscription_id: row.try_get("subscription_id")?,
        is_valid: row.try_get("is_valid")?,
        validity_reason: row.try_get("validity_reason")?,
        request_count: u64::try_from(request_count)
            .map_err(|_| Error::Internal(format!("Negative request_count {}", request_count)))?,
        is_trial: row.try_get("is_trial")?,
    })
}

fn counter_to_sql(count: u64) -> Result<i64> {
    i64::try_from(count).map_err(|_| Error::InvalidInput(format!("Usage count {} out of range", count)))
}

/// SQLite-backed ledger
pub struct SqliteLicenseLedger {
    pool: SqlitePool,
    lock_wait_ms: u64,
}

impl SqliteLicenseLedger {
    pub fn new(pool: SqlitePool, lock_wait_ms: u64) -> Self {
        Self { pool, lock_wait_ms }
    }
}

#[async_trait]
impl LicenseLedger for SqliteLicenseLedger {
    async fn get_by_id(&self, id: &str) -> Result<Option<License>> {
        let sql = format!("SELECT {} FROM licenses WHERE id = ?", LICENSE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_license).transpose()
    }

    async fn get_by_billing_account(&self, stripe_id: &str) -> Result<Option<License>> {
        let sql = format!(
            "SELECT {} FROM licenses WHERE stripe_id = ? ORDER BY rowid LIMIT 1",
            LICENSE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(stripe_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_license).transpose()
    }

    async fn update(&self, license: &License) -> Result<()> {
        let request_count = counter_to_sql(license.request_count)?;

        retry_on_lock("update_license", self.lock_wait_ms, || async move {
            sqlx::query(
                r#"
                INSERT INTO licenses
                    (id, email, stripe_id, subscription_id, is_valid, validity_reason,
                     request_count, is_trial, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    email = excluded.email,
                    stripe_id = excluded.stripe_id,
                    subscription_id = excluded.subscription_id,
                    is_valid = excluded.is_valid,
                    validity_reason = excluded.validity_reason,
                    request_count = MAX(licenses.request_count, excluded.request_count),
                    is_trial = excluded.is_trial,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&license.id)
            .bind(&license.email)
            .bind(&license.stripe_id)
            .bind(&license.subscription_id)
            .bind(license.is_valid)
            .bind(&license.validity_reason)
            .bind(request_count)
            .bind(license.is_trial)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok::<(), Error>(())
        })
        .await
    }

    async fn add_usage(&self, id: &str, count: u64) -> Result<u64> {
        let count = counter_to_sql(count)?;

        let new_count: Option<i64> = retry_on_lock("add_license_usage", self.lock_wait_ms, || async move {
            let value = sqlx::query_scalar(
                r#"
                UPDATE licenses
                SET request_count = request_count + ?, updated_at = ?
                WHERE id = ?
                RETURNING request_count
                "#,
            )
            .bind(count)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok::<Option<i64>, Error>(value)
        })
        .await?;

        match new_count {
            Some(value) => {
                tracing::debug!(license_id = %id, added = count, request_count = value, "Recorded license usage");
                Ok(value.max(0) as u64)
            }
            None => Err(Error::NotFound(format!("License {}", id))),
        }
    }

    async fn expire_trial(&self, license: &License) -> Result<License> {
        let sql = format!(
            r#"
            UPDATE licenses
            SET is_valid = 0, validity_reason = ?, updated_at = ?
            WHERE id = ?
            RETURNING {}
            "#,
            LICENSE_COLUMNS
        );

        let row = retry_on_lock("expire_trial_license", self.lock_wait_ms, || {
            let sql = sql.as_str();
            async move {
                let row = sqlx::query(sql)
                    .bind(TRIAL_EXPIRED_REASON)
                    .bind(Utc::now().to_rfc3339())
                    .bind(&license.id)
                    .fetch_optional(&self.pool)
                    .await?;
                Ok::<Option<SqliteRow>, Error>(row)
            }
        })
        .await?;

        let expired = row
            .as_ref()
            .map(row_to_license)
            .transpose()?
            .ok_or_else(|| Error::NotFound(format!("License {}", license.id)))?;

        tracing::info!(
            license_id = %expired.id,
            request_count = expired.request_count,
            "Trial license expired"
        );
        Ok(expired)
    }
}

/// In-process ledger for tests and local runs
#[derive(Default)]
pub struct MemoryLicenseLedger {
    licenses: RwLock<HashMap<String, License>>,
}

impl MemoryLicenseLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_licenses(licenses: impl IntoIterator<Item = License>) -> Self {
        Self {
            licenses: RwLock::new(
                licenses
                    .into_iter()
                    .map(|license| (license.id.clone(), license))
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl LicenseLedger for MemoryLicenseLedger {
    async fn get_by_id(&self, id: &str) -> Result<Option<License>> {
        Ok(self.licenses.read().await.get(id).cloned())
    }

    async fn get_by_billing_account(&self, stripe_id: &str) -> Result<Option<License>> {
        Ok(self
            .licenses
            .read()
            .await
            .values()
            .find(|license| license.stripe_id == stripe_id)
            .cloned())
    }

    async fn update(&self, license: &License) -> Result<()> {
        let mut licenses = self.licenses.write().await;
        let mut stored = license.clone();
        if let Some(existing) = licenses.get(&license.id) {
            stored.request_count = stored.request_count.max(existing.request_count);
        }
        licenses.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn add_usage(&self, id: &str, count: u64) -> Result<u64> {
        let mut licenses = self.licenses.write().await;
        let license = licenses
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("License {}", id)))?;
        license.request_count = license.request_count.saturating_add(count);
        Ok(license.request_count)
    }

    async fn expire_trial(&self, license: &License) -> Result<License> {
        let mut licenses = self.licenses.write().await;
        let stored = licenses
            .get_mut(&license.id)
            .ok_or_else(|| Error::NotFound(format!("License {}", license.id)))?;
        stored.is_valid = false;
        stored.validity_reason = TRIAL_EXPIRED_REASON.to_string();
        Ok(stored.clone())
    }
}
