// crates/jobflow/src/store/postgres.rs

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::{Duration, Instant};

use super::{Entry, Park, Store};
use crate::error::StoreError;

/// Durable store on PostgreSQL.
///
/// Expired entries are invisible to every read immediately; `purge_expired`
/// physically deletes them and is driven by the worker's maintenance task.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(250),
        }
    }

    /// How often `blocking_pop` re-checks an empty list.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(10));
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Deletes up to `batch` expired entries. Returns number deleted.
    pub async fn purge_expired(&self, batch: i64) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM kv_entries
            WHERE key IN (
                SELECT key
                FROM kv_entries
                WHERE expires_at IS NOT NULL
                  AND expires_at <= now()
                ORDER BY expires_at ASC
                LIMIT $1
            )
            "#,
        )
        .bind(batch)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }

    async fn try_pop(&self, list: &str, park: Option<Park<'_>>) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let popped: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM kv_lists
            WHERE id = (
                SELECT id
                FROM kv_lists
                WHERE list_key = $1
                ORDER BY id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING value
            "#,
        )
        .bind(list)
        .fetch_optional(&mut *tx)
        .await?;

        if let (Some(value), Some(park)) = (popped.as_deref(), park) {
            upsert_index(&mut tx, park.index, value, park.score).await?;
        }

        tx.commit().await?;
        Ok(popped)
    }
}

fn ttl_millis(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

async fn upsert_index(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    index: &str,
    member: &str,
    score: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO kv_indexes (index_key, member, score)
        VALUES ($1, $2, $3)
        ON CONFLICT (index_key, member)
        DO UPDATE SET score = EXCLUDED.score
        "#,
    )
    .bind(index)
    .bind(member)
    .bind(score)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl Store for PgStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        // An expired row is treated as absent, so its version restarts at 1.
        let version: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kv_entries (key, value, version, expires_at)
            VALUES ($1, $2, 1, now() + ($3::bigint * interval '1 millisecond'))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                version = CASE
                    WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now() THEN 1
                    ELSE kv_entries.version + 1
                END,
                expires_at = EXCLUDED.expires_at,
                updated_at = now()
            RETURNING version
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl_millis(ttl))
        .fetch_one(&self.pool)
        .await?;

        Ok(version as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, StoreError> {
        let row = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT value, version
            FROM kv_entries
            WHERE key = $1
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(value, version)| Entry {
            value,
            version: version as u64,
        }))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM kv_entries
            WHERE key = $1
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted > 0)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: u64,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> = if expected == 0 {
            // create-if-absent; an expired row counts as absent
            sqlx::query_scalar(
                r#"
                INSERT INTO kv_entries (key, value, version, expires_at)
                VALUES ($1, $2, 1, now() + ($3::bigint * interval '1 millisecond'))
                ON CONFLICT (key) DO UPDATE
                SET value = EXCLUDED.value,
                    version = 1,
                    expires_at = EXCLUDED.expires_at,
                    updated_at = now()
                WHERE kv_entries.expires_at IS NOT NULL
                  AND kv_entries.expires_at <= now()
                RETURNING version
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(ttl_millis(ttl))
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                UPDATE kv_entries
                SET value = $2,
                    version = version + 1,
                    expires_at = now() + ($3::bigint * interval '1 millisecond'),
                    updated_at = now()
                WHERE key = $1
                  AND version = $4
                  AND (expires_at IS NULL OR expires_at > now())
                RETURNING version
                "#,
            )
            .bind(key)
            .bind(value)
            .bind(ttl_millis(ttl))
            .bind(expected as i64)
            .fetch_optional(&self.pool)
            .await?
        };

        Ok(version.map(|v| v as u64))
    }

    async fn list_push(&self, list: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_lists (list_key, value)
            VALUES ($1, $2)
            "#,
        )
        .bind(list)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn blocking_pop(
        &self,
        list: &str,
        timeout: Duration,
        park: Option<Park<'_>>,
    ) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(value) = self.try_pop(list, park).await? {
                return Ok(Some(value));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn list_len(&self, list: &str) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_lists WHERE list_key = $1")
            .bind(list)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    async fn index_set(&self, index: &str, member: &str, score: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_index(&mut tx, index, member, score).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn index_remove(&self, index: &str, member: &str) -> Result<bool, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM kv_indexes
            WHERE index_key = $1
              AND member = $2
            "#,
        )
        .bind(index)
        .bind(member)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted > 0)
    }

    async fn index_range(
        &self,
        index: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT member
            FROM kv_indexes
            WHERE index_key = $1
              AND score <= $2
            ORDER BY score ASC, member ASC
            LIMIT $3
            "#,
        )
        .bind(index)
        .bind(max_score)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }
}
