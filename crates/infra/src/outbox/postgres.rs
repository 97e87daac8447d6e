//! Postgres-backed outbox.
//!
//! ## Claims
//!
//! `claim_unprocessed` selects candidates with `FOR UPDATE SKIP LOCKED` and
//! stamps them with the owner and a lease deadline in the same statement.
//! Concurrent processors therefore never receive the same row, and a crashed
//! processor's rows become claimable again once `claimed_until` passes.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError |
//! |------------|----------------------|------------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Anything else | - | `Storage` |
//!
//! ## Blocking bridge
//!
//! The async methods are the primary API. The synchronous [`OutboxStore`]
//! impl drives them on the runtime handle captured at construction and must
//! be called from threads outside that runtime (the scheduler's workers).

use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use tessera_core::MessageId;

use super::store::OutboxStore;
use super::types::{OutboxMessage, OutboxStats, OutboxStoreError};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS outbox_messages (
    id                UUID PRIMARY KEY,
    message_type      TEXT        NOT NULL,
    content           JSONB       NOT NULL,
    created_on_utc    TIMESTAMPTZ NOT NULL,
    processed_on_utc  TIMESTAMPTZ NULL,
    error             TEXT        NULL,
    attempts          INTEGER     NOT NULL DEFAULT 0,
    claimed_by        TEXT        NULL,
    claimed_until     TIMESTAMPTZ NULL
);

CREATE INDEX IF NOT EXISTS outbox_messages_unprocessed_idx
    ON outbox_messages (created_on_utc, id)
    WHERE processed_on_utc IS NULL;
"#;

const COLUMNS: &str = "id, message_type, content, created_on_utc, processed_on_utc, error, attempts, claimed_by, claimed_until";

// $1 id, $2 owner, $3 processed_on_utc
const MARK_PROCESSED_SQL: &str = r#"
UPDATE outbox_messages
SET processed_on_utc = $3, error = NULL, claimed_by = NULL, claimed_until = NULL
WHERE id = $1 AND claimed_by = $2 AND processed_on_utc IS NULL
"#;

// $1 id, $2 owner, $3 error
const MARK_ERRORED_SQL: &str = r#"
UPDATE outbox_messages
SET error = $3, claimed_by = NULL, claimed_until = NULL
WHERE id = $1 AND claimed_by = $2 AND processed_on_utc IS NULL
"#;

const PURGE_PROCESSED_SQL: &str = r#"
DELETE FROM outbox_messages
WHERE processed_on_utc IS NOT NULL AND processed_on_utc < $1
"#;

/// $1 now, $2 limit, $3 owner, $4 lease deadline.
fn claim_sql() -> String {
    format!(
        r#"
WITH next AS (
    SELECT id FROM outbox_messages
    WHERE processed_on_utc IS NULL
      AND (claimed_until IS NULL OR claimed_until <= $1)
    ORDER BY created_on_utc, id
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE outbox_messages m
SET claimed_by = $3, claimed_until = $4, attempts = m.attempts + 1
FROM next
WHERE m.id = next.id
RETURNING {}
"#,
        prefixed_columns("m")
    )
}

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
    handle: Handle,
}

impl PostgresOutboxStore {
    /// Must be called from inside a tokio runtime; the current handle is kept
    /// for the blocking bridge.
    pub fn new(pool: PgPool) -> Result<Self, OutboxStoreError> {
        let handle = Handle::try_current().map_err(|_| {
            OutboxStoreError::Storage(
                "PostgresOutboxStore requires a tokio runtime at construction".to_string(),
            )
        })?;
        Ok(Self { pool, handle })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the outbox table and index if missing.
    pub async fn migrate(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    /// Append `message` inside the caller's transaction.
    ///
    /// Commit or rollback of `tx` decides the message's fate together with
    /// the domain rows written in it.
    #[instrument(skip_all, fields(message_id = %message.id, message_type = %message.message_type), err)]
    pub async fn append_in(
        tx: &mut Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> Result<(), OutboxStoreError> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, message_type, content, created_on_utc)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(message.id.as_uuid())
        .bind(&message.message_type)
        .bind(&message.content)
        .bind(message.created_on_utc)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxStoreError::Duplicate(message.id)
            } else {
                map_sqlx_error("append", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, lease, now), err)]
    pub async fn claim_unprocessed(
        &self,
        owner: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        let sql = claim_sql();
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(limit as i64)
            .bind(owner)
            .bind(now + lease)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_unprocessed", e))?;

        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        messages.sort_by_key(|m| (m.created_on_utc, m.id));
        Ok(messages)
    }

    #[instrument(skip(self, now), fields(message_id = %id), err)]
    pub async fn mark_processed(
        &self,
        id: MessageId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(MARK_PROCESSED_SQL)
            .bind(id.as_uuid())
            .bind(owner)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_failure(id, owner).await);
        }
        Ok(())
    }

    #[instrument(skip(self, error), fields(message_id = %id), err)]
    pub async fn mark_errored(
        &self,
        id: MessageId,
        owner: &str,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        let result = sqlx::query(MARK_ERRORED_SQL)
            .bind(id.as_uuid())
            .bind(owner)
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_errored", e))?;

        if result.rows_affected() == 0 {
            return Err(self.settle_failure(id, owner).await);
        }
        Ok(())
    }

    /// Distinguish a missing row from a lost claim after a no-op update.
    async fn settle_failure(&self, id: MessageId, owner: &str) -> OutboxStoreError {
        match self.get(id).await {
            Ok(Some(_)) => OutboxStoreError::ClaimLost {
                id,
                owner: owner.to_string(),
            },
            Ok(None) => OutboxStoreError::NotFound(id),
            Err(e) => e,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn purge_processed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let result = sqlx::query(PURGE_PROCESSED_SQL)
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("purge_processed_older_than", e))?;

        Ok(result.rows_affected() as usize)
    }

    pub async fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        let sql = format!("SELECT {COLUMNS} FROM outbox_messages WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE processed_on_utc IS NULL AND error IS NULL) AS pending,
                COUNT(*) FILTER (WHERE processed_on_utc IS NULL AND error IS NOT NULL) AS errored,
                COUNT(*) FILTER (WHERE processed_on_utc IS NOT NULL) AS processed,
                COUNT(*) FILTER (WHERE processed_on_utc IS NULL AND claimed_until > $1) AS claimed
            FROM outbox_messages
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let count = |name: &str| -> Result<usize, OutboxStoreError> {
            row.try_get::<i64, _>(name)
                .map(|n| n as usize)
                .map_err(|e| map_sqlx_error("stats", e))
        };

        Ok(OutboxStats {
            pending: count("pending")?,
            errored: count("errored")?,
            processed: count("processed")?,
            claimed: count("claimed")?,
        })
    }
}

fn prefixed_columns(alias: &str) -> String {
    COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<OutboxMessage, OutboxStoreError> {
    let decode = |e: sqlx::Error| {
        OutboxStoreError::Serialization(format!("failed to decode outbox row: {e}"))
    };

    let id: Uuid = row.try_get("id").map_err(decode)?;
    let attempts: i32 = row.try_get("attempts").map_err(decode)?;

    Ok(OutboxMessage {
        id: MessageId::from_uuid(id),
        message_type: row.try_get("message_type").map_err(decode)?,
        content: row.try_get("content").map_err(decode)?,
        created_on_utc: row.try_get("created_on_utc").map_err(decode)?,
        processed_on_utc: row.try_get("processed_on_utc").map_err(decode)?,
        error: row.try_get("error").map_err(decode)?,
        attempts: attempts.max(0) as u32,
        claimed_by: row.try_get("claimed_by").map_err(decode)?,
        claimed_until: row.try_get("claimed_until").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    OutboxStoreError::Storage(format!("{operation}: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

impl OutboxStore for PostgresOutboxStore {
    fn claim_unprocessed(
        &self,
        owner: &str,
        limit: usize,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, OutboxStoreError> {
        self.handle
            .block_on(PostgresOutboxStore::claim_unprocessed(self, owner, limit, lease, now))
    }

    fn mark_processed(
        &self,
        id: MessageId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        self.handle
            .block_on(PostgresOutboxStore::mark_processed(self, id, owner, now))
    }

    fn mark_errored(
        &self,
        id: MessageId,
        owner: &str,
        error: &str,
    ) -> Result<(), OutboxStoreError> {
        self.handle
            .block_on(PostgresOutboxStore::mark_errored(self, id, owner, error))
    }

    fn purge_processed_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        self.handle
            .block_on(PostgresOutboxStore::purge_processed_older_than(self, cutoff))
    }

    fn get(&self, id: MessageId) -> Result<Option<OutboxMessage>, OutboxStoreError> {
        self.handle.block_on(PostgresOutboxStore::get(self, id))
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<OutboxStats, OutboxStoreError> {
        self.handle.block_on(PostgresOutboxStore::stats(self, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returning_clause_uses_the_update_alias() {
        let cols = prefixed_columns("m");
        assert!(cols.starts_with("m.id, m.message_type"));
        assert!(cols.ends_with("m.claimed_until"));
    }

    #[test]
    fn claim_skips_locked_and_leased_rows_oldest_first() {
        let sql = claim_sql();
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("processed_on_utc IS NULL"));
        assert!(sql.contains("claimed_until IS NULL OR claimed_until <= $1"));
        assert!(sql.contains("ORDER BY created_on_utc, id"));
        assert!(sql.contains("attempts = m.attempts + 1"));
        assert!(sql.contains(&format!("RETURNING {}", prefixed_columns("m"))));
    }

    #[test]
    fn settles_only_touch_rows_the_owner_still_holds() {
        for sql in [MARK_PROCESSED_SQL, MARK_ERRORED_SQL] {
            assert!(sql.contains("WHERE id = $1 AND claimed_by = $2 AND processed_on_utc IS NULL"));
            assert!(sql.contains("claimed_by = NULL, claimed_until = NULL"));
        }
        assert!(MARK_PROCESSED_SQL.contains("error = NULL"));
        assert!(MARK_ERRORED_SQL.contains("SET error = $3"));
    }

    #[test]
    fn purge_leaves_unprocessed_rows() {
        assert!(PURGE_PROCESSED_SQL.contains("processed_on_utc IS NOT NULL AND processed_on_utc < $1"));
    }
}
