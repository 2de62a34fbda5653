use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row};

use crate::outbox::{ClaimedRecord, NewRecord, RecordStatus, Store};

/// SQLx-based Postgres store.
///
/// Each service gets its own table (see [`Outbox::new`](crate::Outbox::new)):
///
/// | column         | type             |
/// |----------------|------------------|
/// | `id`           | `BIGSERIAL` (pk) |
/// | `message`      | `BYTEA`          |
/// | `status`       | `SMALLINT`       |
/// | `create_at`    | `TIMESTAMPTZ(3)` |
/// | `last_send_at` | `TIMESTAMPTZ(3)` |
///
/// Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so concurrent rescans of
/// the same table never hand out the same row twice.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    type Transaction = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Transaction, tower::BoxError> {
        Ok(self.pool.begin().await.map_err(Error::from)?)
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Ok(tx.commit().await.map_err(Error::from)?)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<(), tower::BoxError> {
        Ok(tx.rollback().await.map_err(Error::from)?)
    }

    #[tracing::instrument(skip(self))]
    async fn create_table(&self, table: &str) -> Result<(), tower::BoxError> {
        Ok(create_table(&self.pool, table).await?)
    }

    async fn purge(&self, table: &str) -> Result<u64, tower::BoxError> {
        let sql = format!("DELETE FROM \"{table}\"");
        let result = sqlx::query(&sql)
            .execute(&self.pool)
            .await
            .map_err(Error::from)?;
        Ok(result.rows_affected())
    }

    async fn insert(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        record: NewRecord,
    ) -> Result<i64, tower::BoxError> {
        let sql = format!(
            "INSERT INTO \"{table}\" (message, status, create_at, last_send_at) VALUES ($1, $2, $3, $3) RETURNING id"
        );
        let id: i64 = sqlx::query_scalar(&sql)
            .bind(record.message)
            .bind(record.status as i16)
            .bind(record.created_at)
            .fetch_one(&mut **tx)
            .await
            .map_err(Error::from)?;
        Ok(id)
    }

    async fn delete(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        id: i64,
    ) -> Result<(), tower::BoxError> {
        let sql = format!("DELETE FROM \"{table}\" WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .execute(&mut **tx)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, tx))]
    async fn claim(
        &self,
        tx: &mut Self::Transaction,
        table: &str,
        limit: u64,
        sent_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedRecord>, tower::BoxError> {
        let select = format!(
            "SELECT id, message FROM \"{table}\" WHERE status = $1 AND last_send_at <= $2 ORDER BY id ASC LIMIT $3 FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query(&select)
            .bind(RecordStatus::Pending as i16)
            .bind(sent_before)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::from)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            claimed.push(ClaimedRecord {
                id: row.try_get("id").map_err(Error::from)?,
                message: row.try_get("message").map_err(Error::from)?,
            });
        }

        if !claimed.is_empty() {
            let ids: Vec<i64> = claimed.iter().map(|r| r.id).collect();
            let update = format!("UPDATE \"{table}\" SET last_send_at = $1 WHERE id = ANY($2)");
            sqlx::query(&update)
                .bind(now)
                .bind(ids)
                .execute(&mut **tx)
                .await
                .map_err(Error::from)?;
        }
        Ok(claimed)
    }
}

/// Ensures the outbox table exists.
async fn create_table(pool: &PgPool, table: &str) -> Result<(), Error> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (
            id BIGSERIAL PRIMARY KEY,
            message BYTEA NOT NULL,
            status SMALLINT NOT NULL DEFAULT 0,
            create_at TIMESTAMPTZ(3) NOT NULL,
            last_send_at TIMESTAMPTZ(3) NOT NULL
        )"
    );
    sqlx::query(&sql).execute(pool).await?;

    let index = format!(
        "CREATE INDEX IF NOT EXISTS \"{table}_pending_idx\" ON \"{table}\" (status, last_send_at)"
    );
    sqlx::query(&index).execute(pool).await?;
    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    kind: PgStoreErrorKind,
}

/// Kinds of Postgres store errors.
#[derive(Debug)]
pub enum PgStoreErrorKind {
    Database(sqlx::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            PgStoreErrorKind::Database(err) => writeln!(f, "Database error: {}", err),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            PgStoreErrorKind::Database(err) => Some(err),
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            kind: PgStoreErrorKind::Database(err),
        }
    }
}
