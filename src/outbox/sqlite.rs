//! SQLite outbox store.
//!
//! Timestamps are stored as RFC 3339 text with microsecond precision so that
//! lexical order matches chronological order.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sea_query::{ColumnDef, Expr, Iden, Index, Order, Query, SqliteQueryBuilder, Table};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{FailureDisposition, OutboxError, OutboxRecord, OutboxStore, Result};

/// Outbox table schema.
#[derive(Iden)]
enum Outbox {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "event_type"]
    EventType,
    #[iden = "payload_json"]
    PayloadJson,
    #[iden = "created_at"]
    CreatedAt,
    #[iden = "published_at"]
    PublishedAt,
    #[iden = "attempts"]
    Attempts,
    #[iden = "last_error"]
    LastError,
    #[iden = "failed_at"]
    FailedAt,
}

const COLUMNS: [Outbox; 8] = [
    Outbox::Id,
    Outbox::EventType,
    Outbox::PayloadJson,
    Outbox::CreatedAt,
    Outbox::PublishedAt,
    Outbox::Attempts,
    Outbox::LastError,
    Outbox::FailedAt,
];

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| OutboxError::Storage(format!("invalid {} '{}': {}", column, value, e)))
}

fn record_from_row(row: &SqliteRow) -> Result<OutboxRecord> {
    let id: String = row.try_get("id")?;
    let created_at: String = row.try_get("created_at")?;
    let published_at: Option<String> = row.try_get("published_at")?;
    let failed_at: Option<String> = row.try_get("failed_at")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(OutboxRecord {
        id: Uuid::parse_str(&id)
            .map_err(|e| OutboxError::Storage(format!("invalid id '{}': {}", id, e)))?,
        event_type: row.try_get("event_type")?,
        payload_json: row.try_get("payload_json")?,
        created_at: parse_timestamp("created_at", &created_at)?,
        published_at: published_at
            .as_deref()
            .map(|v| parse_timestamp("published_at", v))
            .transpose()?,
        attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        last_error: row.try_get("last_error")?,
        failed_at: failed_at
            .as_deref()
            .map(|v| parse_timestamp("failed_at", v))
            .transpose()?,
    })
}

/// Outbox store on a SQLite pool.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: SqlitePool,
}

impl SqliteOutboxStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database and initialize the schema.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the outbox table.
    pub async fn init(&self) -> Result<()> {
        let create_table = Table::create()
            .table(Outbox::Table)
            .if_not_exists()
            .col(ColumnDef::new(Outbox::Id).text().primary_key())
            .col(ColumnDef::new(Outbox::EventType).text().not_null())
            .col(ColumnDef::new(Outbox::PayloadJson).text().not_null())
            .col(ColumnDef::new(Outbox::CreatedAt).text().not_null())
            .col(ColumnDef::new(Outbox::PublishedAt).text().null())
            .col(
                ColumnDef::new(Outbox::Attempts)
                    .integer()
                    .not_null()
                    .default(0),
            )
            .col(ColumnDef::new(Outbox::LastError).text().null())
            .col(ColumnDef::new(Outbox::FailedAt).text().null())
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_table).execute(&self.pool).await?;

        let create_index = Index::create()
            .if_not_exists()
            .name("idx_outbox_pending")
            .table(Outbox::Table)
            .col(Outbox::PublishedAt)
            .col(Outbox::FailedAt)
            .col(Outbox::CreatedAt)
            .to_string(SqliteQueryBuilder);

        sqlx::query(&create_index).execute(&self.pool).await?;

        info!("Outbox table initialized (SQLite)");
        Ok(())
    }

    /// Insert a record on the caller's connection.
    ///
    /// Pass `&mut tx` of an open transaction to stage the event atomically
    /// with the business change; the record only exists once `tx` commits.
    pub async fn stage_in(conn: &mut SqliteConnection, record: &OutboxRecord) -> Result<()> {
        let insert = Query::insert()
            .into_table(Outbox::Table)
            .columns(COLUMNS)
            .values_panic([
                record.id.to_string().into(),
                record.event_type.clone().into(),
                record.payload_json.clone().into(),
                timestamp(record.created_at).into(),
                record.published_at.map(timestamp).into(),
                i64::from(record.attempts).into(),
                record.last_error.clone().into(),
                record.failed_at.map(timestamp).into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&insert).execute(&mut *conn).await?;
        Ok(())
    }

    async fn fetch(&self, id: Uuid, conn: &mut SqliteConnection) -> Result<Option<OutboxRecord>> {
        let select = Query::select()
            .columns(COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&select).fetch_optional(&mut *conn).await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

#[async_trait]
impl OutboxStore for SqliteOutboxStore {
    async fn stage(&self, record: &OutboxRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Self::stage_in(&mut conn, record).await
    }

    async fn pending(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let select = Query::select()
            .columns(COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::PublishedAt).is_null())
            .and_where(Expr::col(Outbox::FailedAt).is_null())
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by_expr(Expr::cust("rowid"), Order::Asc)
            .limit(u64::from(limit))
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn mark_published(&self, id: Uuid, published_at: DateTime<Utc>) -> Result<()> {
        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::PublishedAt, timestamp(published_at))
            .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&update).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(OutboxError::NotFound(id));
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        max_attempts: u32,
    ) -> Result<FailureDisposition> {
        let mut tx = self.pool.begin().await?;

        let record = self.fetch(id, &mut tx).await?.ok_or(OutboxError::NotFound(id))?;
        let attempts = record.attempts.saturating_add(1);
        let failed_at = (attempts >= max_attempts).then(|| timestamp(Utc::now()));
        let flagged = failed_at.is_some();

        let update = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Attempts, i64::from(attempts))
            .value(Outbox::LastError, error)
            .value(Outbox::FailedAt, failed_at)
            .and_where(Expr::col(Outbox::Id).eq(id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&update).execute(&mut *tx).await?;
        tx.commit().await?;

        Ok(if flagged {
            FailureDisposition::Flagged { attempts }
        } else {
            FailureDisposition::Retry { attempts }
        })
    }

    async fn flagged(&self) -> Result<Vec<OutboxRecord>> {
        let select = Query::select()
            .columns(COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::FailedAt).is_not_null())
            .order_by(Outbox::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&select).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.fetch(id, &mut conn).await
    }
}
