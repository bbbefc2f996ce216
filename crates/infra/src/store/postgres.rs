//! Postgres-backed outbox/inbox store.
//!
//! Each service owns one schema holding two tables:
//!
//! ```sql
//! {schema}.outbox_messages(id uuid PK, occurred_on_utc timestamptz, "type" text,
//!                          content text, processed_on_utc timestamptz NULL, error text NULL)
//! {schema}.outbox_message_consumers(id uuid, name text, PRIMARY KEY (id, name))
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) on outbox insert | `23505` | `DuplicateMessage` | Event id already captured |
//! | Database (unique violation) on consumer insert | `23505` | `DuplicateConsumer` | Concurrent delivery already handled the message |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Other | N/A | `Storage` | Network errors, connection failures, etc. |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use courier_core::MessageId;

use super::r#trait::{InboxConsumerRecord, OutboxDatabase, OutboxMessage, OutboxTransaction, StoreError};

/// Postgres database of one service.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
    schema: String,
}

impl PostgresDatabase {
    /// `schema` is interpolated into SQL, so it must be a plain identifier
    /// (ASCII letters, digits and `_`, not starting with a digit).
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Result<Self, StoreError> {
        let schema = schema.into();
        if !is_valid_identifier(&schema) {
            return Err(StoreError::storage(format!("invalid schema name: {schema:?}")));
        }
        Ok(Self { pool, schema })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create the schema and both tables if they do not exist yet.
    #[instrument(skip(self), fields(schema = %self.schema), err)]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let schema = &self.schema;
        let statements = [
            format!("CREATE SCHEMA IF NOT EXISTS {schema}"),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {schema}.outbox_messages (
                    id               uuid        PRIMARY KEY,
                    occurred_on_utc  timestamptz NOT NULL,
                    "type"           text        NOT NULL,
                    content          text        NOT NULL,
                    processed_on_utc timestamptz NULL,
                    error            text        NULL
                )
                "#
            ),
            format!(
                r#"
                CREATE INDEX IF NOT EXISTS outbox_messages_unprocessed_idx
                    ON {schema}.outbox_messages (occurred_on_utc, id)
                    WHERE processed_on_utc IS NULL
                "#
            ),
            format!(
                r#"
                CREATE TABLE IF NOT EXISTS {schema}.outbox_message_consumers (
                    id   uuid NOT NULL,
                    name text NOT NULL,
                    PRIMARY KEY (id, name)
                )
                "#
            ),
        ];

        for sql in &statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxDatabase for PostgresDatabase {
    type Tx = PostgresTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(PostgresTransaction {
            tx,
            schema: self.schema.clone(),
        })
    }
}

/// Open Postgres transaction.
///
/// Business code writes its own tables through [`PostgresTransaction::connection`]
/// so they commit or roll back together with the outbox rows.
pub struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
    schema: String,
}

impl std::fmt::Debug for PostgresTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresTransaction")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl PostgresTransaction {
    pub fn connection(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }
}

#[async_trait]
impl OutboxTransaction for PostgresTransaction {
    #[instrument(skip(self, messages), fields(schema = %self.schema, count = messages.len()), err)]
    async fn insert_outbox_messages(&mut self, messages: &[OutboxMessage]) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {}.outbox_messages (id, occurred_on_utc, "type", content, processed_on_utc, error)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            self.schema
        );

        for message in messages {
            sqlx::query(&sql)
                .bind(message.id.as_uuid())
                .bind(message.occurred_on_utc)
                .bind(&message.event_type)
                .bind(&message.content)
                .bind(message.processed_on_utc)
                .bind(&message.error)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StoreError::DuplicateMessage(message.id)
                    } else {
                        map_sqlx_error("insert_outbox_message", e)
                    }
                })?;
        }
        Ok(())
    }

    #[instrument(skip(self), fields(schema = %self.schema), err)]
    async fn fetch_unprocessed(&mut self, batch_size: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, occurred_on_utc, "type", content, processed_on_utc, error
            FROM {}.outbox_messages
            WHERE processed_on_utc IS NULL
            ORDER BY (error IS NOT NULL) ASC, occurred_on_utc ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
            self.schema
        );

        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("fetch_unprocessed", e))?;

        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map(Into::into)
                    .map_err(|e| StoreError::storage(format!("failed to deserialize outbox row: {e}")))
            })
            .collect()
    }

    async fn outbox_message(&mut self, id: MessageId) -> Result<Option<OutboxMessage>, StoreError> {
        let sql = format!(
            r#"
            SELECT id, occurred_on_utc, "type", content, processed_on_utc, error
            FROM {}.outbox_messages
            WHERE id = $1
            "#,
            self.schema
        );

        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("outbox_message", e))?;

        row.map(|row| {
            OutboxRow::from_row(&row)
                .map(Into::into)
                .map_err(|e| StoreError::storage(format!("failed to deserialize outbox row: {e}")))
        })
        .transpose()
    }

    async fn mark_processed(
        &mut self,
        id: MessageId,
        processed_on_utc: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}.outbox_messages
            SET processed_on_utc = $2, error = NULL
            WHERE id = $1 AND processed_on_utc IS NULL
            "#,
            self.schema
        );

        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(processed_on_utc)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("mark_processed", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_error(&mut self, id: MessageId, error: &str) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}.outbox_messages
            SET error = $2
            WHERE id = $1 AND processed_on_utc IS NULL
            "#,
            self.schema
        );

        let result = sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(error)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("record_error", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn consumer_exists(&mut self, record: &InboxConsumerRecord) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {}.outbox_message_consumers WHERE id = $1 AND name = $2)",
            self.schema
        );

        let row = sqlx::query(&sql)
            .bind(record.message_id.as_uuid())
            .bind(&record.consumer_name)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("consumer_exists", e))?;
        row.try_get::<bool, _>(0)
            .map_err(|e| StoreError::storage(format!("failed to read exists flag: {e}")))
    }

    async fn insert_consumer(&mut self, record: &InboxConsumerRecord) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {}.outbox_message_consumers (id, name) VALUES ($1, $2)",
            self.schema
        );

        sqlx::query(&sql)
            .bind(record.message_id.as_uuid())
            .bind(&record.consumer_name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateConsumer {
                        message_id: record.message_id,
                        consumer_name: record.consumer_name.clone(),
                    }
                } else {
                    map_sqlx_error("insert_consumer", e)
                }
            })?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback_transaction", e))
    }
}

fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::storage(format!(
            "database error in {}: {} (code {})",
            operation,
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none")
        )),
        sqlx::Error::PoolClosed => {
            StoreError::storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct OutboxRow {
    id: uuid::Uuid,
    occurred_on_utc: DateTime<Utc>,
    event_type: String,
    content: String,
    processed_on_utc: Option<DateTime<Utc>>,
    error: Option<String>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(OutboxRow {
            id: row.try_get("id")?,
            occurred_on_utc: row.try_get("occurred_on_utc")?,
            event_type: row.try_get("type")?,
            content: row.try_get("content")?,
            processed_on_utc: row.try_get("processed_on_utc")?,
            error: row.try_get("error")?,
        })
    }
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        OutboxMessage {
            id: MessageId::from_uuid(row.id),
            occurred_on_utc: row.occurred_on_utc,
            event_type: row.event_type,
            content: row.content,
            processed_on_utc: row.processed_on_utc,
            error: row.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_are_plain_identifiers() {
        assert!(is_valid_identifier("orders"));
        assert!(is_valid_identifier("_billing_2"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2fast"));
        assert!(!is_valid_identifier("orders; DROP TABLE x"));
        assert!(!is_valid_identifier("public.orders"));
    }

    async fn database() -> PostgresDatabase {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect");
        let schema = format!("courier_test_{}", uuid::Uuid::now_v7().simple());
        let db = PostgresDatabase::new(pool, schema).unwrap();
        db.ensure_schema().await.unwrap();
        db
    }

    fn message(secs: i64) -> OutboxMessage {
        OutboxMessage {
            id: MessageId::new(),
            occurred_on_utc: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            event_type: "test.event".to_string(),
            content: "{}".to_string(),
            processed_on_utc: None,
            error: None,
        }
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL (DATABASE_URL)"]
    async fn concurrent_relays_skip_locked_rows() {
        let db = database().await;
        let mut tx = db.begin().await.unwrap();
        tx.insert_outbox_messages(&[message(1), message(2), message(3)])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut first = db.begin().await.unwrap();
        let mut second = db.begin().await.unwrap();
        let a = first.fetch_unprocessed(2).await.unwrap();
        let b = second.fetch_unprocessed(2).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(b.len(), 1);
        assert!(a.iter().all(|m| m.id != b[0].id));
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL (DATABASE_URL)"]
    async fn mark_processed_is_conditional() {
        let db = database().await;
        let m = message(0);
        let mut tx = db.begin().await.unwrap();
        tx.insert_outbox_messages(std::slice::from_ref(&m)).await.unwrap();
        assert!(tx.mark_processed(m.id, Utc::now()).await.unwrap());
        assert!(!tx.mark_processed(m.id, Utc::now()).await.unwrap());
        assert!(!tx.record_error(m.id, "late").await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(tx.fetch_unprocessed(10).await.unwrap().is_empty());
        assert!(tx.outbox_message(m.id).await.unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    #[ignore = "Requires PostgreSQL (DATABASE_URL)"]
    async fn duplicate_consumer_maps_to_duplicate_error() {
        let db = database().await;
        let record = InboxConsumerRecord::new(MessageId::new(), "billing");

        let mut tx = db.begin().await.unwrap();
        tx.insert_consumer(&record).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(tx.consumer_exists(&record).await.unwrap());
        assert!(tx.insert_consumer(&record).await.unwrap_err().is_duplicate_consumer());
    }
}
