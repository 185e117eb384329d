//! Durable storage of enriched records in PostgreSQL.
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo};
use thiserror::Error;
use tracing::{info, warn};

use crate::record::EnrichedRecord;

pub const TABLE_NAME: &str = "world_happiness";

/// Enumeration of errors for operations with the storage sink.
/// Errors originate from sqlx and are wrapped to tell apart a database that is
/// down from a row the database refuses.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("database unavailable while running {command}: {error}")]
    StorageUnavailable {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("{command} rejected by the database: {error}")]
    InsertError {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: &'static str,
        error: sqlx::Error,
    },
}

impl StorageError {
    /// Whether trying again later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::ConnectionError { .. } | StorageError::StorageUnavailable { .. }
        )
    }

    fn unavailable_or(
        command: &'static str,
        error: sqlx::Error,
        otherwise: fn(&'static str, sqlx::Error) -> StorageError,
    ) -> StorageError {
        match error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StorageError::StorageUnavailable { command, error },
            error => otherwise(command, error),
        }
    }

    fn insert(command: &'static str, error: sqlx::Error) -> StorageError {
        StorageError::unavailable_or(command, error, |command, error| {
            StorageError::InsertError { command, error }
        })
    }

    fn query(command: &'static str, error: sqlx::Error) -> StorageError {
        StorageError::unavailable_or(command, error, |command, error| {
            StorageError::QueryError { command, error }
        })
    }
}

/// Where enriched records end up.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Durably append one record, returning its surrogate id. Either the whole
    /// row is written or nothing is.
    async fn insert(&self, record: &EnrichedRecord) -> Result<i64, StorageError>;
}

/// Rows returned by [`PgSink::query`], as a table of named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of a named column in one row.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|name| name == column)?;
        self.rows.get(row)?.get(index)
    }

    /// Every value of a named column.
    pub fn column(&self, column: &str) -> Option<Vec<&Value>> {
        let index = self.columns.iter().position(|name| name == column)?;
        Some(self.rows.iter().filter_map(|row| row.get(index)).collect())
    }
}

/// The `world_happiness` table.
///
/// Each insert borrows a connection from the pool for the duration of its own
/// transaction. The transaction rolls back and the connection returns to the
/// pool when dropped, so every exit path releases it.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    /// Connect to PostgreSQL, failing if the database cannot be reached.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .map_err(|error| StorageError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the destination table unless it already exists.
    pub async fn create_schema(&self) -> Result<(), StorageError> {
        let query = format!(
            r#"
CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
    id BIGSERIAL PRIMARY KEY,
    country TEXT,
    continent TEXT,
    gdp_per_capita DOUBLE PRECISION NOT NULL,
    life_expectancy DOUBLE PRECISION NOT NULL,
    freedom DOUBLE PRECISION NOT NULL,
    perceptions_corruption DOUBLE PRECISION NOT NULL,
    generosity DOUBLE PRECISION NOT NULL,
    continent_numeric INTEGER NOT NULL,
    country_numeric INTEGER NOT NULL,
    happiness_score DOUBLE PRECISION NOT NULL,
    happiness_prediction DOUBLE PRECISION NOT NULL
)
            "#
        );

        sqlx::query(&query)
            .execute(&self.pool)
            .await
            .map_err(|error| StorageError::query("CREATE TABLE", error))?;

        info!("{} table is ready", TABLE_NAME);
        Ok(())
    }

    /// Run a read statement and return every row.
    pub async fn query(&self, statement: &str) -> Result<QueryResult, StorageError> {
        let rows: Vec<PgRow> = sqlx::query(statement)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StorageError::query("SELECT", error))?;

        let columns: Vec<String> = match rows.first() {
            Some(row) => row
                .columns()
                .iter()
                .map(|column| column.name().to_owned())
                .collect(),
            // No row to read column names from, ask the database instead
            None => self
                .pool
                .describe(statement)
                .await
                .map_err(|error| StorageError::query("DESCRIBE", error))?
                .columns()
                .iter()
                .map(|column| column.name().to_owned())
                .collect(),
        };

        let rows = rows.iter().map(row_values).collect();

        Ok(QueryResult { columns, rows })
    }
}

#[async_trait]
impl RecordSink for PgSink {
    async fn insert(&self, record: &EnrichedRecord) -> Result<i64, StorageError> {
        let query = format!(
            r#"
INSERT INTO {TABLE_NAME}
    (country, continent, gdp_per_capita, life_expectancy, freedom, perceptions_corruption,
     generosity, continent_numeric, country_numeric, happiness_score, happiness_prediction)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
RETURNING id
            "#
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StorageError::insert("BEGIN", error))?;

        let raw = &record.record;
        let id: i64 = sqlx::query_scalar(&query)
            .bind(&raw.country)
            .bind(&raw.continent)
            .bind(raw.gdp_per_capita)
            .bind(raw.life_expectancy)
            .bind(raw.freedom)
            .bind(raw.perceptions_corruption)
            .bind(raw.generosity)
            .bind(raw.continent_numeric)
            .bind(raw.country_numeric)
            .bind(raw.happiness_score)
            .bind(record.happiness_prediction)
            .fetch_one(&mut *tx)
            .await
            .map_err(|error| StorageError::insert("INSERT", error))?;

        tx.commit()
            .await
            .map_err(|error| StorageError::insert("COMMIT", error))?;

        Ok(id)
    }
}

fn row_values(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .map(|column| {
            let index = column.ordinal();
            let decoded: Result<Value, sqlx::Error> = match column.type_info().name() {
                "BOOL" => row.try_get::<Option<bool>, _>(index).map(|v| v.into()),
                "INT2" => row.try_get::<Option<i16>, _>(index).map(|v| v.into()),
                "INT4" => row.try_get::<Option<i32>, _>(index).map(|v| v.into()),
                "INT8" => row.try_get::<Option<i64>, _>(index).map(|v| v.into()),
                "FLOAT4" => row.try_get::<Option<f32>, _>(index).map(|v| v.into()),
                "FLOAT8" => row.try_get::<Option<f64>, _>(index).map(|v| v.into()),
                "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index).map(|v| v.into()),
                _ => row.try_get::<Option<String>, _>(index).map(|v| v.into()),
            };

            decoded.unwrap_or_else(|error| {
                warn!("could not decode column {}: {}", column.name(), error);
                Value::Null
            })
        })
        .collect()
}
