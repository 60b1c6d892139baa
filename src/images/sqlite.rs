use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteArguments, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, Sqlite};
use std::sync::Arc;

use super::{ArgStyle, SqlDatabase, Stage, SuiteInit, SupportingImage};
use crate::error::ImageError;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_args<'q>(mut query: SqliteQuery<'q>, args: &[Value]) -> SqliteQuery<'q> {
    for arg in args {
        query = match arg {
            Value::String(s) => query.bind(s.clone()),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    query.bind(i)
                } else {
                    query.bind(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::Bool(b) => query.bind(*b),
            Value::Null => query.bind(Option::<String>::None),
            other => query.bind(other.to_string()),
        };
    }
    query
}

/// Decode a column by trying integer, real, text and blob in turn
fn column_value(row: &SqliteRow, index: usize) -> Value {
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<f64>, _>(index) {
        return value.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(Some(bytes)) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return Value::String(String::from_utf8_lossy(&bytes).into_owned());
    }
    Value::Null
}

fn row_to_json(row: &SqliteRow) -> Value {
    let mut fields = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        fields.insert(column.name().to_string(), column_value(row, index));
    }
    Value::Object(fields)
}

/// Pool-backed SQL handle handed to the suite
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SqlDatabase for SqliteDatabase {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, ImageError> {
        let query = bind_args(sqlx::query(sql), args);
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Value>, ImageError> {
        let query = bind_args(sqlx::query(sql), args);
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// SQLite supporting image. Installs itself as the suite's SQL handle.
pub struct SqliteImage {
    name: String,
    url: String,
    schema: Vec<String>,
    database: RwLock<Option<SqliteDatabase>>,
}

impl SqliteImage {
    /// Private in-memory database
    pub fn in_memory() -> Self {
        Self::new("sqlite", "sqlite::memory:")
    }

    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            schema: Vec::new(),
            database: RwLock::new(None),
        }
    }

    /// Statement executed once during `init`, in declaration order
    pub fn with_schema(mut self, statement: impl Into<String>) -> Self {
        self.schema.push(statement.into());
        self
    }

    fn database(&self) -> Result<SqliteDatabase, ImageError> {
        self.database
            .read()
            .clone()
            .ok_or_else(|| ImageError::NotInitialized(self.name.clone()))
    }
}

#[async_trait]
impl SupportingImage for SqliteImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Supporting
    }

    async fn init(&self, init: &mut SuiteInit) -> Result<(), ImageError> {
        // A single connection keeps one shared in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(&self.url)
            .await
            .map_err(|e| ImageError::InitializationFailed(format!("SQLite connection failed: {}", e)))?;

        let database = SqliteDatabase::new(pool);
        for statement in &self.schema {
            database.exec(statement, &[]).await?;
        }

        *self.database.write() = Some(database.clone());
        init.set_db(Arc::new(database));
        init.set_db_arg_markers(ArgStyle::Positional);
        log::info!("SQLite image '{}' connected to {}", self.name, self.url);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ImageError> {
        let database = self.database.write().take();
        if let Some(database) = database {
            database.pool.close().await;
        }
        Ok(())
    }
}

#[async_trait]
impl SqlDatabase for SqliteImage {
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<u64, ImageError> {
        self.database()?.exec(sql, args).await
    }

    async fn query(&self, sql: &str, args: &[Value]) -> Result<Vec<Value>, ImageError> {
        self.database()?.query(sql, args).await
    }
}
