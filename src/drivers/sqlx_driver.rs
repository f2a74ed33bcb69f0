//! The built-in driver, backed by sqlx's `Any` pool. It covers the
//! `postgres`, `mysql` and `sqlite` schemes; sqlx expects full URL-style
//! DSNs, so no rewrite is needed.

use async_trait::async_trait;
use sqlx::any::{install_default_drivers, AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Column, Connection, Row, TypeInfo};
use std::sync::{Arc, Once};

use super::{DbHandle, DbRow, DbValue, Driver, DriverError, Rows, Statement};

static INSTALL: Once = Once::new();

pub struct SqlxDriver;

impl SqlxDriver {
    pub fn new() -> Self {
        INSTALL.call_once(install_default_drivers);
        SqlxDriver
    }
}

impl Default for SqlxDriver {
    fn default() -> Self {
        SqlxDriver::new()
    }
}

#[async_trait]
impl Driver for SqlxDriver {
    fn name(&self) -> &'static str {
        "sqlx"
    }

    async fn open(
        &self,
        dsn: &str,
        max_connections: u32,
        _max_idle_connections: u32,
    ) -> Result<Box<dyn DbHandle>, DriverError> {
        // sqlx pools have no separate idle cap; idle connections are bounded
        // by max_connections and retired by the pool's own idle timeout.
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(dsn)
            .await?;
        Ok(Box::new(SqlxHandle { pool }))
    }
}

struct SqlxHandle {
    pool: AnyPool,
}

#[async_trait]
impl DbHandle for SqlxHandle {
    async fn ping(&self) -> Result<(), DriverError> {
        let mut conn = self.pool.acquire().await?;
        conn.ping().await?;
        Ok(())
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DriverError> {
        // sqlx prepares lazily and caches per connection; the statement here
        // just pins the SQL text to this handle's pool.
        Ok(Arc::new(SqlxStatement {
            pool: self.pool.clone(),
            sql: sql.to_string(),
        }))
    }
}

struct SqlxStatement {
    pool: AnyPool,
    sql: String,
}

#[async_trait]
impl Statement for SqlxStatement {
    async fn query(&self) -> Result<Box<dyn Rows>, DriverError> {
        let rows = sqlx::query(self.sql.as_str()).fetch_all(&self.pool).await?;
        let columns: Arc<Vec<String>> = Arc::new(
            rows.first()
                .map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
                .unwrap_or_default(),
        );
        let rows: Vec<DbRow> = rows
            .iter()
            .map(|row| DbRow {
                columns: columns.clone(),
                values: (0..columns.len()).map(|i| decode(row, i)).collect(),
            })
            .collect();
        Ok(Box::new(SqlxRows {
            rows: rows.into_iter(),
        }))
    }
}

struct SqlxRows {
    rows: std::vec::IntoIter<DbRow>,
}

#[async_trait]
impl Rows for SqlxRows {
    async fn next_row(&mut self) -> Result<Option<DbRow>, DriverError> {
        Ok(self.rows.next())
    }
}

fn decode(row: &AnyRow, idx: usize) -> DbValue {
    // NULLs decode as None whatever the column type, so any branch catches
    // them; the rest are tried strictest-first.
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map_or(DbValue::Null, DbValue::Int);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map_or(DbValue::Null, DbValue::Float);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map_or(DbValue::Null, DbValue::Text);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return v.map_or(DbValue::Null, DbValue::Bool);
    }
    DbValue::Other(row.column(idx).type_info().name().to_string())
}
