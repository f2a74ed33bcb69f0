//! A deterministic in-memory driver.
//!
//! Result sets are keyed by the exact SQL text; anything else a real driver
//! could do wrong (failing or hanging on open, ping or query) is a builder
//! switch. Execution counters make prepare-once and run-once-per-scrape
//! behavior observable from tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{DbHandle, DbRow, DbValue, Driver, DriverError, Rows, Statement};

#[derive(Clone, Default)]
pub struct MockDriver {
    fail_open: Option<String>,
    fail_ping: Option<String>,
    hang_open: bool,
    hang_ping: bool,
    hang_query: bool,
    results: HashMap<String, MockResult>,
    /// Number of `open` calls across all handles of this driver.
    pub opens: Arc<AtomicUsize>,
    /// Number of `prepare` calls across all handles of this driver.
    pub prepares: Arc<AtomicUsize>,
    /// Number of statement executions across all handles of this driver.
    pub queries: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct MockResult {
    columns: Arc<Vec<String>>,
    rows: Vec<Vec<DbValue>>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver::default()
    }

    pub fn fail_open(mut self, message: &str) -> Self {
        self.fail_open = Some(message.to_string());
        self
    }

    pub fn fail_ping(mut self, message: &str) -> Self {
        self.fail_ping = Some(message.to_string());
        self
    }

    pub fn hang_open(mut self) -> Self {
        self.hang_open = true;
        self
    }

    pub fn hang_ping(mut self) -> Self {
        self.hang_ping = true;
        self
    }

    pub fn hang_query(mut self) -> Self {
        self.hang_query = true;
        self
    }

    /// Defines the result set returned for the exact statement text `sql`.
    pub fn with_result(mut self, sql: &str, columns: &[&str], rows: Vec<Vec<DbValue>>) -> Self {
        self.results.insert(
            sql.to_string(),
            MockResult {
                columns: Arc::new(columns.iter().map(|c| c.to_string()).collect()),
                rows,
            },
        );
        self
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(
        &self,
        _dsn: &str,
        _max_connections: u32,
        _max_idle_connections: u32,
    ) -> Result<Box<dyn DbHandle>, DriverError> {
        if self.hang_open {
            pending::<()>().await;
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_open {
            return Err(DriverError(message.clone()));
        }
        Ok(Box::new(MockHandle {
            driver: self.clone(),
        }))
    }
}

struct MockHandle {
    driver: MockDriver,
}

#[async_trait]
impl DbHandle for MockHandle {
    async fn ping(&self) -> Result<(), DriverError> {
        if self.driver.hang_ping {
            pending::<()>().await;
        }
        match &self.driver.fail_ping {
            Some(message) => Err(DriverError(message.clone())),
            None => Ok(()),
        }
    }

    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DriverError> {
        self.driver.prepares.fetch_add(1, Ordering::SeqCst);
        if !self.driver.hang_query && !self.driver.results.contains_key(sql) {
            return Err(DriverError(format!("no such statement: {}", sql)));
        }
        Ok(Arc::new(MockStatement {
            driver: self.driver.clone(),
            sql: sql.to_string(),
        }))
    }
}

struct MockStatement {
    driver: MockDriver,
    sql: String,
}

#[async_trait]
impl Statement for MockStatement {
    async fn query(&self) -> Result<Box<dyn Rows>, DriverError> {
        if self.driver.hang_query {
            pending::<()>().await;
        }
        self.driver.queries.fetch_add(1, Ordering::SeqCst);
        let result = self
            .driver
            .results
            .get(&self.sql)
            .ok_or_else(|| DriverError(format!("no such statement: {}", self.sql)))?;
        Ok(Box::new(MockRows {
            columns: result.columns.clone(),
            rows: result.rows.clone().into_iter(),
        }))
    }
}

struct MockRows {
    columns: Arc<Vec<String>>,
    rows: std::vec::IntoIter<Vec<DbValue>>,
}

#[async_trait]
impl Rows for MockRows {
    async fn next_row(&mut self) -> Result<Option<DbRow>, DriverError> {
        Ok(self.rows.next().map(|values| DbRow {
            columns: self.columns.clone(),
            values,
        }))
    }
}
