//! Database driver adapter and the minimal connection abstraction the rest
//! of the crate consumes.
//!
//! Drivers are registered under their DSN scheme at startup; adding one is a
//! code change, not a configuration change. The scrape path only ever sees
//! the object-safe traits below, so tests run against `drivers::mock` and
//! production runs against the sqlx-backed driver.

pub mod mock;
mod sqlx_driver;

use async_trait::async_trait;
use lazy_static::lazy_static;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, ErrorKind};

/// An error raised by a driver implementation.
#[derive(Debug, Clone)]
pub struct DriverError(pub String);

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DriverError {}

impl From<sqlx::Error> for DriverError {
    fn from(e: sqlx::Error) -> Self {
        DriverError(e.to_string())
    }
}

/// A single cell as returned by a driver, before any semantic typing is
/// applied. Anything a driver cannot express as one of the first five
/// variants arrives as `Other` with the driver's type name, and is rejected
/// with a precise error if a metric actually references that column.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Other(String),
}

impl DbValue {
    /// The driver-level type name, for error messages.
    pub fn type_name(&self) -> &str {
        match self {
            DbValue::Null => "NULL",
            DbValue::Int(_) => "integer",
            DbValue::Float(_) => "double",
            DbValue::Text(_) => "text",
            DbValue::Bool(_) => "boolean",
            DbValue::Other(name) => name,
        }
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Int(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Float(v)
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Bool(v)
    }
}

/// One result row: column names (shared across the row set) plus one value
/// per column.
#[derive(Debug, Clone)]
pub struct DbRow {
    pub columns: Arc<Vec<String>>,
    pub values: Vec<DbValue>,
}

/// Opens database handles for one DSN scheme.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Opens a handle for `dsn` (the full, unrewritten DSN) with the given
    /// pool limits. Drivers wrapping scheme-less native libraries should run
    /// the DSN through [`native_dsn`] first.
    async fn open(
        &self,
        dsn: &str,
        max_connections: u32,
        max_idle_connections: u32,
    ) -> Result<Box<dyn DbHandle>, DriverError>;
}

/// An open database handle (a connection pool, for most drivers).
#[async_trait]
pub trait DbHandle: Send + Sync {
    async fn ping(&self) -> Result<(), DriverError>;
    async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DriverError>;
}

/// A prepared statement, tied to the handle that prepared it.
#[async_trait]
pub trait Statement: Send + Sync {
    async fn query(&self) -> Result<Box<dyn Rows>, DriverError>;
}

/// A streaming result set.
#[async_trait]
pub trait Rows: Send {
    async fn next_row(&mut self) -> Result<Option<DbRow>, DriverError>;
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// An open handle plus a process-unique id. Prepared statements are pinned to
/// the id of the handle that prepared them; a re-opened handle gets a new id,
/// invalidating every cached statement.
pub struct Handle {
    id: u64,
    inner: Box<dyn DbHandle>,
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

impl Handle {
    fn new(inner: Box<dyn DbHandle>) -> Self {
        Handle {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            inner,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pings the database, returning as soon as the deadline expires even if
    /// the underlying driver ignores it.
    pub async fn ping(&self, deadline: Instant, log_context: &str) -> Result<(), Error> {
        match timeout_at(deadline, self.inner.ping()).await {
            Err(_) => Err(Error::cancelled(log_context)),
            Ok(Err(e)) => Err(Error::new(ErrorKind::DriverPing, log_context, e)),
            Ok(Ok(())) => Ok(()),
        }
    }

    pub async fn prepare(&self, sql: &str) -> Result<Arc<dyn Statement>, DriverError> {
        self.inner.prepare(sql).await
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<HashMap<String, Arc<dyn Driver>>> = RwLock::new(HashMap::new());
}

/// Registers `driver` for `scheme`, replacing any previous registration.
pub fn register_driver(scheme: &str, driver: Arc<dyn Driver>) {
    REGISTRY
        .write()
        .expect("driver registry poisoned")
        .insert(scheme.to_string(), driver);
}

/// Registers the drivers compiled into this binary: the sqlx-backed driver
/// for `postgres`, `mysql` and `sqlite`. `sqlserver` and `clickhouse` DSNs
/// parse but fail at open time until a driver is registered for them.
pub fn register_builtin_drivers() {
    let driver = Arc::new(sqlx_driver::SqlxDriver::new());
    for scheme in ["postgres", "mysql", "sqlite"] {
        register_driver(scheme, driver.clone());
    }
}

fn lookup(scheme: &str) -> Option<Arc<dyn Driver>> {
    REGISTRY
        .read()
        .expect("driver registry poisoned")
        .get(scheme)
        .cloned()
}

/// Extracts the scheme from a `<scheme>://<rest>` data source name.
pub fn parse_scheme(dsn: &str) -> Result<&str, String> {
    match dsn.split_once("://") {
        Some((scheme, _)) if !scheme.is_empty() => Ok(scheme),
        _ => Err("missing driver in data source name, expected format `<driver>://<dsn>`".into()),
    }
}

/// Rewrites a DSN into the form classic scheme-less native drivers expect:
///
/// | scheme       | rewrite                                  |
/// |--------------|------------------------------------------|
/// | `mysql`      | strip the `mysql://` prefix              |
/// | `postgres`   | unchanged                                |
/// | `sqlserver`  | unchanged                                |
/// | `clickhouse` | strip `clickhouse://`, prepend `tcp://`  |
///
/// Any other scheme passes through unchanged.
pub fn native_dsn(dsn: &str) -> Result<String, String> {
    let scheme = parse_scheme(dsn)?;
    Ok(match scheme {
        "mysql" => dsn.trim_start_matches("mysql://").to_string(),
        "clickhouse" => format!("tcp://{}", dsn.trim_start_matches("clickhouse://")),
        _ => dsn.to_string(),
    })
}

/// Opens a database handle for `dsn`, racing the driver against the scrape
/// deadline. Unknown schemes fail before any network I/O.
pub async fn open(
    deadline: Instant,
    log_context: &str,
    dsn: &str,
    max_connections: u32,
    max_idle_connections: u32,
) -> Result<Handle, Error> {
    let scheme = parse_scheme(dsn).map_err(|msg| Error::new(ErrorKind::Config, log_context, msg))?;
    let driver = lookup(scheme).ok_or_else(|| {
        Error::new(
            ErrorKind::Config,
            log_context,
            format!("missing or unknown driver for scheme {:?}", scheme),
        )
    })?;

    match timeout_at(deadline, driver.open(dsn, max_connections, max_idle_connections)).await {
        Err(_) => Err(Error::cancelled(log_context)),
        Ok(Err(e)) => Err(Error::new(ErrorKind::DriverOpen, log_context, e)),
        Ok(Ok(inner)) => {
            debug!("[{}] database handle opened with driver {}", log_context, driver.name());
            Ok(Handle::new(inner))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDriver;
    use super::*;
    use std::time::Duration;

    #[test]
    fn native_dsn_rewrites_known_schemes() {
        assert_eq!(native_dsn("mysql://u:p@tcp(h:3306)/db").unwrap(), "u:p@tcp(h:3306)/db");
        assert_eq!(
            native_dsn("postgres://u:p@h:5432/db").unwrap(),
            "postgres://u:p@h:5432/db"
        );
        assert_eq!(
            native_dsn("sqlserver://u:p@h:1433").unwrap(),
            "sqlserver://u:p@h:1433"
        );
        assert_eq!(
            native_dsn("clickhouse://h:9000?database=db").unwrap(),
            "tcp://h:9000?database=db"
        );
    }

    #[test]
    fn native_dsn_requires_a_scheme() {
        assert!(native_dsn("host=localhost dbname=x").is_err());
    }

    #[tokio::test]
    async fn open_rejects_unknown_schemes_before_any_io() {
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = open(deadline, "", "voodoo://h:1", 1, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("missing or unknown driver"), "{}", err);
    }

    #[tokio::test]
    async fn open_failure_is_a_driver_open_error() {
        register_driver("drv-openfail", Arc::new(MockDriver::new().fail_open("boom")));
        let deadline = Instant::now() + Duration::from_secs(5);
        let err = open(deadline, "", "drv-openfail://db", 1, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverOpen);
    }

    #[tokio::test]
    async fn open_respects_the_deadline_when_the_driver_hangs() {
        register_driver("drv-openhang", Arc::new(MockDriver::new().hang_open()));
        let started = Instant::now();
        let deadline = started + Duration::from_millis(100);
        let err = open(deadline, "", "drv-openhang://db", 1, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn ping_respects_the_deadline_when_the_driver_hangs() {
        register_driver("drv-pinghang", Arc::new(MockDriver::new().hang_ping()));
        let deadline = Instant::now() + Duration::from_secs(5);
        let handle = open(deadline, "", "drv-pinghang://db", 1, 1).await.unwrap();

        let started = Instant::now();
        let err = handle
            .ping(started + Duration::from_millis(100), "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn handles_get_unique_ids() {
        register_driver("drv-ids", Arc::new(MockDriver::new()));
        let deadline = Instant::now() + Duration::from_secs(5);
        let a = open(deadline, "", "drv-ids://db", 1, 1).await.unwrap();
        let b = open(deadline, "", "drv-ids://db", 1, 1).await.unwrap();
        assert_ne!(a.id(), b.id());
    }
}
