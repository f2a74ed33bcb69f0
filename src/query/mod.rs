//! Query planning and execution: one `Query` feeds every metric family that
//! shares its SQL, converting result rows into typed records.

use log::trace;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

use crate::config::QueryConfig;
use crate::drivers::{DbRow, DbValue, Handle, Rows, Statement};
use crate::error::{push_context, Error, ErrorKind};
use crate::metrics::{CellValue, MetricFamily, Record};

/// The semantic type expected of a result column: key columns scan as text,
/// value columns as finite doubles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnUse {
    Key,
    Value,
}

/// A SQL query and the metric families it populates. The prepared statement
/// is created once per `(query, handle)` pair and pinned to that handle.
pub struct Query {
    config: Arc<QueryConfig>,
    families: Vec<MetricFamily>,
    column_types: HashMap<String, ColumnUse>,
    log_context: String,
    prepared: Mutex<Option<Prepared>>,
}

struct Prepared {
    handle_id: u64,
    statement: Arc<dyn Statement>,
}

impl std::fmt::Debug for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Query")
            .field("log_context", &self.log_context)
            .finish()
    }
}

impl Query {
    /// Builds the query's column-type map from the union of columns its
    /// families reference. A column used as a key by one family and as a
    /// value by another is a configuration error.
    pub fn new(
        log_context: &str,
        config: Arc<QueryConfig>,
        families: Vec<MetricFamily>,
    ) -> Result<Query, Error> {
        let log_context = push_context(log_context, "query", &config.query_name);

        let mut column_types = HashMap::new();
        for mf in &families {
            for column in mf.key_labels() {
                set_column_type(&log_context, column, ColumnUse::Key, &mut column_types)?;
            }
            for column in mf.values() {
                set_column_type(&log_context, column, ColumnUse::Value, &mut column_types)?;
            }
        }

        Ok(Query {
            config,
            families,
            column_types,
            log_context,
            prepared: Mutex::new(None),
        })
    }

    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    pub fn log_context(&self) -> &str {
        &self.log_context
    }

    /// Executes the query on `handle` under the scrape deadline, preparing
    /// the statement on first use.
    ///
    /// # Panics
    ///
    /// Panics if invoked with a different handle than the one that prepared
    /// the statement; that is a programming error, not a runtime condition.
    pub async fn run(&self, deadline: Instant, handle: &Handle) -> Result<Box<dyn Rows>, Error> {
        let statement = {
            let mut prepared = self.prepared.lock().await;
            match prepared.as_ref() {
                Some(p) => {
                    if p.handle_id != handle.id() {
                        panic!(
                            "[{}] query invoked with a different handle than the one that prepared it",
                            self.log_context
                        );
                    }
                    p.statement.clone()
                }
                None => {
                    let statement = match timeout_at(deadline, handle.prepare(&self.config.query)).await
                    {
                        Err(_) => return Err(Error::cancelled(&self.log_context)),
                        Ok(Err(e)) => {
                            return Err(Error::new(
                                ErrorKind::Query,
                                &self.log_context,
                                format!("prepare failed: {}", e),
                            ))
                        }
                        Ok(Ok(statement)) => statement,
                    };
                    *prepared = Some(Prepared {
                        handle_id: handle.id(),
                        statement: statement.clone(),
                    });
                    statement
                }
            }
        };

        match timeout_at(deadline, statement.query()).await {
            Err(_) => Err(Error::cancelled(&self.log_context)),
            Ok(Err(e)) => Err(Error::new(ErrorKind::Query, &self.log_context, e)),
            Ok(Ok(rows)) => Ok(rows),
        }
    }

    /// Converts one driver row into a record, checking that every column of
    /// the type map was present in the result set.
    pub fn scan_row(&self, row: &DbRow) -> Result<Record, Error> {
        let mut record = Record::with_capacity(self.column_types.len());
        for (i, column) in row.columns.iter().enumerate() {
            let value = row.values.get(i).ok_or_else(|| {
                Error::new(
                    ErrorKind::Scan,
                    &self.log_context,
                    "row is narrower than its column list",
                )
            })?;
            match self.column_types.get(column.as_str()) {
                Some(ColumnUse::Key) => {
                    record.insert(column.clone(), CellValue::Key(self.key_text(column, value)?));
                }
                Some(ColumnUse::Value) => {
                    record.insert(column.clone(), CellValue::Value(self.value_f64(column, value)?));
                }
                None => {
                    trace!("[{}] extra column {:?} returned by query", self.log_context, column);
                }
            }
        }

        if record.len() != self.column_types.len() {
            let mut missing: Vec<&str> = self
                .column_types
                .keys()
                .filter(|c| !record.contains_key(c.as_str()))
                .map(String::as_str)
                .collect();
            missing.sort_unstable();
            return Err(Error::new(
                ErrorKind::Scan,
                &self.log_context,
                format!("column(s) [{}] missing from query result", missing.join(", ")),
            ));
        }
        Ok(record)
    }

    fn key_text(&self, column: &str, value: &DbValue) -> Result<String, Error> {
        match value {
            DbValue::Text(s) => Ok(s.clone()),
            DbValue::Int(i) => Ok(i.to_string()),
            DbValue::Float(f) => Ok(f.to_string()),
            DbValue::Bool(b) => Ok(b.to_string()),
            DbValue::Null | DbValue::Other(_) => Err(Error::new(
                ErrorKind::Scan,
                &self.log_context,
                format!("cannot use {} value in key column {:?}", value.type_name(), column),
            )),
        }
    }

    fn value_f64(&self, column: &str, value: &DbValue) -> Result<f64, Error> {
        let v = match value {
            DbValue::Float(f) => *f,
            DbValue::Int(i) => *i as f64,
            DbValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                Error::new(
                    ErrorKind::Scan,
                    &self.log_context,
                    format!("cannot parse text {:?} in value column {:?}", s, column),
                )
            })?,
            DbValue::Null | DbValue::Bool(_) | DbValue::Other(_) => {
                return Err(Error::new(
                    ErrorKind::Scan,
                    &self.log_context,
                    format!("cannot use {} value in value column {:?}", value.type_name(), column),
                ))
            }
        };
        if !v.is_finite() {
            return Err(Error::new(
                ErrorKind::Scan,
                &self.log_context,
                format!("non-finite value in value column {:?}", column),
            ));
        }
        Ok(v)
    }
}

fn set_column_type(
    log_context: &str,
    column: &str,
    column_use: ColumnUse,
    column_types: &mut HashMap<String, ColumnUse>,
) -> Result<(), Error> {
    match column_types.get(column) {
        Some(previous) if *previous != column_use => Err(Error::new(
            ErrorKind::Config,
            log_context,
            format!("column {:?} used both as a key and a value", column),
        )),
        Some(_) => Ok(()),
        None => {
            column_types.insert(column.to_string(), column_use);
            Ok(())
        }
    }
}
