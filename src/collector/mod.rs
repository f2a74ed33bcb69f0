//! A collector executes the queries of one named collector config against a
//! target's handle and streams the resulting samples.

use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};

use crate::config::{CollectorConfig, GlobalConfig, QueryConfig};
use crate::drivers::Handle;
use crate::error::{push_context, Error, ErrorKind};
use crate::metrics::{MetricFamily, Sample, SampleResult};
use crate::query::Query;

/// A named bundle of metric families grouped by the queries that populate
/// them. Each target owns its own instances, because prepared statements are
/// tied to the target's handle.
pub struct Collector {
    name: String,
    queries: Vec<Query>,
    min_interval: Duration,
    log_context: String,
    last_run: Mutex<Option<CachedRun>>,
}

struct CachedRun {
    at: Instant,
    samples: Vec<Sample>,
}

impl Collector {
    /// Builds the collector's families and coalesces those sharing a query
    /// into a single `Query`, so that each statement runs once per scrape no
    /// matter how many families it feeds.
    pub fn new(
        log_context: &str,
        cc: &CollectorConfig,
        const_labels: &[(String, String)],
        global: &GlobalConfig,
    ) -> Result<Collector, Error> {
        let log_context = push_context(log_context, "collector", &cc.collector_name);

        let named: HashMap<&str, Arc<QueryConfig>> = cc
            .queries
            .iter()
            .map(|q| (q.query_name.as_str(), Arc::new(q.clone())))
            .collect();

        // Group order follows first metric mention, so query execution order
        // is stable across scrapes.
        let mut groups: Vec<(Arc<QueryConfig>, Vec<MetricFamily>)> = Vec::new();
        for mc in &cc.metrics {
            let qc = match (&mc.query, &mc.query_ref) {
                (_, Some(query_ref)) => named.get(query_ref.as_str()).cloned().ok_or_else(|| {
                    Error::new(
                        ErrorKind::Config,
                        &log_context,
                        format!("unresolved query_ref {:?} in metric {:?}", query_ref, mc.metric_name),
                    )
                })?,
                (Some(sql), None) => Arc::new(QueryConfig {
                    query_name: format!("{}.{}", cc.collector_name, mc.metric_name),
                    query: sql.clone(),
                }),
                (None, None) => {
                    return Err(Error::new(
                        ErrorKind::Config,
                        &log_context,
                        format!("metric {:?} defines neither query nor query_ref", mc.metric_name),
                    ))
                }
            };
            let mf = MetricFamily::new(&log_context, mc, const_labels)?;
            match groups.iter_mut().find(|(g, _)| g.query_name == qc.query_name) {
                Some((_, families)) => families.push(mf),
                None => groups.push((qc, vec![mf])),
            }
        }

        let queries = groups
            .into_iter()
            .map(|(qc, families)| Query::new(&log_context, qc, families))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Collector {
            name: cc.collector_name.clone(),
            queries,
            min_interval: cc.min_interval.unwrap_or(global.min_interval),
            log_context,
            last_run: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs every query against `handle` and sends each resulting sample (or
    /// invalid-metric error) to `tx`. Failures are localized: a failing query
    /// or row does not stop the remaining ones.
    pub async fn collect(&self, deadline: Instant, handle: &Handle, tx: &mpsc::Sender<SampleResult>) {
        if !self.min_interval.is_zero() {
            let last_run = self.last_run.lock().await;
            if let Some(run) = last_run.as_ref() {
                if run.at.elapsed() < self.min_interval {
                    debug!(
                        "[{}] serving cached samples, min_interval ({:?}) not yet elapsed",
                        self.log_context, self.min_interval
                    );
                    for sample in run.samples.clone() {
                        if tx.send(Ok(sample)).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
            }
        }

        let mut batch = Vec::new();
        let mut clean = true;
        for query in &self.queries {
            if Instant::now() >= deadline {
                let _ = tx.send(Err(Error::cancelled(&self.log_context))).await;
                return;
            }

            let mut rows = match query.run(deadline, handle).await {
                Ok(rows) => rows,
                Err(e) => {
                    clean = false;
                    if tx.send(Err(e)).await.is_err() {
                        return;
                    }
                    continue;
                }
            };

            loop {
                let row = match timeout_at(deadline, rows.next_row()).await {
                    Err(_) => {
                        clean = false;
                        let _ = tx.send(Err(Error::cancelled(query.log_context()))).await;
                        break;
                    }
                    Ok(Err(e)) => {
                        clean = false;
                        let _ = tx
                            .send(Err(Error::new(ErrorKind::Query, query.log_context(), e)))
                            .await;
                        break;
                    }
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(row))) => row,
                };

                let record = match query.scan_row(&row) {
                    Ok(record) => record,
                    Err(e) => {
                        // Schema drift on a single row; keep scanning.
                        clean = false;
                        if tx.send(Err(e)).await.is_err() {
                            return;
                        }
                        continue;
                    }
                };

                for family in query.families() {
                    for result in family.collect(&record) {
                        if let Ok(sample) = &result {
                            batch.push(sample.clone());
                        } else {
                            clean = false;
                        }
                        if tx.send(result).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }

        // Only a fully successful run may serve a cache window.
        if clean && !self.min_interval.is_zero() {
            *self.last_run.lock().await = Some(CachedRun {
                at: Instant::now(),
                samples: batch,
            });
        }
    }
}
