//! Target execution: one database endpoint, its collectors, and the
//! synthetic `up` / `scrape_duration_seconds` metrics.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::Instant;

use crate::collector::Collector;
use crate::config::{CollectorConfig, GlobalConfig};
use crate::drivers::{self, Handle};
use crate::error::{push_context, Error};
use crate::metrics::{AutomaticMetric, Sample, SampleResult};

/// Capacity of the sample channel between collectors and the aggregator.
const SAMPLE_CHANNEL_CAPACITY: usize = 1000;

const UP_NAME: &str = "up";
const UP_HELP: &str = "1 if the target is reachable, or 0 if the scrape failed";
const SCRAPE_DURATION_NAME: &str = "scrape_duration_seconds";
const SCRAPE_DURATION_HELP: &str = "How long it took to scrape the target in seconds";

/// A single database endpoint identified by `(job, instance)`. The handle is
/// opened lazily on the first scrape and then kept for the lifetime of the
/// process; a failed scrape never poisons the next one.
pub struct Target {
    job: String,
    instance: String,
    dsn: String,
    collectors: Vec<Arc<Collector>>,
    up: AutomaticMetric,
    scrape_duration: AutomaticMetric,
    global: GlobalConfig,
    handle: Mutex<Option<Arc<Handle>>>,
    collector_gate: Arc<Semaphore>,
    log_context: String,
}

impl Target {
    pub fn new(
        job: &str,
        instance: &str,
        dsn: &str,
        collector_configs: &[Arc<CollectorConfig>],
        static_labels: &BTreeMap<String, String>,
        global: &GlobalConfig,
    ) -> Result<Target, Error> {
        let mut log_context = String::new();
        if !job.is_empty() {
            log_context = push_context(&log_context, "job", job);
        }
        if !instance.is_empty() {
            log_context = push_context(&log_context, "target", instance);
        }

        let mut const_labels: Vec<(String, String)> = static_labels
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if !job.is_empty() {
            const_labels.push(("job".to_string(), job.to_string()));
        }
        if !instance.is_empty() {
            const_labels.push(("instance".to_string(), instance.to_string()));
        }

        let collectors = collector_configs
            .iter()
            .map(|cc| Collector::new(&log_context, cc, &const_labels, global).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Target {
            job: job.to_string(),
            instance: instance.to_string(),
            dsn: dsn.to_string(),
            collectors,
            up: AutomaticMetric::new(UP_NAME, UP_HELP, &const_labels),
            scrape_duration: AutomaticMetric::new(
                SCRAPE_DURATION_NAME,
                SCRAPE_DURATION_HELP,
                &const_labels,
            ),
            global: global.clone(),
            handle: Mutex::new(None),
            collector_gate: Arc::new(Semaphore::new(global.max_connections as usize)),
            log_context,
        })
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Scrapes this target under `deadline`. Callers serialize scrapes per
    /// target.
    ///
    /// `up` and `scrape_duration_seconds` are always present exactly once in
    /// the returned samples, and always after every collector has finished
    /// or been cancelled.
    pub async fn gather(&self, deadline: Instant) -> (Vec<Sample>, Vec<Error>) {
        let scrape_start = Instant::now();
        let mut errors = Vec::new();
        let mut target_up = true;

        // Open the handle if this is the first scrape to get here; one
        // attempt per scrape, retained once it succeeds.
        let handle = {
            let mut handle = self.handle.lock().await;
            if handle.is_none() {
                match drivers::open(
                    deadline,
                    &self.log_context,
                    &self.dsn,
                    self.global.max_connections,
                    self.global.max_idle_connections,
                )
                .await
                {
                    Ok(opened) => *handle = Some(Arc::new(opened)),
                    Err(e) => {
                        errors.push(e);
                        target_up = false;
                    }
                }
            }
            handle.clone()
        };

        if target_up {
            if Instant::now() >= deadline {
                // Timed out or cancelled before actually scraping.
                errors.push(Error::cancelled(&self.log_context));
                target_up = false;
            }
        }

        if let (true, Some(handle)) = (target_up, handle.as_ref()) {
            if let Err(e) = handle.ping(deadline, &self.log_context).await {
                errors.push(e);
                target_up = false;
            }
        }

        let (tx, mut rx) = mpsc::channel::<SampleResult>(SAMPLE_CHANNEL_CAPACITY);
        if let (true, Some(handle)) = (target_up, handle) {
            for collector in &self.collectors {
                let collector = collector.clone();
                let handle = handle.clone();
                let tx = tx.clone();
                let gate = self.collector_gate.clone();
                tokio::spawn(async move {
                    let _permit = match gate.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return,
                    };
                    collector.collect(deadline, &handle, &tx).await;
                });
            }
        }
        // The aggregator below owns the only remaining sender clone; once
        // every collector task finishes, the channel closes and the loop
        // ends, so collectors are fully drained even on cancellation.
        drop(tx);

        let mut samples = Vec::new();
        while let Some(result) = rx.recv().await {
            match result {
                Ok(sample) => samples.push(sample),
                Err(e) => errors.push(e),
            }
        }

        // Synthetic metrics go last, after the stream has closed.
        samples.push(self.up.sample(if target_up { 1.0 } else { 0.0 }));
        samples.push(self.scrape_duration.sample(scrape_start.elapsed().as_secs_f64()));

        let labels = [self.job.as_str(), self.instance.as_str()];
        if target_up {
            crate::SCRAPE_SUCCESSES.with_label_values(&labels).inc();
        } else {
            crate::SCRAPE_FAILURES.with_label_values(&labels).inc();
        }

        (samples, errors)
    }
}
