//! The scrape engine: deadline derivation, target fan-out and the final
//! by-name merge of metric families.

use futures::StreamExt;
use log::warn;
use prometheus::proto;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{CollectorConfig, Config, MetricType};
use crate::error::{Error, ErrorKind};
use crate::job::Job;
use crate::metrics::Sample;
use crate::target::Target;

/// The exporter core: all jobs and targets built from one validated config.
pub struct Exporter {
    config: Config,
    jobs: Vec<Job>,
}

impl Exporter {
    pub fn new(config: Config) -> Result<Exporter, Error> {
        let mut jobs = Vec::new();
        if let Some(tc) = &config.target {
            let collectors = resolve_collectors(&config, &tc.collectors)?;
            let target = Target::new(
                "",
                "",
                &tc.data_source_name,
                &collectors,
                &tc.labels,
                &config.global,
            )?;
            jobs.push(Job::single(target));
        }
        for jc in &config.jobs {
            let collectors = resolve_collectors(&config, &jc.collectors)?;
            jobs.push(Job::from_config(jc, &collectors, &config.global)?);
        }
        Ok(Exporter { config, jobs })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn targets(&self) -> impl Iterator<Item = &Target> {
        self.jobs.iter().flat_map(Job::targets)
    }

    /// Derives the effective scrape timeout from the deadline the caller
    /// announced (if any): the announced timeout minus the configured offset,
    /// capped by `global.scrape_timeout`. An offset that would leave nothing
    /// is ignored rather than starving the scrape.
    pub fn scrape_timeout(&self, header_timeout: Option<Duration>) -> Option<Duration> {
        let globals = &self.config.global;
        let mut timeout = None;

        if let Some(announced) = header_timeout {
            let offset = globals.scrape_timeout_offset;
            if offset >= announced {
                warn!(
                    "global.scrape_timeout_offset ({}) is not smaller than the caller's timeout ({}), ignoring it",
                    humantime::format_duration(offset),
                    humantime::format_duration(announced),
                );
                timeout = Some(announced);
            } else {
                timeout = Some(announced - offset);
            }
        }

        let configured = globals.scrape_timeout;
        if !configured.is_zero() && timeout.map_or(true, |t| configured < t) {
            timeout = Some(configured);
        }
        timeout
    }

    /// Runs one scrape: every target in parallel under `deadline`, results
    /// merged by family name together with the process-level metrics from
    /// the default registry. The output is sorted by family name.
    pub async fn gather(&self, deadline: Instant) -> (Vec<proto::MetricFamily>, Vec<Error>) {
        let scrapes: Vec<_> = self.targets().map(|t| t.gather(deadline)).collect();
        let concurrency = scrapes.len().max(1);
        let results = futures::stream::iter(scrapes)
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut errors = Vec::new();
        let mut families = BTreeMap::new();
        for (samples, errs) in results {
            errors.extend(errs);
            for sample in samples {
                merge_sample(&mut families, sample);
            }
        }
        for family in prometheus::gather() {
            merge_proto(&mut families, family);
        }

        (families.into_values().collect(), errors)
    }
}

fn resolve_collectors(
    config: &Config,
    names: &[String],
) -> Result<Vec<Arc<CollectorConfig>>, Error> {
    names
        .iter()
        .map(|name| {
            config
                .collector(name)
                .map(|cc| Arc::new(cc.clone()))
                .ok_or_else(|| {
                    Error::new(ErrorKind::Config, "", format!("unknown collector {:?}", name))
                })
        })
        .collect()
}

fn proto_type(kind: MetricType) -> proto::MetricType {
    match kind {
        MetricType::Counter => proto::MetricType::COUNTER,
        MetricType::Gauge => proto::MetricType::GAUGE,
    }
}

/// Appends `sample` to its family, creating the family on first sight. On a
/// kind conflict the first family wins and the sample is dropped; on a help
/// conflict the first help wins. Both are logged, neither aborts the scrape.
fn merge_sample(families: &mut BTreeMap<String, proto::MetricFamily>, sample: Sample) {
    let family = families.entry(sample.name.clone()).or_insert_with(|| {
        let mut mf = proto::MetricFamily::default();
        mf.set_name(sample.name.clone());
        mf.set_help(sample.help.clone());
        mf.set_field_type(proto_type(sample.kind));
        mf
    });

    if family.get_field_type() != proto_type(sample.kind) {
        warn!(
            "conflicting types for metric family {:?}, dropping a {:?} sample",
            sample.name, sample.kind
        );
        return;
    }
    if family.get_help() != sample.help {
        warn!(
            "conflicting help for metric family {:?}, keeping {:?}",
            sample.name,
            family.get_help()
        );
    }

    let mut metric = proto::Metric::default();
    for (name, value) in &sample.labels {
        let mut pair = proto::LabelPair::default();
        pair.set_name(name.clone());
        pair.set_value(value.clone());
        metric.mut_label().push(pair);
    }
    match sample.kind {
        MetricType::Counter => {
            let mut counter = proto::Counter::default();
            counter.set_value(sample.value);
            metric.set_counter(counter);
        }
        MetricType::Gauge => {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(sample.value);
            metric.set_gauge(gauge);
        }
    }
    family.mut_metric().push(metric);
}

fn merge_proto(families: &mut BTreeMap<String, proto::MetricFamily>, mut incoming: proto::MetricFamily) {
    match families.get_mut(incoming.get_name()) {
        None => {
            families.insert(incoming.get_name().to_string(), incoming);
        }
        Some(existing) => {
            if existing.get_field_type() != incoming.get_field_type() {
                warn!(
                    "conflicting types for metric family {:?}, dropping {} samples",
                    incoming.get_name(),
                    incoming.get_metric().len()
                );
                return;
            }
            for metric in incoming.take_metric().into_iter() {
                existing.mut_metric().push(metric);
            }
        }
    }
}
