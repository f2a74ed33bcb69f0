//! Metric family materialization: expanding one scanned record into the
//! samples it defines, with deterministic label ordering.

use std::collections::HashMap;

use crate::config::{MetricConfig, MetricType};
use crate::error::{push_context, Error, ErrorKind};

/// One scanned cell: text for key columns, a finite double for value columns.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Key(String),
    Value(f64),
}

/// One scanned row, keyed by column name.
pub type Record = HashMap<String, CellValue>;

/// A single concrete sample. Samples are self-contained (they carry their
/// family's descriptor) so that families from different targets merge by
/// name at the end of a scrape.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub help: String,
    pub kind: MetricType,
    /// Complete label set, sorted by label name.
    pub labels: Vec<(String, String)>,
    pub value: f64,
}

/// What flows through the sample channel: either a sample or the error that
/// prevented one ("invalid metric").
pub type SampleResult = Result<Sample, Error>;

/// A family of samples sharing name, help, kind and label schema, with the
/// logic to populate them from scanned records.
pub struct MetricFamily {
    name: String,
    help: String,
    kind: MetricType,
    key_labels: Vec<String>,
    value_label: Option<String>,
    values: Vec<String>,
    const_labels: Vec<(String, String)>,
    log_context: String,
}

impl MetricFamily {
    /// Builds a family from its config and the constant labels of the owning
    /// target (typically `job`, `instance` and static-config labels).
    pub fn new(
        log_context: &str,
        mc: &MetricConfig,
        const_labels: &[(String, String)],
    ) -> Result<MetricFamily, Error> {
        let log_context = push_context(log_context, "metric", &mc.metric_name);

        if mc.values.is_empty() {
            return Err(Error::new(ErrorKind::Config, log_context, "no value column defined"));
        }
        if mc.values.len() > 1 && mc.value_label.is_none() {
            return Err(Error::new(
                ErrorKind::Config,
                log_context,
                "multiple value columns but no value label",
            ));
        }

        let mut const_labels = const_labels.to_vec();
        const_labels.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(MetricFamily {
            name: mc.metric_name.clone(),
            help: mc.help.clone(),
            kind: mc.metric_type,
            key_labels: mc.key_labels.clone(),
            value_label: mc.value_label.clone(),
            values: mc.values.clone(),
            const_labels,
            log_context,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key_labels(&self) -> &[String] {
        &self.key_labels
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn log_context(&self) -> &str {
        &self.log_context
    }

    /// Expands `record` into one sample per value column. A record missing a
    /// required column yields a single invalid metric and no samples.
    pub fn collect(&self, record: &Record) -> Vec<SampleResult> {
        let mut key_values = Vec::with_capacity(self.key_labels.len());
        for label in &self.key_labels {
            match record.get(label) {
                Some(CellValue::Key(text)) => key_values.push((label.clone(), text.clone())),
                _ => {
                    return vec![Err(Error::new(
                        ErrorKind::Scan,
                        &self.log_context,
                        format!("key column {:?} missing from record", label),
                    ))]
                }
            }
        }
        let mut value_columns = Vec::with_capacity(self.values.len());
        for column in &self.values {
            match record.get(column) {
                Some(CellValue::Value(v)) => value_columns.push((column, *v)),
                _ => {
                    return vec![Err(Error::new(
                        ErrorKind::Scan,
                        &self.log_context,
                        format!("value column {:?} missing from record", column),
                    ))]
                }
            }
        }

        let mut samples = Vec::with_capacity(self.values.len());
        for (column, value) in value_columns {
            let mut labels = key_values.clone();
            if let Some(value_label) = &self.value_label {
                // The value column's name, not its data, goes in this slot.
                labels.push((value_label.clone(), column.clone()));
            }
            labels.extend(self.const_labels.iter().cloned());
            labels.sort_by(|a, b| a.0.cmp(&b.0));
            samples.push(Ok(Sample {
                name: self.name.clone(),
                help: self.help.clone(),
                kind: self.kind,
                labels,
                value,
            }));
        }
        samples
    }
}

/// Descriptor for synthesized per-target metrics (`up`,
/// `scrape_duration_seconds`): gauges carrying only the target's constant
/// labels.
pub struct AutomaticMetric {
    name: &'static str,
    help: &'static str,
    const_labels: Vec<(String, String)>,
}

impl AutomaticMetric {
    pub fn new(name: &'static str, help: &'static str, const_labels: &[(String, String)]) -> Self {
        let mut const_labels = const_labels.to_vec();
        const_labels.sort_by(|a, b| a.0.cmp(&b.0));
        AutomaticMetric {
            name,
            help,
            const_labels,
        }
    }

    pub fn sample(&self, value: f64) -> Sample {
        Sample {
            name: self.name.to_string(),
            help: self.help.to_string(),
            kind: MetricType::Gauge,
            labels: self.const_labels.clone(),
            value,
        }
    }
}
