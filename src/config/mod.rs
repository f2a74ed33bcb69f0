//! Typed, validated in-memory configuration.
//!
//! The file format is YAML; unknown fields are rejected everywhere. All
//! cross-references (collector names, `query_ref`s) and label rules are
//! checked at load time so that nothing past this module ever has to deal
//! with an unresolved name.

mod duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Labels injected by the target; user configurations may not redefine them.
pub const RESERVED_LABELS: [&str; 2] = ["job", "instance"];

/// Placeholder shown instead of data source names on the config page.
pub const DSN_MASK: &str = "<secret>";

lazy_static! {
    static ref METRIC_NAME_RE: Regex = Regex::new("^[a-zA-Z_:][a-zA-Z0-9_:]*$").unwrap();
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "error reading config: {}", e),
            ConfigError::Yaml(e) => write!(f, "error parsing config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Yaml(e)
    }
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

//
// Top-level config
//

/// The complete exporter configuration: global defaults, either a single
/// target or a list of jobs, and the collectors they reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<JobConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collectors: Vec<CollectorConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collector_files: Vec<String>,
}

impl Config {
    /// Reads and validates the configuration at `path`. Glob patterns in
    /// `collector_files` are resolved relative to the config file's directory
    /// and their collectors merged in before validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&text)?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let patterns = config.collector_files.clone();
        for pattern in &patterns {
            let full = base.join(pattern);
            let paths = glob::glob(&full.to_string_lossy())
                .map_err(|e| invalid(format!("bad collector_files pattern {:?}: {}", pattern, e)))?;
            for entry in paths {
                let file = entry.map_err(|e| {
                    invalid(format!("error resolving collector_files pattern {:?}: {}", pattern, e))
                })?;
                let text = fs::read_to_string(&file)?;
                let cf: CollectorFileConfig = serde_yaml::from_str(&text)?;
                for mut cc in cf.collectors {
                    // File-level named queries are visible to every collector
                    // in that file, unless shadowed by the collector's own.
                    for q in &cf.queries {
                        if !cc.queries.iter().any(|own| own.query_name == q.query_name) {
                            cc.queries.push(q.clone());
                        }
                    }
                    config.collectors.push(cc);
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a configuration from a YAML string.
    pub fn from_yaml(text: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Renders the configuration back to YAML. `Config::from_yaml` of the
    /// result yields an equal value.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Like `to_yaml`, but with every data source name replaced by
    /// `<secret>`. This is what the `/config` page serves.
    pub fn to_masked_yaml(&self) -> Result<String, ConfigError> {
        let mut masked = self.clone();
        if let Some(target) = masked.target.as_mut() {
            target.data_source_name = DSN_MASK.to_string();
        }
        for job in &mut masked.jobs {
            for sc in &mut job.static_configs {
                for dsn in sc.targets.values_mut() {
                    *dsn = DSN_MASK.to_string();
                }
            }
        }
        masked.to_yaml()
    }

    pub fn collector(&self, name: &str) -> Option<&CollectorConfig> {
        self.collectors.iter().find(|c| c.collector_name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.global.max_connections == 0 {
            return Err(invalid("global.max_connections must be at least 1"));
        }

        match (&self.target, self.jobs.is_empty()) {
            (Some(_), false) => {
                return Err(invalid("exactly one of `target` and `jobs` must be defined, not both"))
            }
            (None, true) => return Err(invalid("no targets defined: need either `target` or `jobs`")),
            _ => {}
        }

        let mut collector_names = HashSet::new();
        for cc in &self.collectors {
            if cc.collector_name.is_empty() {
                return Err(invalid("missing name for collector"));
            }
            if !collector_names.insert(cc.collector_name.as_str()) {
                return Err(invalid(format!("duplicate collector name: {}", cc.collector_name)));
            }
            cc.validate()?;
        }

        if let Some(target) = &self.target {
            self.validate_collector_refs("target", &target.collectors)?;
            check_labels(target.labels.keys(), "target labels")?;
            self.check_label_collisions("target", &target.collectors, &target.labels)?;
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.job_name.is_empty() {
                return Err(invalid("missing name for job"));
            }
            if !job_names.insert(job.job_name.as_str()) {
                return Err(invalid(format!("duplicate job name: {}", job.job_name)));
            }
            self.validate_collector_refs(&format!("job {:?}", job.job_name), &job.collectors)?;
            if job.static_configs.is_empty() {
                return Err(invalid(format!("no targets defined for job {:?}", job.job_name)));
            }
            for sc in &job.static_configs {
                sc.validate(&job.job_name)?;
                self.check_label_collisions(
                    &format!("job {:?}", job.job_name),
                    &job.collectors,
                    &sc.labels,
                )?;
            }
        }

        Ok(())
    }

    fn validate_collector_refs(&self, owner: &str, refs: &[String]) -> Result<(), ConfigError> {
        if refs.is_empty() {
            return Err(invalid(format!("no collectors defined for {}", owner)));
        }
        for (i, name) in refs.iter().enumerate() {
            if refs[i + 1..].contains(name) {
                return Err(invalid(format!("duplicate collector reference {:?} by {}", name, owner)));
            }
            if self.collector(name).is_none() {
                return Err(invalid(format!("unknown collector {:?} referenced by {}", name, owner)));
            }
        }
        Ok(())
    }

    /// A label set by a static config must not collide with a label produced
    /// by any metric of the referenced collectors.
    fn check_label_collisions(
        &self,
        owner: &str,
        collector_refs: &[String],
        labels: &BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        if labels.is_empty() {
            return Ok(());
        }
        for name in collector_refs {
            let cc = match self.collector(name) {
                Some(cc) => cc,
                None => continue, // reported by validate_collector_refs
            };
            for mc in &cc.metrics {
                for label in mc.key_labels.iter().chain(mc.value_label.iter()) {
                    if labels.contains_key(label) {
                        return Err(invalid(format!(
                            "label collision in {}: label {:?} is defined both by a static config and by metric {:?} of collector {:?}",
                            owner, label, mc.metric_name, cc.collector_name
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

//
// Globals
//

/// Globally applicable defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Default bound on any scrape; zero disables it.
    #[serde(with = "duration", default = "default_scrape_timeout")]
    pub scrape_timeout: Duration,
    /// Headroom subtracted from the deadline Prometheus announces.
    #[serde(with = "duration", default = "default_scrape_timeout_offset")]
    pub scrape_timeout_offset: Duration,
    /// Default per-collector cache window; zero disables caching.
    #[serde(with = "duration", default)]
    pub min_interval: Duration,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: u32,
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_scrape_timeout_offset() -> Duration {
    Duration::from_millis(500)
}

fn default_max_connections() -> u32 {
    3
}

fn default_max_idle_connections() -> u32 {
    3
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            scrape_timeout: default_scrape_timeout(),
            scrape_timeout_offset: default_scrape_timeout_offset(),
            min_interval: Duration::ZERO,
            max_connections: default_max_connections(),
            max_idle_connections: default_max_idle_connections(),
        }
    }
}

//
// Targets and jobs
//

/// A single statically configured target (the exporter's single-target mode).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub data_source_name: String,
    pub collectors: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A set of collectors applied to a set of targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub job_name: String,
    pub collectors: Vec<String>,
    pub static_configs: Vec<StaticConfig>,
}

/// Statically defined targets (instance name → DSN) plus labels applied to
/// every metric collected from them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticConfig {
    pub targets: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl StaticConfig {
    fn validate(&self, job: &str) -> Result<(), ConfigError> {
        if self.targets.is_empty() {
            return Err(invalid(format!("no targets defined in a static config of job {:?}", job)));
        }
        let mut dsns = HashSet::new();
        for (name, dsn) in &self.targets {
            if name.is_empty() {
                return Err(invalid(format!("empty target name in a static config of job {:?}", job)));
            }
            if dsn.is_empty() {
                return Err(invalid(format!(
                    "empty data source name for target {:?} of job {:?}",
                    name, job
                )));
            }
            if !dsns.insert(dsn.as_str()) {
                return Err(invalid(format!(
                    "duplicate data source name in a static config of job {:?}",
                    job
                )));
            }
        }
        check_labels(self.labels.keys(), &format!("static config labels of job {:?}", job))
    }
}

//
// Collectors
//

/// A named, reusable set of metrics and the queries that populate them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CollectorConfig {
    pub collector_name: String,
    /// Minimum interval between executions; unset falls back to the global
    /// default.
    #[serde(default, with = "duration::option", skip_serializing_if = "Option::is_none")]
    pub min_interval: Option<Duration>,
    pub metrics: Vec<MetricConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<QueryConfig>,
}

impl CollectorConfig {
    pub fn query(&self, name: &str) -> Option<&QueryConfig> {
        self.queries.iter().find(|q| q.query_name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ctx = format!("collector {:?}", self.collector_name);

        if self.metrics.is_empty() {
            return Err(invalid(format!("no metrics defined for {}", ctx)));
        }

        let mut query_names = HashSet::new();
        for qc in &self.queries {
            if qc.query_name.is_empty() {
                return Err(invalid(format!("missing name for a query of {}", ctx)));
            }
            if qc.query.is_empty() {
                return Err(invalid(format!("missing SQL for query {:?} of {}", qc.query_name, ctx)));
            }
            if !query_names.insert(qc.query_name.as_str()) {
                return Err(invalid(format!("duplicate query name {:?} in {}", qc.query_name, ctx)));
            }
        }

        let mut metric_names = HashSet::new();
        for mc in &self.metrics {
            mc.validate(&ctx)?;
            if !metric_names.insert(mc.metric_name.as_str()) {
                return Err(invalid(format!("duplicate metric name {:?} in {}", mc.metric_name, ctx)));
            }
            if let Some(query_ref) = &mc.query_ref {
                if self.query(query_ref).is_none() {
                    return Err(invalid(format!(
                        "unresolved query_ref {:?} in metric {:?} of {}",
                        query_ref, mc.metric_name, ctx
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The sample kind of a metric family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
}

/// A metric family, the SQL that populates it and the mapping of result
/// columns to labels and values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricConfig {
    pub metric_name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub help: String,
    /// Result columns exposed as labels, in declared order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub key_labels: Vec<String>,
    /// With multiple value columns, the label that carries the column name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_label: Option<String>,
    /// Result columns exposed as sample values, in declared order.
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_ref: Option<String>,
}

impl MetricConfig {
    fn validate(&self, owner: &str) -> Result<(), ConfigError> {
        if self.metric_name.is_empty() {
            return Err(invalid(format!("missing name for a metric of {}", owner)));
        }
        let ctx = format!("metric {:?} of {}", self.metric_name, owner);

        if !METRIC_NAME_RE.is_match(&self.metric_name) {
            return Err(invalid(format!("invalid metric name {:?} in {}", self.metric_name, owner)));
        }
        if self.help.is_empty() {
            return Err(invalid(format!("missing help for {}", ctx)));
        }
        if self.query.is_some() == self.query_ref.is_some() {
            return Err(invalid(format!(
                "exactly one of query and query_ref must be specified for {}",
                ctx
            )));
        }
        if self.values.is_empty() {
            return Err(invalid(format!("no values defined for {}", ctx)));
        }
        if self.values.len() > 1 && self.value_label.is_none() {
            return Err(invalid(format!("value_label must be defined for multi-value {}", ctx)));
        }

        check_labels(self.key_labels.iter().chain(self.value_label.iter()), &ctx)?;
        for (i, label) in self.key_labels.iter().enumerate() {
            if self.key_labels[i + 1..].contains(label) {
                return Err(invalid(format!("duplicate key label {:?} in {}", label, ctx)));
            }
            if self.value_label.as_deref() == Some(label.as_str()) {
                return Err(invalid(format!(
                    "label {:?} defined in both key_labels and value_label of {}",
                    label, ctx
                )));
            }
        }
        Ok(())
    }
}

/// A named query, referenced by one or more metrics via `query_ref`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryConfig {
    pub query_name: String,
    pub query: String,
}

/// The shape of files referenced by `collector_files`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CollectorFileConfig {
    #[serde(default)]
    collectors: Vec<CollectorConfig>,
    #[serde(default)]
    queries: Vec<QueryConfig>,
}

fn check_labels<'a>(
    labels: impl Iterator<Item = &'a String>,
    owner: &str,
) -> Result<(), ConfigError> {
    for label in labels {
        if label.is_empty() {
            return Err(invalid(format!("empty label defined in {}", owner)));
        }
        if RESERVED_LABELS.contains(&label.as_str()) {
            return Err(invalid(format!("reserved label {:?} redefined in {}", label, owner)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        r#"
global:
  scrape_timeout_offset: 250ms
  min_interval: 0s
  max_connections: 2
jobs:
  - job_name: pricing
    collectors: [stats]
    static_configs:
      - targets:
          db1: "mock://primary"
        labels:
          env: prod
collectors:
  - collector_name: stats
    metrics:
      - metric_name: pricing_update_time
        type: gauge
        help: Last update time.
        key_labels: [Market]
        values: [LastUpdateTime]
        query: "SELECT Market, LastUpdateTime FROM updates"
"#
    }

    #[test]
    fn parses_a_minimal_config() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        assert_eq!(config.global.scrape_timeout_offset, Duration::from_millis(250));
        assert_eq!(config.global.max_connections, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.global.max_idle_connections, 3);
        assert_eq!(config.global.scrape_timeout, Duration::from_secs(10));
        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.collectors[0].metrics[0].metric_type, MetricType::Gauge);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        let rendered = config.to_yaml().unwrap();
        assert_eq!(Config::from_yaml(&rendered).unwrap(), config);
    }

    #[test]
    fn masks_data_source_names() {
        let config = Config::from_yaml(minimal_yaml()).unwrap();
        let masked = config.to_masked_yaml().unwrap();
        assert!(!masked.contains("mock://primary"));
        assert!(masked.contains(DSN_MASK));
    }

    #[test]
    fn rejects_unknown_fields() {
        let bad = "bogus_section: {}\n".to_string() + minimal_yaml();
        assert!(matches!(Config::from_yaml(&bad), Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn rejects_reserved_labels() {
        let yaml = minimal_yaml().replace("key_labels: [Market]", "key_labels: [job]");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("reserved label"), "{}", err);
    }

    #[test]
    fn rejects_static_label_collisions() {
        let yaml = minimal_yaml().replace("env: prod", "Market: emea");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("label collision"), "{}", err);
    }

    #[test]
    fn rejects_invalid_metric_names() {
        let yaml = minimal_yaml().replace("pricing_update_time", "pricing-update-time");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid metric name"), "{}", err);
    }

    #[test]
    fn rejects_query_and_query_ref_together() {
        let yaml = minimal_yaml().replace(
            "query: \"SELECT Market, LastUpdateTime FROM updates\"",
            "query: \"SELECT 1\"\n        query_ref: q1",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("exactly one of query and query_ref"), "{}", err);
    }

    #[test]
    fn rejects_unresolved_query_ref() {
        let yaml = minimal_yaml().replace(
            "query: \"SELECT Market, LastUpdateTime FROM updates\"",
            "query_ref: missing",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unresolved query_ref"), "{}", err);
    }

    #[test]
    fn rejects_multi_value_without_value_label() {
        let yaml = minimal_yaml().replace("values: [LastUpdateTime]", "values: [a, b]");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("value_label"), "{}", err);
    }

    #[test]
    fn rejects_unknown_collector_reference() {
        let yaml = minimal_yaml().replace("collectors: [stats]", "collectors: [nope]");
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("unknown collector"), "{}", err);
    }

    #[test]
    fn rejects_target_and_jobs_together() {
        let yaml = minimal_yaml().to_string()
            + "target:\n  data_source_name: \"mock://x\"\n  collectors: [stats]\n";
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("not both"), "{}", err);
    }

    #[test]
    fn rejects_duplicate_dsns_in_a_static_config() {
        let yaml = minimal_yaml().replace(
            "db1: \"mock://primary\"",
            "db1: \"mock://primary\"\n          db2: \"mock://primary\"",
        );
        let err = Config::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate data source name"), "{}", err);
    }

    #[test]
    fn loads_collector_files_relative_to_the_config_file() {
        let dir = std::env::temp_dir().join(format!("sql-exporter-config-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(
            dir.join("sql_exporter.yml"),
            r#"
jobs:
  - job_name: j
    collectors: [stats]
    static_configs:
      - targets:
          db1: "mock://db"
collector_files:
  - "*.collector.yml"
"#,
        )
        .unwrap();
        fs::write(
            dir.join("stats.collector.yml"),
            r#"
collectors:
  - collector_name: stats
    metrics:
      - metric_name: m
        type: gauge
        help: M.
        values: [v]
        query_ref: q
queries:
  - query_name: q
    query: "SELECT v FROM t"
"#,
        )
        .unwrap();

        let config = Config::load(dir.join("sql_exporter.yml")).unwrap();
        let stats = config.collector("stats").expect("collector not merged");
        // The file-level named query is visible to the collector's metrics.
        assert_eq!(stats.query("q").unwrap().query, "SELECT v FROM t");

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn accepts_single_target_mode() {
        let yaml = r#"
target:
  data_source_name: "mock://solo"
  collectors: [stats]
collectors:
  - collector_name: stats
    metrics:
      - metric_name: one
        type: counter
        help: One.
        values: [v]
        query: "SELECT 1 AS v"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.target.is_some());
        assert!(config.jobs.is_empty());
    }
}
