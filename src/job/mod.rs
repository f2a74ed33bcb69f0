//! Job fan-out: expanding a job config into the targets it scrapes.

use std::sync::Arc;

use crate::config::{CollectorConfig, GlobalConfig, JobConfig};
use crate::error::Error;
use crate::target::Target;

/// A grouping of targets scraped with the same collector set. Every target
/// gets `job` and `instance` const labels plus its static-config labels.
pub struct Job {
    name: String,
    targets: Vec<Target>,
}

impl Job {
    pub fn from_config(
        jc: &JobConfig,
        collectors: &[Arc<CollectorConfig>],
        global: &GlobalConfig,
    ) -> Result<Job, Error> {
        let mut targets = Vec::new();
        for sc in &jc.static_configs {
            for (instance, dsn) in &sc.targets {
                targets.push(Target::new(
                    &jc.job_name,
                    instance,
                    dsn,
                    collectors,
                    &sc.labels,
                    global,
                )?);
            }
        }
        Ok(Job {
            name: jc.job_name.clone(),
            targets,
        })
    }

    /// Wraps the single target of a `target:`-mode configuration; such a
    /// target carries no `job`/`instance` labels.
    pub fn single(target: Target) -> Job {
        Job {
            name: String::new(),
            targets: vec![target],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}
