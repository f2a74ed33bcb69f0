pub mod collector;
pub mod config;
pub mod drivers;
pub mod error;
pub mod exporter;
pub mod job;
pub mod metrics;
pub mod query;
pub mod server;
pub mod target;

use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, IntCounterVec};

lazy_static! {
    pub static ref SCRAPE_SUCCESSES: IntCounterVec = register_int_counter_vec!(
        "sql_exporter_scrape_successes_total",
        "Number of target scrapes that found the target up",
        &["job", "instance"]
    )
    .unwrap();
    pub static ref SCRAPE_FAILURES: IntCounterVec = register_int_counter_vec!(
        "sql_exporter_scrape_failures_total",
        "Number of target scrapes that found the target down",
        &["job", "instance"]
    )
    .unwrap();
}

pub fn init_metrics() {
    // needs to happen before the first scrape, so lazy registration doesn't
    // run in the middle of a gather
    SCRAPE_SUCCESSES.reset();
    SCRAPE_FAILURES.reset();
}

pub use config::Config;
pub use error::{Error, ErrorKind};
pub use exporter::Exporter;
