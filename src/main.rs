use actix_web::{web, App, HttpServer};
use actix_web_prom::PrometheusMetricsBuilder;
use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use sql_exporter::config::Config;
use sql_exporter::drivers;
use sql_exporter::exporter::Exporter;
use sql_exporter::server::{self, AppState};

#[derive(Parser)]
#[command(author, version, about = "Prometheus exporter for SQL database metrics")]
struct Opts {
    /// Path to the configuration file (defaults to sql_exporter.yml; the
    /// CONFIG environment variable overrides the default).
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on for web interface and telemetry.
    #[arg(short, long, default_value = "0.0.0.0:9399")]
    address: String,

    /// Path under which to expose the scraped metrics.
    #[arg(short, long, default_value = "/metrics")]
    metrics_path: String,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Opts::parse();
    let config_path = opts
        .config
        .or_else(|| std::env::var("CONFIG").ok())
        .unwrap_or_else(|| "sql_exporter.yml".to_string());

    info!("starting sql-exporter {}", env!("CARGO_PKG_VERSION"));

    sql_exporter::init_metrics();
    drivers::register_builtin_drivers();

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("error loading config from {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    let masked_config = config.to_masked_yaml().unwrap_or_default();
    let exporter = match Exporter::new(config) {
        Ok(exporter) => Arc::new(exporter),
        Err(e) => {
            error!("error creating exporter: {}", e);
            std::process::exit(1);
        }
    };

    // Process metrics stay on their own path so a broken target can never
    // hide the exporter's own health.
    let prometheus = PrometheusMetricsBuilder::new("sql_exporter")
        .registry(prometheus::default_registry().clone())
        .endpoint("/sql_exporter_metrics")
        .build()
        .unwrap();

    let state = web::Data::new(AppState {
        exporter,
        metrics_path: opts.metrics_path.clone(),
        masked_config,
    });
    let metrics_path = opts.metrics_path.clone();

    info!("listening on {}", opts.address);
    HttpServer::new(move || {
        App::new()
            .wrap(prometheus.clone())
            .app_data(state.clone())
            .service(server::healthz)
            .service(server::home)
            .service(server::config_page)
            .route(&metrics_path, web::get().to(server::metrics))
    })
    .bind(opts.address)?
    .run()
    .await
}
