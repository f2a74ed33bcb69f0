//! HTTP handlers: the scrape endpoint, the landing page, the masked config
//! viewer and the health check.

use actix_web::{get, web, HttpRequest, HttpResponse};
use log::{error, warn};
use prometheus::proto;
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::exporter::Exporter;

/// Prometheus announces its own timeout through this header.
pub const SCRAPE_TIMEOUT_HEADER: &str = "X-Prometheus-Scrape-Timeout-Seconds";

/// Stand-in deadline when no timeout applies at all.
const NO_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

pub struct AppState {
    pub exporter: Arc<Exporter>,
    pub metrics_path: String,
    pub masked_config: String,
}

/// Serves one scrape. Returns 500 only when not a single target could be
/// scraped; a scrape with at least one live target returns 200 with `up=0`
/// for the failed ones.
pub async fn metrics(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let header_timeout = req
        .headers()
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|text| match text.parse::<f64>() {
            Ok(seconds) if seconds > 0.0 => Some(Duration::from_secs_f64(seconds)),
            _ => {
                error!("failed to parse timeout {:?} from Prometheus header", text);
                None
            }
        });

    let timeout = state.exporter.scrape_timeout(header_timeout);
    let deadline = Instant::now() + timeout.unwrap_or(NO_TIMEOUT);

    let (families, errors) = state.exporter.gather(deadline).await;
    for e in &errors {
        warn!("error gathering metrics: {}", e);
    }

    if !errors.is_empty() && !any_target_up(&families) {
        let details: Vec<String> = errors.iter().map(ToString::to_string).collect();
        return HttpResponse::InternalServerError()
            .body(format!("no targets scraped successfully\n{}", details.join("\n")));
    }

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return HttpResponse::InternalServerError().body(format!("error encoding metrics: {}", e));
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

fn any_target_up(families: &[proto::MetricFamily]) -> bool {
    families
        .iter()
        .find(|f| f.get_name() == "up")
        .map(|f| f.get_metric().iter().any(|m| m.get_gauge().get_value() == 1.0))
        .unwrap_or(false)
}

#[get("/")]
pub async fn home(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(format!(
            r#"<html>
<head><title>SQL Exporter</title></head>
<body>
<h1>SQL Exporter</h1>
<p><a href="{path}">Metrics</a></p>
<p><a href="/config">Configuration</a></p>
<p><a href="/sql_exporter_metrics">Exporter process metrics</a></p>
</body>
</html>
"#,
            path = state.metrics_path
        ))
}

#[get("/config")]
pub async fn config_page(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(state.masked_config.clone())
}

#[get("/healthz")]
pub async fn healthz() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}
