//! End-to-end scrape scenarios, run against the in-memory mock driver.

use actix_web::{test, web, App};
use prometheus::proto;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use sql_exporter::config::Config;
use sql_exporter::drivers::{self, mock::MockDriver, DbValue};
use sql_exporter::error::ErrorKind;
use sql_exporter::exporter::Exporter;
use sql_exporter::server::{self, AppState};

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

fn exporter(yaml: &str) -> Exporter {
    Exporter::new(Config::from_yaml(yaml).unwrap()).unwrap()
}

fn family<'a>(families: &'a [proto::MetricFamily], name: &str) -> Option<&'a proto::MetricFamily> {
    families.iter().find(|f| f.get_name() == name)
}

fn labels(metric: &proto::Metric) -> Vec<(String, String)> {
    metric
        .get_label()
        .iter()
        .map(|l| (l.get_name().to_string(), l.get_value().to_string()))
        .collect()
}

fn up_values(families: &[proto::MetricFamily]) -> Vec<f64> {
    family(families, "up")
        .map(|f| f.get_metric().iter().map(|m| m.get_gauge().get_value()).collect())
        .unwrap_or_default()
}

fn job_yaml(scheme: &str) -> String {
    format!(
        r#"
jobs:
  - job_name: pricing
    collectors: [pricing]
    static_configs:
      - targets:
          db1: "{}://u:p@h:1433"
collectors:
  - collector_name: pricing
    metrics:
      - metric_name: pricing_update_time
        type: gauge
        help: Time of the last update.
        key_labels: [Market]
        values: [LastUpdateTime]
        query: "SELECT Market, LastUpdateTime FROM MarketPrices"
"#,
        scheme
    )
}

#[tokio::test]
async fn single_target_happy_path() {
    drivers::register_driver(
        "e2e-happy",
        Arc::new(MockDriver::new().with_result(
            "SELECT Market, LastUpdateTime FROM MarketPrices",
            &["Market", "LastUpdateTime"],
            vec![
                vec![DbValue::Text("US".into()), DbValue::Float(1_500_000_000.0)],
                vec![DbValue::Text("EU".into()), DbValue::Float(1_500_000_001.0)],
            ],
        )),
    );

    let exporter = exporter(&job_yaml("e2e-happy"));
    let (families, errors) = exporter.gather(deadline()).await;
    assert!(errors.is_empty(), "{:?}", errors);

    let pricing = family(&families, "pricing_update_time").expect("family missing");
    assert_eq!(pricing.get_field_type(), proto::MetricType::GAUGE);
    assert_eq!(pricing.get_metric().len(), 2);
    let us = &pricing.get_metric()[0];
    assert_eq!(us.get_gauge().get_value(), 1_500_000_000.0);
    assert_eq!(
        labels(us),
        vec![
            ("Market".to_string(), "US".to_string()),
            ("instance".to_string(), "db1".to_string()),
            ("job".to_string(), "pricing".to_string()),
        ]
    );
    assert_eq!(pricing.get_metric()[1].get_gauge().get_value(), 1_500_000_001.0);

    assert_eq!(up_values(&families), vec![1.0]);
    let duration = family(&families, "scrape_duration_seconds").expect("duration missing");
    assert_eq!(duration.get_metric().len(), 1);
    assert!(duration.get_metric()[0].get_gauge().get_value() >= 0.0);
}

#[tokio::test]
async fn value_label_expands_value_columns() {
    drivers::register_driver(
        "e2e-mem",
        Arc::new(MockDriver::new().with_result(
            "SELECT region, used, free FROM mem",
            &["region", "used", "free"],
            vec![vec![
                DbValue::Text("us".into()),
                DbValue::Float(10.0),
                DbValue::Float(90.0),
            ]],
        )),
    );

    let exporter = exporter(
        r#"
jobs:
  - job_name: mem
    collectors: [mem]
    static_configs:
      - targets:
          db1: "e2e-mem://h"
collectors:
  - collector_name: mem
    metrics:
      - metric_name: mem_bytes
        type: gauge
        help: Memory.
        key_labels: [region]
        value_label: kind
        values: [used, free]
        query: "SELECT region, used, free FROM mem"
"#,
    );

    let (families, errors) = exporter.gather(deadline()).await;
    assert!(errors.is_empty(), "{:?}", errors);

    let mem = family(&families, "mem_bytes").expect("family missing");
    assert_eq!(mem.get_metric().len(), 2);
    let used = &mem.get_metric()[0];
    assert_eq!(used.get_gauge().get_value(), 10.0);
    assert_eq!(
        labels(used),
        vec![
            ("instance".to_string(), "db1".to_string()),
            ("job".to_string(), "mem".to_string()),
            ("kind".to_string(), "used".to_string()),
            ("region".to_string(), "us".to_string()),
        ]
    );
    let free = &mem.get_metric()[1];
    assert_eq!(free.get_gauge().get_value(), 90.0);
    assert!(labels(free).contains(&("kind".to_string(), "free".to_string())));
}

fn two_target_yaml() -> &'static str {
    r#"
jobs:
  - job_name: mixed
    collectors: [basic]
    static_configs:
      - targets:
          live: "e2e-live://h"
          dead: "e2e-dead://h"
collectors:
  - collector_name: basic
    metrics:
      - metric_name: basic_value
        type: gauge
        help: Basic.
        values: [v]
        query: "SELECT v FROM t"
"#
}

#[tokio::test]
async fn an_unreachable_target_reports_down_without_hiding_the_others() {
    drivers::register_driver(
        "e2e-live",
        Arc::new(MockDriver::new().with_result("SELECT v FROM t", &["v"], vec![vec![DbValue::Float(4.0)]])),
    );
    drivers::register_driver(
        "e2e-dead",
        Arc::new(MockDriver::new().fail_open("no route to host")),
    );

    let exporter = exporter(two_target_yaml());
    let (families, errors) = exporter.gather(deadline()).await;

    let mut ups = up_values(&families);
    ups.sort_by(f64::total_cmp);
    assert_eq!(ups, vec![0.0, 1.0]);
    // Only the live target contributed collector samples.
    assert_eq!(family(&families, "basic_value").unwrap().get_metric().len(), 1);
    assert_eq!(
        family(&families, "scrape_duration_seconds").unwrap().get_metric().len(),
        2
    );
    assert_eq!(errors.len(), 1);
    assert!(errors[0].to_string().contains("no route to host"), "{}", errors[0]);
}

#[actix_web::test]
async fn http_scrape_is_200_with_a_live_target_and_500_without() {
    drivers::register_driver(
        "e2e-live",
        Arc::new(MockDriver::new().with_result("SELECT v FROM t", &["v"], vec![vec![DbValue::Float(4.0)]])),
    );
    drivers::register_driver(
        "e2e-dead",
        Arc::new(MockDriver::new().fail_open("no route to host")),
    );

    let state = web::Data::new(AppState {
        exporter: Arc::new(exporter(two_target_yaml())),
        metrics_path: "/metrics".to_string(),
        masked_config: String::new(),
    });
    let app = test::init_service(
        App::new()
            .app_data(state)
            .route("/metrics", web::get().to(server::metrics)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/metrics")
        .insert_header((server::SCRAPE_TIMEOUT_HEADER, "5"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), 200);
    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("basic_value"), "{}", text);
    assert!(text.contains("up{"), "{}", text);

    // Same job, but every target down: the scrape itself fails.
    let all_dead = two_target_yaml().replace("e2e-live://h", "e2e-dead://h2");
    let state = web::Data::new(AppState {
        exporter: Arc::new(exporter(&all_dead)),
        metrics_path: "/metrics".to_string(),
        masked_config: String::new(),
    });
    let app = test::init_service(
        App::new()
            .app_data(state)
            .route("/metrics", web::get().to(server::metrics)),
    )
    .await;
    let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
    assert_eq!(resp.status(), 500);
}

#[tokio::test]
async fn a_broken_collector_is_isolated_from_healthy_ones() {
    drivers::register_driver(
        "e2e-iso",
        Arc::new(MockDriver::new().with_result(
            "SELECT x FROM healthy_table",
            &["x"],
            vec![vec![DbValue::Float(1.0)]],
        )),
    );

    let exporter = exporter(
        r#"
jobs:
  - job_name: iso
    collectors: [a, b]
    static_configs:
      - targets:
          db1: "e2e-iso://h"
collectors:
  - collector_name: a
    metrics:
      - metric_name: a_metric
        type: gauge
        help: A.
        values: [x]
        query: "SELECT x FROM healthy_table"
  - collector_name: b
    metrics:
      - metric_name: b_metric
        type: gauge
        help: B.
        values: [y]
        query: "SELECT y FROM borken"
"#,
    );

    let (families, errors) = exporter.gather(deadline()).await;

    assert!(family(&families, "a_metric").is_some());
    assert!(family(&families, "b_metric").is_none());
    assert_eq!(up_values(&families), vec![1.0]);
    assert!(
        errors.iter().any(|e| e.context().contains("collector=\"b\"")),
        "{:?}",
        errors
    );
}

#[tokio::test]
async fn a_hanging_open_is_bounded_by_the_deadline() {
    drivers::register_driver("e2e-hang-open", Arc::new(MockDriver::new().hang_open()));

    let exporter = exporter(&job_yaml("e2e-hang-open"));
    let started = Instant::now();
    let (families, errors) = exporter.gather(started + Duration::from_millis(500)).await;

    assert!(started.elapsed() < Duration::from_millis(1500), "{:?}", started.elapsed());
    assert_eq!(up_values(&families), vec![0.0]);
    assert!(errors.iter().any(|e| e.kind() == ErrorKind::Cancelled), "{:?}", errors);
}

#[tokio::test]
async fn a_hanging_query_is_bounded_by_the_deadline() {
    drivers::register_driver("e2e-hang-query", Arc::new(MockDriver::new().hang_query()));

    let exporter = exporter(&job_yaml("e2e-hang-query"));
    let started = Instant::now();
    let (families, errors) = exporter.gather(started + Duration::from_millis(500)).await;

    assert!(started.elapsed() < Duration::from_millis(1500), "{:?}", started.elapsed());
    // Open and ping worked, so the target itself is up; the collector's
    // families are simply absent.
    assert_eq!(up_values(&families), vec![1.0]);
    assert!(family(&families, "pricing_update_time").is_none());
    assert!(errors.iter().any(|e| e.kind() == ErrorKind::Cancelled), "{:?}", errors);
}

#[tokio::test]
async fn families_sharing_a_named_query_run_it_once_per_scrape() {
    let driver = MockDriver::new().with_result(
        "SELECT k, x, y FROM t",
        &["k", "x", "y"],
        vec![vec![DbValue::Text("a".into()), DbValue::Float(1.0), DbValue::Float(2.0)]],
    );
    let prepares = driver.prepares.clone();
    let queries = driver.queries.clone();
    drivers::register_driver("e2e-shared", Arc::new(driver));

    let exporter = exporter(
        r#"
jobs:
  - job_name: shared
    collectors: [shared]
    static_configs:
      - targets:
          db1: "e2e-shared://h"
collectors:
  - collector_name: shared
    metrics:
      - metric_name: m1
        type: gauge
        help: M1.
        key_labels: [k]
        values: [x]
        query_ref: joint
      - metric_name: m2
        type: gauge
        help: M2.
        key_labels: [k]
        values: [y]
        query_ref: joint
    queries:
      - query_name: joint
        query: "SELECT k, x, y FROM t"
"#,
    );

    let (families, errors) = exporter.gather(deadline()).await;
    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(family(&families, "m1").unwrap().get_metric().len(), 1);
    assert_eq!(family(&families, "m2").unwrap().get_metric().len(), 1);
    assert_eq!(family(&families, "m1").unwrap().get_metric()[0].get_gauge().get_value(), 1.0);
    assert_eq!(family(&families, "m2").unwrap().get_metric()[0].get_gauge().get_value(), 2.0);

    // A second scrape re-executes the query but reuses the prepared statement.
    let (_, errors) = exporter.gather(deadline()).await;
    assert!(errors.is_empty(), "{:?}", errors);
    assert_eq!(queries.load(Ordering::SeqCst), 2);
    assert_eq!(prepares.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn a_query_returning_zero_rows_yields_no_samples_but_up_stays_1() {
    drivers::register_driver(
        "e2e-zero",
        Arc::new(MockDriver::new().with_result(
            "SELECT Market, LastUpdateTime FROM MarketPrices",
            &["Market", "LastUpdateTime"],
            vec![],
        )),
    );

    let exporter = exporter(&job_yaml("e2e-zero"));
    let (families, errors) = exporter.gather(deadline()).await;

    assert!(errors.is_empty(), "{:?}", errors);
    assert!(family(&families, "pricing_update_time").is_none());
    assert_eq!(up_values(&families), vec![1.0]);
    assert!(family(&families, "scrape_duration_seconds").is_some());
}
