use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static VERDICTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static MUTATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STORE_ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("urlinfo_http_requests_total", "HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create urlinfo_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "urlinfo_http_request_duration_seconds",
                    "HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create urlinfo_http_request_duration_seconds"),
        )
    })
}

fn verdicts_total() -> &'static IntCounterVec {
    VERDICTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("urlinfo_verdicts_total", "URL resolution verdicts."),
                &["outcome"],
            )
            .expect("create urlinfo_verdicts_total"),
        )
    })
}

fn mutations_total() -> &'static IntCounterVec {
    MUTATIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("urlinfo_mutations_total", "Domain record mutations."),
                &["operation", "outcome"],
            )
            .expect("create urlinfo_mutations_total"),
        )
    })
}

fn store_errors_total() -> &'static IntCounterVec {
    STORE_ERRORS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("urlinfo_store_errors_total", "Record store failures."),
                &["kind"],
            )
            .expect("create urlinfo_store_errors_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_verdict(outcome: &str) {
    verdicts_total().with_label_values(&[outcome]).inc();
}

pub fn observe_mutation(operation: &str, outcome: &str) {
    mutations_total()
        .with_label_values(&[operation, outcome])
        .inc();
}

pub fn inc_store_error(kind: &str) {
    store_errors_total().with_label_values(&[kind]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = verdicts_total();
    let _ = mutations_total();
    let _ = store_errors_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
