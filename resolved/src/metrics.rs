//! Prometheus counters for the server binary, scraped over HTTP.
//!
//! This is distinct from [`dns_resolver::metrics::Metrics`], which is
//! a per-query scratch struct folded into these process-wide counters
//! once a response has been sent.

use actix_web::{get, App, HttpResponse, HttpServer};
use lazy_static::lazy_static;
use prometheus::{
    opts, register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec,
    IntCounterVec, TextEncoder,
};
use std::net::SocketAddr;

use dns_resolver::metrics::Metrics;

pub const RESPONSE_TIME_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.0010, 0.0025, 0.0050, 0.0075, 0.0100, 0.0250, 0.0500, 0.0750, 0.1000,
    0.2500, 0.5000, 0.7500, 1.0000,
];

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_requests_total",
            "Total number of DNS requests received, whether valid or invalid."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("dns_responses_total", "Total number of DNS responses sent."),
        &["rcode"]
    )
    .unwrap();
    pub static ref DNS_RESPONSE_TIME_SECONDS: HistogramVec = register_histogram_vec!(
        "dns_response_time_seconds",
        "Response time of DNS requests, whether valid or invalid.",
        &["protocol"],
        RESPONSE_TIME_BUCKETS.to_vec()
    )
    .unwrap();
    pub static ref DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_resolver_authoritative_hit_total",
            "Total number of hits of local authoritative zone data."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESOLVER_NONAUTHORITATIVE_HIT_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_resolver_nonauthoritative_hit_total",
            "Total number of hits of non-authoritative (override) zone data."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESOLVER_CACHE_HIT_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!("dns_resolver_cache_hit_total", "Total number of cache hits."),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESOLVER_CACHE_MISS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_resolver_cache_miss_total",
            "Total number of cache misses."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESOLVER_NXDOMAIN_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_resolver_nxdomain_total",
            "Total number of responses with RCODE NXDOMAIN."
        ),
        &["protocol"]
    )
    .unwrap();
    pub static ref DNS_RESOLVER_TRUNCATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts!(
            "dns_resolver_truncated_total",
            "Total number of responses which had to be truncated to fit the length cap."
        ),
        &["protocol"]
    )
    .unwrap();
}

/// Fold a single query's [`Metrics`] into the process-wide counters.
pub fn record(protocol: &str, metrics: &Metrics) {
    DNS_RESOLVER_AUTHORITATIVE_HIT_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.authoritative_hits);
    DNS_RESOLVER_NONAUTHORITATIVE_HIT_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.nonauthoritative_hits);
    DNS_RESOLVER_CACHE_HIT_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.cache_hits);
    DNS_RESOLVER_CACHE_MISS_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.cache_misses);
    DNS_RESOLVER_NXDOMAIN_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.nxdomain);
    DNS_RESOLVER_TRUNCATED_TOTAL
        .with_label_values(&[protocol])
        .inc_by(metrics.truncated);
}

#[get("/metrics")]
async fn get_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => HttpResponse::Ok()
            .content_type(encoder.format_type())
            .body(buffer),
        Err(err) => HttpResponse::InternalServerError().body(err.to_string()),
    }
}

/// Serve the `/metrics` endpoint until the process is killed.
pub async fn serve_prometheus_endpoint(address: SocketAddr) -> std::io::Result<()> {
    HttpServer::new(|| App::new().service(get_metrics))
        .bind(address)?
        .run()
        .await
}
