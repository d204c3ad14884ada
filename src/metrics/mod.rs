use std::net::SocketAddr;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::info;
use tracing::warn;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::NetworkError;
use crate::Result;

lazy_static! {
    pub static ref APPLIED_ENTRIES: IntCounter =
        IntCounter::new("applied_entries", "Log entries applied to the state machine")
            .expect("metric can not be created");

    pub static ref APPLY_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("apply_latency_seconds", "Time from append to local apply")
            .buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref IS_LEADER: IntGaugeVec = IntGaugeVec::new(
        Opts::new("is_leader", "1 while the node leads the cluster"),
        &["node_id"]
    )
    .expect("metric can not be created");

    pub static ref PROXIED_REQUESTS: IntCounterVec = IntCounterVec::new(
        Opts::new("proxied_requests", "Write requests forwarded to the leader"),
        &["method"]
    )
    .expect("metric can not be created");

    pub static ref PLUGIN_QUERIES: IntCounterVec = IntCounterVec::new(
        Opts::new("plugin_queries", "Queries served over plugin query channels"),
        &["plugin", "command"]
    )
    .expect("metric can not be created");

    pub static ref DROPPED_PLUGIN_EVENTS: IntCounter = IntCounter::new(
        "dropped_plugin_events",
        "Events dropped because the dispatch queue was full"
    )
    .expect("metric can not be created");

    pub static ref PLUGIN_EVENT_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("plugin_event_errors", "Event deliveries a watcher failed"),
        &["plugin"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

/// Registers every collector into `registry`. Calling it twice is harmless.
pub fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(APPLIED_ENTRIES.clone()),
        Box::new(APPLY_LATENCY.clone()),
        Box::new(IS_LEADER.clone()),
        Box::new(PROXIED_REQUESTS.clone()),
        Box::new(PLUGIN_QUERIES.clone()),
        Box::new(DROPPED_PLUGIN_EVENTS.clone()),
        Box::new(PLUGIN_EVENT_ERRORS.clone()),
    ];
    for collector in collectors {
        match registry.register(collector) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => warn!("register collector: {}", e),
        }
    }
}

/// Text exposition of [`REGISTRY`]
pub fn gather_metrics() -> Result<String> {
    register_custom_metrics(&REGISTRY);
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .map_err(|e| crate::Error::Fatal(format!("encode metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| crate::Error::Fatal(format!("metrics are not utf-8: {}", e)))
}

/// Serves `/metrics` until `shutdown_signal` fires.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) -> Result<()> {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics").and_then(metrics_handler);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    let (bound, server) = warp::serve(metrics_route)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_signal.changed().await;
        })
        .map_err(|e| NetworkError::Bind {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
    info!("metrics served at http://{}/metrics", bound);
    server.await;
    Ok(())
}

async fn metrics_handler() -> std::result::Result<impl Reply, Rejection> {
    match gather_metrics() {
        Ok(body) => Ok(warp::reply::with_status(body, warp::http::StatusCode::OK)),
        Err(e) => Ok(warp::reply::with_status(
            e.to_string(),
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
        )),
    }
}
