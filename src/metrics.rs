//! Metrics collection for the remote bootstrap client.
//!
//! Counters and histograms are registered on a crate-level Prometheus
//! registry; the embedding server decides how to expose it.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

use crate::pb;

lazy_static! {
    /// Registry holding all remote bootstrap metrics.
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter of bootstrap sessions begun against a remote peer.
    pub static ref SESSIONS_STARTED_COUNTER: Counter = Counter::new(
        "remote_bootstrap_sessions_started",
        "remote bootstrap sessions started"
    )
    .unwrap();

    /// Counter of bytes fetched from the remote, by artifact type.
    pub static ref BYTES_FETCHED_COUNTER: CounterVec = CounterVec::new(
        Opts::new(
            "remote_bootstrap_bytes_fetched",
            "bytes fetched from the remote peer"
        ),
        &["data_type"]
    )
    .unwrap();

    /// Histogram of FetchData round trip times, by artifact type.
    pub static ref FETCH_COST_HISTOGRAM: HistogramVec = HistogramVec::new(
        HistogramOpts::new("remote_bootstrap_fetch_cost", "FetchData round trip cost"),
        &["data_type"]
    )
    .unwrap();
}

/// Registers all metric collectors with the crate registry.
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(SESSIONS_STARTED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(BYTES_FETCHED_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(FETCH_COST_HISTOGRAM.clone()));
}

pub(crate) fn data_type_label(data_id: &pb::DataId) -> &'static str {
    match data_id.kind() {
        pb::DataType::Block => "block",
        pb::DataType::LogSegment => "log_segment",
        pb::DataType::Unknown => "unknown",
    }
}
