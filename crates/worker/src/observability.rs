use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const DELIVERIES_TOTAL: &str = "parley_worker_deliveries_total";
const INDEX_FLUSHES_TOTAL: &str = "parley_worker_index_flushes_total";
const INDEX_FLUSH_SIZE: &str = "parley_worker_index_flush_size";
const RECONCILE_RUNS_TOTAL: &str = "parley_worker_reconcile_runs_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn register_delivery(queue: &str, disposition: &str) {
    counter!(
        DELIVERIES_TOTAL,
        "queue" => queue.to_string(),
        "disposition" => disposition.to_string()
    )
    .increment(1);
}

pub fn register_index_flush(result: &str, size: usize) {
    counter!(INDEX_FLUSHES_TOTAL, "result" => result.to_string()).increment(1);
    histogram!(INDEX_FLUSH_SIZE).record(size as f64);
}

pub fn register_reconcile_run(result: &str) {
    counter!(RECONCILE_RUNS_TOTAL, "result" => result.to_string()).increment(1);
}
