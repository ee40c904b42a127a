use std::sync::OnceLock;

use anyhow::Result;
use metrics::counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

const CHATS_ALLOCATED_TOTAL: &str = "parley_api_chats_allocated_total";
const MESSAGES_ALLOCATED_TOTAL: &str = "parley_api_messages_allocated_total";
const SEARCHES_TOTAL: &str = "parley_api_searches_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

pub fn register_chat_allocated(result: &str) {
    counter!(CHATS_ALLOCATED_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn register_message_allocated(result: &str) {
    counter!(MESSAGES_ALLOCATED_TOTAL, "result" => result.to_string()).increment(1);
}

pub fn register_search(result: &str) {
    counter!(SEARCHES_TOTAL, "result" => result.to_string()).increment(1);
}
