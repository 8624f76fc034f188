//! Prometheus metrics

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Install the Prometheus recorder, serving `/metrics` on `listen` when given
pub fn setup_metrics(listen: Option<SocketAddr>) -> Result<Option<PrometheusHandle>> {
    match listen {
        Some(addr) => {
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("Failed to install Prometheus exporter")?;
            tracing::info!(addr = %addr, "Prometheus metrics exporter listening");
            Ok(None)
        }
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install Prometheus recorder")?;
            tracing::info!("Prometheus metrics recorder installed");
            Ok(Some(handle))
        }
    }
}

/// Record a llama-server spawn
pub fn record_server_start(model: &str, gpu_layers: u32) {
    metrics::counter!("llama_supervisor_server_starts_total",
        "model" => model.to_string()
    )
    .increment(1);
    metrics::gauge!("llama_supervisor_server_gpu_layers").set(f64::from(gpu_layers));
}

pub fn record_server_stop() {
    metrics::counter!("llama_supervisor_server_stops_total").increment(1);
}

/// Record a child exit nobody asked for
pub fn record_server_exit() {
    metrics::counter!("llama_supervisor_server_unexpected_exits_total").increment(1);
}

pub fn record_vram_clear(killed: usize) {
    metrics::counter!("llama_supervisor_vram_clears_total").increment(1);
    metrics::counter!("llama_supervisor_gpu_processes_killed_total").increment(killed as u64);
}

pub fn record_health_check_failure() {
    metrics::counter!("llama_supervisor_health_check_failures_total").increment(1);
}

/// Record a watchdog restart attempt
pub fn record_watchdog_restart(success: bool) {
    metrics::counter!("llama_supervisor_watchdog_restarts_total",
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
}

/// Record a completed role swap
pub fn record_swap(role: &str, success: bool, seconds: f64) {
    metrics::counter!("llama_supervisor_swaps_total",
        "role" => role.to_string(),
        "outcome" => if success { "success" } else { "failure" }
    )
    .increment(1);
    metrics::histogram!("llama_supervisor_swap_duration_seconds",
        "role" => role.to_string()
    )
    .record(seconds);
}

pub fn record_vision_start(cpu_only: bool) {
    metrics::counter!("llama_supervisor_vision_starts_total",
        "mode" => if cpu_only { "cpu" } else { "gpu" }
    )
    .increment(1);
}

pub fn record_vision_idle_stop() {
    metrics::counter!("llama_supervisor_vision_idle_stops_total").increment(1);
}

pub fn update_vision_active_requests(count: usize) {
    metrics::gauge!("llama_supervisor_vision_active_requests").set(count as f64);
}

pub fn record_download_bytes(bytes: u64) {
    metrics::counter!("llama_supervisor_download_bytes_total").increment(bytes);
}

pub fn record_download_completed(resumed: bool) {
    metrics::counter!("llama_supervisor_downloads_total",
        "resumed" => if resumed { "true" } else { "false" }
    )
    .increment(1);
}
