//! Process-wide metrics glue: Prometheus gauges for host resource usage
//! plus the periodic metrics-logging ticker driven by
//! `kv_block_index_config.metrics_logging_interval`.

use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{Encoder, Gauge, TextEncoder};
use sysinfo::{CpuExt, System, SystemExt};

static PROCESS_CPU_PERCENT: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("kvindex_process_cpu_percent", "Process-wide CPU utilization percent")
        .expect("register kvindex_process_cpu_percent")
});

static PROCESS_MEMORY_BYTES: Lazy<Gauge> = Lazy::new(|| {
    prometheus::register_gauge!("kvindex_process_memory_bytes", "Process-wide resident memory, bytes")
        .expect("register kvindex_process_memory_bytes")
});

/// Touches the lazily-registered statics so their `/metrics` lines appear
/// even before the first poll.
pub fn init() {
    let _ = &*PROCESS_CPU_PERCENT;
    let _ = &*PROCESS_MEMORY_BYTES;
}

/// Spawns a task that samples host CPU/memory once a second.
pub fn spawn_process_metrics_polling() {
    tokio::spawn(async move {
        let mut sys = System::new();
        loop {
            sys.refresh_cpu();
            sys.refresh_memory();
            let cpu = sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>()
                / sys.cpus().len().max(1) as f32;
            PROCESS_CPU_PERCENT.set(cpu as f64);
            PROCESS_MEMORY_BYTES.set(sys.used_memory() as f64);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });
}

/// Periodic dump of the Prometheus registry to the `"metrics"` tracing
/// target, gated on `kvBlockIndexConfig.metricsLoggingInterval > 0`.
pub fn spawn_metrics_logger(interval: Duration) {
    if interval.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let families = prometheus::gather();
            let mut buf = Vec::new();
            if TextEncoder::new().encode(&families, &mut buf).is_ok() {
                tracing::info!(target: "metrics", snapshot = %String::from_utf8_lossy(&buf), "metrics snapshot");
            }
        }
    });
}

/// Renders the current registry as Prometheus text exposition, for the
/// `/metrics` HTTP handler.
pub fn render() -> Vec<u8> {
    let families = prometheus::gather();
    let mut buf = Vec::new();
    let _ = TextEncoder::new().encode(&families, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_gauges() {
        init();
        let text = String::from_utf8(render()).unwrap();
        assert!(text.contains("kvindex_process_cpu_percent"));
    }
}
