//! Metrics export for batch runs.
//!
//! A run is a short-lived process, so instead of serving `/metrics` the binary writes the
//! text exposition format to a file picked up by node-exporter's textfile collector.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{Encoder, Registry, TextEncoder};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    for metric in pathrow_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
    registry
});

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics are not valid UTF-8")
}

/// Write metrics to `path` atomically (temp file + rename), so the collector never reads a
/// half-written file.
pub fn write_textfile(path: &Path) -> Result<()> {
    let body = encode_metrics()?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, body).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to move metrics to {:?}", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_textfile() {
        pathrow_core::metrics::RUNS_TOTAL
            .with_label_values(&["completed"])
            .inc();

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pathrow.prom");
        write_textfile(&path).unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.contains("pathrow_runs_total"));
        assert!(!dir.path().join("pathrow.prom.tmp").exists());
    }
}
