//! Store metrics.

use metrics::{counter, histogram};

/// Metric name constants for consistency.
pub mod names {
    /// Store commands by operation and outcome.
    pub const COMMANDS_TOTAL: &str = "reelsmith_store_commands_total";

    /// Command latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "reelsmith_store_latency_seconds";
}

/// Record one store command.
pub fn record_command(operation: &str, success: bool, latency_secs: f64) {
    counter!(
        names::COMMANDS_TOTAL,
        "operation" => operation.to_string(),
        "status" => if success { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        assert!(names::COMMANDS_TOTAL.starts_with("reelsmith_store"));
        assert!(names::LATENCY_SECONDS.contains("latency"));
    }

    #[test]
    fn test_record_without_recorder_is_noop() {
        record_command("get", true, 0.001);
        record_command("get", false, 0.002);
    }
}
