//! Narrow metrics sink seam. The core never depends on a specific metrics backend;
//! embedders wire in a Prometheus/StatsD/OTel exporter by implementing this trait.

pub trait MetricsSink: Send + Sync {
    fn instance_started(&self, process_name: &str);
    fn instance_stopped(&self, process_name: &str, exit_code: Option<i32>);
    fn instance_restarted(&self, process_name: &str, restart_count: u32);
    fn health_check_result(&self, process_name: &str, healthy: bool);
    fn scheduled_execution(&self, process_name: &str, success: bool, duration_secs: f64);
    fn scale_changed(&self, process_name: &str, target: u32);
}

/// Default sink for embedders that have not wired in a metrics backend.
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn instance_started(&self, _process_name: &str) {}
    fn instance_stopped(&self, _process_name: &str, _exit_code: Option<i32>) {}
    fn instance_restarted(&self, _process_name: &str, _restart_count: u32) {}
    fn health_check_result(&self, _process_name: &str, _healthy: bool) {}
    fn scheduled_execution(&self, _process_name: &str, _success: bool, _duration_secs: f64) {}
    fn scale_changed(&self, _process_name: &str, _target: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_sink_accepts_every_call_without_panicking() {
        let sink = NoopMetricsSink;
        sink.instance_started("worker");
        sink.instance_stopped("worker", Some(0));
        sink.instance_restarted("worker", 1);
        sink.health_check_result("worker", true);
        sink.scheduled_execution("job", true, 1.5);
        sink.scale_changed("worker", 3);
    }
}
