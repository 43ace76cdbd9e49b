use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub const VERSION: &str = env!("GIT_TAG");

/// What happened to the samples handed to the ingestion pipeline.
#[derive(Debug, Default)]
pub struct SampleCounters {
    pub recorded: AtomicU64,
    pub ignored: AtomicU64,
    pub failed: AtomicU64,
}

impl SampleCounters {
    pub fn recorded(&self) {
        self.recorded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ignored(&self) {
        self.ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Generates metrics in Prometheus text format.
pub fn generate_metrics(
    counters: &SampleCounters,
    open_streams: u64,
    start_time: &Instant,
) -> String {
    let mut lines = Vec::new();

    // --- Uptime ---
    lines.push("# HELP uptime_seconds Server process uptime in seconds.".to_string());
    lines.push("# TYPE uptime_seconds gauge".to_string());
    lines.push(format!(
        "uptime_seconds {}",
        start_time.elapsed().as_secs_f64()
    ));

    // --- Live streams ---
    lines.push(
        "# HELP convoytracker_open_live_streams Number of open live position streams.".to_string(),
    );
    lines.push("# TYPE convoytracker_open_live_streams gauge".to_string());
    lines.push(format!("convoytracker_open_live_streams {open_streams}"));

    // --- Samples ---
    lines.push(
        "# HELP convoytracker_samples_total Location samples by ingestion outcome.".to_string(),
    );
    lines.push("# TYPE convoytracker_samples_total counter".to_string());
    for (outcome, counter) in [
        ("recorded", &counters.recorded),
        ("ignored", &counters.ignored),
        ("failed", &counters.failed),
    ] {
        lines.push(format!(
            "convoytracker_samples_total{{outcome=\"{outcome}\"}} {}",
            counter.load(Ordering::Relaxed)
        ));
    }

    lines.push(
        "# HELP convoytracker_info Build information about the convoytracker server.".to_string(),
    );
    lines.push("# TYPE convoytracker_info gauge".to_string());
    lines.push(format!("convoytracker_info{{version=\"{VERSION}\"}} 1"));

    lines.join("\n") + "\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_report_sample_outcomes() {
        let counters = SampleCounters::default();
        counters.recorded();
        counters.recorded();
        counters.failed();
        let text = generate_metrics(&counters, 3, &Instant::now());
        assert!(text.contains("convoytracker_samples_total{outcome=\"recorded\"} 2"));
        assert!(text.contains("convoytracker_samples_total{outcome=\"ignored\"} 0"));
        assert!(text.contains("convoytracker_samples_total{outcome=\"failed\"} 1"));
        assert!(text.contains("convoytracker_open_live_streams 3"));
        assert!(text.ends_with('\n'));
    }
}
