use crate::collectors::usage::UsageRecorder;
use crate::collectors::{blocking_collect, CollectFuture, Collector};
use crate::error::CollectorError;
use crate::model::{MetricKind, MetricSample};
use std::sync::Arc;
use std::time::Instant;

/// Metrics about the running process and the requests it served
pub struct ApplicationCollector {
    usage: Arc<UsageRecorder>,
    started: Instant,
}

impl ApplicationCollector {
    /// # Arguments
    ///
    /// * `usage` - Recorder that request handlers report latency to
    pub fn new(usage: Arc<UsageRecorder>) -> Self {
        Self {
            usage,
            started: Instant::now(),
        }
    }

    /// Reads /proc on Linux, so it runs on the blocking pool
    fn sample_now(usage: &UsageRecorder, started: Instant) -> Result<Vec<MetricSample>, CollectorError> {
        let kind = MetricKind::Application;
        let window = usage.take_request_window();

        let mut samples = vec![
            MetricSample::new(
                kind,
                "process_uptime_seconds",
                started.elapsed().as_secs_f64(),
                "s",
            ),
            MetricSample::new(kind, "request_count", window.count as f64, ""),
            MetricSample::new(kind, "request_latency_avg_ms", window.avg_latency_ms, "ms"),
        ];

        if let Some(threads) = process_thread_count() {
            samples.push(MetricSample::new(kind, "process_threads", threads as f64, ""));
        }
        if let Some(rss) = process_memory_bytes() {
            samples.push(MetricSample::new(kind, "process_memory_bytes", rss as f64, "bytes"));
        }

        Ok(samples)
    }
}

impl Collector for ApplicationCollector {
    fn name(&self) -> &str {
        "application"
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Application
    }

    fn collect(&self) -> CollectFuture<'_> {
        let usage = Arc::clone(&self.usage);
        let started = self.started;
        blocking_collect(move || Self::sample_now(&usage, started))
    }
}

/// Read a `Key:   value ...` line from /proc/self/status
#[cfg(target_os = "linux")]
fn proc_status_field(key: &str) -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse::<u64>().ok())
}

fn process_thread_count() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        proc_status_field("Threads:")
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Resident set size of this process in bytes
fn process_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        if let Some(kb) = proc_status_field("VmRSS:") {
            return Some(kb * 1024);
        }
    }

    #[cfg(unix)]
    {
        // Peak RSS, used only when the current value is unavailable
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, &mut usage) } == 0 {
            let max_rss = u64::try_from(usage.ru_maxrss).ok()?;
            // ru_maxrss is in KB on Linux, bytes on macOS
            #[cfg(target_os = "macos")]
            return Some(max_rss);
            #[cfg(not(target_os = "macos"))]
            return Some(max_rss * 1024);
        }
    }

    None
}
