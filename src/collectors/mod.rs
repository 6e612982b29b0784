use crate::error::CollectorError;
use crate::model::{MetricKind, MetricSample};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Host resource collector backed by sysinfo
pub mod system_collector;

/// Process and request metrics for the running application
pub mod app_collector;

/// Business counters fed through the usage recorder
pub mod business_collector;

/// Gauges registered through the custom metric API
pub mod custom_collector;

/// Shared recorder for request latency, users and API calls
pub mod usage;

pub use app_collector::ApplicationCollector;
pub use business_collector::BusinessCollector;
pub use custom_collector::CustomCollector;
pub use system_collector::SystemCollector;
pub use usage::UsageRecorder;

/// Future returned by [`Collector::collect`]
pub type CollectFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<MetricSample>, CollectorError>> + Send + 'a>>;

/// A pluggable source of metric samples
///
/// Invoked at most once per collection tick, possibly concurrently with
/// other collectors. A failing collector returns an error, never a partial
/// sample set. The returned future runs on an async worker and the timeout
/// can only fire while it is pending, so blocking work (file reads,
/// syscalls) belongs in [`blocking_collect`].
pub trait Collector: Send + Sync {
    /// Stable name used in logs and per-collector stats
    fn name(&self) -> &str;

    /// Kind of the samples this collector produces
    fn kind(&self) -> MetricKind;

    /// Produce one round of samples
    fn collect(&self) -> CollectFuture<'_>;

    /// Per-collector timeout overriding the engine default
    fn timeout(&self) -> Option<Duration> {
        None
    }
}

/// Run a blocking sampling function on tokio's blocking pool
///
/// The returned future yields while the work runs, so a timeout around it
/// fires on schedule. A sampler that outlives its timeout keeps its blocking
/// thread until it returns; its result is discarded.
pub fn blocking_collect<F>(sample: F) -> CollectFuture<'static>
where
    F: FnOnce() -> Result<Vec<MetricSample>, CollectorError> + Send + 'static,
{
    Box::pin(async move {
        match tokio::task::spawn_blocking(sample).await {
            Ok(result) => result,
            Err(e) => Err(CollectorError::Failed(format!("sampling task failed: {}", e))),
        }
    })
}

/// Run one collection, turning an elapsed timeout into `CollectorError::Timeout`
pub async fn collect_with_timeout(
    collector: &dyn Collector,
    timeout: Duration,
) -> Result<Vec<MetricSample>, CollectorError> {
    match tokio::time::timeout(timeout, collector.collect()).await {
        Ok(result) => result,
        Err(_) => Err(CollectorError::Timeout {
            collector: collector.name().to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::ScriptedCollector;
    use super::*;

    #[tokio::test]
    async fn test_collect_within_timeout() {
        let collector = ScriptedCollector::new("scripted", MetricKind::Custom, &[("a", 1.0)]);
        let samples = collect_with_timeout(&collector, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "a");
    }

    #[tokio::test]
    async fn test_slow_collector_times_out() {
        let mut collector = ScriptedCollector::new("slow", MetricKind::Custom, &[("a", 1.0)]);
        collector.delay = Some(Duration::from_millis(200));

        let result = collect_with_timeout(&collector, Duration::from_millis(20)).await;
        match result {
            Err(CollectorError::Timeout {
                collector,
                timeout_ms,
            }) => {
                assert_eq!(collector, "slow");
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    /// Sleeps on its sampling thread, like a stalled sysinfo or /proc read
    struct StalledCollector;

    impl Collector for StalledCollector {
        fn name(&self) -> &str {
            "stalled"
        }

        fn kind(&self) -> MetricKind {
            MetricKind::System
        }

        fn collect(&self) -> CollectFuture<'_> {
            blocking_collect(|| {
                std::thread::sleep(Duration::from_millis(500));
                Ok(vec![MetricSample::new(MetricKind::System, "late", 1.0, "")])
            })
        }
    }

    #[tokio::test]
    async fn test_blocking_sampler_honours_timeout() {
        let started = std::time::Instant::now();
        let result = collect_with_timeout(&StalledCollector, Duration::from_millis(20)).await;

        assert!(matches!(result, Err(CollectorError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_panicking_sampler_is_a_failure() {
        let result = blocking_collect(|| panic!("sensor exploded")).await;
        assert!(matches!(result, Err(CollectorError::Failed(_))));
    }
}
