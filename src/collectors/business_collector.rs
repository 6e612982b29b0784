use crate::collectors::usage::UsageRecorder;
use crate::collectors::{CollectFuture, Collector};
use crate::model::{Labels, MetricKind, MetricSample};
use std::sync::Arc;

/// Emits `active_users`, `api_calls_total` and one `api_calls.<endpoint>` per endpoint
pub struct BusinessCollector {
    usage: Arc<UsageRecorder>,
}

impl BusinessCollector {
    pub fn new(usage: Arc<UsageRecorder>) -> Self {
        Self { usage }
    }
}

impl Collector for BusinessCollector {
    fn name(&self) -> &str {
        "business"
    }

    fn kind(&self) -> MetricKind {
        MetricKind::Business
    }

    fn collect(&self) -> CollectFuture<'_> {
        Box::pin(async move {
            let snapshot = self.usage.business_snapshot();
            let kind = MetricKind::Business;

            let mut samples = Vec::with_capacity(snapshot.api_calls.len() + 2);
            samples.push(MetricSample::new(
                kind,
                "active_users",
                snapshot.active_users as f64,
                "users",
            ));
            samples.push(MetricSample::new(
                kind,
                "api_calls_total",
                snapshot.api_calls_total as f64,
                "calls",
            ));
            for (endpoint, calls) in snapshot.api_calls {
                let mut labels = Labels::new();
                labels.insert("endpoint".to_string(), endpoint.clone());
                samples.push(
                    MetricSample::new(kind, format!("api_calls.{}", endpoint), calls as f64, "calls")
                        .with_labels(labels),
                );
            }

            Ok(samples)
        })
    }
}
