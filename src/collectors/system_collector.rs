//! Host resource metrics
//!
//! CPU usage is computed by sysinfo from the difference between two
//! refreshes, so the first collection after start may report 0%.

use crate::collectors::{blocking_collect, CollectFuture, Collector};
use crate::error::CollectorError;
use crate::model::{MetricKind, MetricSample};
use log::debug;
use std::sync::{Arc, Mutex};
use sysinfo::{Disks, Networks, System};

struct Sensors {
    system: System,
    disks: Disks,
    networks: Networks,
}

/// Samples CPU, memory, disk, network and load average
pub struct SystemCollector {
    /// Shared with the blocking sampling task
    sensors: Arc<Mutex<Sensors>>,
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();

        Self {
            sensors: Arc::new(Mutex::new(Sensors {
                system,
                disks: Disks::new_with_refreshed_list(),
                networks: Networks::new_with_refreshed_list(),
            })),
        }
    }

    /// Refresh every sensor and read the values; blocks on sysinfo I/O
    fn sample_now(sensors: &Mutex<Sensors>) -> Result<Vec<MetricSample>, CollectorError> {
        let mut sensors = sensors.lock().unwrap_or_else(|p| p.into_inner());
        let Sensors {
            system,
            disks,
            networks,
        } = &mut *sensors;

        system.refresh_cpu();
        system.refresh_memory();
        // Mounts come and go, so the list is rebuilt rather than refreshed
        disks.refresh_list();
        networks.refresh();

        let total_memory = system.total_memory();
        if total_memory == 0 {
            return Err(CollectorError::Unavailable(
                "total memory reported as 0".to_string(),
            ));
        }
        let used_memory = system.used_memory();

        let disk_usage = disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space());
                used as f64 / d.total_space() as f64 * 100.0
            })
            .fold(None, |max: Option<f64>, usage| {
                Some(max.map_or(usage, |m| m.max(usage)))
            });

        let (rx, tx) = networks
            .iter()
            .fold((0u64, 0u64), |(rx, tx), (_name, data)| {
                (
                    rx.saturating_add(data.total_received()),
                    tx.saturating_add(data.total_transmitted()),
                )
            });

        let kind = MetricKind::System;
        let mut samples = vec![
            MetricSample::new(
                kind,
                "cpu_usage",
                f64::from(system.global_cpu_info().cpu_usage()),
                "%",
            ),
            MetricSample::new(
                kind,
                "memory_usage",
                used_memory as f64 / total_memory as f64 * 100.0,
                "%",
            ),
            MetricSample::new(kind, "memory_used_bytes", used_memory as f64, "bytes"),
            MetricSample::new(kind, "network_rx_bytes", rx as f64, "bytes"),
            MetricSample::new(kind, "network_tx_bytes", tx as f64, "bytes"),
            MetricSample::new(kind, "load_average_1m", System::load_average().one, ""),
        ];
        match disk_usage {
            Some(usage) => samples.push(MetricSample::new(kind, "disk_usage", usage, "%")),
            None => debug!("No mounted disks reported; skipping disk_usage"),
        }

        Ok(samples)
    }
}

impl Collector for SystemCollector {
    fn name(&self) -> &str {
        "system"
    }

    fn kind(&self) -> MetricKind {
        MetricKind::System
    }

    fn collect(&self) -> CollectFuture<'_> {
        let sensors = Arc::clone(&self.sensors);
        blocking_collect(move || Self::sample_now(&sensors))
    }
}
