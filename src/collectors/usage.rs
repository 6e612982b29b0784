//! Usage recorder shared between the engine and the rest of the application
//!
//! Request handlers record latency and API calls here; the application and
//! business collectors read it on every collection tick.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Requests recorded since the previous collection
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RequestWindow {
    pub count: u64,
    /// Zero when no request was recorded
    pub avg_latency_ms: f64,
}

/// Business counters as of now
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BusinessSnapshot {
    pub active_users: u64,
    pub api_calls_total: u64,
    pub api_calls: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct UsageState {
    window_requests: u64,
    window_latency_ms: f64,
    active_users: u64,
    api_calls: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
pub struct UsageRecorder {
    state: Mutex<UsageState>,
}

impl UsageRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one handled request and its latency
    pub fn record_request(&self, latency: Duration) {
        let mut state = self.lock();
        state.window_requests += 1;
        state.window_latency_ms += latency.as_secs_f64() * 1000.0;
    }

    pub fn set_active_users(&self, users: u64) {
        self.lock().active_users = users;
    }

    /// Count one call to `endpoint`
    pub fn record_api_call(&self, endpoint: &str) {
        *self.lock().api_calls.entry(endpoint.to_string()).or_insert(0) += 1;
    }

    /// Requests since the last call, resetting the window
    pub fn take_request_window(&self) -> RequestWindow {
        let mut state = self.lock();
        let count = std::mem::take(&mut state.window_requests);
        let total_ms = std::mem::take(&mut state.window_latency_ms);
        RequestWindow {
            count,
            avg_latency_ms: if count == 0 {
                0.0
            } else {
                total_ms / count as f64
            },
        }
    }

    pub fn business_snapshot(&self) -> BusinessSnapshot {
        let state = self.lock();
        BusinessSnapshot {
            active_users: state.active_users,
            api_calls_total: state.api_calls.values().sum(),
            api_calls: state.api_calls.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, UsageState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
