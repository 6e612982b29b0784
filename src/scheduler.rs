//! Periodic collection, evaluation and cleanup loops

use crate::engine::MonitoringEngine;
use log::{debug, error, info};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type TickFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Drives the engine's three loops on the tokio runtime
///
/// One shutdown signal stops every loop. A tick that is already running
/// finishes before `stop` returns.
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Spawn the loops; must be called from within a tokio runtime
    pub fn start(engine: &Arc<MonitoringEngine>) -> Self {
        let (shutdown, receiver) = watch::channel(false);
        let config = &engine.config().engine;

        let collect_engine = Arc::clone(engine);
        let collection = run_loop(
            "collection",
            config.collection_interval(),
            receiver.clone(),
            move || {
                let engine = Arc::clone(&collect_engine);
                Box::pin(async move {
                    engine.collect_now().await;
                })
            },
        );

        let evaluate_engine = Arc::clone(engine);
        let evaluation = run_loop(
            "evaluation",
            config.evaluation_interval(),
            receiver.clone(),
            move || {
                let engine = Arc::clone(&evaluate_engine);
                Box::pin(async move {
                    let result = tokio::task::spawn_blocking(move || engine.evaluate_now()).await;
                    if let Err(e) = result {
                        error!("Evaluation tick failed: {}", e);
                    }
                })
            },
        );

        let cleanup_engine = Arc::clone(engine);
        let cleanup = run_loop(
            "cleanup",
            config.cleanup_interval(),
            receiver,
            move || {
                let engine = Arc::clone(&cleanup_engine);
                Box::pin(async move {
                    let result = tokio::task::spawn_blocking(move || engine.cleanup_now()).await;
                    if let Err(e) = result {
                        error!("Cleanup tick failed: {}", e);
                    }
                })
            },
        );

        Self {
            shutdown,
            handles: Mutex::new(vec![collection, evaluation, cleanup]),
        }
    }

    /// Signal every loop to stop and wait for them
    pub async fn stop(&self) {
        // Receivers are gone only if every loop already exited
        let _ = self.shutdown.send(true);

        let handles = std::mem::take(&mut *self.handles.lock().unwrap_or_else(|p| p.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Scheduler loop panicked: {}", e);
            }
        }
    }

    /// Whether any loop is still running
    pub fn is_running(&self) -> bool {
        self.handles
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .any(|h| !h.is_finished())
    }
}

fn run_loop<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> TickFuture + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("{} loop started (every {:?})", name, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // The tick runs outside the select so shutdown never cancels it
            debug!("{} tick", name);
            tick().await;
        }

        info!("{} loop stopped", name);
    })
}
