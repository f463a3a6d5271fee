//! Background automation scheduler.
//!
//! A single driver loop polls the registry every `poll_interval`. Each tick
//! selects the enabled automations that are due, advances their next due
//! time with a compare-and-set *before* dispatching, and runs each one in
//! its own tokio task. An automation whose previous run is still in flight
//! is skipped for that tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::{EngineError, Result};
use crate::registry::AutomationRegistry;

// ---------------------------------------------------------------------------
// In-flight guard
// ---------------------------------------------------------------------------

/// Removes the automation from the in-flight set when the run task ends,
/// including when it panics.
struct InFlight {
    set: Arc<DashSet<String>>,
    id: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    registry: Arc<AutomationRegistry>,
    poll_interval: Duration,
    in_flight: Arc<DashSet<String>>,
    /// Flag to signal the background loop to stop.
    running: Arc<AtomicBool>,
    /// Wakes the loop out of its poll sleep on shutdown.
    shutdown: Arc<Notify>,
    handle: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(registry: Arc<AutomationRegistry>, config: &SchedulerConfig) -> Self {
        Self {
            registry,
            poll_interval: config.poll_interval(),
            in_flight: Arc::new(DashSet::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handle: None,
        }
    }

    /// Run one scheduling pass and return the handles of the runs it
    /// dispatched.
    pub async fn tick(&self) -> Result<Vec<JoinHandle<()>>> {
        dispatch_due(&self.registry, &self.in_flight).await
    }

    /// Reconcile persisted schedules, then start the background loop.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(EngineError::Internal("scheduler is already running".into()));
        }

        self.registry.reconcile().await?;

        self.running.store(true, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        let registry = Arc::clone(&self.registry);
        let in_flight = Arc::clone(&self.in_flight);
        let shutdown = Arc::clone(&self.shutdown);
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            info!(poll_secs = poll_interval.as_secs(), "automation scheduler started");

            while running.load(Ordering::SeqCst) {
                if let Err(e) = dispatch_due(&registry, &in_flight).await {
                    error!(error = %e, "scheduler tick failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.notified() => {}
                }
            }

            info!("automation scheduler stopped");
        });

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the driver loop. Runs already dispatched keep going.
    pub async fn stop(&mut self) {
        if !self.running.load(Ordering::SeqCst) {
            warn!("stop called but scheduler is not running");
            return;
        }

        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();

        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "scheduler task panicked during shutdown");
        }

        info!("automation scheduler shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of automation runs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

async fn dispatch_due(
    registry: &Arc<AutomationRegistry>,
    in_flight: &Arc<DashSet<String>>,
) -> Result<Vec<JoinHandle<()>>> {
    let now = registry.clock().now();
    let mut handles = Vec::new();

    for automation in registry.due(now).await? {
        if in_flight.contains(&automation.id) {
            debug!(automation_id = %automation.id, "previous run still in flight, skipping");
            continue;
        }

        let next = automation.next_due_after(now);
        if !registry
            .advance(&automation.id, automation.next_due_at, next)
            .await?
        {
            debug!(automation_id = %automation.id, "next due time moved concurrently, skipping");
            continue;
        }
        if !in_flight.insert(automation.id.clone()) {
            continue;
        }

        info!(
            automation_id = %automation.id,
            due_at = %automation.next_due_at,
            next_due_at = %next,
            "dispatching automation"
        );

        let guard = InFlight {
            set: Arc::clone(in_flight),
            id: automation.id.clone(),
        };
        let registry = Arc::clone(registry);
        handles.push(tokio::spawn(async move {
            let _guard = guard;
            match registry.execute_and_record(&automation).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(automation_id = %automation.id, "automation removed during its run, outcome not recorded");
                }
                Err(e) => {
                    error!(automation_id = %automation.id, error = %e, "failed to record automation run");
                }
            }
        }));
    }

    Ok(handles)
}
