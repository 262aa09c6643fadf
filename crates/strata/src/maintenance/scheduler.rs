//! Background worker driving maintenance and sync on timers
//!
//! `run_maintenance` itself stays a plain async call; this module only decides
//! when to call it. After a transient failure the next attempt is pulled
//! forward with exponential backoff, capped at the regular interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

use super::Interrupt;
use crate::service::TieringService;

pub struct MaintenanceScheduler {
    service: Arc<TieringService>,
}

/// Running scheduler tasks
pub struct SchedulerHandle {
    interrupt: Interrupt,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn task_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop the timers, interrupt a running cycle between tier batches, and
    /// wait for the tasks to exit
    pub async fn shutdown(self) {
        info!("Stopping maintenance scheduler");
        self.interrupt.trigger();
        let _ = self.shutdown.send(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Scheduler task ended abnormally: {e}");
            }
        }
    }
}

impl MaintenanceScheduler {
    pub fn new(service: Arc<TieringService>) -> Self {
        Self { service }
    }

    /// Spawn the enabled loops
    pub fn start(self) -> SchedulerHandle {
        let system = self.service.config().system();
        let interrupt = Interrupt::new();
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        if system.auto_maintenance_enabled {
            let service = self.service.clone();
            let task_interrupt = interrupt.clone();
            handles.push(spawn_loop(
                "maintenance",
                Duration::from_secs(system.maintenance_interval_secs),
                Duration::from_secs(system.retry_base_secs),
                shutdown.subscribe(),
                move || {
                    let service = service.clone();
                    let interrupt = task_interrupt.clone();
                    async move {
                        let report = service.run_maintenance_with(&interrupt).await;
                        if report.has_failures() {
                            error!(run_id = %report.run_id, "Maintenance cycle had failing stages");
                        }
                        report.has_transient_failures()
                    }
                },
            ));
        }

        if system.auto_sync_enabled {
            let service = self.service.clone();
            let task_interrupt = interrupt.clone();
            handles.push(spawn_loop(
                "sync",
                Duration::from_secs(system.sync_interval_secs),
                Duration::from_secs(system.retry_base_secs),
                shutdown.subscribe(),
                move || {
                    let service = service.clone();
                    let interrupt = task_interrupt.clone();
                    async move {
                        match service.run_sync(&interrupt).await {
                            Ok(_) => false,
                            Err(e) => {
                                error!("Synchronization failed: {e}");
                                e.is_transient()
                            }
                        }
                    }
                },
            ));
        }

        info!("Started {} scheduler tasks", handles.len());
        SchedulerHandle {
            interrupt,
            shutdown,
            handles,
        }
    }
}

/// Run `job` every `period` until shutdown. The job returns true when it
/// failed transiently and should be retried early.
fn spawn_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    retry_base: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    tokio::spawn(async move {
        info!("{name} loop started (interval: {:?})", period);

        let mut timer = time::interval(period);
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        let mut failures: u32 = 0;
        let mut retry_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = timer.tick() => {}
                _ = wait_until(retry_at) => {}
            }
            if *shutdown.borrow() {
                break;
            }

            retry_at = None;
            if job().await {
                failures = failures.saturating_add(1);
                let delay = backoff_delay(retry_base, failures, period);
                warn!("{name} failed transiently ({failures} in a row), retrying in {delay:?}");
                retry_at = Some(Instant::now() + delay);
            } else {
                failures = 0;
            }
        }

        info!("{name} loop stopped");
    })
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// `base * 2^(failures - 1)`, never longer than `cap`
pub fn backoff_delay(base: Duration, failures: u32, cap: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(cap)
}
