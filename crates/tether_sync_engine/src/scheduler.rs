//! Background sync triggers.
//!
//! Runs a pass whenever connectivity comes back and, if
//! [`SyncConfig::sync_interval`](crate::SyncConfig::sync_interval) is set,
//! periodically while online.

use crate::service::SyncService;
use crate::transport::RemoteTransport;
use std::sync::Arc;
use tether_core::{EntityStore, OperationQueue};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What started a scheduled pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Connectivity went from offline to online.
    Reconnected,
    /// The sync interval elapsed.
    Interval,
}

/// Handle to a running scheduler task.
///
/// Dropping the handle stops the task after the pass in flight.
pub struct SyncScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Spawns the scheduler on the current tokio runtime.
    ///
    /// `online` reports connectivity; the scheduler stops when its sender
    /// is dropped.
    pub fn spawn<S, Q, T>(service: Arc<SyncService<S, Q, T>>, online: watch::Receiver<bool>) -> Self
    where
        S: EntityStore + 'static,
        Q: OperationQueue + 'static,
        T: RemoteTransport + 'static,
    {
        let (shutdown, stop) = watch::channel(false);
        let handle = tokio::spawn(run(service, online, stop));
        Self { shutdown, handle }
    }

    /// Returns true while the task is running.
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the task and waits for it to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sync scheduler task failed");
        }
    }
}

async fn run<S, Q, T>(
    service: Arc<SyncService<S, Q, T>>,
    mut online: watch::Receiver<bool>,
    mut stop: watch::Receiver<bool>,
) where
    S: EntityStore,
    Q: OperationQueue,
    T: RemoteTransport,
{
    let config = service.config().clone();
    let mut ticker = config.sync_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut was_online = *online.borrow_and_update();
    info!(interval = ?config.sync_interval, online = was_online, "sync scheduler started");

    loop {
        let trigger = tokio::select! {
            _ = stop.changed() => break,
            changed = online.changed() => {
                if changed.is_err() {
                    debug!("connectivity source closed");
                    break;
                }
                let now_online = *online.borrow_and_update();
                let reconnected = now_online && !was_online;
                was_online = now_online;
                if !reconnected {
                    continue;
                }
                SyncTrigger::Reconnected
            }
            _ = tick(&mut ticker) => {
                if !was_online {
                    continue;
                }
                SyncTrigger::Interval
            }
        };

        debug!(?trigger, "scheduled sync");
        let report = if config.pull_on_trigger {
            service.sync_cycle().await
        } else {
            service.sync().await
        };
        if let Some(error) = &report.error {
            warn!(?trigger, %error, "scheduled sync finished with errors");
        }
    }

    info!("sync scheduler stopped");
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
