//! Engine lifecycle: connectivity transitions, background triggers, shutdown.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::SyncResult;
use crate::queue::DrainReport;

use super::{ConnectivityState, EngineState, SyncEngine, SyncEvent};

impl SyncEngine {
    /// Report a connectivity change.
    ///
    /// On the offline → online edge this drains the queue and returns the
    /// report (or a skipped report if a drain was already running). Going
    /// offline pauses a running drain at its next item; nothing is aborted.
    #[instrument(skip(self))]
    pub async fn set_connectivity(&self, state: ConnectivityState) -> SyncResult<Option<DrainReport>> {
        let previous = self.connectivity.send_replace(state);
        if previous == state {
            return Ok(None);
        }

        crate::metrics::set_online(state.is_online());
        self.emit(SyncEvent::ConnectivityChanged(state));

        let queued = self.queue.size().await;
        match state {
            ConnectivityState::Offline => {
                info!(queued, "Connectivity lost, queueing writes");
                self.set_state(EngineState::Offline);
                Ok(None)
            }
            ConnectivityState::Online => {
                info!(queued, "Connectivity restored");
                self.set_state(EngineState::Idle);
                self.trigger_drain("reconnect").await.map(Some)
            }
        }
    }

    /// Follow a host connectivity notifier.
    ///
    /// The current value is applied immediately, then every change. The task
    /// ends when the sender is dropped or the engine goes away.
    pub fn watch_connectivity(&self, mut online_rx: watch::Receiver<bool>) {
        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let online = *online_rx.borrow_and_update();
                let Some(engine) = weak.upgrade() else { break };
                if let Err(e) = engine.set_connectivity(ConnectivityState::from(online)).await {
                    warn!(error = %e, "Drain after connectivity change failed");
                }
                drop(engine);

                if online_rx.changed().await.is_err() {
                    debug!("Connectivity notifier closed");
                    break;
                }
            }
        });
        self.tasks.lock().push(handle);
    }

    /// Drain on a fixed interval while online.
    ///
    /// Returns false if `sync_interval_ms` is 0.
    pub fn start_periodic_sync(&self) -> bool {
        let interval_ms = self.config.read().sync_interval_ms;
        if interval_ms == 0 {
            return false;
        }

        let weak = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else { break };
                if !engine.is_online() {
                    continue;
                }
                if let Err(e) = engine.trigger_drain("periodic").await {
                    warn!(error = %e, "Periodic drain failed");
                }
            }
        });
        self.tasks.lock().push(handle);
        info!(interval_ms, "Periodic sync started");
        true
    }

    /// Stop background tasks and wait for a running drain to finish.
    ///
    /// Queued items stay durable and are replayed by the next engine opened
    /// on the same store.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }

        let _guard = self.drain_lock.lock().await;
        self.connectivity.send_replace(ConnectivityState::Offline);
        self.set_state(EngineState::Offline);
        crate::metrics::set_online(false);
        let queued = self.queue.size().await;
        info!(queued, "Sync engine shut down");
    }
}
