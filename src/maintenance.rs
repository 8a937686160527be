//! Background expiry sweep and garbage collection

use crate::PairingService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to stop the maintenance loop
pub struct MaintenanceHandle {
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl MaintenanceHandle {
    /// Signal the loop and wait for the pass in flight to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if e.is_panic() {
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }

    /// Check if the loop has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Run [`PairingService::run_maintenance`] every `period` until shut down.
///
/// A failed pass is logged and the loop keeps going.
pub fn spawn_maintenance(service: Arc<PairingService>, period: Duration) -> MaintenanceHandle {
    let (shutdown, mut stop) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = service.run_maintenance() {
                        tracing::error!(error = %err, "Maintenance pass failed");
                    }
                }
                _ = stop.changed() => break,
            }
        }
        tracing::debug!("Maintenance loop stopped");
    });
    MaintenanceHandle { task, shutdown }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ActorId, ManualClock, NoOpDispatcher, NoOpObserver, PairingConfig, RequestStatus, ResourceRef,
    };

    #[tokio::test(start_paused = true)]
    async fn sweeps_until_shut_down() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let service = Arc::new(
            PairingService::in_memory(
                PairingConfig::default(),
                clock.clone(),
                Arc::new(NoOpDispatcher),
                Arc::new(NoOpObserver),
            )
            .unwrap(),
        );
        let alice = ActorId::new("alice");
        let created = service
            .create_request(&alice, &ActorId::new("bob"), ResourceRef::new("chat"), Some(5), None)
            .await
            .unwrap();

        let handle = spawn_maintenance(service.clone(), Duration::from_secs(1));
        clock.advance_secs(5);
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        let record = service.get_request(&alice, created.request.id).unwrap();
        assert_eq!(record.status, RequestStatus::Expired);

        handle.shutdown().await;
    }
}
