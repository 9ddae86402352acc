use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info};

use crate::store::ReservationStore;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Runs `clear_expired_reservations` every `period` until the store is
/// destroyed. Must be called from inside a tokio runtime.
pub fn spawn_sweeper(store: Arc<ReservationStore>, period: Duration) -> JoinHandle<()> {
    let mut shutdown = store.shutdown_signal();

    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        ticker.tick().await;

        info!(interval_ms = period.as_millis() as u64, "expiry sweeper started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    let reclaimed = store.clear_expired_reservations();
                    if reclaimed > 0 {
                        debug!(reclaimed, "sweep reclaimed expired leases");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("expiry sweeper stopped");
    })
}
