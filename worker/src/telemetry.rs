use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use nimbus_core::Monitor;

use crate::outgoing::OutgoingSender;

const PERIOD: Duration = Duration::from_secs(2);

/// Pushes a system-stats frame every two seconds until shutdown. Snapshot
/// failures never stop the loop.
pub async fn run(monitor: Arc<Monitor>, outgoing: OutgoingSender, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(PERIOD);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                outgoing.telemetry(monitor.snapshot()).await;
            }
            () = shutdown.cancelled() => return,
        }
    }
}
