use std::sync::Arc;

use pollward_api::HealthStatus;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, trace, warn};

use super::ElectorShared;
use crate::health::HealthReporter;

/// Rewrites the health record every health interval, and right away
/// whenever the leader flag flips
pub(super) struct HealthPublisher {
    shared: Arc<ElectorShared>,
    health: Arc<HealthReporter>,
}

impl HealthPublisher {
    pub(super) fn new(shared: Arc<ElectorShared>, health: Arc<HealthReporter>) -> Self {
        Self { shared, health }
    }

    pub(super) async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let guard = self.shared.panic_guard("health publisher");
        let _log = scopeguard::guard((), |_| {
            info!("Health publisher is done");
        });

        let mut role_rx = self.shared.subscribe_role();
        let mut tick = interval(self.shared.params.health_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // leader bit of the last successful write
        let mut published_leader = None;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                res = role_rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                    // candidate/follower flapping is not worth a write
                    if published_leader == Some(self.shared.is_leader()) {
                        continue;
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }

            // leader bit is read once the lease refresh is done
            let shared = &self.shared;
            match self
                .health
                .report_current(|| (shared.health_status(), shared.health_extra()))
                .await
            {
                Ok(status) => {
                    trace!(%status, "Health published");
                    // a flip during the put shows up as a role change
                    published_leader = Some(status == HealthStatus::Leader);
                }
                Err(e) => warn!(error = %e, "Could not publish health"),
            }
        }

        self.health.deregister().await;
        guard.done();
    }
}
