use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, trace, warn};

use super::{ElectorShared, StepDownReason};
use crate::error::ElectionError;
use crate::lease::LeaseManager;

/// Keeps the leader lease alive while the elector holds one
///
/// Refreshes every refresh period; after a failed refresh it retries every
/// tick, and once less than the step-down margin is left it demotes the
/// instance on its own.
pub(super) struct LeaseKeeper {
    shared: Arc<ElectorShared>,
    leases: LeaseManager,
}

impl LeaseKeeper {
    pub(super) fn new(shared: Arc<ElectorShared>, leases: LeaseManager) -> Self {
        Self { shared, leases }
    }

    pub(super) async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let guard = self.shared.panic_guard("lease keeper");
        let _log = scopeguard::guard((), |_| {
            info!("Lease keeper is done");
        });

        let params = &self.shared.params;
        let mut next_refresh = Instant::now() + params.refresh_period();

        loop {
            tokio::select! {
                _ = sleep_until(next_refresh) => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            next_refresh = Instant::now() + params.refresh_period();

            let Some(mut lease) = self.shared.lease() else {
                continue;
            };

            match self.leases.refresh(&mut lease).await {
                Ok(()) => {
                    trace!(lease = %lease.id, "Lease refreshed");
                    self.shared.update_lease(lease);
                }
                Err(ElectionError::LeaseExpired(_)) => {
                    if self
                        .shared
                        .demote_if_current(lease.id, StepDownReason::LeaseExpired)
                    {
                        warn!(lease = %lease.id, "Lease expired");
                    } else {
                        debug!(lease = %lease.id, "Released lease expired");
                    }
                }
                Err(e) => {
                    let remaining = lease.remaining(Instant::now());
                    warn!(lease = %lease.id, ?remaining, error = %e, "Lease refresh failed");
                    next_refresh = Instant::now() + params.tick_period;
                    if remaining < params.step_down_margin() {
                        self.shared
                            .demote_if_current(lease.id, StepDownReason::LeaseExpiring);
                    }
                }
            }
        }

        guard.done();
    }
}
