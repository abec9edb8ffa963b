use pollward_api::LeaseId;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ElectionResult;
use crate::store::StoreHandle;

/// Locally tracked TTL lease
///
/// `deadline` is computed from the moment the grant/refresh request was
/// sent, so it never lies later than the store's own deadline.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub id: LeaseId,
    pub ttl: Duration,
    pub deadline: Instant,
}

impl Lease {
    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline <= now
    }
}

/// Acquires, refreshes and revokes leases of one fixed TTL
#[derive(Clone)]
pub struct LeaseManager {
    store: StoreHandle,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: StoreHandle, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn acquire(&self) -> ElectionResult<Lease> {
        let requested_at = Instant::now();
        let id = self.store.lease_grant(self.ttl).await?;
        debug!(lease = %id, ttl = ?self.ttl, "Lease granted");
        Ok(Lease {
            id,
            ttl: self.ttl,
            deadline: requested_at + self.ttl,
        })
    }

    /// Extend the lease; [`crate::ElectionError::LeaseExpired`] if the store
    /// no longer knows it
    pub async fn refresh(&self, lease: &mut Lease) -> ElectionResult<()> {
        let requested_at = Instant::now();
        self.store.lease_keep_alive(lease.id).await?;
        lease.deadline = requested_at + lease.ttl;
        Ok(())
    }

    /// Best effort; TTL expiry releases the lease anyway
    pub async fn revoke(&self, lease: Lease) {
        match self.store.lease_revoke(lease.id).await {
            Ok(()) => debug!(lease = %lease.id, "Lease revoked"),
            Err(e) => warn!(lease = %lease.id, error = %e, "Could not revoke lease, leaving it to expire"),
        }
    }
}
