use pollward_api::{unix_millis, Epoch, HealthRecord, HealthStatus, InstanceId, Keys, Record};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ElectionError, ElectionResult};
use crate::lease::{Lease, LeaseManager};
use crate::store::StoreHandle;

/// Fields of the health record that come from the rest of the instance
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthExtra {
    pub offset: u64,
    pub epoch: Option<Epoch>,
    pub updates_processed: u64,
}

/// Publishes this instance's liveness record and checks others'
///
/// All writes share one lease, refreshed before every write and only
/// re-granted once it is gone.
pub struct HealthReporter {
    store: StoreHandle,
    keys: Keys,
    instance_id: InstanceId,
    leases: LeaseManager,
    lease: Mutex<Option<Lease>>,
    start_time_ms: u64,
}

impl HealthReporter {
    pub fn new(store: StoreHandle, keys: Keys, instance_id: InstanceId, leases: LeaseManager) -> Self {
        Self {
            store,
            keys,
            instance_id,
            leases,
            lease: Mutex::new(None),
            start_time_ms: unix_millis(),
        }
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub async fn report_health(&self, status: HealthStatus, extra: HealthExtra) -> ElectionResult<()> {
        self.report_current(|| (status, extra)).await.map(|_| ())
    }

    /// Write the record with the fields `current` returns, read only once
    /// the lease round trip is done; returns the status written
    pub async fn report_current<F>(&self, current: F) -> ElectionResult<HealthStatus>
    where
        F: FnOnce() -> (HealthStatus, HealthExtra),
    {
        let mut lease_slot = self.lease.lock().await;
        let lease = self.ensure_lease(&mut lease_slot).await?;

        let (status, extra) = current();
        let record = HealthRecord {
            instance_id: self.instance_id.clone(),
            status,
            is_leader: status == HealthStatus::Leader,
            epoch: extra.epoch,
            offset: extra.offset,
            start_time_ms: self.start_time_ms,
            last_seen_ms: unix_millis(),
            updates_processed: extra.updates_processed,
        }
        .encode()?;

        match self
            .store
            .put(&self.keys.health(&self.instance_id), record, Some(lease.id))
            .await
        {
            Ok(()) => {
                trace!(%status, "Health reported");
                Ok(status)
            }
            Err(e) => {
                let e = ElectionError::from(e);
                if matches!(e, ElectionError::LeaseExpired(_)) {
                    *lease_slot = None;
                }
                Err(e)
            }
        }
    }

    async fn ensure_lease(&self, slot: &mut Option<Lease>) -> ElectionResult<Lease> {
        if let Some(mut lease) = *slot {
            if !lease.is_expired(Instant::now()) {
                match self.leases.refresh(&mut lease).await {
                    Ok(()) => {
                        *slot = Some(lease);
                        return Ok(lease);
                    }
                    Err(ElectionError::LeaseExpired(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            debug!(lease = %lease.id, "Health lease lost, granting a new one");
            *slot = None;
        }

        let lease = self.leases.acquire().await?;
        *slot = Some(lease);
        Ok(lease)
    }

    /// Whether `instance_id` has a live health record
    pub async fn is_alive(&self, instance_id: &InstanceId) -> ElectionResult<bool> {
        Ok(self.store.get(&self.keys.health(instance_id)).await?.is_some())
    }

    /// Remove the own health record and its lease
    pub async fn deregister(&self) {
        if let Some(lease) = self.lease.lock().await.take() {
            self.leases.revoke(lease).await;
        }
        if let Err(e) = self.store.delete(&self.keys.health(&self.instance_id)).await {
            debug!(error = %e, "Could not delete health record, leaving it to expire");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::gated::GatedStore;
    use crate::store::mem::MemStore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;

    fn reporter(store: &MemStore, id: &str) -> HealthReporter {
        let handle = StoreHandle::new(Arc::new(store.connect()), Duration::from_secs(1));
        HealthReporter::new(
            handle.clone(),
            Keys::new("svc"),
            InstanceId::from(id),
            LeaseManager::new(handle, Duration::from_secs(15)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_lease_across_reports() -> anyhow::Result<()> {
        let store = MemStore::new();
        let a = reporter(&store, "a");

        for _ in 0..10 {
            a.report_health(HealthStatus::Follower, HealthExtra::default())
                .await?;
            sleep(Duration::from_secs(5)).await;
        }
        assert_eq!(store.live_leases(), 1);
        assert!(a.is_alive(&InstanceId::from("a")).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn silent_instance_expires() -> anyhow::Result<()> {
        let store = MemStore::new();
        let a = reporter(&store, "a");
        let b = reporter(&store, "b");

        a.report_health(
            HealthStatus::Leader,
            HealthExtra {
                offset: 7,
                epoch: Some(Epoch(2)),
                updates_processed: 3,
            },
        )
        .await?;

        let record = HealthRecord::decode(&store.peek("/bots/svc/health/a").unwrap())?;
        assert!(record.is_leader);
        assert_eq!(record.epoch, Some(Epoch(2)));
        assert_eq!(record.offset, 7);

        sleep(Duration::from_secs(14)).await;
        assert!(b.is_alive(&InstanceId::from("a")).await?);
        sleep(Duration::from_secs(2)).await;
        assert!(!b.is_alive(&InstanceId::from("a")).await?);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn regrants_after_expiry() -> anyhow::Result<()> {
        let store = MemStore::new();
        let a = reporter(&store, "a");

        a.report_health(HealthStatus::Follower, HealthExtra::default())
            .await?;
        sleep(Duration::from_secs(20)).await;
        a.report_health(HealthStatus::Follower, HealthExtra::default())
            .await?;

        assert!(a.is_alive(&InstanceId::from("a")).await?);
        assert_eq!(store.live_leases(), 1);
        Ok(())
    }

    fn as_reported(leading: &AtomicBool) -> (HealthStatus, HealthExtra) {
        if leading.load(Ordering::SeqCst) {
            let extra = HealthExtra {
                epoch: Some(Epoch(4)),
                ..HealthExtra::default()
            };
            (HealthStatus::Leader, extra)
        } else {
            (HealthStatus::Follower, HealthExtra::default())
        }
    }

    #[tokio::test]
    async fn demotion_during_lease_refresh_is_not_published_as_leader() -> anyhow::Result<()> {
        let store = MemStore::new();
        let gated = Arc::new(GatedStore::new(store.connect()));
        let handle = StoreHandle::new(gated.clone(), Duration::from_secs(1));
        let a = Arc::new(HealthReporter::new(
            handle.clone(),
            Keys::new("svc"),
            InstanceId::from("a"),
            LeaseManager::new(handle, Duration::from_secs(15)),
        ));
        let leading = Arc::new(AtomicBool::new(true));

        assert_eq!(
            a.report_current(|| as_reported(&leading)).await?,
            HealthStatus::Leader
        );

        gated.hold_next_keep_alive();
        let report = tokio::spawn({
            let a = a.clone();
            let leading = leading.clone();
            async move { a.report_current(|| as_reported(&leading)).await }
        });
        gated.keep_alive_parked().await;
        leading.store(false, Ordering::SeqCst);
        gated.resume();

        assert_eq!(report.await??, HealthStatus::Follower);
        let record = HealthRecord::decode(&store.peek("/bots/svc/health/a").unwrap())?;
        assert!(!record.is_leader);
        assert_eq!(record.epoch, None);
        Ok(())
    }

    #[tokio::test]
    async fn deregister_removes_record() -> anyhow::Result<()> {
        let store = MemStore::new();
        let a = reporter(&store, "a");

        a.report_health(HealthStatus::Starting, HealthExtra::default())
            .await?;
        a.deregister().await;

        assert_eq!(store.peek("/bots/svc/health/a"), None);
        assert_eq!(store.live_leases(), 0);
        Ok(())
    }
}
