use std::cmp;
use std::fmt;
use std::sync::Arc;

use pollward_api::{unix_millis, Epoch, InstanceId, Keys, LeaderRecord, Record, Role};
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::ElectorShared;
use crate::backoff::Backoff;
use crate::checkpoint::{CheckpointHandle, OffsetCheckpoint};
use crate::error::{ElectionError, ElectionResult};
use crate::health::HealthReporter;
use crate::lease::{Lease, LeaseManager};
use crate::store::StoreHandle;
use crate::supervisor::{LeadershipContext, Supervisor};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Follower,
    Acquiring,
    Leader { epoch: Epoch },
    Releasing,
}

impl State {
    fn role(self) -> Role {
        match self {
            State::Follower | State::Releasing => Role::Follower,
            State::Acquiring => Role::Candidate,
            State::Leader { .. } => Role::Leader,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Follower => f.write_str("follower"),
            State::Acquiring => f.write_str("acquiring"),
            State::Leader { epoch } => write!(f, "leader({epoch})"),
            State::Releasing => f.write_str("releasing"),
        }
    }
}

/// Outcome of one acquisition attempt
#[derive(Debug)]
enum Acquisition {
    Elected { epoch: Epoch, lease: Lease },
    /// Someone else holds a record and is alive
    LeaderAlive { owner: InstanceId, epoch: Epoch },
    /// Another instance won the conditional put
    ConditionalWriteLost,
    /// The record belonged to a dead instance and was removed
    StaleLeaderDetected,
}

/// Leader record as decoded, with the exact bytes it was stored as
struct StoredLeader {
    record: LeaderRecord,
    bytes: Vec<u8>,
}

async fn read_leader(store: &StoreHandle, keys: &Keys) -> ElectionResult<Option<StoredLeader>> {
    let Some(bytes) = store.get(&keys.leader()).await? else {
        return Ok(None);
    };
    Ok(Some(StoredLeader {
        record: LeaderRecord::decode(&bytes)?,
        bytes,
    }))
}

/// Delete the leader record if it is still ours, then revoke the lease
///
/// Best effort: whatever fails here is cleaned up by the lease expiring.
pub(super) async fn release_store_resources(
    store: &StoreHandle,
    keys: &Keys,
    leases: &LeaseManager,
    instance_id: &InstanceId,
    epoch: Epoch,
    lease: Option<Lease>,
) {
    match read_leader(store, keys).await {
        Ok(Some(stored)) if stored.record.owner == *instance_id && stored.record.epoch == epoch => {
            match store.delete_if_equals(&keys.leader(), &stored.bytes).await {
                Ok(deleted) => debug!(deleted, %epoch, "Leader record removed"),
                Err(e) => warn!(error = %e, "Could not delete leader record"),
            }
        }
        Ok(_) => debug!(%epoch, "Leader record already gone or replaced"),
        Err(e) => warn!(error = %e, "Could not read leader record on release"),
    }

    if let Some(lease) = lease {
        leases.revoke(lease).await;
    }
}

/// The state machine driving acquisition, maintenance and release
pub(super) struct ElectionLoop {
    shared: Arc<ElectorShared>,
    store: StoreHandle,
    keys: Keys,
    leases: LeaseManager,
    health: Arc<HealthReporter>,
    checkpoint: OffsetCheckpoint,
    supervisor: Arc<dyn Supervisor>,

    state: State,
    backoff: Backoff,
    /// No acquisition attempts before this instant
    retry_at: Option<Instant>,
    /// Highest epoch seen in any leader record
    highest_epoch_seen: Epoch,
}

impl ElectionLoop {
    pub(super) fn new(
        shared: Arc<ElectorShared>,
        store: StoreHandle,
        leases: LeaseManager,
        health: Arc<HealthReporter>,
        checkpoint: OffsetCheckpoint,
        supervisor: Arc<dyn Supervisor>,
    ) -> Self {
        let keys = shared.params.keys();
        let backoff = Backoff::new(shared.params.tick_period, shared.params.backoff_max);
        Self {
            shared,
            store,
            keys,
            leases,
            health,
            checkpoint,
            supervisor,
            state: State::Follower,
            backoff,
            retry_at: None,
            highest_epoch_seen: Epoch::ZERO,
        }
    }

    pub(super) async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        let guard = self.shared.panic_guard("election loop");
        let _log = scopeguard::guard((), |_| {
            info!("Election loop is done");
        });

        let mut tick = interval(self.shared.params.tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = self.shared.step_down_requested() => {}
                _ = shutdown_rx.changed() => break,
            }
            if *shutdown_rx.borrow() {
                break;
            }
            self.step().await;
        }

        self.release().await;
        guard.done();
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            trace!(from = %self.state, to = %state, "State transition");
        }
        self.state = state;
        self.shared.set_role(state.role());
    }

    async fn step(&mut self) {
        match self.state {
            State::Leader { epoch } => self.maintain(epoch).await,
            _ => {
                // requests addressed to a leadership that is already gone
                self.shared.clear_step_down();

                if self.retry_at.map_or(false, |at| Instant::now() < at) {
                    return;
                }
                self.acquire().await;
            }
        }
    }

    async fn acquire(&mut self) {
        self.set_state(State::Acquiring);

        match self.try_acquire().await {
            Ok(Acquisition::Elected { epoch, lease }) => self.become_leader(epoch, lease).await,
            Ok(Acquisition::LeaderAlive { owner, epoch }) => {
                trace!(%owner, %epoch, "Leader is alive");
                self.backoff.reset();
                self.retry_at = None;
                self.set_state(State::Follower);
            }
            Ok(Acquisition::ConditionalWriteLost) => {
                debug!("Lost the race for the leader record");
                self.shared.count_contended_acquisition();
                self.follow_with_backoff();
            }
            Ok(Acquisition::StaleLeaderDetected) => {
                debug!("Stale leader record keeps reappearing");
                self.follow_with_backoff();
            }
            Err(e) => {
                warn!(error = %e, "Acquisition attempt failed");
                self.follow_with_backoff();
            }
        }
    }

    /// Read the record; create it if absent, remove it if its owner is
    /// dead and try once more within the same tick
    async fn try_acquire(&mut self) -> ElectionResult<Acquisition> {
        let mut outcome = Acquisition::ConditionalWriteLost;

        for _ in 0..2 {
            let Some(stored) = read_leader(&self.store, &self.keys).await? else {
                return self.try_create_leader_record().await;
            };
            self.highest_epoch_seen = cmp::max(self.highest_epoch_seen, stored.record.epoch);

            // an own record here is a leftover of a release that failed
            if stored.record.owner != *self.shared.instance_id()
                && self.health.is_alive(&stored.record.owner).await?
            {
                return Ok(Acquisition::LeaderAlive {
                    owner: stored.record.owner,
                    epoch: stored.record.epoch,
                });
            }

            outcome = self.remove_stale_leader(&stored).await?;
        }

        Ok(outcome)
    }

    async fn remove_stale_leader(&mut self, stale: &StoredLeader) -> ElectionResult<Acquisition> {
        if self
            .store
            .delete_if_equals(&self.keys.leader(), &stale.bytes)
            .await?
        {
            warn!(
                owner = %stale.record.owner,
                epoch = %stale.record.epoch,
                "Removed leader record of a dead instance"
            );
            self.shared.count_stale_takeover();
        }
        Ok(Acquisition::StaleLeaderDetected)
    }

    async fn next_epoch(&mut self) -> ElectionResult<Epoch> {
        let checkpointed = self
            .checkpoint
            .load_record()
            .await?
            .map(|r| r.epoch)
            .unwrap_or_default();
        Ok(cmp::max(self.highest_epoch_seen, checkpointed).next())
    }

    async fn try_create_leader_record(&mut self) -> ElectionResult<Acquisition> {
        let epoch = self.next_epoch().await?;
        let lease = self.leases.acquire().await?;

        let record = LeaderRecord {
            owner: self.shared.instance_id().clone(),
            lease_id: lease.id,
            epoch,
            written_at_ms: unix_millis(),
        };

        let created = match record.encode() {
            Ok(bytes) => self
                .store
                .put_if_absent(&self.keys.leader(), bytes, lease.id)
                .await
                .map_err(ElectionError::from),
            Err(e) => Err(e.into()),
        };

        match created {
            Ok(true) => {
                self.highest_epoch_seen = epoch;
                Ok(Acquisition::Elected { epoch, lease })
            }
            Ok(false) => {
                self.leases.revoke(lease).await;
                Ok(Acquisition::ConditionalWriteLost)
            }
            Err(e) => {
                // the write may have landed; revoking removes it either way
                self.leases.revoke(lease).await;
                Err(e)
            }
        }
    }

    /// Load the checkpoint, stamp it with the new epoch and start the
    /// supervisor
    async fn become_leader(&mut self, epoch: Epoch, lease: Lease) {
        let offset = match self.claim_checkpoint(epoch).await {
            Ok(offset) => offset,
            Err(e) => {
                warn!(%epoch, error = %e, "Could not claim checkpoint, giving up leadership");
                self.release_store_resources(epoch, Some(lease)).await;
                self.follow_with_backoff();
                return;
            }
        };

        self.shared.enter_leadership(epoch, lease, offset);
        self.set_state(State::Leader { epoch });
        info!(instance = %self.shared.instance_id(), %epoch, offset, "Elected leader");

        let ctx = LeadershipContext {
            epoch,
            offset,
            checkpoint: CheckpointHandle::new(self.checkpoint.clone(), self.shared.clone(), epoch),
        };

        match self.supervisor.on_leader_elected(ctx).await {
            Ok(()) => {
                self.backoff.reset();
                self.retry_at = None;
            }
            Err(e) => {
                let e = ElectionError::SupervisorStartFailure(e);
                warn!(%epoch, error = %e, "Stepping down");
                self.release().await;
                self.follow_with_backoff();
            }
        }
    }

    async fn claim_checkpoint(&self, epoch: Epoch) -> ElectionResult<u64> {
        let offset = self.checkpoint.load().await?;
        self.checkpoint.save(offset, epoch).await
    }

    async fn maintain(&mut self, epoch: Epoch) {
        if let Some(reason) = self.shared.take_step_down_reason(epoch) {
            info!(%epoch, %reason, "Stepping down");
            return self.release_with_backoff().await;
        }

        if !self.shared.is_leader() {
            info!(%epoch, "Leader flag cleared, stepping down");
            return self.release_with_backoff().await;
        }

        let margin = self.shared.params.step_down_margin();
        match self.shared.lease() {
            Some(lease) if margin <= lease.remaining(Instant::now()) => {}
            lease => {
                warn!(
                    %epoch,
                    remaining = ?lease.map(|l| l.remaining(Instant::now())),
                    "Lease not refreshed in time, stepping down"
                );
                return self.release_with_backoff().await;
            }
        }

        match read_leader(&self.store, &self.keys).await {
            Ok(Some(stored))
                if stored.record.owner == *self.shared.instance_id()
                    && stored.record.epoch == epoch => {}
            Ok(stored) => {
                warn!(
                    %epoch,
                    owner = ?stored.as_ref().map(|s| &s.record.owner),
                    "Leader record no longer ours, stepping down"
                );
                self.release_with_backoff().await;
            }
            // the lease margin bounds how long this can go on
            Err(e) => debug!(error = %e, "Could not verify leader record"),
        }
    }

    async fn release_with_backoff(&mut self) {
        self.release().await;
        self.follow_with_backoff();
    }

    /// Leave leadership: clear the flag, wait for the supervisor to stop,
    /// then release the record and the lease
    async fn release(&mut self) {
        let State::Leader { epoch } = self.state else {
            return;
        };

        self.shared.leave_leadership();
        self.set_state(State::Releasing);
        info!(instance = %self.shared.instance_id(), %epoch, "Releasing leadership");

        self.supervisor.on_leader_lost().await;

        let lease = self.shared.take_lease();
        self.release_store_resources(epoch, lease).await;
        self.shared.clear_step_down();

        self.set_state(State::Follower);
        info!(%epoch, "Leadership released");
    }

    async fn release_store_resources(&self, epoch: Epoch, lease: Option<Lease>) {
        release_store_resources(
            &self.store,
            &self.keys,
            &self.leases,
            self.shared.instance_id(),
            epoch,
            lease,
        )
        .await
    }

    fn follow_with_backoff(&mut self) {
        let delay = self.backoff.next_delay();
        trace!(?delay, "Backing off");
        self.retry_at = Some(Instant::now() + delay);
        self.set_state(State::Follower);
    }
}
