mod election_loop;
mod health_publisher;
mod lease_keeper;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use pollward_api::{Epoch, HealthStatus, InstanceId, Keys, LeaseId, Role};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::checkpoint::OffsetCheckpoint;
use crate::error::{ElectionError, ElectionResult};
use crate::health::{HealthExtra, HealthReporter};
use crate::lease::{Lease, LeaseManager};
use crate::params::Parameters;
use crate::status::{ClusterStatus, ClusterStatusView};
use crate::store::{CoordinationStore, StoreHandle};
use crate::supervisor::Supervisor;
use crate::task::{PanicGuard, TaskHandle};

use self::election_loop::ElectionLoop;
use self::health_publisher::HealthPublisher;
use self::lease_keeper::LeaseKeeper;

/// Why the leader has to give up leadership before its next tick
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepDownReason {
    /// The store no longer knows the leader lease
    LeaseExpired,
    /// Refresh kept failing until less than the safety margin remained
    LeaseExpiring,
    /// A checkpoint write saw a newer epoch
    Fenced,
    TaskPanicked,
}

impl fmt::Display for StepDownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StepDownReason::LeaseExpired => "lease expired",
            StepDownReason::LeaseExpiring => "lease about to expire",
            StepDownReason::Fenced => "fenced by a newer epoch",
            StepDownReason::TaskPanicked => "background task panicked",
        })
    }
}

/// Snapshot of local counters
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ElectorStats {
    pub leadership_changes: u64,
    pub updates_processed: u64,
    pub contended_acquisitions: u64,
    pub stale_takeovers: u64,
}

#[derive(Default)]
struct Counters {
    leadership_changes: AtomicU64,
    updates_processed: AtomicU64,
    contended_acquisitions: AtomicU64,
    stale_takeovers: AtomicU64,
}

/// State shared between the election loop, the lease keeper, the health
/// publisher and the supervisor's checkpoint handle
pub(crate) struct ElectorShared {
    pub(crate) params: Parameters,

    /// The only leadership signal other tasks act upon
    is_leader: AtomicBool,
    /// Epoch of the current (or last) leadership
    epoch: AtomicU64,
    offset: AtomicU64,

    /// Leader lease, kept alive by the lease keeper while set
    lease: Mutex<Option<Lease>>,

    step_down_reason: Mutex<Option<(Epoch, StepDownReason)>>,
    step_down_notify: Notify,

    role_tx: watch::Sender<Role>,
    role_rx: watch::Receiver<Role>,

    counters: Counters,
}

impl ElectorShared {
    pub(crate) fn new(params: Parameters) -> Self {
        let (role_tx, role_rx) = watch::channel(Role::Follower);
        Self {
            params,
            is_leader: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            offset: AtomicU64::new(0),
            lease: Mutex::new(None),
            step_down_reason: Mutex::new(None),
            step_down_notify: Notify::new(),
            role_tx,
            role_rx,
            counters: Counters::default(),
        }
    }

    pub(crate) fn instance_id(&self) -> &InstanceId {
        &self.params.instance_id
    }

    pub(crate) fn panic_guard(self: &Arc<Self>, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.clone())
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    pub(crate) fn is_leader_of(&self, epoch: Epoch) -> bool {
        self.is_leader() && self.epoch() == epoch
    }

    pub(crate) fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::SeqCst))
    }

    pub(crate) fn enter_leadership(&self, epoch: Epoch, lease: Lease, offset: u64) {
        {
            // lease and epoch change together, see `demote_if_current`
            let mut current = self.lease.lock().expect("locking failed");
            *current = Some(lease);
            self.epoch.store(epoch.0, Ordering::SeqCst);
            self.offset.store(offset, Ordering::SeqCst);
            self.is_leader.store(true, Ordering::SeqCst);
        }
        self.counters
            .leadership_changes
            .fetch_add(1, Ordering::SeqCst);
        self.set_role(Role::Leader);
    }

    /// Clear the leader flag; `true` if it was set
    ///
    /// The lease stays in place until the store resources are released.
    pub(crate) fn leave_leadership(&self) -> bool {
        let was_leader = self.is_leader.swap(false, Ordering::SeqCst);
        if was_leader {
            self.role_tx.send_if_modified(|role| {
                let changed = *role == Role::Leader;
                *role = Role::Follower;
                changed
            });
        }
        was_leader
    }

    pub(crate) fn set_role(&self, role: Role) {
        self.role_tx.send_if_modified(|current| {
            let changed = *current != role;
            *current = role;
            changed
        });
    }

    pub(crate) fn role(&self) -> Role {
        *self.role_rx.borrow()
    }

    pub(crate) fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_rx.clone()
    }

    pub(crate) fn lease(&self) -> Option<Lease> {
        *self.lease.lock().expect("locking failed")
    }

    /// Store a refreshed lease, unless it was released in the meantime
    pub(crate) fn update_lease(&self, refreshed: Lease) {
        let mut lease = self.lease.lock().expect("locking failed");
        if lease.map(|l| l.id) == Some(refreshed.id) {
            *lease = Some(refreshed);
        }
    }

    pub(crate) fn take_lease(&self) -> Option<Lease> {
        self.lease.lock().expect("locking failed").take()
    }

    /// Demote the instance if `lease` still backs the current leadership;
    /// `false` if it was already released or replaced
    pub(crate) fn demote_if_current(&self, lease: LeaseId, reason: StepDownReason) -> bool {
        let current = self.lease.lock().expect("locking failed");
        if current.map(|l| l.id) != Some(lease) {
            return false;
        }
        let epoch = self.epoch();
        if self.leave_leadership() {
            warn!(%epoch, %reason, "Demoting before the election loop notices");
        }
        self.request_step_down(epoch, reason);
        true
    }

    /// Ask the election loop to end the leadership of `epoch` as soon as
    /// possible
    ///
    /// The first reason wins until the loop takes it, unless it was meant
    /// for an older epoch.
    pub(crate) fn request_step_down(&self, epoch: Epoch, reason: StepDownReason) {
        {
            let mut pending = self.step_down_reason.lock().expect("locking failed");
            match *pending {
                Some((pending_epoch, _)) if epoch <= pending_epoch => {}
                _ => *pending = Some((epoch, reason)),
            }
        }
        self.step_down_notify.notify_one();
    }

    /// Pending reason to end `epoch`; requests for older epochs are dropped
    pub(crate) fn take_step_down_reason(&self, epoch: Epoch) -> Option<StepDownReason> {
        let mut pending = self.step_down_reason.lock().expect("locking failed");
        match *pending {
            Some((pending_epoch, reason)) if pending_epoch == epoch => {
                *pending = None;
                Some(reason)
            }
            Some((pending_epoch, reason)) if pending_epoch < epoch => {
                debug!(%pending_epoch, %reason, "Dropping step-down request of an old epoch");
                *pending = None;
                None
            }
            _ => None,
        }
    }

    pub(crate) fn clear_step_down(&self) {
        *self.step_down_reason.lock().expect("locking failed") = None;
    }

    pub(crate) async fn step_down_requested(&self) {
        self.step_down_notify.notified().await
    }

    pub(crate) fn record_offset(&self, offset: u64) {
        self.offset.fetch_max(offset, Ordering::SeqCst);
    }

    pub(crate) fn offset(&self) -> u64 {
        self.offset.load(Ordering::SeqCst)
    }

    pub(crate) fn add_updates_processed(&self, count: u64) {
        self.counters
            .updates_processed
            .fetch_add(count, Ordering::SeqCst);
    }

    pub(crate) fn count_contended_acquisition(&self) {
        self.counters
            .contended_acquisitions
            .fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn count_stale_takeover(&self) {
        self.counters.stale_takeovers.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn stats(&self) -> ElectorStats {
        ElectorStats {
            leadership_changes: self.counters.leadership_changes.load(Ordering::SeqCst),
            updates_processed: self.counters.updates_processed.load(Ordering::SeqCst),
            contended_acquisitions: self
                .counters
                .contended_acquisitions
                .load(Ordering::SeqCst),
            stale_takeovers: self.counters.stale_takeovers.load(Ordering::SeqCst),
        }
    }

    /// Status to publish; `Leader` only while the flag is set
    pub(crate) fn health_status(&self) -> HealthStatus {
        if self.is_leader() {
            return HealthStatus::Leader;
        }
        match self.role() {
            Role::Candidate => HealthStatus::Candidate,
            Role::Follower | Role::Leader => HealthStatus::Follower,
        }
    }

    pub(crate) fn health_extra(&self) -> HealthExtra {
        HealthExtra {
            offset: self.offset(),
            epoch: self.is_leader().then(|| self.epoch()),
            updates_processed: self.counters.updates_processed.load(Ordering::SeqCst),
        }
    }
}

/// Background tasks of a running elector, stopped in a fixed order
struct ElectorTasks {
    shared: Arc<ElectorShared>,
    store: StoreHandle,
    leases: LeaseManager,

    election_loop_shutdown_tx: watch::Sender<bool>,
    election_loop: TaskHandle,
    lease_keeper_shutdown_tx: watch::Sender<bool>,
    lease_keeper: TaskHandle,
    health_publisher_shutdown_tx: watch::Sender<bool>,
    health_publisher: TaskHandle,
}

impl ElectorTasks {
    /// Release leadership first (the lease keeper still refreshes the lease
    /// meanwhile), then stop refreshing, then deregister
    async fn shutdown(self) {
        let _ = self.election_loop_shutdown_tx.send(true);
        self.election_loop.join().await;

        let _ = self.lease_keeper_shutdown_tx.send(true);
        self.lease_keeper.join().await;

        // only left behind if the election loop died while leading
        if let Some(lease) = self.shared.take_lease() {
            self.shared.leave_leadership();
            election_loop::release_store_resources(
                &self.store,
                &self.shared.params.keys(),
                &self.leases,
                self.shared.instance_id(),
                self.shared.epoch(),
                Some(lease),
            )
            .await;
        }

        let _ = self.health_publisher_shutdown_tx.send(true);
        self.health_publisher.join().await;

        self.shared.set_role(Role::Follower);
    }
}

/// Leader elector of one instance
///
/// Runs until [`Elector::stop`] is called. Dropping it without calling
/// `stop` starts the same shutdown in the background.
pub struct Elector {
    shared: Arc<ElectorShared>,
    store: StoreHandle,
    tasks: tokio::sync::Mutex<Option<ElectorTasks>>,
}

impl Elector {
    /// Connect, register and start electing
    ///
    /// Fails with [`ElectionError::Connect`] if the store cannot be reached
    /// within the configured number of probe attempts.
    pub async fn start(
        params: Parameters,
        store: Arc<dyn CoordinationStore>,
        supervisor: Arc<dyn Supervisor>,
    ) -> ElectionResult<Self> {
        params.validate()?;
        let keys = params.keys();
        let store = StoreHandle::new(store, params.store_timeout);

        info!(
            instance = %params.instance_id,
            service = %params.service,
            ttl = ?params.lease_ttl,
            "Starting elector"
        );

        probe_store(&store, &keys, &params).await?;

        let shared = Arc::new(ElectorShared::new(params.clone()));
        let leases = LeaseManager::new(store.clone(), params.lease_ttl);
        let health = Arc::new(HealthReporter::new(
            store.clone(),
            keys.clone(),
            params.instance_id.clone(),
            LeaseManager::new(store.clone(), params.health_record_ttl()),
        ));

        if let Err(e) = health
            .report_health(HealthStatus::Starting, HealthExtra::default())
            .await
        {
            warn!(error = %e, "Could not register, health publisher will retry");
        }

        let checkpoint =
            OffsetCheckpoint::new(store.clone(), keys.offset(), params.instance_id.clone());

        let (election_loop_shutdown_tx, election_loop_shutdown_rx) = watch::channel(false);
        let (lease_keeper_shutdown_tx, lease_keeper_shutdown_rx) = watch::channel(false);
        let (health_publisher_shutdown_tx, health_publisher_shutdown_rx) = watch::channel(false);

        let health_publisher = TaskHandle::spawn(
            "health publisher",
            HealthPublisher::new(shared.clone(), health.clone()).run(health_publisher_shutdown_rx),
        );
        let lease_keeper = TaskHandle::spawn(
            "lease keeper",
            LeaseKeeper::new(shared.clone(), leases.clone()).run(lease_keeper_shutdown_rx),
        );
        let election_loop = TaskHandle::spawn(
            "election loop",
            ElectionLoop::new(
                shared.clone(),
                store.clone(),
                leases.clone(),
                health,
                checkpoint,
                supervisor,
            )
            .run(election_loop_shutdown_rx),
        );

        Ok(Self {
            shared: shared.clone(),
            store: store.clone(),
            tasks: tokio::sync::Mutex::new(Some(ElectorTasks {
                shared,
                store,
                leases,
                election_loop_shutdown_tx,
                election_loop,
                lease_keeper_shutdown_tx,
                lease_keeper,
                health_publisher_shutdown_tx,
                health_publisher,
            })),
        })
    }

    pub fn instance_id(&self) -> &InstanceId {
        self.shared.instance_id()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader()
    }

    pub fn role(&self) -> Role {
        self.shared.role()
    }

    /// Epoch currently led by this instance
    pub fn epoch(&self) -> Option<Epoch> {
        self.shared.is_leader().then(|| self.shared.epoch())
    }

    /// Follow role changes
    pub fn subscribe(&self) -> watch::Receiver<Role> {
        self.shared.subscribe_role()
    }

    pub fn stats(&self) -> ElectorStats {
        self.shared.stats()
    }

    pub async fn cluster_status(&self) -> ElectionResult<ClusterStatus> {
        let cluster = ClusterStatusView::new(self.store.clone(), self.shared.params.keys())
            .snapshot()
            .await?;

        Ok(ClusterStatus {
            cluster,
            is_leader: self.shared.is_leader(),
            instance_id: self.shared.instance_id().clone(),
            role: self.shared.role(),
            offset: self.shared.offset(),
        })
    }

    /// Release leadership (awaiting the supervisor), stop every task and
    /// deregister
    ///
    /// Idempotent; concurrent callers all return once shutdown is complete.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        if let Some(tasks) = tasks.take() {
            info!(instance = %self.shared.instance_id(), "Stopping elector");
            tasks.shutdown().await;
            info!(instance = %self.shared.instance_id(), "Elector stopped");
        }
    }
}

impl Drop for Elector {
    fn drop(&mut self) {
        let Some(tasks) = self.tasks.get_mut().take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                debug!("Elector dropped without stop, shutting down in the background");
                handle.spawn(tasks.shutdown());
            }
            Err(_) => {
                warn!("Elector dropped outside of a runtime, leaving the lease to expire");
            }
        }
    }
}

async fn probe_store(store: &StoreHandle, keys: &Keys, params: &Parameters) -> ElectionResult<()> {
    let mut backoff = Backoff::new(params.tick_period, params.backoff_max);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match store.get(&keys.leader()).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < params.startup_probe_attempts => {
                warn!(attempt, error = %e, "Coordination store not reachable yet");
                sleep(backoff.next_delay()).await;
            }
            Err(e) => {
                error!(attempt, error = %e, "Could not connect to the coordination store");
                return Err(ElectionError::Connect(e));
            }
        }
    }
}
