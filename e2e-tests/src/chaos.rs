//! Randomized partitions and restarts against replicas sharing one store
//!
//! Every replica runs a supervisor that keeps moving the checkpoint while
//! it leads. A shared monitor records supervisor starts and stops, and
//! flags overlapping leadership, non-increasing epochs and a checkpoint
//! seen going backwards.
use async_trait::async_trait;
use pollward::api::{Epoch, InstanceId};
use pollward::store::mem::{MemClient, MemStore};
use pollward::{
    CheckpointHandle, ElectionError, Elector, LeadershipContext, Parameters, Supervisor,
    SupervisorError,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use typed_builder::TypedBuilder;

#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("replica failed to start")]
    Start(#[from] ElectionError),
}

#[derive(TypedBuilder, Debug, Clone)]
pub struct ChaosParams {
    #[builder(default = 3)]
    pub replicas: usize,
    #[builder(default = 20)]
    pub rounds: u32,
    #[builder(default = 0)]
    pub seed: u64,
    #[builder(default = Duration::from_millis(100))]
    pub tick: Duration,
}

impl ChaosParams {
    fn elector_params(&self, instance_id: InstanceId) -> Parameters {
        let tick = self.tick;
        Parameters::builder()
            .service("chaos")
            .instance_id(instance_id)
            .tick_period(tick)
            .lease_ttl(tick * 30)
            .lease_refresh(tick * 10)
            .health_interval(tick * 5)
            .store_timeout(tick * 2)
            .backoff_max(tick * 10)
            .build()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ChaosReport {
    pub seed: u64,
    pub faults: u32,
    pub elections: u32,
    pub max_checkpoint: u64,
    pub violations: Vec<String>,
}

impl ChaosReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Default)]
struct MonitorState {
    active: Option<(InstanceId, Epoch)>,
    last_epoch: Epoch,
    max_saved: u64,
    elections: u32,
    violations: Vec<String>,
}

#[derive(Default)]
struct Monitor {
    inner: Mutex<MonitorState>,
}

impl Monitor {
    fn elected(&self, id: &InstanceId, epoch: Epoch, offset: u64) {
        let mut state = self.inner.lock().expect("locking failed");
        if let Some((active, active_epoch)) = &state.active {
            let violation =
                format!("{id} elected in epoch {epoch} while {active} leads epoch {active_epoch}");
            state.violations.push(violation);
        }
        if epoch <= state.last_epoch {
            let violation = format!("epoch {epoch} of {id} not above {}", state.last_epoch);
            state.violations.push(violation);
        }
        if offset < state.max_saved {
            let violation = format!(
                "{id} resumed from {offset}, below the saved {}",
                state.max_saved
            );
            state.violations.push(violation);
        }
        state.active = Some((id.clone(), epoch));
        state.last_epoch = epoch;
        state.elections += 1;
    }

    fn lost(&self, id: &InstanceId) {
        let mut state = self.inner.lock().expect("locking failed");
        if state.active.as_ref().map(|(active, _)| active) == Some(id) {
            state.active = None;
        }
    }

    fn saved(&self, id: &InstanceId, cursor: u64) {
        let mut state = self.inner.lock().expect("locking failed");
        if cursor < state.max_saved {
            let violation = format!("{id} saved {cursor} after {}", state.max_saved);
            state.violations.push(violation);
        }
        state.max_saved = state.max_saved.max(cursor);
    }

    fn violation(&self, violation: String) {
        self.inner
            .lock()
            .expect("locking failed")
            .violations
            .push(violation);
    }

    fn report(&self, seed: u64, faults: u32) -> ChaosReport {
        let state = self.inner.lock().expect("locking failed");
        ChaosReport {
            seed,
            faults,
            elections: state.elections,
            max_checkpoint: state.max_saved,
            violations: state.violations.clone(),
        }
    }
}

struct Worker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Advances the checkpoint by one every `save_period` while leading
struct ChaosSupervisor {
    id: InstanceId,
    monitor: Arc<Monitor>,
    save_period: Duration,
    worker: tokio::sync::Mutex<Option<Worker>>,
}

#[async_trait]
impl Supervisor for ChaosSupervisor {
    async fn on_leader_elected(&self, ctx: LeadershipContext) -> Result<(), SupervisorError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.monitor.elected(&self.id, ctx.epoch, ctx.offset);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(advance_checkpoint(
            self.id.clone(),
            ctx.checkpoint,
            ctx.offset,
            self.monitor.clone(),
            self.save_period,
            shutdown_rx,
        ));
        *worker = Some(Worker {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    async fn on_leader_lost(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };
        let _ = worker.shutdown_tx.send(true);
        if let Err(e) = worker.handle.await {
            warn!(instance = %self.id, error = %e, "Checkpoint worker failed");
        }
        self.monitor.lost(&self.id);
    }
}

async fn advance_checkpoint(
    id: InstanceId,
    checkpoint: CheckpointHandle,
    mut cursor: u64,
    monitor: Arc<Monitor>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(period) => {}
            _ = shutdown_rx.changed() => return,
        }
        match checkpoint.save_offset(cursor + 1).await {
            Ok(saved) => {
                cursor = saved;
                monitor.saved(&id, saved);
            }
            Err(ElectionError::NotLeader | ElectionError::Fenced { .. }) => return,
            Err(e) => debug!(instance = %id, error = %e, "Checkpoint save failed"),
        }
    }
}

struct Replica {
    client: MemClient,
    elector: Elector,
}

impl Replica {
    async fn start(
        store: &MemStore,
        monitor: &Arc<Monitor>,
        params: &ChaosParams,
        n: usize,
    ) -> Result<Self, ChaosError> {
        let id = InstanceId(format!("replica-{n}"));
        let client = store.connect();
        let supervisor = Arc::new(ChaosSupervisor {
            id: id.clone(),
            monitor: monitor.clone(),
            save_period: params.tick,
            worker: tokio::sync::Mutex::new(None),
        });
        let elector =
            Elector::start(params.elector_params(id), Arc::new(client.clone()), supervisor).await?;
        Ok(Self { client, elector })
    }
}

pub async fn run_chaos(params: ChaosParams) -> Result<ChaosReport, ChaosError> {
    info!(
        replicas = params.replicas,
        rounds = params.rounds,
        seed = params.seed,
        "Starting chaos run"
    );
    let store = MemStore::new();
    let monitor = Arc::new(Monitor::default());
    let mut rng = StdRng::seed_from_u64(params.seed);

    let mut replicas = Vec::with_capacity(params.replicas);
    for n in 0..params.replicas {
        replicas.push(Replica::start(&store, &monitor, &params, n).await?);
    }
    let mut next_n = params.replicas;

    for round in 0..params.rounds {
        sleep(params.tick * rng.gen_range(10..40)).await;

        let leader = replicas.iter().position(|r| r.elector.is_leader());
        let target = match leader {
            Some(leader) if rng.gen_bool(0.75) => leader,
            _ => rng.gen_range(0..replicas.len()),
        };

        if rng.gen_bool(0.3) {
            info!(round, replica = target, "Restarting replica");
            let fresh = Replica::start(&store, &monitor, &params, next_n).await?;
            next_n += 1;
            let old = std::mem::replace(&mut replicas[target], fresh);
            old.elector.stop().await;
        } else {
            let outage = params.tick * rng.gen_range(5..60);
            info!(round, replica = target, ?outage, "Partitioning replica");
            replicas[target].client.disconnect();
            sleep(outage).await;
            replicas[target].client.reconnect();
        }
    }

    // long enough for any expired leadership to be taken over
    sleep(params.tick * 60).await;
    let leaders = replicas.iter().filter(|r| r.elector.is_leader()).count();
    if leaders != 1 {
        monitor.violation(format!("{leaders} leaders after the run settled"));
    }

    for replica in &replicas {
        replica.elector.stop().await;
    }
    if store.live_leases() != 0 {
        monitor.violation(format!("{} leases left after stop", store.live_leases()));
    }

    Ok(monitor.report(params.seed, params.rounds))
}
