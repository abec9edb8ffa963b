#![allow(unused)]

use async_trait::async_trait;
use pollward::api::{Epoch, InstanceId};
use pollward::store::mem::{MemClient, MemStore};
use pollward::{
    CheckpointHandle, Elector, LeadershipContext, Parameters, Supervisor, SupervisorError,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG=debug cargo test` shows the elector's logs
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "off".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Election {
    pub instance: InstanceId,
    pub epoch: Epoch,
    pub offset: u64,
    pub at: Instant,
}

#[derive(Default)]
struct LedgerState {
    active: Option<InstanceId>,
    elections: Vec<Election>,
    losses: Vec<(InstanceId, Instant)>,
    violations: Vec<String>,
}

/// Supervisor activity of every instance in a test, in order
#[derive(Default)]
pub struct Ledger {
    inner: Mutex<LedgerState>,
}

impl Ledger {
    pub fn elections(&self) -> Vec<Election> {
        self.inner.lock().unwrap().elections.clone()
    }

    pub fn elections_of(&self, id: &str) -> Vec<Election> {
        self.elections()
            .into_iter()
            .filter(|e| e.instance.0 == id)
            .collect()
    }

    pub fn losses_of(&self, id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .losses
            .iter()
            .filter(|(instance, _)| instance.0 == id)
            .count()
    }

    pub fn active(&self) -> Option<InstanceId> {
        self.inner.lock().unwrap().active.clone()
    }

    /// Overlapping or duplicate supervisor starts
    pub fn assert_clean(&self) {
        let violations = &self.inner.lock().unwrap().violations;
        assert!(violations.is_empty(), "{violations:#?}");
    }
}

/// Supervisor that only records what it was asked to do
pub struct RecordingSupervisor {
    id: InstanceId,
    ledger: Arc<Ledger>,
    running: Mutex<Option<CheckpointHandle>>,
    failing_starts: AtomicU32,
}

impl RecordingSupervisor {
    pub fn new(id: &str, ledger: Arc<Ledger>) -> Self {
        Self {
            id: InstanceId::from(id),
            ledger,
            running: Mutex::new(None),
            failing_starts: AtomicU32::new(0),
        }
    }

    /// Make the next `count` starts fail
    pub fn fail_starts(&self, count: u32) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    /// Checkpoint handle of the running epoch
    pub fn checkpoint(&self) -> Option<CheckpointHandle> {
        self.running.lock().unwrap().clone()
    }
}

#[async_trait]
impl Supervisor for RecordingSupervisor {
    async fn on_leader_elected(&self, ctx: LeadershipContext) -> Result<(), SupervisorError> {
        if 0 < self.failing_starts.load(Ordering::SeqCst) {
            self.failing_starts.fetch_sub(1, Ordering::SeqCst);
            return Err(SupervisorError::Start("scripted failure".into()));
        }

        let mut ledger = self.ledger.inner.lock().unwrap();
        if let Some(active) = &ledger.active {
            let violation = format!(
                "{} elected in epoch {} while {} is active",
                self.id, ctx.epoch, active
            );
            ledger.violations.push(violation);
        }
        let mut running = self.running.lock().unwrap();
        if running.is_some() {
            let violation = format!("{} started twice", self.id);
            ledger.violations.push(violation);
        }

        ledger.active = Some(self.id.clone());
        ledger.elections.push(Election {
            instance: self.id.clone(),
            epoch: ctx.epoch,
            offset: ctx.offset,
            at: Instant::now(),
        });
        *running = Some(ctx.checkpoint);
        Ok(())
    }

    async fn on_leader_lost(&self) {
        let mut ledger = self.ledger.inner.lock().unwrap();
        if self.running.lock().unwrap().take().is_none() {
            return;
        }
        if ledger.active.as_ref() == Some(&self.id) {
            ledger.active = None;
        }
        ledger.losses.push((self.id.clone(), Instant::now()));
    }
}

/// One replica on a shared [`MemStore`] with its own connection
pub struct TestInstance {
    pub client: MemClient,
    pub supervisor: Arc<RecordingSupervisor>,
    elector: Option<Elector>,
}

impl TestInstance {
    pub async fn start(store: &MemStore, ledger: &Arc<Ledger>, id: &str) -> anyhow::Result<Self> {
        Self::start_with(store, ledger, id, |params| params).await
    }

    pub async fn start_with(
        store: &MemStore,
        ledger: &Arc<Ledger>,
        id: &str,
        f: impl FnOnce(Parameters) -> Parameters,
    ) -> anyhow::Result<Self> {
        init_logging();
        let params = f(Parameters::builder()
            .service("svc")
            .instance_id(InstanceId::from(id))
            .build());
        let client = store.connect();
        let supervisor = Arc::new(RecordingSupervisor::new(id, ledger.clone()));
        let elector = Elector::start(params, Arc::new(client.clone()), supervisor.clone()).await?;
        Ok(Self {
            client,
            supervisor,
            elector: Some(elector),
        })
    }

    pub fn elector(&self) -> &Elector {
        self.elector.as_ref().expect("Elector was already dropped")
    }

    pub fn is_leader(&self) -> bool {
        self.elector().is_leader()
    }

    /// Drop the elector without stopping it
    pub fn drop_elector(&mut self) {
        self.elector.take();
    }
}
