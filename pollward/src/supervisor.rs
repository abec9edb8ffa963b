//! Supervisor callbacks and the long-poll supervisor started by them
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pollward_api::{Epoch, WorkRecord};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::checkpoint::CheckpointHandle;
use crate::error::ElectionError;
use crate::task::TaskHandle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("supervisor already running")]
    AlreadyRunning,
    #[error("supervisor failed to start: {0}")]
    Start(String),
}

/// Everything the supervisor gets on election
pub struct LeadershipContext {
    pub epoch: Epoch,
    /// Last checkpointed cursor, `0` if none
    pub offset: u64,
    pub checkpoint: CheckpointHandle,
}

/// Lifecycle callbacks driven by the elector
///
/// For one instance `on_leader_elected` and `on_leader_lost` strictly
/// alternate, and both are awaited before the elector moves on.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// An error makes the elector release leadership right away
    async fn on_leader_elected(&self, ctx: LeadershipContext) -> Result<(), SupervisorError>;

    /// Must return only once the supervised work fully stopped
    async fn on_leader_lost(&self);
}

/// One upstream update; `work` is `None` for updates that carry nothing
/// to hand downstream, which still advance the cursor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolledUpdate {
    pub update_id: u64,
    pub work: Option<WorkRecord>,
}

#[async_trait]
pub trait UpdateSource: Send + Sync + 'static {
    /// Long poll for updates with `update_id >= from`
    ///
    /// Polling from `from` acknowledges every update below it upstream.
    async fn poll(&self, from: u64) -> Result<Vec<PolledUpdate>, BoxError>;
}

/// Durable at-least-once queue of work records
#[async_trait]
pub trait WorkSink: Send + Sync + 'static {
    async fn publish(&self, work: &WorkRecord) -> Result<(), BoxError>;
}

#[derive(Default)]
struct PollerCounters {
    batches: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub batches: u64,
    pub published: u64,
    pub publish_failures: u64,
}

struct RunningPoller {
    shutdown_tx: watch::Sender<bool>,
    task: TaskHandle,
}

/// Runs the long-poll loop while this instance leads
///
/// Per batch: publish every work record, save the highest update id, and
/// only then poll again, so an update is acknowledged upstream only after
/// it is both queued and checkpointed.
pub struct PollingSupervisor<S, K> {
    source: Arc<S>,
    sink: Arc<K>,
    retry_max: Duration,
    running: tokio::sync::Mutex<Option<RunningPoller>>,
    counters: Arc<PollerCounters>,
}

impl<S, K> PollingSupervisor<S, K>
where
    S: UpdateSource,
    K: WorkSink,
{
    pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(30);

    pub fn new(source: S, sink: K) -> Self {
        Self {
            source: Arc::new(source),
            sink: Arc::new(sink),
            retry_max: Self::DEFAULT_RETRY_MAX,
            running: tokio::sync::Mutex::new(None),
            counters: Arc::default(),
        }
    }

    pub fn with_retry_max(mut self, retry_max: Duration) -> Self {
        self.retry_max = retry_max;
        self
    }

    pub fn stats(&self) -> PollerStats {
        PollerStats {
            batches: self.counters.batches.load(Ordering::SeqCst),
            published: self.counters.published.load(Ordering::SeqCst),
            publish_failures: self.counters.publish_failures.load(Ordering::SeqCst),
        }
    }
}

#[async_trait]
impl<S, K> Supervisor for PollingSupervisor<S, K>
where
    S: UpdateSource,
    K: WorkSink,
{
    async fn on_leader_elected(&self, ctx: LeadershipContext) -> Result<(), SupervisorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = Poller {
            source: self.source.clone(),
            sink: self.sink.clone(),
            counters: self.counters.clone(),
            checkpoint: ctx.checkpoint,
            shutdown_rx,
            retry_max: self.retry_max,
        };
        info!(epoch = %ctx.epoch, from = ctx.offset + 1, "Starting poll loop");
        *running = Some(RunningPoller {
            shutdown_tx,
            task: TaskHandle::spawn("poll loop", poller.run(ctx.offset + 1)),
        });
        Ok(())
    }

    async fn on_leader_lost(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);
        running.task.join().await;
    }
}

struct Poller<S, K> {
    source: Arc<S>,
    sink: Arc<K>,
    counters: Arc<PollerCounters>,
    checkpoint: CheckpointHandle,
    shutdown_rx: watch::Receiver<bool>,
    retry_max: Duration,
}

impl<S, K> Poller<S, K>
where
    S: UpdateSource,
    K: WorkSink,
{
    const RETRY_INITIAL: Duration = Duration::from_millis(100);

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep unless asked to stop first; `false` on shutdown
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => !self.is_shutting_down(),
            _ = self.shutdown_rx.changed() => false,
        }
    }

    async fn run(mut self, mut from: u64) {
        let _log = scopeguard::guard((), |_| {
            info!("Poll loop is done");
        });
        let mut backoff = Backoff::new(Self::RETRY_INITIAL, self.retry_max);

        while !self.is_shutting_down() {
            let polled = tokio::select! {
                res = self.source.poll(from) => res,
                _ = self.shutdown_rx.changed() => break,
            };

            let updates = match polled {
                Ok(updates) => {
                    backoff.reset();
                    updates
                }
                Err(e) => {
                    warn!(from, error = %e, "Poll failed");
                    if !self.pause(backoff.next_delay()).await {
                        break;
                    }
                    continue;
                }
            };

            let Some(last) = updates.iter().map(|u| u.update_id).max() else {
                continue;
            };
            self.counters.batches.fetch_add(1, Ordering::SeqCst);

            for work in updates.iter().filter_map(|u| u.work.as_ref()) {
                if !self.publish(work).await {
                    return;
                }
            }

            match self.save(last).await {
                Some(saved) => {
                    self.checkpoint
                        .add_processed(u64::try_from(updates.len()).unwrap_or(u64::MAX));
                    from = saved + 1;
                }
                None => return,
            }
        }
    }

    /// Publish, retrying until it works; `false` if stopped meanwhile
    async fn publish(&mut self, work: &WorkRecord) -> bool {
        let mut backoff = Backoff::new(Self::RETRY_INITIAL, self.retry_max);
        loop {
            match self.sink.publish(work).await {
                Ok(()) => {
                    self.counters.published.fetch_add(1, Ordering::SeqCst);
                    debug!(update_id = work.update_id, "Work published");
                    return true;
                }
                Err(e) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::SeqCst);
                    warn!(update_id = work.update_id, error = %e, "Publish failed, retrying");
                    if !self.pause(backoff.next_delay()).await {
                        return false;
                    }
                }
            }
        }
    }

    /// Checkpoint `cursor`; `None` once leadership is gone
    async fn save(&mut self, cursor: u64) -> Option<u64> {
        let mut backoff = Backoff::new(Self::RETRY_INITIAL, self.retry_max);
        loop {
            match self.checkpoint.save_offset(cursor).await {
                Ok(saved) => return Some(saved),
                Err(e @ (ElectionError::NotLeader | ElectionError::Fenced { .. })) => {
                    info!(cursor, error = %e, "No longer leading, stopping poll loop");
                    return None;
                }
                Err(e) => {
                    warn!(cursor, error = %e, "Checkpoint failed, retrying");
                    if !self.pause(backoff.next_delay()).await {
                        return None;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::OffsetCheckpoint;
    use crate::elector::ElectorShared;
    use crate::lease::Lease;
    use crate::params::Parameters;
    use crate::store::mem::MemStore;
    use crate::store::StoreHandle;
    use pollward_api::{ContentType, InstanceId, LeaseId};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<PolledUpdate>, String>>>,
        polled_from: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn poll(&self, from: u64) -> Result<Vec<PolledUpdate>, BoxError> {
            self.polled_from.lock().unwrap().push(from);
            let next = self.batches.lock().unwrap().pop_front();
            match next {
                Some(batch) => batch.map_err(BoxError::from),
                None => std::future::pending().await,
            }
        }
    }

    #[derive(Default)]
    struct FlakySink {
        failures_left: Mutex<u32>,
        published: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl WorkSink for FlakySink {
        async fn publish(&self, work: &WorkRecord) -> Result<(), BoxError> {
            let mut failures_left = self.failures_left.lock().unwrap();
            if 0 < *failures_left {
                *failures_left -= 1;
                return Err("queue unavailable".into());
            }
            self.published.lock().unwrap().push(work.update_id);
            Ok(())
        }
    }

    fn update(update_id: u64, text: Option<&str>) -> PolledUpdate {
        PolledUpdate {
            update_id,
            work: text.map(|text| WorkRecord {
                content_type: ContentType::Text,
                update_id,
                user_id: "42".into(),
                source_timestamp: 0,
                received_timestamp_ms: 0,
                text: Some(text.into()),
                media_link: None,
                class_id: None,
            }),
        }
    }

    fn leadership(store: &MemStore, epoch: Epoch, offset: u64) -> (Arc<ElectorShared>, LeadershipContext) {
        let shared = Arc::new(ElectorShared::new(
            Parameters::builder().service("svc").build(),
        ));
        shared.enter_leadership(
            epoch,
            Lease {
                id: LeaseId(1),
                ttl: Duration::from_secs(15),
                deadline: Instant::now() + Duration::from_secs(15),
            },
            offset,
        );
        let checkpoint = OffsetCheckpoint::new(
            StoreHandle::new(Arc::new(store.connect()), Duration::from_secs(1)),
            "/bots/svc/offset".into(),
            InstanceId::from("a"),
        );
        let ctx = LeadershipContext {
            epoch,
            offset,
            checkpoint: CheckpointHandle::new(checkpoint, shared.clone(), epoch),
        };
        (shared, ctx)
    }

    async fn stored_cursor(store: &MemStore) -> anyhow::Result<u64> {
        Ok(OffsetCheckpoint::new(
            StoreHandle::new(Arc::new(store.connect()), Duration::from_secs(1)),
            "/bots/svc/offset".into(),
            InstanceId::from("reader"),
        )
        .load()
        .await?)
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_then_checkpoints() -> anyhow::Result<()> {
        let store = MemStore::new();
        let source = ScriptedSource::default();
        source.batches.lock().unwrap().extend([
            Ok(vec![update(11, Some("hi")), update(12, None), update(13, Some("yo"))]),
            Err("network".into()),
            Ok(vec![update(14, Some("again"))]),
        ]);
        let sink = FlakySink {
            failures_left: Mutex::new(2),
            ..Default::default()
        };
        let supervisor = Arc::new(PollingSupervisor::new(source, sink));

        let (shared, ctx) = leadership(&store, Epoch(1), 10);
        supervisor.on_leader_elected(ctx).await?;
        sleep(Duration::from_secs(5)).await;
        supervisor.on_leader_lost().await;

        assert_eq!(*supervisor.sink.published.lock().unwrap(), vec![11, 13, 14]);
        assert_eq!(
            *supervisor.source.polled_from.lock().unwrap(),
            vec![11, 14, 14, 15]
        );
        assert_eq!(stored_cursor(&store).await?, 14);
        assert_eq!(shared.stats().updates_processed, 4);
        assert_eq!(
            supervisor.stats(),
            PollerStats {
                batches: 2,
                published: 3,
                publish_failures: 2,
            }
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_leadership_is_gone() -> anyhow::Result<()> {
        let store = MemStore::new();
        let source = ScriptedSource::default();
        source
            .batches
            .lock()
            .unwrap()
            .push_back(Ok(vec![update(5, Some("late"))]));
        let supervisor = Arc::new(PollingSupervisor::new(source, FlakySink::default()));

        let (shared, ctx) = leadership(&store, Epoch(1), 0);
        shared.leave_leadership();
        supervisor.on_leader_elected(ctx).await?;
        sleep(Duration::from_secs(1)).await;

        // published but never checkpointed, so it will be replayed
        assert_eq!(*supervisor.sink.published.lock().unwrap(), vec![5]);
        assert_eq!(stored_cursor(&store).await?, 0);
        assert_eq!(*supervisor.source.polled_from.lock().unwrap(), vec![1]);

        supervisor.on_leader_lost().await;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn refuses_a_second_start() -> anyhow::Result<()> {
        let store = MemStore::new();
        let supervisor =
            PollingSupervisor::new(ScriptedSource::default(), FlakySink::default());

        let (_shared, ctx) = leadership(&store, Epoch(1), 0);
        supervisor.on_leader_elected(ctx).await?;
        let (_shared, ctx) = leadership(&store, Epoch(2), 0);
        assert!(matches!(
            supervisor.on_leader_elected(ctx).await,
            Err(SupervisorError::AlreadyRunning)
        ));

        supervisor.on_leader_lost().await;
        supervisor.on_leader_lost().await;
        Ok(())
    }
}
