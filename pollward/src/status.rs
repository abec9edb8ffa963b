//! Read-only cluster view, for observability only
use pollward_api::{Epoch, HealthRecord, InstanceId, Keys, LeaderRecord, OffsetRecord, Record, Role};
use serde::Serialize;
use tracing::debug;

use crate::error::ElectionResult;
use crate::store::StoreHandle;

/// What the store currently says about the service
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterSnapshot {
    pub current_leader: Option<InstanceId>,
    pub leader_epoch: Option<Epoch>,
    /// Every instance with a live health record
    pub active_instances: Vec<HealthRecord>,
    pub checkpoint: Option<u64>,
}

/// [`ClusterSnapshot`] plus the local instance's view
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    #[serde(flatten)]
    pub cluster: ClusterSnapshot,
    pub is_leader: bool,
    pub instance_id: InstanceId,
    pub role: Role,
    pub offset: u64,
}

pub struct ClusterStatusView {
    store: StoreHandle,
    keys: Keys,
}

impl ClusterStatusView {
    pub fn new(store: StoreHandle, keys: Keys) -> Self {
        Self { store, keys }
    }

    pub async fn snapshot(&self) -> ElectionResult<ClusterSnapshot> {
        let leader = self
            .store
            .get_record::<LeaderRecord>(&self.keys.leader())
            .await?;
        let checkpoint = self
            .store
            .get_record::<OffsetRecord>(&self.keys.offset())
            .await?;

        let mut active_instances = vec![];
        for (key, value) in self.store.get_prefix(&self.keys.health_prefix()).await? {
            match HealthRecord::decode(&value) {
                Ok(record) => active_instances.push(record),
                Err(e) => debug!(%key, error = %e, "Skipping undecodable health record"),
            }
        }

        Ok(ClusterSnapshot {
            current_leader: leader.as_ref().map(|l| l.owner.clone()),
            leader_epoch: leader.map(|l| l.epoch),
            active_instances,
            checkpoint: checkpoint.map(|c| c.cursor),
        })
    }
}
