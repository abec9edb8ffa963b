use std::sync::Arc;

use pollward_api::{unix_millis, Epoch, InstanceId, OffsetRecord, Record};
use tracing::{debug, warn};

use crate::elector::{ElectorShared, StepDownReason};
use crate::error::{ElectionError, ElectionResult};
use crate::store::StoreHandle;

/// Durable cursor of the upstream long poll
#[derive(Clone)]
pub struct OffsetCheckpoint {
    store: StoreHandle,
    key: String,
    instance_id: InstanceId,
}

impl OffsetCheckpoint {
    pub fn new(store: StoreHandle, key: String, instance_id: InstanceId) -> Self {
        Self {
            store,
            key,
            instance_id,
        }
    }

    /// Last saved cursor, `0` if nothing was ever saved
    pub async fn load(&self) -> ElectionResult<u64> {
        Ok(self.load_record().await?.map(|r| r.cursor).unwrap_or(0))
    }

    pub async fn load_record(&self) -> ElectionResult<Option<OffsetRecord>> {
        self.store.get_record(&self.key).await
    }

    /// Persist `cursor` on behalf of the leader of `epoch`
    ///
    /// Refused with [`ElectionError::Fenced`] if a newer epoch already
    /// wrote. A cursor below the stored one is not written. Returns the
    /// cursor stored afterwards.
    pub async fn save(&self, cursor: u64, epoch: Epoch) -> ElectionResult<u64> {
        if let Some(stored) = self.load_record().await? {
            if epoch < stored.epoch {
                return Err(ElectionError::Fenced {
                    ours: epoch,
                    observed: stored.epoch,
                });
            }
            if cursor < stored.cursor {
                warn!(
                    cursor,
                    stored = stored.cursor,
                    "Refusing to move the checkpoint backwards"
                );
                return Ok(stored.cursor);
            }
            if cursor == stored.cursor && epoch == stored.epoch {
                return Ok(cursor);
            }
        }

        let record = OffsetRecord {
            cursor,
            owner: self.instance_id.clone(),
            epoch,
            written_at_ms: unix_millis(),
        };
        self.store.put(&self.key, record.encode()?, None).await?;
        debug!(cursor, %epoch, "Checkpoint saved");
        Ok(cursor)
    }
}

/// `saveOffset` callback handed to the supervisor for one epoch
///
/// Only works while this instance is still the leader of that epoch.
#[derive(Clone)]
pub struct CheckpointHandle {
    checkpoint: OffsetCheckpoint,
    shared: Arc<ElectorShared>,
    epoch: Epoch,
}

impl CheckpointHandle {
    pub(crate) fn new(checkpoint: OffsetCheckpoint, shared: Arc<ElectorShared>, epoch: Epoch) -> Self {
        Self {
            checkpoint,
            shared,
            epoch,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Whether saving can still succeed
    pub fn is_current(&self) -> bool {
        self.shared.is_leader_of(self.epoch)
    }

    pub async fn save_offset(&self, cursor: u64) -> ElectionResult<u64> {
        if !self.is_current() {
            return Err(ElectionError::NotLeader);
        }

        match self.checkpoint.save(cursor, self.epoch).await {
            Ok(saved) => {
                self.shared.record_offset(saved);
                Ok(saved)
            }
            Err(e @ ElectionError::Fenced { .. }) => {
                warn!(error = %e, "Checkpoint write fenced, stepping down");
                self.shared.request_step_down(self.epoch, StepDownReason::Fenced);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Count upstream updates fully handed downstream
    pub fn add_processed(&self, count: u64) {
        self.shared.add_updates_processed(count);
    }
}
