//! Records stored in the coordination store
//!
//! All values are MessagePack maps (named fields), so a newer replica
//! can add fields without breaking older ones during a rolling upgrade.
use derive_more::Display;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::{Epoch, InstanceId, LeaseId};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Encoding shared by every stored record
pub trait Record: Serialize + DeserializeOwned {
    fn encode(&self) -> CodecResult<Vec<u8>> {
        Ok(rmp_serde::encode::to_vec_named(self)?)
    }

    fn decode(bytes: &[u8]) -> CodecResult<Self> {
        Ok(rmp_serde::decode::from_slice(bytes)?)
    }
}

/// Content of the leader key
///
/// At most one exists at a time: it is only ever created with a
/// conditional put, and is bound to the owner's lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderRecord {
    pub owner: InstanceId,
    pub lease_id: LeaseId,
    pub epoch: Epoch,
    pub written_at_ms: u64,
}

impl Record for LeaderRecord {}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Registered, election loop not running yet
    #[display(fmt = "starting")]
    Starting,
    #[display(fmt = "follower")]
    Follower,
    #[display(fmt = "candidate")]
    Candidate,
    #[display(fmt = "leader")]
    Leader,
}

/// Per-instance liveness record, bound to a TTL lease
///
/// Its presence is the only signal used to decide whether an
/// instance is alive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: InstanceId,
    pub status: HealthStatus,
    pub is_leader: bool,
    /// Epoch led by this instance, if it is the leader
    #[serde(default)]
    pub epoch: Option<Epoch>,
    pub offset: u64,
    pub start_time_ms: u64,
    pub last_seen_ms: u64,
    #[serde(default)]
    pub updates_processed: u64,
}

impl Record for HealthRecord {}

/// Durable progress cursor of the upstream long poll
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    /// Last fully handled upstream update id; never decreases
    pub cursor: u64,
    pub owner: InstanceId,
    /// Epoch of the leader that wrote it
    pub epoch: Epoch,
    pub written_at_ms: u64,
}

impl Record for OffsetRecord {}

#[test]
fn leader_record_codec() {
    let record = LeaderRecord {
        owner: InstanceId::from("a"),
        lease_id: LeaseId(7),
        epoch: Epoch(3),
        written_at_ms: 1_700_000_000_000,
    };

    let bytes = record.encode().unwrap();
    assert_eq!(LeaderRecord::decode(&bytes).unwrap(), record);
}

#[test]
fn health_record_tolerates_missing_optional_fields() {
    #[derive(Serialize)]
    struct OldHealthRecord {
        instance_id: InstanceId,
        status: HealthStatus,
        is_leader: bool,
        offset: u64,
        start_time_ms: u64,
        last_seen_ms: u64,
    }

    let bytes = rmp_serde::encode::to_vec_named(&OldHealthRecord {
        instance_id: InstanceId::from("old"),
        status: HealthStatus::Follower,
        is_leader: false,
        offset: 10,
        start_time_ms: 1,
        last_seen_ms: 2,
    })
    .unwrap();

    let record = HealthRecord::decode(&bytes).unwrap();
    assert_eq!(record.epoch, None);
    assert_eq!(record.updates_processed, 0);
    assert_eq!(record.offset, 10);
}

#[test]
fn garbage_is_a_decode_error() {
    assert!(matches!(
        OffsetRecord::decode(&[0xc1]),
        Err(CodecError::Decode(_))
    ));
}
