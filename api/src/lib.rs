use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

mod keys;
pub use self::keys::*;

mod record;
pub use self::record::*;

mod work;
pub use self::work::*;

/// Identity of one running replica
///
/// Generated fresh at process start, so a restarted replica
/// never inherits leadership state from its previous life.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// First 8 characters, for log lines and status output
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Id of a TTL lease granted by the coordination store
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseId(pub i64);

/// Leadership epoch (fencing token)
///
/// Strictly increases with every successful acquisition. Writes
/// tagged with an epoch older than the latest observed one are stale.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const ZERO: Epoch = Epoch(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Role of an instance in the election
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    #[display(fmt = "follower")]
    Follower,
    #[display(fmt = "candidate")]
    Candidate,
    #[display(fmt = "leader")]
    Leader,
}

/// Milliseconds since unix epoch, as stored in records
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[test]
fn epoch_ordering() {
    assert!(Epoch::ZERO < Epoch::ZERO.next());
    assert_eq!(Epoch(41).next(), Epoch(42));
    assert_eq!(Epoch::default(), Epoch::ZERO);
}

#[test]
fn instance_id_short() {
    let id = InstanceId::from("0123456789abcdef");
    assert_eq!(id.short(), "01234567");
    assert_eq!(InstanceId::from("abc").short(), "abc");
    assert_ne!(InstanceId::generate(), InstanceId::generate());
}
