#![deny(clippy::as_conversions)]

mod backoff;
mod checkpoint;
mod elector;
mod error;
mod health;
mod lease;
mod params;
mod status;
pub mod store;
pub mod supervisor;
mod task;

pub use self::backoff::Backoff;
pub use self::checkpoint::{CheckpointHandle, OffsetCheckpoint};
pub use self::elector::{Elector, ElectorStats, StepDownReason};
pub use self::error::{ElectionError, ElectionResult};
pub use self::health::{HealthExtra, HealthReporter};
pub use self::lease::{Lease, LeaseManager};
pub use self::params::Parameters;
pub use self::status::{ClusterSnapshot, ClusterStatus, ClusterStatusView};
pub use self::store::{CoordinationStore, StoreError, StoreHandle, StoreResult};
pub use self::supervisor::{LeadershipContext, Supervisor, SupervisorError};

pub use pollward_api as api;
