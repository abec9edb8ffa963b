use pollward_api::{CodecError, Epoch, LeaseId};
use thiserror::Error;

use crate::store::StoreError;
use crate::supervisor::SupervisorError;

#[derive(Error, Debug)]
pub enum ElectionError {
    /// Transient: retried with backoff, never fatal once running
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    /// The store answered and refused the operation; not transient, but
    /// the loop still starts a fresh attempt on its next tick
    #[error("coordination store rejected the request: {0}")]
    StoreRejected(#[source] StoreError),
    /// The lease is gone; the owner must step down immediately
    #[error("lease {0} expired")]
    LeaseExpired(LeaseId),
    /// Treated like a failed acquisition
    #[error("supervisor failed to start: {0}")]
    SupervisorStartFailure(#[source] SupervisorError),
    /// A newer epoch already wrote; the writer is a demoted leader
    #[error("write from epoch {ours} fenced off by epoch {observed}")]
    Fenced { ours: Epoch, observed: Epoch },
    #[error("not the leader")]
    NotLeader,
    /// Could not reach the store at startup
    #[error("could not connect to the coordination store: {0}")]
    Connect(#[source] StoreError),
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("record codec error: {0}")]
    Codec(#[from] CodecError),
}

impl ElectionError {
    /// Fatal errors are surfaced to the operator; everything else is retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ElectionError::Connect(_) | ElectionError::InvalidParameters(_)
        )
    }
}

impl From<StoreError> for ElectionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::LeaseNotFound(lease) => ElectionError::LeaseExpired(lease),
            e @ StoreError::Rejected { .. } => ElectionError::StoreRejected(e),
            e => ElectionError::StoreUnavailable(e),
        }
    }
}

pub type ElectionResult<T> = std::result::Result<T, ElectionError>;

#[test]
fn lease_not_found_means_expired() {
    assert!(matches!(
        ElectionError::from(StoreError::LeaseNotFound(LeaseId(3))),
        ElectionError::LeaseExpired(LeaseId(3))
    ));
    let e = ElectionError::from(StoreError::Unavailable {
        op: "get",
        reason: "refused".into(),
    });
    assert!(matches!(e, ElectionError::StoreUnavailable(_)));
    assert!(!e.is_fatal());
    assert!(ElectionError::Connect(StoreError::Unavailable {
        op: "get",
        reason: "refused".into()
    })
    .is_fatal());
}

#[test]
fn rejection_is_not_reported_as_unavailable() {
    let e = ElectionError::from(StoreError::Rejected {
        op: "put",
        reason: "value too large".into(),
    });
    assert!(matches!(
        e,
        ElectionError::StoreRejected(StoreError::Rejected { op: "put", .. })
    ));
    assert!(!e.is_fatal());
}
