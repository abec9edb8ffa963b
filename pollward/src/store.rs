//! Coordination store abstraction
//!
//! The store itself (strongly consistent KV with TTL leases and atomic
//! create-if-absent) is external. Everything in this crate talks to it
//! through [`StoreHandle`], which bounds every call with a timeout.
use async_trait::async_trait;
use pollward_api::{LeaseId, Record};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::ElectionResult;

pub mod mem;

#[cfg(test)]
pub(crate) mod gated;

#[cfg(feature = "etcd")]
pub mod etcd;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable during {op}: {reason}")]
    Unavailable { op: &'static str, reason: String },
    #[error("store call {op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),
    #[error("store rejected {op}: {reason}")]
    Rejected { op: &'static str, reason: String },
}

impl StoreError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Timeout { .. })
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Operations consumed from the coordination store
///
/// Every call is a network round trip and a suspension point.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Unconditional write, optionally bound to a lease
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()>;

    /// Atomic create: `true` if the key did not exist and is now written
    async fn put_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId)
        -> StoreResult<bool>;

    /// `true` if something was deleted
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Atomic compare-and-delete: only if the current value is `expected`
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool>;

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId>;

    /// Extend the lease by its TTL; [`StoreError::LeaseNotFound`] if it already expired
    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<()>;

    /// Revoke the lease, deleting every key bound to it
    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()>;
}

/// Shared, timeout-bounded access to a [`CoordinationStore`]
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn CoordinationStore>,
    timeout: Duration,
}

impl StoreHandle {
    pub fn new(inner: Arc<dyn CoordinationStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = StoreResult<T>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_elapsed) => Err(StoreError::Timeout {
                op,
                timeout: self.timeout,
            }),
        }
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.bounded("get", self.inner.get(key)).await
    }

    pub async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.bounded("put", self.inner.put(key, value, lease)).await
    }

    pub async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<bool> {
        self.bounded("put_if_absent", self.inner.put_if_absent(key, value, lease))
            .await
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.bounded("delete", self.inner.delete(key)).await
    }

    pub async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.bounded(
            "delete_if_equals",
            self.inner.delete_if_equals(key, expected),
        )
        .await
    }

    pub async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.bounded("get_prefix", self.inner.get_prefix(prefix))
            .await
    }

    pub async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.bounded("lease_grant", self.inner.lease_grant(ttl)).await
    }

    pub async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.bounded("lease_keep_alive", self.inner.lease_keep_alive(lease))
            .await
    }

    pub async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.bounded("lease_revoke", self.inner.lease_revoke(lease))
            .await
    }

    /// Read and decode a record
    pub async fn get_record<R: Record>(&self, key: &str) -> ElectionResult<Option<R>> {
        Ok(self.get(key).await?.map(|bytes| R::decode(&bytes)).transpose()?)
    }
}
