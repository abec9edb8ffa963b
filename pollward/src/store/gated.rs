//! [`MemClient`] wrapper that can park a lease refresh mid-flight
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use pollward_api::LeaseId;
use tokio::sync::Notify;

use super::mem::MemClient;
use super::{CoordinationStore, StoreResult};

pub(crate) struct GatedStore {
    inner: MemClient,
    hold_next: AtomicBool,
    parked: Notify,
    resume: Notify,
}

impl GatedStore {
    pub(crate) fn new(inner: MemClient) -> Self {
        Self {
            inner,
            hold_next: AtomicBool::new(false),
            parked: Notify::new(),
            resume: Notify::new(),
        }
    }

    /// Make the next `lease_keep_alive` wait for [`GatedStore::resume`]
    pub(crate) fn hold_next_keep_alive(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }

    /// Wait until a held `lease_keep_alive` is parked
    pub(crate) async fn keep_alive_parked(&self) {
        self.parked.notified().await
    }

    pub(crate) fn resume(&self) {
        self.resume.notify_one();
    }
}

#[async_trait]
impl CoordinationStore for GatedStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.inner.put(key, value, lease).await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<bool> {
        self.inner.put_if_absent(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.inner.delete_if_equals(key, expected).await
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.inner.get_prefix(prefix).await
    }

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.inner.lease_grant(ttl).await
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.parked.notify_one();
            self.resume.notified().await;
        }
        self.inner.lease_keep_alive(lease).await
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.inner.lease_revoke(lease).await
    }
}
