//! In-process coordination store
//!
//! Linearizable (one lock around everything) with TTL leases measured on
//! the tokio clock, so tests running with paused time see leases expire
//! deterministically. Every instance talks to it through its own
//! [`MemClient`], which can be disconnected to simulate a crash or a
//! network partition of that instance.
use async_trait::async_trait;
use pollward_api::LeaseId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

use super::{CoordinationStore, StoreError, StoreResult};

#[derive(Debug)]
struct MemEntry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct MemLease {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct MemState {
    kv: BTreeMap<String, MemEntry>,
    leases: HashMap<LeaseId, MemLease>,
    next_lease_id: i64,
}

impl MemState {
    fn expire(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            trace!(lease = %id, "Lease expired");
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        for key in lease.keys {
            if self.kv.get(&key).and_then(|entry| entry.lease) == Some(id) {
                self.kv.remove(&key);
            }
        }
        true
    }

    fn remove(&mut self, key: &str) -> bool {
        let Some(entry) = self.kv.remove(key) else {
            return false;
        };
        if let Some(lease) = entry.lease.and_then(|id| self.leases.get_mut(&id)) {
            lease.keys.remove(key);
        }
        true
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        if let Some(id) = lease {
            self.leases
                .get_mut(&id)
                .ok_or(StoreError::LeaseNotFound(id))?
                .keys
                .insert(key.to_owned());
        }

        let prev = self
            .kv
            .insert(key.to_owned(), MemEntry { value, lease });

        if let Some(prev_lease) = prev.and_then(|entry| entry.lease) {
            if Some(prev_lease) != lease {
                if let Some(prev_lease) = self.leases.get_mut(&prev_lease) {
                    prev_lease.keys.remove(key);
                }
            }
        }
        Ok(())
    }
}

/// The store itself
///
/// Cheap to clone; all clones share the same data.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client with its own connectivity switch
    pub fn connect(&self) -> MemClient {
        MemClient {
            state: self.state.clone(),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        let mut state = self.state.lock().expect("locking failed");
        state.expire(Instant::now());
        state
    }

    /// Read a key, bypassing any client
    pub fn peek(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().kv.get(key).map(|entry| entry.value.clone())
    }

    /// Number of live (unexpired, unrevoked) leases
    pub fn live_leases(&self) -> usize {
        self.lock().leases.len()
    }
}

/// Connection of one instance to a [`MemStore`]
#[derive(Clone)]
pub struct MemClient {
    state: Arc<Mutex<MemState>>,
    connected: Arc<AtomicBool>,
}

impl MemClient {
    /// Make every following call fail with [`StoreError::Unavailable`]
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Suspend like a network round trip would, then lock the state
    ///
    /// The yield lets concurrently running instances interleave their calls.
    async fn enter(&self, op: &'static str) -> StoreResult<()> {
        tokio::task::yield_now().await;
        if !self.is_connected() {
            return Err(StoreError::Unavailable {
                op,
                reason: "client disconnected".into(),
            });
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        let mut state = self.state.lock().expect("locking failed");
        state.expire(Instant::now());
        state
    }
}

#[async_trait]
impl CoordinationStore for MemClient {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.enter("get").await?;
        Ok(self.lock().kv.get(key).map(|entry| entry.value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>) -> StoreResult<()> {
        self.enter("put").await?;
        self.lock().insert(key, value, lease)
    }

    async fn put_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> StoreResult<bool> {
        self.enter("put_if_absent").await?;
        let mut state = self.lock();
        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state.insert(key, value, Some(lease))?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.enter("delete").await?;
        Ok(self.lock().remove(key))
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> StoreResult<bool> {
        self.enter("delete_if_equals").await?;
        let mut state = self.lock();
        if state.kv.get(key).map(|entry| entry.value.as_slice()) != Some(expected) {
            return Ok(false);
        }
        Ok(state.remove(key))
    }

    async fn get_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
        self.enter("get_prefix").await?;
        Ok(self
            .lock()
            .kv
            .range(prefix.to_owned()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn lease_grant(&self, ttl: Duration) -> StoreResult<LeaseId> {
        self.enter("lease_grant").await?;
        let mut state = self.lock();
        state.next_lease_id += 1;
        let id = LeaseId(state.next_lease_id);
        state.leases.insert(
            id,
            MemLease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> StoreResult<()> {
        self.enter("lease_keep_alive").await?;
        let mut state = self.lock();
        let lease_state = state
            .leases
            .get_mut(&lease)
            .ok_or(StoreError::LeaseNotFound(lease))?;
        lease_state.deadline = Instant::now() + lease_state.ttl;
        Ok(())
    }

    async fn lease_revoke(&self, lease: LeaseId) -> StoreResult<()> {
        self.enter("lease_revoke").await?;
        // revoking an already expired lease is not an error
        self.lock().drop_lease(lease);
        Ok(())
    }
}
