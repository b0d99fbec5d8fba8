//! Per-identity admission control.
//!
//! One in-flight unit of work per identity: a grant marks the identity busy,
//! a second attempt while the mark is held is refused (a business outcome,
//! not an error). The busy set is striped so unrelated identities never
//! contend on the same lock.

use std::collections::HashSet;

use tokio::sync::Mutex;

use crate::domain::UserId;

const SHARDS: usize = 16;

pub struct AdmissionGate {
    shards: Vec<Mutex<HashSet<i64>>>,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashSet::new())).collect(),
        }
    }

    fn shard(&self, user_id: UserId) -> &Mutex<HashSet<i64>> {
        &self.shards[(user_id.0.unsigned_abs() as usize) % SHARDS]
    }

    /// Atomically check-and-mark the identity busy. Returns `false` when a
    /// previous grant for the same identity has not been released yet.
    pub async fn try_grant(&self, user_id: UserId) -> bool {
        self.shard(user_id).lock().await.insert(user_id.0)
    }

    /// Clear the busy mark. Releasing an identity that holds no grant is
    /// harmless but logged; callers on error paths do not need to track
    /// whether the grant was ever taken.
    pub async fn release(&self, user_id: UserId) {
        if !self.shard(user_id).lock().await.remove(&user_id.0) {
            tracing::warn!(user = user_id.0, "release without a matching grant");
        }
    }

    pub async fn is_busy(&self, user_id: UserId) -> bool {
        self.shard(user_id).lock().await.contains(&user_id.0)
    }
}
