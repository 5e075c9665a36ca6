//! Alert snapshot cache
//!
//! ## Responsibilities
//!
//! - Hold the frames that triggered alerts, keyed by a generated id
//! - Serve them to the web API for `Alert.snapshot_url` links
//! - Evict oldest-first past a fixed capacity
//!
//! Frames are small JPEGs and alerts are rare, so an in-memory ring is
//! enough; restarts drop old snapshot links, which clients already treat
//! as optional.

use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Snapshots kept before the oldest is evicted
pub const SNAPSHOT_CAPACITY: usize = 32;

#[derive(Default)]
struct Inner {
    /// Insertion order, oldest first
    order: VecDeque<String>,
    frames: HashMap<String, Vec<u8>>,
}

/// SnapshotCache instance
pub struct SnapshotCache {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::with_capacity(SNAPSHOT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity,
        }
    }

    /// Store a frame and return the URL path it is served under
    pub async fn insert(&self, frame: Vec<u8>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;

        while inner.order.len() >= self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.frames.remove(&evicted);
            }
        }

        inner.order.push_back(id.clone());
        inner.frames.insert(id.clone(), frame);
        tracing::debug!(snapshot_id = %id, count = inner.order.len(), "Snapshot cached");
        format!("/api/snapshots/{}", id)
    }

    /// Frame bytes for a snapshot id, None once evicted
    pub async fn get(&self, id: &str) -> Option<Vec<u8>> {
        let inner = self.inner.read().await;
        inner.frames.get(id).cloned()
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}
