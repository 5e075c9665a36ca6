//! Room/Alert state store
//!
//! ## Responsibilities
//!
//! - Authoritative per-user room state (sensor snapshot, actions, last-seen)
//! - Per-home alert list (pending/resolved)
//! - Atomic read-modify-write operations safe under concurrent writers
//!
//! Every operation is scoped to the owning user; cross-user access fails
//! closed (not-found), never leaking another user's data. The hub's policy
//! engine and fan-out only ever talk to the `StateStore` trait, never to
//! storage specifics.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::models::{Alert, Room, UserIdentity};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Stored user record, password included for credential checks
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub identity: UserIdentity,
    pub password: String,
}

/// Outcome of a timestamped room write.
///
/// Callers must only act on `Applied`; a `Stale` write changed nothing and
/// must not be dispatched or broadcast as if it had.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome<T> {
    /// Write persisted; carries the resulting value
    Applied(T),
    /// Timestamp older than the stored `last_seen`; nothing changed.
    /// Carries the stored value the write lost to.
    Stale(T),
    /// No matching room for this user
    NotFound,
}

impl<T> WriteOutcome<T> {
    /// Payload of a persisted write, `None` for stale or unmatched writes
    pub fn applied(&self) -> Option<&T> {
        match self {
            WriteOutcome::Applied(value) => Some(value),
            _ => None,
        }
    }
}

/// Storage interface for rooms, alerts and users
///
/// Writers for the same room are serialized by the implementation;
/// callers must not rely on cross-room atomicity.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a user; `Conflict` if the email is taken
    async fn create_user(&self, email: &str, name: &str, password: &str) -> Result<UserIdentity>;

    /// Look up a user by email
    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>>;

    /// All rooms owned by `user_id`
    async fn list_rooms(&self, user_id: i64) -> Result<Vec<Room>>;

    /// One room, or None
    async fn get_room(&self, user_id: i64, room_id: &str) -> Result<Option<Room>>;

    /// Create a room; `Conflict` if `room_id` already exists for this user
    async fn create_room(&self, user_id: i64, room: Room) -> Result<Room>;

    /// Insert or fully replace a room
    async fn upsert_room(&self, user_id: i64, room: Room) -> Result<Room>;

    /// Atomically set one action on a room and advance `last_seen`.
    ///
    /// A call whose `timestamp_ms` is older than the stored `last_seen` is a
    /// full no-op reported as `Stale` with the winning `last_seen`; `Applied`
    /// carries the new `last_seen`.
    async fn update_room_action(
        &self,
        user_id: i64,
        room_id: &str,
        action: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<i64>>;

    /// Atomically replace a room's sensor snapshot by device id, advancing
    /// `last_seen` under the same monotonicity rule. `Applied` and `Stale`
    /// carry the id of the room bound to this device.
    async fn update_room_sensors(
        &self,
        user_id: i64,
        device_id: &str,
        sensors: BTreeMap<String, serde_json::Value>,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<String>>;

    /// Delete a room; true if it existed
    async fn delete_room(&self, user_id: i64, room_id: &str) -> Result<bool>;

    /// Append a new alert
    async fn append_alert(&self, user_id: i64, alert: Alert) -> Result<()>;

    /// Mark an alert resolved. False if not found (for this user) or
    /// already resolved; no other alert is touched either way.
    async fn resolve_alert(&self, user_id: i64, alert_id: &str) -> Result<bool>;

    /// Alerts for a user, optionally filtered by home, newest first
    async fn list_alerts(
        &self,
        user_id: i64,
        home_id: Option<&str>,
        unresolved_only: bool,
    ) -> Result<Vec<Alert>>;
}

/// Starter room created on first authenticated listing
pub fn default_room() -> Room {
    let mut sensors = BTreeMap::new();
    for key in ["temperature", "humidity", "gas", "flame", "distance"] {
        sensors.insert(key.to_string(), serde_json::json!(0));
    }
    let mut actions = BTreeMap::new();
    for key in ["fan", "buzzer", "light"] {
        actions.insert(key.to_string(), "OFF".to_string());
    }

    Room {
        room_id: "living-room".to_string(),
        room_name: "Living Room".to_string(),
        device_id: "pi-main".to_string(),
        sensors,
        actions,
        last_seen: 0,
    }
}
