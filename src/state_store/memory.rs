//! In-memory state store
//!
//! Backs unit tests and credential-less development runs. Same contract as
//! the SQLite store; a single lock over the user's state serializes writers
//! (coarse locking is permitted, callers never rely on cross-room atomicity).

use super::{StateStore, UserRecord, WriteOutcome};
use crate::error::{Error, Result};
use crate::models::{Alert, Room, UserIdentity};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    next_user_id: i64,
    users_by_email: HashMap<String, UserRecord>,
    /// (user_id, room_id) -> room
    rooms: HashMap<(i64, String), Room>,
    /// (user_id, alert)
    alerts: Vec<(i64, Alert)>,
}

/// MemoryStore instance
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_user(&self, email: &str, name: &str, password: &str) -> Result<UserIdentity> {
        let mut inner = self.inner.write().await;
        if inner.users_by_email.contains_key(email) {
            return Err(Error::Conflict(format!("user {} already exists", email)));
        }

        inner.next_user_id += 1;
        let identity = UserIdentity {
            user_id: inner.next_user_id,
            email: email.to_string(),
            name: name.to_string(),
        };
        inner.users_by_email.insert(
            email.to_string(),
            UserRecord {
                identity: identity.clone(),
                password: password.to_string(),
            },
        );
        Ok(identity)
    }

    async fn find_user(&self, email: &str) -> Result<Option<UserRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.users_by_email.get(email).cloned())
    }

    async fn list_rooms(&self, user_id: i64) -> Result<Vec<Room>> {
        let inner = self.inner.read().await;
        let mut rooms: Vec<Room> = inner
            .rooms
            .iter()
            .filter(|((uid, _), _)| *uid == user_id)
            .map(|(_, room)| room.clone())
            .collect();
        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(rooms)
    }

    async fn get_room(&self, user_id: i64, room_id: &str) -> Result<Option<Room>> {
        let inner = self.inner.read().await;
        Ok(inner.rooms.get(&(user_id, room_id.to_string())).cloned())
    }

    async fn create_room(&self, user_id: i64, room: Room) -> Result<Room> {
        let mut inner = self.inner.write().await;
        let key = (user_id, room.room_id.clone());
        if inner.rooms.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "room {} already exists",
                room.room_id
            )));
        }
        inner.rooms.insert(key, room.clone());
        Ok(room)
    }

    async fn upsert_room(&self, user_id: i64, room: Room) -> Result<Room> {
        let mut inner = self.inner.write().await;
        inner
            .rooms
            .insert((user_id, room.room_id.clone()), room.clone());
        Ok(room)
    }

    async fn update_room_action(
        &self,
        user_id: i64,
        room_id: &str,
        action: &str,
        value: &str,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<i64>> {
        let mut inner = self.inner.write().await;
        let Some(room) = inner.rooms.get_mut(&(user_id, room_id.to_string())) else {
            return Ok(WriteOutcome::NotFound);
        };

        if timestamp_ms < room.last_seen {
            // Stale writer; last_seen only advances
            return Ok(WriteOutcome::Stale(room.last_seen));
        }

        room.actions.insert(action.to_string(), value.to_string());
        room.last_seen = timestamp_ms;
        Ok(WriteOutcome::Applied(room.last_seen))
    }

    async fn update_room_sensors(
        &self,
        user_id: i64,
        device_id: &str,
        sensors: BTreeMap<String, serde_json::Value>,
        timestamp_ms: i64,
    ) -> Result<WriteOutcome<String>> {
        let mut inner = self.inner.write().await;
        let room = inner
            .rooms
            .iter_mut()
            .find(|((uid, _), room)| *uid == user_id && room.device_id == device_id)
            .map(|(_, room)| room);

        let Some(room) = room else {
            return Ok(WriteOutcome::NotFound);
        };

        if timestamp_ms < room.last_seen {
            return Ok(WriteOutcome::Stale(room.room_id.clone()));
        }

        room.sensors = sensors;
        room.last_seen = timestamp_ms;
        Ok(WriteOutcome::Applied(room.room_id.clone()))
    }

    async fn delete_room(&self, user_id: i64, room_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .rooms
            .remove(&(user_id, room_id.to_string()))
            .is_some())
    }

    async fn append_alert(&self, user_id: i64, alert: Alert) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.alerts.push((user_id, alert));
        Ok(())
    }

    async fn resolve_alert(&self, user_id: i64, alert_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        for (uid, alert) in inner.alerts.iter_mut() {
            if *uid == user_id && alert.alert_id == alert_id {
                if alert.resolved {
                    return Ok(false);
                }
                alert.resolved = true;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn list_alerts(
        &self,
        user_id: i64,
        home_id: Option<&str>,
        unresolved_only: bool,
    ) -> Result<Vec<Alert>> {
        let inner = self.inner.read().await;
        let mut alerts: Vec<Alert> = inner
            .alerts
            .iter()
            .filter(|(uid, alert)| {
                *uid == user_id
                    && home_id.map_or(true, |h| alert.home_id == h)
                    && (!unresolved_only || !alert.resolved)
            })
            .map(|(_, alert)| alert.clone())
            .collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(alerts)
    }
}
