//! RealtimeHub - WebSocket event fan-out
//!
//! ## Responsibilities
//!
//! - Subscriber registration per logical channel (per-user or broadcast)
//! - Event delivery to all current subscribers of a channel
//! - Dropping subscribers that cannot keep up
//!
//! Delivery is best-effort to currently-connected subscribers only. There is
//! no replay: a client that reconnects re-fetches current state over HTTP.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Alert, Detection};

/// Per-subscriber queue depth. A subscriber whose queue is full at publish
/// time is dropped rather than allowed to stall the publisher.
const SUBSCRIBER_QUEUE_CAPACITY: usize = 64;

/// Logical fan-out channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Room/sensor updates scoped to one user
    User(i64),
    /// Alert-processed events visible to all clients
    Broadcast,
}

/// Hub event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum HubEvent {
    RoomUpdate(RoomUpdateEvent),
    SensorUpdate(SensorUpdateEvent),
    ActionUpdate(ActionUpdateEvent),
    AlertCreated(AlertCreatedEvent),
    AlertProcessed(AlertProcessedEvent),
}

/// Room snapshot changed (client should re-render the room card)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomUpdateEvent {
    pub room_id: String,
    pub last_seen: i64,
}

/// New sensor telemetry for a device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorUpdateEvent {
    pub device_id: String,
    pub room_id: String,
    pub sensors: serde_json::Value,
    pub timestamp: i64,
}

/// Actuator command applied
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionUpdateEvent {
    pub room_id: String,
    pub action: String,
    pub value: String,
}

/// A new alert fired
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertCreatedEvent {
    pub alert: Alert,
    pub confidence: f32,
    pub detections: Vec<Detection>,
}

/// An alert was resolved (allow/deny)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertProcessedEvent {
    pub alert_id: String,
    pub action: String,
}

/// Subscriber connection
struct Subscriber {
    id: Uuid,
    channel: Channel,
    tx: mpsc::Sender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    subscriber_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            subscriber_count: AtomicU64::new(0),
        }
    }

    /// Subscribe to a channel
    pub async fn subscribe(&self, channel: Channel) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);

        {
            let mut subscribers = self.subscribers.write().await;
            subscribers.insert(id, Subscriber { id, channel, tx });
        }

        self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(subscription_id = %id, "Subscriber connected");

        (id, rx)
    }

    /// Unsubscribe; safe to call for an already-removed handle
    pub async fn unsubscribe(&self, id: &Uuid) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(id).is_some() {
            self.subscriber_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(subscription_id = %id, "Subscriber disconnected");
        }
    }

    /// Publish an event to every current subscriber of `channel`.
    ///
    /// Never blocks: subscribers with a full queue are dropped.
    pub async fn publish(&self, channel: Channel, event: HubEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize hub event");
                return;
            }
        };

        let mut stalled: Vec<Uuid> = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for sub in subscribers.values().filter(|s| s.channel == channel) {
                match sub.tx.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            "Subscriber queue full, dropping subscriber"
                        );
                        stalled.push(sub.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stalled.push(sub.id);
                    }
                }
            }
        }

        for id in stalled {
            self.unsubscribe(&id).await;
        }
    }

    /// Publish to a user channel and the broadcast channel in one call
    pub async fn publish_all(&self, user_id: i64, event: HubEvent) {
        self.publish(Channel::User(user_id), event.clone()).await;
        self.publish(Channel::Broadcast, event).await;
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> u64 {
        self.subscriber_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
