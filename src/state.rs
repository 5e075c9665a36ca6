//! Application state
//!
//! Holds all shared components and state

use crate::actuator_dispatcher::ActuatorDispatcher;
use crate::alert_policy::AlertPolicyEngine;
use crate::auth_service::AuthService;
use crate::camera_client::CameraClient;
use crate::detection_gate::DetectionGate;
use crate::realtime_hub::RealtimeHub;
use crate::sensor_bridge::SensorBridge;
use crate::snapshot_cache::SnapshotCache;
use crate::state_store::StateStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Database URL (`sqlite::memory:` for credential-less development)
    pub database_url: String,
    /// Server port
    pub port: u16,
    /// Server host
    pub host: String,
    /// Sensor feed address (serial-over-TCP bridge)
    pub sensor_addr: String,
    /// Camera module base URL
    pub camera_url: String,
    /// Detection cycle interval
    pub camera_poll_interval: Duration,
    /// Run the sensor reader task
    pub enable_sensors: bool,
    /// Run the camera detection loop
    pub enable_camera: bool,
    /// Email of the account the edge pipeline writes into
    pub edge_user_email: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://sensegrid.db".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            sensor_addr: std::env::var("SENSOR_ADDR")
                .unwrap_or_else(|_| "127.0.0.1:9600".to_string()),
            camera_url: std::env::var("CAMERA_URL")
                .unwrap_or_else(|_| "http://192.168.1.50".to_string()),
            camera_poll_interval: std::env::var("CAMERA_POLL_INTERVAL_SEC")
                .ok()
                .and_then(|p| p.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(3)),
            enable_sensors: env_flag("ENABLE_SENSORS", true),
            enable_camera: env_flag("ENABLE_CAMERA", true),
            edge_user_email: std::env::var("EDGE_USER_EMAIL")
                .unwrap_or_else(|_| "pi@sensegrid.local".to_string()),
        }
    }
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// Room/alert/user storage
    pub store: Arc<dyn StateStore>,
    /// AuthService (sessions)
    pub auth: Arc<AuthService>,
    /// RealtimeHub (WebSocket fan-out)
    pub hub: Arc<RealtimeHub>,
    /// ActuatorDispatcher (relay control)
    pub dispatcher: Arc<ActuatorDispatcher>,
    /// AlertPolicyEngine (cooldowns and auto-actions)
    pub policy: Arc<AlertPolicyEngine>,
    /// DetectionGate (detector adapter)
    pub gate: Arc<DetectionGate>,
    /// SensorBridge (telemetry ingestion)
    pub bridge: Arc<SensorBridge>,
    /// CameraClient (frame acquisition); None when the camera loop is off
    pub camera: Option<Arc<CameraClient>>,
    /// SnapshotCache (frames behind alert snapshot links)
    pub snapshots: Arc<SnapshotCache>,
    /// Process start, for the health endpoint
    pub started_at: DateTime<Utc>,
}
