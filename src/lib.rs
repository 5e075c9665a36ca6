//! SenseGrid Hub Library
//!
//! Home security coordination hub: telemetry ingestion, intruder detection,
//! alert policy and realtime fan-out for one or more homes.
//!
//! ## Architecture (8 Components)
//!
//! 1. SensorBridge - Environmental telemetry ingestion (serial-over-TCP)
//! 2. CameraClient - ESP32-CAM frame acquisition
//! 3. DetectionGate - Detector adapter and qualification filter
//! 4. AlertPolicyEngine - Cooldown state machine and auto-actions
//! 5. StateStore - Rooms, alerts and users (memory / SQLite)
//! 6. RealtimeHub - WebSocket event fan-out
//! 7. ActuatorDispatcher - Relay commands and timed holds
//! 8. WebAPI / AuthService - REST surface and sessions
//!
//! ## Design Principles
//!
//! - Storage specifics stay behind the `StateStore` trait
//! - Drivers and detectors are injected at construction, never singletons
//! - A failing device or subscriber never stalls the rest of the pipeline

pub mod actuator_dispatcher;
pub mod alert_policy;
pub mod auth_service;
pub mod camera_client;
pub mod detection_gate;
pub mod edge_controller;
pub mod error;
pub mod models;
pub mod realtime_hub;
pub mod sensor_bridge;
pub mod snapshot_cache;
pub mod state;
pub mod state_store;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
