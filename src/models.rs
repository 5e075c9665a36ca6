//! Shared models and types for the SenseGrid hub
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
}

/// A room owned by one user
///
/// `last_seen` is monotonic: writes carrying an older timestamp never
/// regress it. Mutated only through the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_id: String,
    pub room_name: String,
    pub device_id: String,
    /// sensor-name -> last reading (number or string)
    pub sensors: BTreeMap<String, serde_json::Value>,
    /// actuator-name -> commanded state ("ON"/"OFF")
    pub actions: BTreeMap<String, String>,
    /// Unix millis, non-decreasing
    pub last_seen: i64,
}

/// An intrusion alert, owned by one user and one home
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    pub home_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
    /// Unix millis
    pub timestamp: i64,
    /// One-way transition false -> true
    pub resolved: bool,
}

/// Parsed sensor reading from the edge bridge
///
/// Ephemeral per-cycle record; the latest one is cached per device but
/// never persisted standalone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub temperature: f64,
    #[serde(default)]
    pub humidity: f64,
    #[serde(default)]
    pub gas: i64,
    #[serde(default)]
    pub flame: i64,
    #[serde(default)]
    pub distance: f64,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Bounding box from a detector
///
/// Upstream detectors vary between corner-pair and center+size forms,
/// so both deserialize transparently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum BBox {
    /// `[x1, y1, x2, y2]`
    Corners([f32; 4]),
    /// `{x, y, width, height}` (center point + size)
    Center {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
    },
}

impl BBox {
    /// Normalize to corner-pair form
    pub fn to_corners(&self) -> [f32; 4] {
        match *self {
            BBox::Corners(c) => c,
            BBox::Center {
                x,
                y,
                width,
                height,
            } => [
                x - width / 2.0,
                y - height / 2.0,
                x + width / 2.0,
                y + height / 2.0,
            ],
        }
    }
}

/// Single detection result; lives for one detection cycle only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<BBox>,
}

/// Authenticated user identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: i64,
    pub email: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_parses_corner_pair() {
        let bbox: BBox = serde_json::from_str("[10.0, 20.0, 110.0, 220.0]").unwrap();
        assert_eq!(bbox.to_corners(), [10.0, 20.0, 110.0, 220.0]);
    }

    #[test]
    fn bbox_parses_center_form() {
        let bbox: BBox =
            serde_json::from_str(r#"{"x": 60.0, "y": 120.0, "width": 100.0, "height": 200.0}"#)
                .unwrap();
        assert_eq!(bbox.to_corners(), [10.0, 20.0, 110.0, 220.0]);
    }

    #[test]
    fn sensor_reading_defaults_missing_fields() {
        let reading: SensorReading =
            serde_json::from_str(r#"{"temperature": 24.5, "gas": 120}"#).unwrap();
        assert_eq!(reading.temperature, 24.5);
        assert_eq!(reading.gas, 120);
        assert_eq!(reading.flame, 0);
        assert_eq!(reading.humidity, 0.0);
    }
}
