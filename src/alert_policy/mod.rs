//! AlertPolicyEngine - Alerting decisions and auto-actions
//!
//! ## Responsibilities
//!
//! - Decide when a qualifying detection fires a new alert (cooldown window
//!   per home and category)
//! - Threshold-based auto-actions from sensor readings (gas/flame/temp)
//! - Persist the alert, then fan out exactly one notification
//!
//! State machine per (home, category): IDLE -> TRIGGERED (cooldown active)
//! -> IDLE. The return to IDLE is time-based; no explicit event exists.
//! Threshold auto-actions are independent of the detection cooldown and use
//! their own idempotency rule (never re-issue a command for a state the
//! actuator is already in).

use crate::actuator_dispatcher::ActuatorDispatcher;
use crate::detection_gate::GateOutcome;
use crate::models::{Alert, SensorReading, UserIdentity};
use crate::realtime_hub::{AlertCreatedEvent, HubEvent, RealtimeHub};
use crate::state_store::StateStore;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Alert category, one cooldown window per (home, category)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertCategory {
    Intruder,
    Flame,
    Gas,
    Temperature,
}

/// Policy thresholds and durations
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Minimum time between two alerts of the same category for one home
    pub alert_cooldown: Duration,
    /// Gas ppm above which the fan is switched on
    pub gas_threshold: i64,
    /// Temperature (°C) above which the fan is switched on
    pub temperature_threshold: f64,
    /// Buzzer hold on flame detection
    pub flame_alarm: Duration,
    /// Buzzer hold on intruder detection
    pub intruder_alarm: Duration,
    /// Whether intruder alerts sound the buzzer at all
    pub trigger_buzzer: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            alert_cooldown: Duration::from_secs(60),
            gas_threshold: 350,
            temperature_threshold: 35.0,
            flame_alarm: Duration::from_secs(10),
            intruder_alarm: Duration::from_secs(5),
            trigger_buzzer: true,
        }
    }
}

/// AlertPolicyEngine instance
pub struct AlertPolicyEngine {
    store: Arc<dyn StateStore>,
    hub: Arc<RealtimeHub>,
    dispatcher: Arc<ActuatorDispatcher>,
    config: PolicyConfig,
    /// (home_id, category) -> last fired
    cooldowns: RwLock<HashMap<(String, AlertCategory), Instant>>,
    /// Highest alert-id millis issued so far; same-millisecond alerts get
    /// the next value to keep ids unique and monotonic
    last_alert_ms: StdMutex<i64>,
}

impl AlertPolicyEngine {
    pub fn new(
        store: Arc<dyn StateStore>,
        hub: Arc<RealtimeHub>,
        dispatcher: Arc<ActuatorDispatcher>,
        config: PolicyConfig,
    ) -> Self {
        Self {
            store,
            hub,
            dispatcher,
            config,
            cooldowns: RwLock::new(HashMap::new()),
            last_alert_ms: StdMutex::new(0),
        }
    }

    fn next_alert_id(&self) -> (String, i64) {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_alert_ms.lock().expect("alert id lock poisoned");
        let ms = if now > *last { now } else { *last + 1 };
        *last = ms;
        (format!("alert-{}", ms), ms)
    }

    /// Atomically check and arm the cooldown window.
    ///
    /// When the category was IDLE (window elapsed or never fired) it becomes
    /// TRIGGERED and the displaced entry is returned, so a failed persist can
    /// hand it back via `restore_cooldown`. `None` means suppressed.
    async fn try_arm_cooldown(
        &self,
        home_id: &str,
        category: AlertCategory,
    ) -> Option<Option<Instant>> {
        let mut cooldowns = self.cooldowns.write().await;
        let key = (home_id.to_string(), category);
        let now = Instant::now();

        if let Some(last_fired) = cooldowns.get(&key) {
            if now.duration_since(*last_fired) < self.config.alert_cooldown {
                return None;
            }
        }
        Some(cooldowns.insert(key, now))
    }

    /// Put a displaced cooldown entry back after a failed persist, so the
    /// next cycle retries instead of waiting out a window with no alert
    /// behind it
    async fn restore_cooldown(
        &self,
        home_id: &str,
        category: AlertCategory,
        previous: Option<Instant>,
    ) {
        let mut cooldowns = self.cooldowns.write().await;
        let key = (home_id.to_string(), category);
        match previous {
            Some(last_fired) => {
                cooldowns.insert(key, last_fired);
            }
            None => {
                cooldowns.remove(&key);
            }
        }
    }

    /// Process one detection cycle for a home.
    ///
    /// At most one alert per cycle regardless of detection count; the
    /// recorded confidence is the maximum among qualifying detections.
    /// Returns the created alert, or None when nothing fired.
    pub async fn handle_detections(
        &self,
        user: &UserIdentity,
        home_id: &str,
        outcome: &GateOutcome,
        snapshot_url: Option<String>,
    ) -> crate::error::Result<Option<Alert>> {
        if outcome.detector_failed {
            // Not a negative; recorded distinctly for audit
            tracing::warn!(home_id = %home_id, "Detection cycle skipped: detector failed");
            return Ok(None);
        }

        if !outcome.detected() {
            return Ok(None);
        }

        let Some(previous) = self.try_arm_cooldown(home_id, AlertCategory::Intruder).await else {
            tracing::debug!(
                home_id = %home_id,
                count = outcome.qualifying.len(),
                "Qualifying detection suppressed by cooldown"
            );
            return Ok(None);
        };

        let (alert_id, timestamp) = self.next_alert_id();
        let alert = Alert {
            alert_id,
            home_id: home_id.to_string(),
            snapshot_url,
            timestamp,
            resolved: false,
        };

        // Persist before publishing so a subscriber's immediate alert
        // listing already contains the new alert. A failed persist disarms
        // the window again; TRIGGERED always has a stored alert behind it.
        if let Err(e) = self.store.append_alert(user.user_id, alert.clone()).await {
            self.restore_cooldown(home_id, AlertCategory::Intruder, previous)
                .await;
            return Err(e);
        }

        self.hub
            .publish_all(
                user.user_id,
                HubEvent::AlertCreated(AlertCreatedEvent {
                    alert: alert.clone(),
                    confidence: outcome.max_confidence(),
                    detections: outcome.qualifying.clone(),
                }),
            )
            .await;

        tracing::info!(
            alert_id = %alert.alert_id,
            home_id = %home_id,
            confidence = outcome.max_confidence() as f64,
            detections = outcome.qualifying.len(),
            "Intruder alert created"
        );

        if self.config.trigger_buzzer {
            self.dispatcher.trigger_alarm(self.config.intruder_alarm).await;
        }

        Ok(Some(alert))
    }

    /// Threshold auto-actions for one sensor reading
    pub async fn handle_reading(&self, reading: &SensorReading) {
        // Gas threshold -> fan
        if reading.gas > self.config.gas_threshold {
            if self.dispatcher.get_state("fan").await != Some(true) {
                tracing::warn!(gas = reading.gas, "High gas level, turning on fan");
                self.dispatcher.set_state("fan", true).await;
            }
        }

        // Flame -> buzzer alarm
        if reading.flame == 1 {
            tracing::warn!("Flame detected, triggering alarm");
            self.dispatcher.trigger_alarm(self.config.flame_alarm).await;
        }

        // Temperature threshold -> fan
        if reading.temperature > self.config.temperature_threshold {
            if self.dispatcher.get_state("fan").await != Some(true) {
                tracing::warn!(
                    temperature = reading.temperature,
                    "High temperature, turning on fan"
                );
                self.dispatcher.set_state("fan", true).await;
            }
        }
    }
}
