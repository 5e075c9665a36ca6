//! SensorBridge - Environmental telemetry ingestion
//!
//! ## Responsibilities
//!
//! - Read newline-delimited JSON readings from the sensor transport
//! - Validate/parse each line; malformed lines are skipped, never fatal
//! - Persist the snapshot into the room owning the device, fan out the
//!   update, and run threshold auto-actions
//!
//! The read loop (`pump`) and the processing loop (`run`) are separate tasks
//! joined by a bounded channel, so a stalled store or policy call never
//! blocks the transport read. Transport loss is expected: the pump
//! reconnects with capped exponential backoff.

use crate::alert_policy::AlertPolicyEngine;
use crate::error::{Error, Result};
use crate::models::{SensorReading, UserIdentity};
use crate::realtime_hub::{Channel, HubEvent, RealtimeHub, SensorUpdateEvent};
use crate::state_store::{StateStore, WriteOutcome};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Depth of the pump -> processing channel
pub const READING_QUEUE_CAPACITY: usize = 32;

/// Line-oriented sensor transport
///
/// Production uses a TCP bridge to the microcontroller; tests script it.
#[async_trait]
pub trait SensorPort: Send {
    /// Open (or re-open) the transport
    async fn connect(&mut self) -> Result<()>;

    /// Next raw line, or None when the peer closed the connection
    async fn read_line(&mut self) -> Result<Option<String>>;
}

/// TCP transport for the sensor feed
pub struct TcpSensorPort {
    addr: String,
    lines: Option<Lines<BufReader<TcpStream>>>,
}

impl TcpSensorPort {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            lines: None,
        }
    }
}

#[async_trait]
impl SensorPort for TcpSensorPort {
    async fn connect(&mut self) -> Result<()> {
        let stream = TcpStream::connect(&self.addr).await?;
        tracing::info!(addr = %self.addr, "Sensor port connected");
        self.lines = Some(BufReader::new(stream).lines());
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let lines = self
            .lines
            .as_mut()
            .ok_or_else(|| Error::Internal("sensor port not connected".into()))?;
        Ok(lines.next_line().await?)
    }
}

/// Ingestion counters, exposed for the health endpoint
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub accepted: AtomicU64,
    pub rejected: AtomicU64,
    pub dropped: AtomicU64,
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Device id the readings are attributed to
    pub device_id: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            device_id: "pi-main".to_string(),
        }
    }
}

/// SensorBridge instance
pub struct SensorBridge {
    store: Arc<dyn StateStore>,
    hub: Arc<RealtimeHub>,
    policy: Arc<AlertPolicyEngine>,
    config: BridgeConfig,
    stats: BridgeStats,
    latest: RwLock<Option<SensorReading>>,
}

impl SensorBridge {
    pub fn new(
        store: Arc<dyn StateStore>,
        hub: Arc<RealtimeHub>,
        policy: Arc<AlertPolicyEngine>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            store,
            hub,
            policy,
            config,
            stats: BridgeStats::default(),
            latest: RwLock::new(None),
        }
    }

    pub fn stats(&self) -> &BridgeStats {
        &self.stats
    }

    /// Most recently ingested reading, for liveness probes
    pub async fn latest(&self) -> Option<SensorReading> {
        self.latest.read().await.clone()
    }

    /// Parse one raw line. Malformed lines are counted and skipped;
    /// blank lines are ignored without counting.
    pub fn parse_line(&self, line: &str) -> Option<SensorReading> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        match serde_json::from_str::<SensorReading>(line) {
            Ok(reading) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                Some(reading)
            }
            Err(e) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, line = %line, "Skipping malformed sensor line");
                None
            }
        }
    }

    /// Read lines from `port` and feed parsed readings into `tx` until the
    /// task is cancelled.
    ///
    /// Reconnects with capped exponential backoff; backoff resets after the
    /// first successfully read line. A full channel drops the reading (the
    /// next cycle carries fresher data anyway).
    pub async fn pump(&self, mut port: Box<dyn SensorPort>, tx: mpsc::Sender<SensorReading>) {
        let mut backoff = RECONNECT_BASE;

        loop {
            if let Err(e) = port.connect().await {
                tracing::warn!(error = %e, backoff_sec = backoff.as_secs(), "Sensor port connect failed");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }

            loop {
                match port.read_line().await {
                    Ok(Some(line)) => {
                        backoff = RECONNECT_BASE;
                        if let Some(reading) = self.parse_line(&line) {
                            if tx.try_send(reading).is_err() {
                                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                                tracing::warn!("Reading queue full, dropping sensor reading");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::warn!("Sensor port closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Sensor port read failed");
                        break;
                    }
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_MAX);
        }
    }

    /// Consume parsed readings until the channel closes
    pub async fn run(&self, mut rx: mpsc::Receiver<SensorReading>, user: UserIdentity) {
        while let Some(reading) = rx.recv().await {
            if let Err(e) = self.ingest(&user, &reading).await {
                tracing::error!(error = %e, "Failed to process sensor reading");
            }
        }
        tracing::info!("Sensor processing loop stopped");
    }

    /// Persist one reading, fan out the update, run auto-actions
    pub async fn ingest(&self, user: &UserIdentity, reading: &SensorReading) -> Result<()> {
        *self.latest.write().await = Some(reading.clone());

        let timestamp_ms = reading.timestamp.timestamp_millis();
        let mut sensors = BTreeMap::new();
        sensors.insert("temperature".to_string(), serde_json::json!(reading.temperature));
        sensors.insert("humidity".to_string(), serde_json::json!(reading.humidity));
        sensors.insert("gas".to_string(), serde_json::json!(reading.gas));
        sensors.insert("flame".to_string(), serde_json::json!(reading.flame));
        sensors.insert("distance".to_string(), serde_json::json!(reading.distance));

        let updated = self
            .store
            .update_room_sensors(user.user_id, &self.config.device_id, sensors.clone(), timestamp_ms)
            .await?;

        match updated {
            WriteOutcome::Applied(room_id) => {
                self.hub
                    .publish(
                        Channel::User(user.user_id),
                        HubEvent::SensorUpdate(SensorUpdateEvent {
                            device_id: self.config.device_id.clone(),
                            room_id,
                            sensors: serde_json::to_value(&sensors)?,
                            timestamp: timestamp_ms,
                        }),
                    )
                    .await;
            }
            WriteOutcome::Stale(_) => {
                // Out-of-order reading; nothing was persisted, so nothing
                // is broadcast and no auto-action runs on the old values
                tracing::debug!(device_id = %self.config.device_id, "Stale sensor reading ignored");
                return Ok(());
            }
            WriteOutcome::NotFound => {
                tracing::debug!(device_id = %self.config.device_id, "No room bound to device, reading not persisted");
            }
        }

        self.policy.handle_reading(reading).await;
        Ok(())
    }
}
