//! EdgeController - Pipeline composition root
//!
//! ## Responsibilities
//!
//! - Resolve (or bootstrap) the account the edge pipeline writes into
//! - Start the sensor pump/processing tasks and the camera detection loop
//! - Ordered shutdown: readers stop first, dispatcher cleanup last
//!
//! Frame flow: CameraClient -> DetectionGate -> AlertPolicyEngine. Sensor
//! flow: SensorPort -> SensorBridge pump -> bounded channel -> SensorBridge
//! run. Each loop is its own task; one failing cycle never stops a loop.

use crate::camera_client::CameraClient;
use crate::error::Result;
use crate::models::UserIdentity;
use crate::sensor_bridge::{TcpSensorPort, READING_QUEUE_CAPACITY};
use crate::state::AppState;
use crate::state_store::default_room;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Home the edge pipeline files alerts under
const EDGE_HOME: &str = "default";

const CAPTURE_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// EdgeController instance
pub struct EdgeController {
    state: AppState,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EdgeController {
    pub fn new(state: AppState) -> Self {
        Self {
            state,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the configured reader loops
    pub async fn start(&self) -> Result<()> {
        let user = self.ensure_edge_user().await?;
        let mut tasks = self.tasks.lock().await;

        if self.state.config.enable_sensors {
            let (tx, rx) = mpsc::channel(READING_QUEUE_CAPACITY);

            let bridge = self.state.bridge.clone();
            let addr = self.state.config.sensor_addr.clone();
            tasks.push(tokio::spawn(async move {
                bridge.pump(Box::new(TcpSensorPort::new(addr)), tx).await;
            }));

            let bridge = self.state.bridge.clone();
            let reader_user = user.clone();
            tasks.push(tokio::spawn(async move {
                bridge.run(rx, reader_user).await;
            }));

            tracing::info!(addr = %self.state.config.sensor_addr, "Sensor pipeline started");
        }

        if let Some(camera) = self.state.camera.clone() {
            let state = self.state.clone();
            let detect_user = user.clone();
            tasks.push(tokio::spawn(async move {
                detection_loop(state, camera, detect_user).await;
            }));
            tracing::info!("Camera detection loop started");
        }

        Ok(())
    }

    /// Find the edge account, creating it (with its starter room) on a
    /// fresh deployment
    pub async fn ensure_edge_user(&self) -> Result<UserIdentity> {
        let email = &self.state.config.edge_user_email;

        if let Some(record) = self.state.store.find_user(email).await? {
            return Ok(record.identity);
        }

        // Locally generated credential; the edge pipeline never logs in
        // over HTTP
        let identity = self
            .state
            .store
            .create_user(email, "Edge Controller", &Uuid::new_v4().to_string())
            .await?;
        self.state
            .store
            .create_room(identity.user_id, default_room())
            .await?;

        tracing::info!(user_id = identity.user_id, email = %email, "Edge account bootstrapped");
        Ok(identity)
    }

    /// Stop readers, then the dispatcher. Idempotent.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }

        self.state.dispatcher.cleanup().await;
        tracing::info!("Edge controller stopped");
    }
}

/// Capture -> gate -> policy, forever
async fn detection_loop(state: AppState, camera: Arc<CameraClient>, user: UserIdentity) {
    let interval = camera.poll_interval();
    let mut backoff = interval;

    loop {
        tokio::time::sleep(backoff).await;

        let frame = match camera.capture().await {
            Ok(frame) => {
                backoff = interval;
                frame
            }
            Err(e) => {
                backoff = (backoff * 2).min(CAPTURE_BACKOFF_MAX);
                tracing::warn!(
                    error = %e,
                    failures = camera.consecutive_failures(),
                    backoff_sec = backoff.as_secs(),
                    "Frame capture failed"
                );
                continue;
            }
        };

        let outcome = state.gate.evaluate(&frame.bytes).await;
        let snapshot_url = if outcome.detected() {
            Some(state.snapshots.insert(frame.bytes.clone()).await)
        } else {
            None
        };
        if let Err(e) = state
            .policy
            .handle_detections(&user, EDGE_HOME, &outcome, snapshot_url)
            .await
        {
            tracing::error!(error = %e, "Detection cycle failed");
        }
    }
}
