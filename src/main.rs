//! SenseGrid Hub
//!
//! Main entry point for the hub application.

use sensegrid_hub::{
    actuator_dispatcher::{ActuatorDispatcher, DispatcherConfig, MockRelayDriver},
    alert_policy::{AlertPolicyEngine, PolicyConfig},
    auth_service::AuthService,
    camera_client::{CameraClient, CameraConfig},
    detection_gate::{DetectionGate, DetectorConfig, GateConfig, HttpDetector},
    edge_controller::EdgeController,
    realtime_hub::RealtimeHub,
    sensor_bridge::{BridgeConfig, SensorBridge},
    snapshot_cache::SnapshotCache,
    state::{AppConfig, AppState},
    state_store::{SqliteStore, StateStore},
    web_api,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sensegrid_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SenseGrid Hub v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        database_url = %config.database_url,
        sensor_addr = %config.sensor_addr,
        camera_url = %config.camera_url,
        enable_sensors = config.enable_sensors,
        enable_camera = config.enable_camera,
        "Configuration loaded"
    );

    // Storage
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::connect(&config.database_url).await?);
    tracing::info!("State store initialized");

    // Core components
    let hub = Arc::new(RealtimeHub::new());
    let auth = Arc::new(AuthService::new(store.clone()));
    let dispatcher = Arc::new(ActuatorDispatcher::new(
        Arc::new(MockRelayDriver::new()),
        DispatcherConfig::default(),
    ));
    let policy = Arc::new(AlertPolicyEngine::new(
        store.clone(),
        hub.clone(),
        dispatcher.clone(),
        PolicyConfig::default(),
    ));

    // Detector credentials are required; a misconfigured deployment stops
    // here rather than failing on the first frame
    let detector = Arc::new(HttpDetector::new(DetectorConfig::from_env())?);
    let gate = Arc::new(DetectionGate::new(detector, GateConfig::default()));

    let bridge = Arc::new(SensorBridge::new(
        store.clone(),
        hub.clone(),
        policy.clone(),
        BridgeConfig::default(),
    ));

    let camera = if config.enable_camera {
        let mut camera_config = CameraConfig::new(config.camera_url.clone());
        camera_config.poll_interval = config.camera_poll_interval;
        Some(Arc::new(CameraClient::new(camera_config)?))
    } else {
        None
    };

    let state = AppState {
        config,
        store,
        auth,
        hub,
        dispatcher,
        policy,
        gate,
        bridge,
        camera,
        snapshots: Arc::new(SnapshotCache::new()),
        started_at: chrono::Utc::now(),
    };

    // Edge pipeline
    let controller = Arc::new(EdgeController::new(state.clone()));
    controller.start().await?;

    // Router
    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown_controller = controller.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            shutdown_controller.shutdown().await;
        })
        .await?;

    Ok(())
}
