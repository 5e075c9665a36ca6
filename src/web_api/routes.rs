//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Multipart, Path, Query, State,
    },
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{ApiResponse, Room, SensorReading, UserIdentity};
use crate::realtime_hub::{
    ActionUpdateEvent, AlertProcessedEvent, Channel, HubEvent, SensorUpdateEvent,
};
use crate::state::AppState;
use crate::state_store::{default_room, WriteOutcome};

/// Create API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Auth
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        // Rooms
        .route("/api/rooms", get(list_rooms))
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/:id", delete(delete_room))
        .route("/api/rooms/:id/action", post(room_action))
        // Devices
        .route("/api/devices/:id/command", post(device_command))
        .route("/api/telemetry", post(push_telemetry))
        // Alerts
        .route("/api/alerts", get(list_alerts))
        .route("/api/alerts/:id/resolve", post(resolve_alert))
        .route("/api/intruder/detect", post(intruder_detect))
        // Snapshots
        .route("/api/snapshots/:id", get(get_snapshot))
        // WebSocket
        .route("/api/ws", get(websocket_handler))
        .with_state(state)
}

async fn authed(state: &AppState, headers: &HeaderMap) -> Result<UserIdentity> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    state.auth.authenticate(header).await
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ========================================
// Auth Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    email: String,
    #[serde(default)]
    name: String,
    password: String,
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse> {
    let identity = state
        .auth
        .register(&req.email, &req.name, &req.password)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(identity))))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse> {
    let (token, user) = state.auth.login(&req.email, &req.password).await?;
    Ok(Json(ApiResponse::success(json!({
        "token": token,
        "user": user,
    }))))
}

// ========================================
// Room Handlers
// ========================================

async fn list_rooms(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;

    let mut rooms = state.store.list_rooms(user.user_id).await?;
    if rooms.is_empty() {
        // First listing bootstraps the starter room; a concurrent first
        // listing may win the insert, in which case re-list instead of
        // surfacing the conflict
        match state.store.create_room(user.user_id, default_room()).await {
            Ok(room) => rooms = vec![room],
            Err(Error::Conflict(_)) => rooms = state.store.list_rooms(user.user_id).await?,
            Err(e) => return Err(e),
        }
    }
    Ok(Json(ApiResponse::success(rooms)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRoomRequest {
    room_id: String,
    room_name: String,
    device_id: String,
}

async fn create_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateRoomRequest>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;

    if req.room_id.trim().is_empty() {
        return Err(Error::Validation("roomId is required".to_string()));
    }

    let template = default_room();
    let room = Room {
        room_id: req.room_id,
        room_name: req.room_name,
        device_id: req.device_id,
        sensors: BTreeMap::new(),
        actions: template.actions,
        last_seen: 0,
    };

    let created = state.store.create_room(user.user_id, room).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

async fn delete_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;
    let deleted = state.store.delete_room(user.user_id, &room_id).await?;
    Ok(Json(ApiResponse::success(json!({ "deleted": deleted }))))
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    action: String,
    value: String,
    timestamp: Option<i64>,
}

/// Apply one action to a room. Commands are lenient: an unknown room is
/// acknowledged without effect.
async fn room_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_id): Path<String>,
    Json(req): Json<ActionRequest>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;
    let timestamp = req.timestamp.unwrap_or_else(now_ms);

    let outcome = state
        .store
        .update_room_action(user.user_id, &room_id, &req.action, &req.value, timestamp)
        .await?;

    // Only a persisted write reaches the dispatcher or subscribers
    let applied = matches!(outcome, WriteOutcome::Applied(_));
    match outcome {
        WriteOutcome::Applied(_) => {
            state
                .dispatcher
                .set_state(&req.action, req.value.eq_ignore_ascii_case("on"))
                .await;
            state
                .hub
                .publish(
                    Channel::User(user.user_id),
                    HubEvent::ActionUpdate(ActionUpdateEvent {
                        room_id: room_id.clone(),
                        action: req.action.clone(),
                        value: req.value.clone(),
                    }),
                )
                .await;
        }
        WriteOutcome::Stale(last_seen) => {
            tracing::debug!(room_id = %room_id, action = %req.action, last_seen, "Stale action command ignored");
        }
        WriteOutcome::NotFound => {
            tracing::debug!(room_id = %room_id, action = %req.action, "Action for unknown room ignored");
        }
    }

    Ok(Json(ApiResponse::success(json!({ "applied": applied }))))
}

// ========================================
// Device Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct CommandRequest {
    action: String,
    value: String,
}

async fn device_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(device_id): Path<String>,
    Json(req): Json<CommandRequest>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;

    state
        .dispatcher
        .set_state(&req.action, req.value.eq_ignore_ascii_case("on"))
        .await;

    // Mirror the command into the room bound to this device, if any
    let rooms = state.store.list_rooms(user.user_id).await?;
    if let Some(room) = rooms.into_iter().find(|r| r.device_id == device_id) {
        let outcome = state
            .store
            .update_room_action(user.user_id, &room.room_id, &req.action, &req.value, now_ms())
            .await?;
        if outcome.applied().is_some() {
            state
                .hub
                .publish(
                    Channel::User(user.user_id),
                    HubEvent::ActionUpdate(ActionUpdateEvent {
                        room_id: room.room_id,
                        action: req.action.clone(),
                        value: req.value.clone(),
                    }),
                )
                .await;
        }
    }

    Ok(Json(ApiResponse::success(json!({ "ack": true }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryRequest {
    device_id: String,
    sensors: BTreeMap<String, serde_json::Value>,
    timestamp: Option<i64>,
}

/// Device telemetry push (the HTTP alternative to the serial bridge)
async fn push_telemetry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TelemetryRequest>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;
    let timestamp = req.timestamp.unwrap_or_else(now_ms);

    let outcome = state
        .store
        .update_room_sensors(user.user_id, &req.device_id, req.sensors.clone(), timestamp)
        .await?;

    if let WriteOutcome::Stale(_) = outcome {
        // Out-of-order push; nothing persisted, nothing broadcast, no
        // auto-action on the old values
        tracing::debug!(device_id = %req.device_id, "Stale telemetry ignored");
        return Ok(Json(ApiResponse::success(json!({ "roomId": null }))));
    }

    let room_id = outcome.applied().cloned();
    if let Some(room_id) = &room_id {
        state
            .hub
            .publish(
                Channel::User(user.user_id),
                HubEvent::SensorUpdate(SensorUpdateEvent {
                    device_id: req.device_id.clone(),
                    room_id: room_id.clone(),
                    sensors: serde_json::to_value(&req.sensors)?,
                    timestamp,
                }),
            )
            .await;
    }

    // Threshold auto-actions run even when no room is bound
    if let Ok(reading) =
        serde_json::from_value::<SensorReading>(serde_json::to_value(&req.sensors)?)
    {
        state.policy.handle_reading(&reading).await;
    }

    Ok(Json(ApiResponse::success(json!({ "roomId": room_id }))))
}

// ========================================
// Alert Handlers
// ========================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertQuery {
    home_id: Option<String>,
    include_resolved: Option<bool>,
}

async fn list_alerts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AlertQuery>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;
    let alerts = state
        .store
        .list_alerts(
            user.user_id,
            query.home_id.as_deref(),
            !query.include_resolved.unwrap_or(false),
        )
        .await?;
    Ok(Json(ApiResponse::success(alerts)))
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    action: String,
}

async fn resolve_alert(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(alert_id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;

    if req.action != "allow" && req.action != "deny" {
        return Err(Error::Validation(
            "action must be \"allow\" or \"deny\"".to_string(),
        ));
    }

    let resolved = state.store.resolve_alert(user.user_id, &alert_id).await?;
    if !resolved {
        return Err(Error::NotFound(
            "alert not found or already resolved".to_string(),
        ));
    }

    state
        .hub
        .publish_all(
            user.user_id,
            HubEvent::AlertProcessed(AlertProcessedEvent {
                alert_id: alert_id.clone(),
                action: req.action.clone(),
            }),
        )
        .await;

    tracing::info!(alert_id = %alert_id, action = %req.action, "Alert resolved");
    Ok(Json(ApiResponse::success(json!({
        "alertId": alert_id,
        "action": req.action,
    }))))
}

/// Run one detection cycle on an uploaded frame
async fn intruder_detect(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let user = authed(&state, &headers).await?;

    let mut image: Option<Vec<u8>> = None;
    let mut home_id = "default".to_string();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("image") => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::Validation(format!("failed to read image: {}", e)))?;
                image = Some(bytes.to_vec());
            }
            Some("homeId") => {
                home_id = field
                    .text()
                    .await
                    .map_err(|e| Error::Validation(format!("failed to read homeId: {}", e)))?;
            }
            _ => {}
        }
    }

    let image = image.ok_or_else(|| Error::Validation("image field is required".to_string()))?;

    let outcome = state.gate.evaluate(&image).await;
    let snapshot_url = if outcome.detected() {
        Some(state.snapshots.insert(image.clone()).await)
    } else {
        None
    };
    let alert = state
        .policy
        .handle_detections(&user, &home_id, &outcome, snapshot_url)
        .await?;

    Ok(Json(ApiResponse::success(json!({
        "detected": outcome.detected(),
        "detectorFailed": outcome.detector_failed,
        "detections": outcome.raw,
        "alertId": alert.map(|a| a.alert_id),
    }))))
}

/// Serve the frame behind an alert's snapshot link
async fn get_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(snapshot_id): Path<String>,
) -> Result<impl IntoResponse> {
    authed(&state, &headers).await?;

    let frame = state
        .snapshots
        .get(&snapshot_id)
        .await
        .ok_or_else(|| Error::NotFound("snapshot not found".to_string()))?;

    Ok((
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame,
    ))
}

// ========================================
// WebSocket
// ========================================

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Result<impl IntoResponse> {
    let header = query.token.map(|t| format!("Bearer {}", t));
    let user = state.auth.authenticate(header.as_deref()).await?;

    Ok(ws.on_upgrade(move |socket| handle_websocket(socket, state, user)))
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState, user: UserIdentity) {
    let (mut sender, mut receiver) = socket.split();

    let (user_sub, mut user_rx) = state.hub.subscribe(Channel::User(user.user_id)).await;
    let (bcast_sub, mut bcast_rx) = state.hub.subscribe(Channel::Broadcast).await;

    tracing::info!(user_id = user.user_id, "WebSocket client connected");

    // Forward hub events to the socket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                m = user_rx.recv() => m,
                m = bcast_rx.recv() => m,
            };
            match msg {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
    });

    // Drain incoming messages until the client goes away
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Err(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }

    state.hub.unsubscribe(&user_sub).await;
    state.hub.unsubscribe(&bcast_sub).await;
    tracing::info!(user_id = user.user_id, "WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator_dispatcher::{ActuatorDispatcher, DispatcherConfig, MockRelayDriver};
    use crate::alert_policy::{AlertPolicyEngine, PolicyConfig};
    use crate::auth_service::AuthService;
    use crate::detection_gate::{DetectionGate, Detector, GateConfig};
    use crate::models::{Alert, Detection};
    use crate::realtime_hub::RealtimeHub;
    use crate::sensor_bridge::{BridgeConfig, SensorBridge};
    use crate::snapshot_cache::SnapshotCache;
    use crate::state::AppConfig;
    use crate::state_store::{MemoryStore, StateStore, UserRecord};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    struct AlwaysHuman;

    #[async_trait]
    impl Detector for AlwaysHuman {
        async fn detect(&self, _image: &[u8], _confidence: f32) -> Result<Vec<Detection>> {
            Ok(vec![Detection {
                class_name: "Human".to_string(),
                confidence: 0.9,
                bbox: None,
            }])
        }
    }

    fn test_state() -> AppState {
        test_state_with(Arc::new(MemoryStore::new()))
    }

    fn test_state_with(store: Arc<dyn StateStore>) -> AppState {
        let hub = Arc::new(RealtimeHub::new());
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
        let gate = Arc::new(DetectionGate::new(
            Arc::new(AlwaysHuman),
            GateConfig::default(),
        ));
        let bridge = Arc::new(SensorBridge::new(
            store.clone(),
            hub.clone(),
            policy.clone(),
            BridgeConfig::default(),
        ));

        AppState {
            config: AppConfig::default(),
            store: store.clone(),
            auth: Arc::new(AuthService::new(store)),
            hub,
            dispatcher,
            policy,
            gate,
            bridge,
            camera: None,
            snapshots: Arc::new(SnapshotCache::new()),
            started_at: chrono::Utc::now(),
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(t) = token {
            builder = builder.header("authorization", format!("Bearer {}", t));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn register_and_login(router: &Router) -> String {
        let response = router
            .clone()
            .oneshot(post_json(
                "/api/auth/register",
                None,
                json!({"email": "ana@example.com", "name": "Ana", "password": "hunter2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/auth/login",
                None,
                json!({"email": "ana@example.com", "password": "hunter2"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        body["data"]["token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn rooms_require_auth() {
        let router = create_router(test_state());
        let response = router
            .oneshot(Request::get("/api/rooms").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn first_room_listing_bootstraps_default_room() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let response = router
            .oneshot(
                Request::get("/api/rooms")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["roomId"], "living-room");
        assert_eq!(body["data"][0]["actions"]["fan"], "OFF");
    }

    #[tokio::test]
    async fn action_on_unknown_room_is_acknowledged_noop() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let response = router
            .oneshot(post_json(
                "/api/rooms/garage/action",
                Some(&token),
                json!({"action": "fan", "value": "ON"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["applied"], false);
    }

    #[tokio::test]
    async fn action_on_known_room_persists_and_applies() {
        let state = test_state();
        let router = create_router(state.clone());
        let token = register_and_login(&router).await;

        // Bootstrap the default room
        router
            .clone()
            .oneshot(
                Request::get("/api/rooms")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = router
            .oneshot(post_json(
                "/api/rooms/living-room/action",
                Some(&token),
                json!({"action": "fan", "value": "ON"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let room = state.store.get_room(1, "living-room").await.unwrap().unwrap();
        assert_eq!(room.actions["fan"], "ON");
        assert_eq!(state.dispatcher.get_state("fan").await, Some(true));
    }

    #[tokio::test]
    async fn resolving_unknown_alert_is_not_found() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let response = router
            .oneshot(post_json(
                "/api/alerts/alert-123/resolve",
                Some(&token),
                json!({"action": "allow"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_action_value() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let response = router
            .oneshot(post_json(
                "/api/alerts/alert-123/resolve",
                Some(&token),
                json!({"action": "snooze"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn telemetry_updates_bound_room() {
        let state = test_state();
        let router = create_router(state.clone());
        let token = register_and_login(&router).await;

        router
            .clone()
            .oneshot(
                Request::get("/api/rooms")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/telemetry",
                Some(&token),
                json!({
                    "deviceId": "pi-main",
                    "sensors": {"temperature": 24.5, "gas": 130},
                    "timestamp": 1700000000000i64,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["roomId"], "living-room");

        let room = state.store.get_room(1, "living-room").await.unwrap().unwrap();
        assert_eq!(room.sensors["temperature"], json!(24.5));
        assert_eq!(room.last_seen, 1700000000000i64);

        // An out-of-order push persists nothing and drives no auto-action,
        // even with an over-threshold temperature
        let response = router
            .oneshot(post_json(
                "/api/telemetry",
                Some(&token),
                json!({
                    "deviceId": "pi-main",
                    "sensors": {"temperature": 99.0},
                    "timestamp": 1000i64,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["data"]["roomId"].is_null());

        let room = state.store.get_room(1, "living-room").await.unwrap().unwrap();
        assert_eq!(room.sensors["temperature"], json!(24.5));
        assert_eq!(room.last_seen, 1700000000000i64);
        assert_eq!(state.dispatcher.get_state("fan").await, None);
    }

    #[tokio::test]
    async fn stale_action_command_is_a_full_noop() {
        let state = test_state();
        let router = create_router(state.clone());
        let token = register_and_login(&router).await;

        router
            .clone()
            .oneshot(
                Request::get("/api/rooms")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/rooms/living-room/action",
                Some(&token),
                json!({"action": "fan", "value": "ON", "timestamp": 5000i64}),
            ))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"]["applied"], true);
        assert_eq!(state.dispatcher.get_state("fan").await, Some(true));

        let (_id, mut rx) = state.hub.subscribe(Channel::User(1)).await;
        let response = router
            .oneshot(post_json(
                "/api/rooms/living-room/action",
                Some(&token),
                json!({"action": "fan", "value": "OFF", "timestamp": 1000i64}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["applied"], false);

        // Stored state, relay state and subscribers are all untouched
        let room = state.store.get_room(1, "living-room").await.unwrap().unwrap();
        assert_eq!(room.actions["fan"], "ON");
        assert_eq!(room.last_seen, 5000);
        assert_eq!(state.dispatcher.get_state("fan").await, Some(true));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_room_creation_conflicts() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let req = json!({"roomId": "shed", "roomName": "Shed", "deviceId": "esp32-shed"});
        let response = router
            .clone()
            .oneshot(post_json("/api/rooms", Some(&token), req.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router
            .oneshot(post_json("/api/rooms", Some(&token), req))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    /// Reports an empty room list once while the room actually exists,
    /// reproducing a listing that interleaves with another bootstrap.
    struct HiddenRoomStore {
        inner: MemoryStore,
        hide_once: AtomicBool,
    }

    #[async_trait]
    impl StateStore for HiddenRoomStore {
        async fn create_user(
            &self,
            email: &str,
            name: &str,
            password: &str,
        ) -> Result<UserIdentity> {
            self.inner.create_user(email, name, password).await
        }

        async fn find_user(&self, email: &str) -> Result<Option<UserRecord>> {
            self.inner.find_user(email).await
        }

        async fn list_rooms(&self, user_id: i64) -> Result<Vec<Room>> {
            if self.hide_once.swap(false, Ordering::SeqCst) {
                return Ok(Vec::new());
            }
            self.inner.list_rooms(user_id).await
        }

        async fn get_room(&self, user_id: i64, room_id: &str) -> Result<Option<Room>> {
            self.inner.get_room(user_id, room_id).await
        }

        async fn create_room(&self, user_id: i64, room: Room) -> Result<Room> {
            self.inner.create_room(user_id, room).await
        }

        async fn upsert_room(&self, user_id: i64, room: Room) -> Result<Room> {
            self.inner.upsert_room(user_id, room).await
        }

        async fn update_room_action(
            &self,
            user_id: i64,
            room_id: &str,
            action: &str,
            value: &str,
            timestamp_ms: i64,
        ) -> Result<WriteOutcome<i64>> {
            self.inner
                .update_room_action(user_id, room_id, action, value, timestamp_ms)
                .await
        }

        async fn update_room_sensors(
            &self,
            user_id: i64,
            device_id: &str,
            sensors: BTreeMap<String, serde_json::Value>,
            timestamp_ms: i64,
        ) -> Result<WriteOutcome<String>> {
            self.inner
                .update_room_sensors(user_id, device_id, sensors, timestamp_ms)
                .await
        }

        async fn delete_room(&self, user_id: i64, room_id: &str) -> Result<bool> {
            self.inner.delete_room(user_id, room_id).await
        }

        async fn append_alert(&self, user_id: i64, alert: Alert) -> Result<()> {
            self.inner.append_alert(user_id, alert).await
        }

        async fn resolve_alert(&self, user_id: i64, alert_id: &str) -> Result<bool> {
            self.inner.resolve_alert(user_id, alert_id).await
        }

        async fn list_alerts(
            &self,
            user_id: i64,
            home_id: Option<&str>,
            unresolved_only: bool,
        ) -> Result<Vec<Alert>> {
            self.inner.list_alerts(user_id, home_id, unresolved_only).await
        }
    }

    #[tokio::test]
    async fn bootstrap_tolerates_concurrent_room_creation() {
        let store = Arc::new(HiddenRoomStore {
            inner: MemoryStore::new(),
            hide_once: AtomicBool::new(true),
        });
        let state = test_state_with(store.clone());
        let router = create_router(state);
        let token = register_and_login(&router).await;

        // The room the competing bootstrap already inserted
        store.inner.create_room(1, default_room()).await.unwrap();

        let response = router
            .oneshot(
                Request::get("/api/rooms")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["roomId"], "living-room");
    }

    #[tokio::test]
    async fn intruder_detection_links_a_servable_snapshot() {
        let router = create_router(test_state());
        let token = register_and_login(&router).await;

        let boundary = "sensegrid-test-boundary";
        let body = format!(
            "--{b}\r\ncontent-disposition: form-data; name=\"homeId\"\r\n\r\nhome-1\r\n\
             --{b}\r\ncontent-disposition: form-data; name=\"image\"; filename=\"frame.jpg\"\r\n\
             content-type: image/jpeg\r\n\r\nfakejpegbytes\r\n--{b}--\r\n",
            b = boundary
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/intruder/detect")
            .header("authorization", format!("Bearer {}", token))
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["detected"], true);
        assert!(body["data"]["alertId"].is_string());

        let response = router
            .clone()
            .oneshot(
                Request::get("/api/alerts?homeId=home-1")
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let snapshot_url = body["data"][0]["snapshotUrl"].as_str().unwrap().to_string();
        assert!(snapshot_url.starts_with("/api/snapshots/"));

        let response = router
            .oneshot(
                Request::get(snapshot_url.as_str())
                    .header("authorization", format!("Bearer {}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"fakejpegbytes");
    }
}
