use axum::{
    body::{Body, Bytes},
    debug_handler,
    extract::{Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Html, IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
#[cfg(not(feature = "dev"))]
use axum_embed::ServeEmbed;
use log::{debug, trace};
use rust_embed::RustEmbed;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream, ReceiverStream};
use tokio_stream::StreamExt;
#[cfg(feature = "dev")]
use tower_http::services::ServeDir;

use turret_core::{
    duration_from_secs, Detection, MotionSource, Position, SessionId, SessionState,
};

use crate::arbiter::{Arbiter, MotionEvent, SessionHandle, SessionInfo, SessionStatus};
use crate::camera::{CameraSettings, FrameSource};
use crate::diagnostics;
use crate::error::TurretError;
use crate::modes::ControlMode;
use crate::tracking::{FeedOutcome, TrackingStatus};
use crate::Turret;

// Legacy paths, kept for existing clients
const ROOT_URI: &str = "/";
const SET_URI: &str = "/set/{pan}/{tilt}";
const SET_DURATION_URI: &str = "/set/{pan}/{tilt}/{duration}";
const RESET_URI: &str = "/reset";
const RESET_DURATION_URI: &str = "/reset/{duration}";
const CONTROL_URI: &str = "/control";
const VIDEO_FEED_URI: &str = "/video_feed";
const CAMERA_DIAGNOSTICS_URI: &str = "/camera_diagnostics";
const CAMERA_ERRORS_URI: &str = "/camera_errors";
const RESET_CAMERA_URI: &str = "/reset_camera";
const CONFIGURE_CAMERA_URI: &str = "/configure_camera";
const POSITION_CONTROL_URI: &str = "/position_control";

// JSON API
const POSITION_URI: &str = "/api/v1/position";
const API_RESET_URI: &str = "/api/v1/reset";
const SESSION_URI: &str = "/api/v1/session/{id}";
const EVENTS_URI: &str = "/api/v1/events";
const TRACKING_URI: &str = "/api/v1/tracking";
const TRACKING_ENABLE_URI: &str = "/api/v1/tracking/enable";
const TRACKING_DISABLE_URI: &str = "/api/v1/tracking/disable";
const TRACKING_DETECTIONS_URI: &str = "/api/v1/tracking/detections";
const DIAGNOSTICS_URI: &str = "/api/v1/diagnostics";

const POSITION_CONTROL_PAGE: &str = "position_control.html";
const HOLD_CHANNEL_SIZE: usize = 16;
const VIDEO_CHANNEL_SIZE: usize = 4;
const ONE_TIME_STATUS: &str = "Position set (one-time)";

#[derive(RustEmbed, Clone)]
#[folder = "$CARGO_MANIFEST_DIR/web/"]
struct Assets;

#[derive(Clone)]
pub struct Web {
    turret: Turret,
    addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

impl Web {
    pub fn new(turret: Turret, addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Web {
            turret,
            addr,
            shutdown_tx,
        }
    }

    pub fn router(self) -> Router {
        // In dev mode, serve files from the source tree for live reload
        #[cfg(feature = "dev")]
        let serve_assets = ServeDir::new(concat!(env!("CARGO_MANIFEST_DIR"), "/web"));
        #[cfg(not(feature = "dev"))]
        let serve_assets = ServeEmbed::<Assets>::new();

        Router::new()
            .route(ROOT_URI, get(root_handler))
            .route(SET_URI, get(set_handler))
            .route(SET_DURATION_URI, get(set_handler))
            .route(RESET_URI, get(reset_handler))
            .route(RESET_DURATION_URI, get(reset_duration_handler))
            .route(CONTROL_URI, get(control_handler))
            .route(VIDEO_FEED_URI, get(video_feed_handler))
            .route(CAMERA_DIAGNOSTICS_URI, get(camera_diagnostics_handler))
            .route(CAMERA_ERRORS_URI, get(camera_errors_handler))
            .route(RESET_CAMERA_URI, get(reset_camera_handler))
            .route(CONFIGURE_CAMERA_URI, get(configure_camera_handler))
            .route(POSITION_CONTROL_URI, get(position_control_handler))
            // JSON API
            .route(POSITION_URI, get(get_position).put(put_position))
            .route(API_RESET_URI, post(post_reset))
            .route(SESSION_URI, delete(delete_session))
            .route(EVENTS_URI, get(events_handler))
            .route(TRACKING_URI, get(get_tracking))
            .route(TRACKING_ENABLE_URI, post(enable_tracking))
            .route(TRACKING_DISABLE_URI, post(disable_tracking))
            .route(TRACKING_DETECTIONS_URI, post(post_detections))
            .route(DIAGNOSTICS_URI, get(get_diagnostics))
            // Apply no-cache middleware to all API routes
            .layer(middleware::from_fn(no_cache_middleware))
            // Static assets (no middleware - can be cached)
            .fallback_service(serve_assets)
            .with_state(self)
    }

    pub async fn run(self, subsys: SubsystemHandle) -> Result<(), TurretError> {
        let addr = self.addr;
        let listener = TcpListener::bind(addr).await.map_err(TurretError::Io)?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let shutdown_tx = self.shutdown_tx.clone(); // Clone as self is moved into router() below
        let app = self.router();

        log::info!("Starting HTTP web server on {}", addr);

        tokio::select! { biased;
            _ = subsys.on_shutdown_requested() => {
                let _ = shutdown_tx.send(());
            },
            r = axum::serve(listener, app)
                    .with_graceful_shutdown(
                        async move {
                            _ = shutdown_rx.recv().await;
                        }
                    ) => {
                return r.map_err(TurretError::Io);
            }
        }
        Ok(())
    }
}

/// Middleware to add no-cache headers to API responses
async fn no_cache_middleware(request: axum::http::Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    response
}

// =============================================================================
// Request parsing
// =============================================================================

fn parse_number(name: &str, value: &str) -> Result<f64, TurretError> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| TurretError::BadRequest(format!("{} '{}' is not a number", name, value)))
}

/// Seconds as sent by a client; negative or non-finite values are refused
fn parse_duration_secs(secs: f64) -> Result<Duration, TurretError> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(TurretError::BadRequest(format!(
            "duration {} must be a non-negative number of seconds",
            secs
        )));
    }
    Ok(duration_from_secs(secs))
}

// =============================================================================
// Hold progress streams: /set and /reset
// =============================================================================

#[derive(Deserialize)]
struct SetParams {
    pan: String,
    tilt: String,
    duration: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct HoldProgress {
    session: SessionId,
    pan: f64,
    tilt: f64,
    /// Seconds left
    remaining: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fault: Option<String>,
}

fn final_status(status: &SessionStatus) -> &'static str {
    match status.state {
        SessionState::Expired if status.fault.is_some() => "fault",
        SessionState::Expired | SessionState::Running => "complete",
        SessionState::Superseded => "superseded",
        SessionState::Cancelled => "cancelled",
    }
}

fn json_event(value: &impl Serialize) -> Option<Event> {
    match Event::default().json_data(value) {
        Ok(event) => Some(event),
        Err(e) => {
            log::warn!("Cannot encode SSE event: {}", e);
            None
        }
    }
}

#[debug_handler]
async fn root_handler() -> Response {
    Json(json!({ "status": "Fan Turret is running" })).into_response()
}

#[debug_handler]
async fn set_handler(
    State(state): State<Web>,
    Path(params): Path<SetParams>,
) -> Result<Response, TurretError> {
    let pan = parse_number("pan", &params.pan)?;
    let tilt = parse_number("tilt", &params.tilt)?;
    let duration = match params.duration {
        Some(d) => parse_duration_secs(parse_number("duration", &d)?)?,
        None => state.turret.config.hold.default_duration(),
    };
    debug!("GET /set {} {} for {:?}", pan, tilt, duration);

    let arbiter = &state.turret.arbiter;
    let events = arbiter.subscribe();
    let handle = arbiter.request_angles(pan, tilt, duration, MotionSource::Manual)?;
    Ok(state.hold_response(handle, duration, events).await)
}

#[debug_handler]
async fn reset_handler(State(state): State<Web>) -> Response {
    let duration = state.turret.config.hold.default_duration();
    state.start_reset(duration).await
}

#[debug_handler]
async fn reset_duration_handler(
    State(state): State<Web>,
    Path(duration): Path<String>,
) -> Result<Response, TurretError> {
    let duration = parse_duration_secs(parse_number("duration", &duration)?)?;
    Ok(state.start_reset(duration).await)
}

impl Web {
    async fn start_reset(&self, duration: Duration) -> Response {
        debug!("GET /reset for {:?}", duration);
        let events = self.turret.arbiter.subscribe();
        let handle = self.turret.arbiter.reset(duration);
        self.hold_response(handle, duration, events).await
    }

    /// JSON for a one-shot command, an SSE progress stream otherwise
    async fn hold_response(
        &self,
        handle: SessionHandle,
        duration: Duration,
        mut events: broadcast::Receiver<MotionEvent>,
    ) -> Response {
        if duration.is_zero() {
            let status = handle.wait().await;
            let mut fault = status.fault;
            while let Ok(event) = events.try_recv() {
                if let MotionEvent::HardwareFault { session, message, .. } = event {
                    if session == handle.id() {
                        fault = Some(message);
                    }
                }
            }
            let target = handle.target();
            return Json(json!({
                "status": ONE_TIME_STATUS,
                "session": handle.id(),
                "pan": target.pan(),
                "tilt": target.tilt(),
                "fault": fault,
            }))
            .into_response();
        }

        let (tx, rx) = mpsc::channel(HOLD_CHANNEL_SIZE);
        tokio::spawn(hold_progress(
            self.turret.arbiter.clone(),
            handle,
            events,
            self.turret.config.hold.progress_interval(),
            tx,
        ));
        Sse::new(ReceiverStream::new(rx).map(Ok::<Event, Infallible>))
            .keep_alive(KeepAlive::default())
            .into_response()
    }
}

/// Report the session's progress until it ends. Cancels the session when
/// the client goes away.
async fn hold_progress(
    arbiter: Arbiter,
    handle: SessionHandle,
    mut events: broadcast::Receiver<MotionEvent>,
    every: Duration,
    tx: mpsc::Sender<Event>,
) {
    let id = handle.id();
    let target = handle.target();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let progress = |remaining: f64, status, fault| HoldProgress {
        session: id,
        pan: target.pan(),
        tilt: target.tilt(),
        remaining,
        status,
        fault,
    };

    loop {
        let tick = tokio::select! { biased;
            _ = tx.closed() => {
                if arbiter.cancel(&handle) {
                    debug!("Client left, session {} cancelled", id);
                }
                return;
            }
            _ = handle.wait() => false,
            event = events.recv() => {
                match event {
                    Ok(MotionEvent::HardwareFault { session, consecutive, message }) if session == id => {
                        let data = json!({ "session": id, "consecutive": consecutive, "message": message });
                        if let Some(event) = json_event(&data) {
                            let _ = tx.send(event.event("error")).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        trace!("Hold stream {} missed {} events", id, n);
                    }
                    _ => {}
                }
                false
            }
            _ = ticker.tick() => true,
        };

        let status = handle.status();
        if status.state.is_terminal() {
            let result = final_status(&status);
            debug!("Hold stream for session {} done: {}", id, result);
            if let Some(event) = json_event(&progress(0.0, Some(result), status.fault)) {
                let _ = tx.send(event).await;
            }
            return;
        }
        if tick {
            let remaining = handle.remaining().as_secs_f64();
            if let Some(event) = json_event(&progress(remaining, None, None)) {
                let _ = tx.send(event).await;
            }
        }
    }
}

// =============================================================================
// Auto-sweep stream
// =============================================================================

#[debug_handler]
async fn control_handler(State(state): State<Web>) -> Response {
    let sub = state.turret.modes.start_sweep();
    debug!("GET /control: sweep {} streaming", sub.id);
    let stream = ReceiverStream::new(sub.points).map(|point| Event::default().json_data(point));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// =============================================================================
// JSON API
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionApi {
    position: Position,
    active_session: Option<SessionInfo>,
    mode: ControlMode,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionApi {
    id: SessionId,
    target: Position,
    source: MotionSource,
    duration_ms: u64,
    state: SessionState,
}

impl SessionApi {
    fn new(handle: &SessionHandle, duration: Duration) -> Self {
        SessionApi {
            id: handle.id(),
            target: handle.target(),
            source: handle.source(),
            duration_ms: duration.as_millis() as u64,
            state: handle.state(),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetPositionRequest {
    pan: f64,
    tilt: f64,
    #[serde(default, alias = "duration_secs")]
    duration_secs: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ResetRequest {
    #[serde(default, alias = "duration_secs")]
    duration_secs: Option<f64>,
}

#[debug_handler]
async fn get_position(State(state): State<Web>) -> Response {
    let snapshot = state.turret.arbiter.snapshot();
    Json(PositionApi {
        position: snapshot.position,
        active_session: snapshot.active_session,
        mode: state.turret.modes.mode(),
    })
    .into_response()
}

#[debug_handler]
async fn put_position(
    State(state): State<Web>,
    Json(request): Json<SetPositionRequest>,
) -> Result<Response, TurretError> {
    let duration = match request.duration_secs {
        Some(secs) => parse_duration_secs(secs)?,
        None => state.turret.config.hold.default_duration(),
    };
    debug!("PUT position {} {} for {:?}", request.pan, request.tilt, duration);
    let handle = state.turret.arbiter.request_angles(
        request.pan,
        request.tilt,
        duration,
        MotionSource::Manual,
    )?;
    Ok((StatusCode::CREATED, Json(SessionApi::new(&handle, duration))).into_response())
}

// The body is optional, so it is parsed by hand
#[debug_handler]
async fn post_reset(State(state): State<Web>, body: Bytes) -> Result<Response, TurretError> {
    let request: ResetRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ResetRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| TurretError::BadRequest(e.to_string()))?
    };
    let duration = match request.duration_secs {
        Some(secs) => parse_duration_secs(secs)?,
        None => state.turret.config.hold.default_duration(),
    };
    let handle = state.turret.arbiter.reset(duration);
    Ok((StatusCode::CREATED, Json(SessionApi::new(&handle, duration))).into_response())
}

#[debug_handler]
async fn delete_session(State(state): State<Web>, Path(id): Path<u64>) -> Response {
    if !state.turret.arbiter.cancel_session(SessionId(id)) {
        debug!("DELETE session {}: not active", id);
    }
    StatusCode::NO_CONTENT.into_response()
}

fn event_name(event: &MotionEvent) -> &'static str {
    match event {
        MotionEvent::SessionStarted { .. } => "sessionStarted",
        MotionEvent::SessionEnded { .. } => "sessionEnded",
        MotionEvent::HardwareFault { .. } => "error",
    }
}

#[debug_handler]
async fn events_handler(State(state): State<Web>) -> Response {
    let stream = BroadcastStream::new(state.turret.arbiter.subscribe()).filter_map(|event| {
        match event {
            Ok(event) => Some(Event::default().event(event_name(&event)).json_data(&event)),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                debug!("Event subscriber lagged, {} events dropped", n);
                None
            }
        }
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

// =============================================================================
// Tracking
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TrackingApi {
    mode: ControlMode,
    #[serde(flatten)]
    status: TrackingStatus,
}

impl Web {
    fn tracking_api(&self) -> TrackingApi {
        TrackingApi {
            mode: self.turret.modes.mode(),
            status: self.turret.tracking().status(),
        }
    }
}

#[debug_handler]
async fn get_tracking(State(state): State<Web>) -> Response {
    Json(state.tracking_api()).into_response()
}

#[debug_handler]
async fn enable_tracking(State(state): State<Web>) -> Response {
    state.turret.modes.enable_tracking();
    Json(state.tracking_api()).into_response()
}

#[debug_handler]
async fn disable_tracking(State(state): State<Web>) -> Response {
    state.turret.modes.disable_tracking();
    Json(state.tracking_api()).into_response()
}

#[debug_handler]
async fn post_detections(
    State(state): State<Web>,
    Json(detections): Json<Vec<Detection>>,
) -> Result<Response, TurretError> {
    let total = detections.len();
    let detections: Vec<Detection> = detections
        .into_iter()
        .filter(|d| d.centroid().is_normalized())
        .collect();
    let ignored = total - detections.len();
    if ignored > 0 {
        debug!("Ignoring {} detections outside the unit square", ignored);
    }
    trace!("POST {} detections", detections.len());

    let feed = state.turret.tracking();
    let mut response = match feed.on_detections(&detections) {
        FeedOutcome::Disabled => {
            return Err(TurretError::ModeConflict(
                "auto-tracking is not enabled".to_string(),
            ))
        }
        FeedOutcome::Requested(handle) => json!({
            "outcome": "requested",
            "session": SessionApi::new(&handle, feed.config().hold_duration()),
        }),
        FeedOutcome::RateLimited => json!({ "outcome": "rateLimited" }),
        FeedOutcome::NoDetection => json!({ "outcome": "noDetection" }),
    };
    response["ignored"] = json!(ignored);
    Ok(Json(response).into_response())
}

// =============================================================================
// Camera
// =============================================================================

fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}

#[debug_handler]
async fn video_feed_handler(State(state): State<Web>) -> Result<Response, TurretError> {
    let mut frames = state.turret.camera.subscribe()?;
    let (tx, rx) = mpsc::channel::<Bytes>(VIDEO_CHANNEL_SIZE);

    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = tx.closed() => break,
                frame = frames.next_frame() => frame,
            };
            match frame {
                Ok(frame) => {
                    if tx.send(multipart_part(&frame.data)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Video feed ended: {}", e);
                    break;
                }
            }
        }
        trace!("Video feed client gone");
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, Infallible>));
    Ok((
        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
        body,
    )
        .into_response())
}

#[debug_handler]
async fn camera_diagnostics_handler(State(state): State<Web>) -> Response {
    Json(state.turret.camera.diagnostics()).into_response()
}

#[debug_handler]
async fn camera_errors_handler(State(state): State<Web>) -> Response {
    Json(json!({ "errors": state.turret.camera.recent_errors() })).into_response()
}

#[debug_handler]
async fn reset_camera_handler(State(state): State<Web>) -> Response {
    let status = state.turret.camera.reset().await;
    let available = state.turret.camera.is_available();
    Json(json!({
        "status": if available { "Camera reset successful" } else { "Camera reset failed" },
        "success": available,
        "camera": status,
    }))
    .into_response()
}

#[debug_handler]
async fn configure_camera_handler(
    State(state): State<Web>,
    Query(settings): Query<CameraSettings>,
) -> Response {
    let config = state.turret.camera.configure(&settings);
    Json(json!({
        "status": "Camera configuration updated",
        "config": config,
    }))
    .into_response()
}

#[debug_handler]
async fn get_diagnostics(State(state): State<Web>) -> Response {
    Json(diagnostics::collect(&state.turret)).into_response()
}

#[debug_handler]
async fn position_control_handler() -> Response {
    match Assets::get(POSITION_CONTROL_PAGE) {
        Some(file) => Html(file.data).into_response(),
        None => (StatusCode::NOT_FOUND, "Position control page missing").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use turret_core::SimulatedActuator;

    fn app() -> (Router, Turret, SimulatedActuator) {
        let (turret, sim) = Turret::new_fake();
        let web = Web::new(turret.clone(), ([127, 0, 0, 1], 0).into());
        (web.router(), turret, sim)
    }

    fn request(method: &str, uri: &str, body: Option<serde_json::Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn call(app: Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    async fn read_stream(response: Response) -> String {
        let bytes = tokio::time::timeout(
            Duration::from_secs(2),
            response.into_body().collect(),
        )
        .await
        .unwrap()
        .unwrap()
        .to_bytes();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    #[tokio::test]
    async fn test_root() {
        let (app, _, _) = app();
        let response = app.oneshot(request("GET", "/", None)).await.unwrap();
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-cache, no-store, must-revalidate"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&bytes).unwrap()["status"],
            "Fan Turret is running"
        );
    }

    #[tokio::test]
    async fn test_set_one_time_with_negative_angles() {
        let (app, turret, sim) = app();
        let (status, json) = call(app, request("GET", "/set/-45/-30.5/0", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], ONE_TIME_STATUS);
        assert_eq!(json["pan"], -45.0);
        assert_eq!(json["tilt"], -30.5);
        assert_eq!(sim.commands(), vec![Position::new(-45.0, -30.5).unwrap()]);
        assert_eq!(turret.arbiter.position(), Position::new(-45.0, -30.5).unwrap());
    }

    #[tokio::test]
    async fn test_set_rejects_bad_input() {
        let (app, turret, sim) = app();
        let (status, json) = call(app.clone(), request("GET", "/set/91/0/1", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].as_str().unwrap().contains("91"));

        let (status, _) = call(app.clone(), request("GET", "/set/abc/0", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = call(app, request("GET", "/set/0/0/-1", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        assert_eq!(turret.arbiter.position(), Position::CENTER);
        assert_eq!(sim.command_count(), 0);
    }

    #[tokio::test]
    async fn test_set_stream_completes() {
        let (app, _, sim) = app();
        let response = app
            .oneshot(request("GET", "/set/10/-10/0.1", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");

        let body = read_stream(response).await;
        assert!(body.contains("\"remaining\""));
        assert!(body.contains("\"status\":\"complete\""));
        assert!(sim.command_count() >= 2);
    }

    #[tokio::test]
    async fn test_set_stream_reports_supersede() {
        let (app, turret, _) = app();
        let response = app
            .oneshot(request("GET", "/set/10/10/5", None))
            .await
            .unwrap();
        turret
            .arbiter
            .request_angles(-10.0, -10.0, Duration::from_millis(50), MotionSource::Manual)
            .unwrap();
        let body = read_stream(response).await;
        assert!(body.contains("\"status\":\"superseded\""));
    }

    #[tokio::test]
    async fn test_reset_stream_and_disconnect() {
        let (app, turret, _) = app();
        turret
            .arbiter
            .request_angles(30.0, 30.0, Duration::from_secs(5), MotionSource::Manual)
            .unwrap();

        let response = app.oneshot(request("GET", "/reset/5", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(turret.arbiter.position(), Position::CENTER);
        assert!(turret.arbiter.active_session().is_some());

        // Client disconnect cancels the reset session
        drop(response);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(turret.arbiter.active_session(), None);
    }

    #[tokio::test]
    async fn test_position_api() {
        let (app, turret, _) = app();
        let (status, json) = call(
            app.clone(),
            request(
                "PUT",
                POSITION_URI,
                Some(json!({ "pan": 45.0, "tilt": -30.0, "durationSecs": 5 })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["target"]["pan"], 45.0);
        assert_eq!(json["source"], "manual");
        let id = json["id"].as_u64().unwrap();

        let (status, json) = call(app.clone(), request("GET", POSITION_URI, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["position"]["tilt"], -30.0);
        assert_eq!(json["activeSession"]["id"], id);
        assert_eq!(json["mode"], "manual");

        let uri = format!("/api/v1/session/{}", id);
        let (status, _) = call(app.clone(), request("DELETE", &uri, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(turret.arbiter.active_session(), None);
        // Idempotent
        let (status, _) = call(app.clone(), request("DELETE", &uri, None)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = call(app, request("POST", API_RESET_URI, None)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["source"], "reset");
        assert_eq!(json["durationMs"], 10_000);
        assert_eq!(turret.arbiter.position(), Position::CENTER);
    }

    #[tokio::test]
    async fn test_put_position_out_of_range() {
        let (app, turret, _) = app();
        let (status, _) = call(
            app,
            request("PUT", POSITION_URI, Some(json!({ "pan": 0.0, "tilt": -90.5 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(turret.arbiter.active_session(), None);
    }

    #[tokio::test]
    async fn test_detections_need_tracking_enabled() {
        let (app, turret, _) = app();
        let detections = json!([{ "x": 0.75, "y": 0.5, "confidence": 0.9 }]);
        let (status, _) = call(
            app.clone(),
            request("POST", TRACKING_DETECTIONS_URI, Some(detections.clone())),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, json) = call(app.clone(), request("POST", TRACKING_ENABLE_URI, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["mode"], "auto-track");
        assert_eq!(json["enabled"], true);

        let (status, json) = call(
            app.clone(),
            request("POST", TRACKING_DETECTIONS_URI, Some(detections)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "requested");
        assert_eq!(json["session"]["source"], "auto-track");
        assert_eq!(turret.arbiter.position(), Position::new(45.0, 0.0).unwrap());

        assert_eq!(json["ignored"], 0);
    }

    #[tokio::test]
    async fn test_detections_outside_frame_are_ignored() {
        let (app, turret, _) = app();
        turret.modes.enable_tracking();

        let (status, json) = call(
            app.clone(),
            request("POST", TRACKING_DETECTIONS_URI, Some(json!([{ "x": 1.5, "y": 0.5 }]))),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "noDetection");
        assert_eq!(json["ignored"], 1);
        assert_eq!(turret.arbiter.position(), Position::CENTER);

        // The stronger detection is off-frame; the valid one is followed
        let mixed = json!([
            { "x": -0.2, "y": 0.5, "confidence": 0.99 },
            { "x": 0.25, "y": 0.5, "confidence": 0.5 },
        ]);
        let (status, json) = call(
            app,
            request("POST", TRACKING_DETECTIONS_URI, Some(mixed)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["outcome"], "requested");
        assert_eq!(json["ignored"], 1);
        assert_eq!(turret.arbiter.position(), Position::new(-45.0, 0.0).unwrap());
    }

    #[tokio::test]
    async fn test_control_stream() {
        let (app, turret, sim) = app();
        let response = app.oneshot(request("GET", CONTROL_URI, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(turret.modes.mode(), ControlMode::AutoSweep);

        let mut body = response.into_body();
        let frame = tokio::time::timeout(Duration::from_secs(1), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let data = frame.into_data().unwrap();
        let text = String::from_utf8_lossy(&data);
        assert!(text.starts_with("data: "));
        assert!(text.contains("\"angle\""));
        // The first command runs on the blocking pool
        let commanded = tokio::time::timeout(Duration::from_secs(1), async {
            while sim.command_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(commanded.is_ok());

        drop(body);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(turret.modes.mode(), ControlMode::Manual);
    }

    #[tokio::test]
    async fn test_video_feed_without_camera() {
        let (app, _, _) = app();
        let (status, json) = call(app, request("GET", VIDEO_FEED_URI, None)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].as_str().unwrap().contains("Camera unavailable"));
    }

    #[tokio::test]
    async fn test_camera_endpoints() {
        let (app, _, _) = app();
        let (status, json) = call(
            app.clone(),
            request("GET", "/configure_camera?primary_index=2&aggressive_reset=false", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["config"]["primaryIndex"], 2);
        assert_eq!(json["config"]["aggressiveReset"], false);

        let (_, json) = call(app.clone(), request("GET", CAMERA_ERRORS_URI, None)).await;
        assert_eq!(json["errors"].as_array().unwrap().len(), 2);

        let (_, json) = call(app.clone(), request("GET", CAMERA_DIAGNOSTICS_URI, None)).await;
        assert_eq!(json["status"]["state"], "disabled");

        let (_, json) = call(app, request("GET", RESET_CAMERA_URI, None)).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_diagnostics_and_page() {
        let (app, _, _) = app();
        let (status, json) = call(app.clone(), request("GET", DIAGNOSTICS_URI, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["actuator"]["driver"], "simulated");

        let response = app
            .oneshot(request("GET", POSITION_CONTROL_URI, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&bytes).contains("/set/"));
    }

    #[test]
    fn test_multipart_part() {
        let part = multipart_part(b"\xff\xd8\xff\xd9");
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n"));
        assert!(part.ends_with(b"\xff\xd8\xff\xd9\r\n"));
    }
}
