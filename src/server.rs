//! ==============================================================================
//! server.rs - dashboard json api
//! ==============================================================================
//!
//! routes:
//!     GET  /health                  liveness
//!     GET  /api/readings            reconciled view, one entry per sensor
//!     GET  /api/sensors/:id         selected map marker
//!     GET  /api/history             filtered / sorted / paged detection log
//!     POST /api/refresh             manual refresh, returns the outcome
//!     POST /api/hooks/detections    database webhook (insert notification)
//!
//! the browser front end owns rendering. everything here is plain json, and
//! missing values come out as placeholders rather than errors.
//!
//! relationships:
//!     - uses: refresh.rs (shared state), estimate.rs (display labels),
//!             history.rs (log view), feed.rs (webhook notices)
//!
//! ==============================================================================

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::config::HistoryConfig;
use crate::domain::{DetectionEvent, HistoryRow, LatestReading, SensorStatus};
use crate::estimate::{self, EventEstimates, LocationEstimator, MarkerState, SIZE_PLACEHOLDER};
use crate::feed::{self, ChangeFeed, NoticeOrigin};
use crate::history::{self, HistoryFilter, HistoryParams, HistoryQuery, HistorySort};
use crate::reconcile::WindowReport;
use crate::refresh::{Phase, RefreshOutcome, Refresher};
use crate::source::DataSource;

const SECRET_HEADER: &str = "x-webhook-secret";

// ==============================================================================
// shared state
// ==============================================================================

pub struct AppState<S> {
    pub refresher: Refresher<S>,
    pub feed: ChangeFeed,
    pub estimator: Arc<dyn LocationEstimator>,
    pub history: HistoryConfig,
    pub webhook_secret: Option<String>,
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            refresher: self.refresher.clone(),
            feed: self.feed.clone(),
            estimator: self.estimator.clone(),
            history: self.history.clone(),
            webhook_secret: self.webhook_secret.clone(),
        }
    }
}

// ==============================================================================
// response types
// ==============================================================================

#[derive(Debug, Serialize)]
pub struct ReadingDetail {
    pub event_id: String,
    pub created_at: DateTime<Utc>,
    pub leak_detected: bool,
    pub confidence: Option<f64>,
    pub confidence_label: String,
    pub estimates: EventEstimates,
}

#[derive(Debug, Serialize)]
pub struct ReadingView {
    pub sensor_id: String,
    pub name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub battery: String,
    pub status: SensorStatus,
    pub marker: MarkerState,
    pub reading: Option<ReadingDetail>,
}

#[derive(Debug, Serialize)]
pub struct ReadingsResponse {
    pub phase: Phase,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub window: WindowReport,
    pub readings: Vec<ReadingView>,
}

#[derive(Debug, Serialize)]
pub struct HistoryItem {
    #[serde(flatten)]
    pub row: HistoryRow,
    pub estimates: EventEstimates,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub filter: HistoryFilter,
    pub sort: HistorySort,
    pub items: Vec<HistoryItem>,
    pub page: usize,
    pub page_size: usize,
    pub page_count: usize,
    pub total: usize,
    pub has_prev: bool,
    pub has_next: bool,
    /// set when the log could not be fetched; items is then empty
    pub error: Option<String>,
}

fn confidence_label(confidence: Option<f64>) -> String {
    match confidence {
        Some(c) if c.is_finite() => format!("{:.0}%", c),
        _ => SIZE_PLACEHOLDER.to_string(),
    }
}

fn reading_detail(event: &DetectionEvent, sensor_name: &str, estimator: &dyn LocationEstimator) -> ReadingDetail {
    ReadingDetail {
        event_id: event.id.clone(),
        created_at: event.created_at,
        leak_detected: event.leak_detected,
        confidence: event.confidence,
        confidence_label: confidence_label(event.confidence),
        estimates: estimate::describe(event, sensor_name, estimator),
    }
}

pub fn reading_view(reading: &LatestReading, estimator: &dyn LocationEstimator) -> ReadingView {
    let sensor = &reading.sensor;
    let (latitude, longitude) = match sensor.coordinate() {
        Some((lat, lon)) => (Some(lat), Some(lon)),
        None => (None, None),
    };

    ReadingView {
        sensor_id: sensor.id.clone(),
        name: sensor.name.clone(),
        latitude,
        longitude,
        battery: estimate::battery_label(sensor.battery_level),
        status: sensor.status,
        marker: estimate::marker_state(reading),
        reading: reading
            .event
            .as_ref()
            .map(|e| reading_detail(e, &sensor.name, estimator)),
    }
}

// ==============================================================================
// errors
// ==============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({"status": "error", "message": self.message});
        (self.status, Json(body)).into_response()
    }
}

// ==============================================================================
// handlers
// ==============================================================================

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn readings_handler<S: DataSource>(State(app): State<AppState<S>>) -> Json<ReadingsResponse> {
    let snapshot = app.refresher.snapshot().await;
    let estimator = app.estimator.as_ref();

    Json(ReadingsResponse {
        phase: snapshot.phase,
        last_update: snapshot.last_update,
        last_error: snapshot.last_error,
        readings: snapshot
            .readings
            .iter()
            .map(|r| reading_view(r, estimator))
            .collect(),
        window: snapshot.window,
    })
}

async fn sensor_handler<S: DataSource>(
    State(app): State<AppState<S>>,
    Path(sensor_id): Path<String>,
) -> Result<Json<ReadingView>, ApiError> {
    let snapshot = app.refresher.snapshot().await;
    snapshot
        .readings
        .iter()
        .find(|r| r.sensor.id == sensor_id)
        .map(|r| Json(reading_view(r, app.estimator.as_ref())))
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, format!("unknown sensor '{}'", sensor_id)))
}

async fn history_handler<S: DataSource>(
    State(app): State<AppState<S>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let HistoryQuery { filter, sort, page } = params
        .parse()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("{:#}", e)))?;

    let (rows, error) = match app.refresher.source().fetch_history(app.history.limit).await {
        Ok(rows) => (rows, None),
        Err(e) => {
            warn!("[HISTORY] ⚠ Fetch failed: {:#}", e);
            (Vec::new(), Some(format!("{:#}", e)))
        }
    };

    let view = history::apply(&rows, &filter, sort);
    let page = history::paginate(view, page, app.history.page_size);
    let estimator = app.estimator.as_ref();

    let items = page
        .rows
        .into_iter()
        .map(|row| {
            let name = row.sensor_name.as_deref().unwrap_or(&row.event.sensor_id);
            let estimates = estimate::describe(&row.event, name, estimator);
            HistoryItem { row, estimates }
        })
        .collect();

    Ok(Json(HistoryResponse {
        filter,
        sort,
        items,
        page: page.page,
        page_size: page.page_size,
        page_count: page.page_count,
        total: page.total,
        has_prev: page.has_prev,
        has_next: page.has_next,
        error,
    }))
}

async fn refresh_handler<S: DataSource>(State(app): State<AppState<S>>) -> Json<RefreshOutcome> {
    Json(app.refresher.refresh(NoticeOrigin::Manual).await)
}

/// database webhook; the payload only matters for logging
async fn webhook_handler<S: DataSource>(
    State(app): State<AppState<S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let provided = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if !feed::verify_secret(app.webhook_secret.as_deref(), provided) {
        warn!("[FEED] Rejected webhook with bad secret");
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "bad webhook secret"));
    }

    let kind = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    info!("[FEED] Webhook received ({})", kind);

    let queued = app.feed.notify(NoticeOrigin::Webhook);
    Ok(Json(serde_json::json!({"status": "ok", "queued": queued})))
}

// ==============================================================================
// web server
// ==============================================================================

pub fn router<S: DataSource>(app: AppState<S>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/readings", get(readings_handler::<S>))
        .route("/api/sensors/:id", get(sensor_handler::<S>))
        .route("/api/history", get(history_handler::<S>))
        .route("/api/refresh", post(refresh_handler::<S>))
        .route("/api/hooks/detections", post(webhook_handler::<S>))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

pub async fn run_server<S: DataSource>(app: AppState<S>, bind: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("[SERVER] ✓ Dashboard API live at http://{}", bind);
    axum::serve(listener, router(app)).await?;
    Ok(())
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Sensor;
    use crate::estimate::{FixedLocationEstimator, RandomLocationEstimator};
    use crate::source::testing::MemorySource;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    fn sensor(id: &str, status: SensorStatus) -> Sensor {
        Sensor {
            id: id.to_string(),
            name: format!("Main {}", id),
            latitude: Some(40.0),
            longitude: None,
            battery_level: Some(64.6),
            status,
        }
    }

    fn event(id: &str, sensor_id: &str, leak: bool, confidence: f64, minute: u32) -> DetectionEvent {
        DetectionEvent {
            id: id.to_string(),
            sensor_id: sensor_id.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 7, 1, 6, minute, 0).unwrap(),
            leak_detected: leak,
            confidence: Some(confidence),
            estimated_size: None,
            estimated_location: None,
        }
    }

    fn app(secret: Option<&str>) -> (AppState<MemorySource>, mpsc::Receiver<feed::ChangeNotice>) {
        let source = MemorySource::new(
            vec![sensor("S-1", SensorStatus::Active), sensor("S-2", SensorStatus::Offline)],
            vec![
                event("e1", "S-1", false, 30.0, 1),
                event("e2", "S-1", true, 90.0, 2),
                event("e3", "S-3", true, 70.0, 3),
            ],
        );
        let (feed, rx) = ChangeFeed::channel();
        let state = AppState {
            refresher: Refresher::new(Arc::new(source), 50),
            feed,
            estimator: Arc::new(FixedLocationEstimator(25)),
            history: HistoryConfig { limit: 100, page_size: 2 },
            webhook_secret: secret.map(str::to_string),
        };
        (state, rx)
    }

    #[tokio::test]
    async fn test_readings_before_first_refresh() {
        let (app, _rx) = app(None);
        let Json(body) = readings_handler(State(app)).await;
        assert_eq!(body.phase, Phase::Loading);
        assert!(body.readings.is_empty());
    }

    #[tokio::test]
    async fn test_readings_view() {
        let (app, _rx) = app(None);
        app.refresher.refresh(NoticeOrigin::Startup).await;

        let Json(body) = readings_handler(State(app)).await;
        assert_eq!(body.phase, Phase::Ready);
        assert_eq!(body.readings.len(), 2);

        let first = &body.readings[0];
        assert_eq!(first.marker, MarkerState::Leak);
        assert_eq!(first.battery, "65%");
        assert_eq!(first.latitude, None, "half a coordinate is no coordinate");
        let detail = first.reading.as_ref().unwrap();
        assert_eq!(detail.event_id, "e2");
        assert_eq!(detail.confidence_label, "90%");
        assert_eq!(detail.estimates.size, "Large");
        assert_eq!(detail.estimates.location, "~25m from Main S-1");

        let second = &body.readings[1];
        assert_eq!(second.marker, MarkerState::Offline);
        assert!(second.reading.is_none());
    }

    #[tokio::test]
    async fn test_list_and_popup_show_same_location() {
        let (mut app, _rx) = app(None);
        app.estimator = Arc::new(RandomLocationEstimator::default());
        app.refresher.refresh(NoticeOrigin::Startup).await;

        let location = |view: &ReadingView| view.reading.as_ref().unwrap().estimates.location.clone();

        let Json(list) = readings_handler(State(app.clone())).await;
        let Json(popup) = sensor_handler(State(app.clone()), Path("S-1".to_string())).await.unwrap();
        let Json(again) = readings_handler(State(app)).await;

        assert_eq!(location(&list.readings[0]), location(&popup));
        assert_eq!(location(&list.readings[0]), location(&again.readings[0]));
    }

    #[tokio::test]
    async fn test_sensor_lookup() {
        let (app, _rx) = app(None);
        app.refresher.refresh(NoticeOrigin::Startup).await;

        let Json(view) = sensor_handler(State(app.clone()), Path("S-2".to_string())).await.unwrap();
        assert_eq!(view.sensor_id, "S-2");

        let missing = sensor_handler(State(app), Path("nope".to_string())).await.unwrap_err();
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_history_filters_sorts_and_pages() {
        let (app, _rx) = app(None);
        let params = HistoryParams {
            leak: Some("leak".into()),
            sort: Some("confidence".into()),
            dir: Some("asc".into()),
            ..Default::default()
        };

        let Json(body) = history_handler(State(app), Query(params)).await.unwrap();
        let ids: Vec<&str> = body.items.iter().map(|i| i.row.event.id.as_str()).collect();
        assert_eq!(ids, ["e3", "e2"]);
        assert_eq!(body.total, 2);
        assert!(!body.has_next);
        assert_eq!(body.items[0].estimates.size, "Medium");
        assert_eq!(body.items[0].estimates.location, "~25m from S-3", "no registry name falls back to id");
        assert!(body.error.is_none());
    }

    #[tokio::test]
    async fn test_history_second_page() {
        let (app, _rx) = app(None);
        let params = HistoryParams { page: Some("2".into()), ..Default::default() };
        let Json(body) = history_handler(State(app), Query(params)).await.unwrap();
        assert_eq!(body.page, 2);
        assert!(body.has_prev);
        assert_eq!(body.items.len(), 1);
        assert_eq!(body.items[0].row.event.id, "e1");
        assert_eq!(body.items[0].estimates.location, "Normal");
    }

    #[tokio::test]
    async fn test_history_query_string_with_empty_values() {
        let (app, _rx) = app(None);
        let uri: axum::http::Uri = "http://localhost/api/history?sensor=&leak=&min_confidence=&page="
            .parse()
            .unwrap();
        let params = Query::<HistoryParams>::try_from_uri(&uri).unwrap();

        let Json(body) = history_handler(State(app), params).await.unwrap();
        assert_eq!(body.page, 1);
        assert_eq!(body.total, 3);
    }

    #[tokio::test]
    async fn test_history_junk_page_is_bad_request() {
        let (app, _rx) = app(None);
        let uri: axum::http::Uri = "http://localhost/api/history?page=abc".parse().unwrap();
        let params = Query::<HistoryParams>::try_from_uri(&uri).unwrap();

        let err = history_handler(State(app), params).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("page"));
    }

    #[tokio::test]
    async fn test_history_bad_params() {
        let (app, _rx) = app(None);
        let params = HistoryParams { dir: Some("sideways".into()), ..Default::default() };
        let err = history_handler(State(app), Query(params)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_fetch_failure_returns_empty_page() {
        let (app, _rx) = app(None);
        *app.refresher.source().failing.lock().await = true;
        let Json(body) = history_handler(State(app), Query(HistoryParams::default())).await.unwrap();
        assert!(body.items.is_empty());
        assert!(body.error.is_some());
    }

    #[tokio::test]
    async fn test_manual_refresh() {
        let (app, _rx) = app(None);
        let Json(outcome) = refresh_handler(State(app)).await;
        assert!(matches!(outcome, RefreshOutcome::Applied { sensors: 2, .. }));
    }

    #[tokio::test]
    async fn test_webhook_queues_notice() {
        let (app, mut rx) = app(Some("s3cret"));

        let mut headers = HeaderMap::new();
        headers.insert(SECRET_HEADER, "s3cret".parse().unwrap());
        let body = Bytes::from_static(br#"{"type":"INSERT","table":"detections","record":{}}"#);

        let Json(reply) = webhook_handler(State(app.clone()), headers, body).await.unwrap();
        assert_eq!(reply["queued"], true);
        assert_eq!(rx.recv().await.unwrap().origin, NoticeOrigin::Webhook);

        let rejected = webhook_handler(State(app), HeaderMap::new(), Bytes::new()).await.unwrap_err();
        assert_eq!(rejected.status, StatusCode::UNAUTHORIZED);
    }
}
