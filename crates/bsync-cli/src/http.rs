//! HTTP surface: capture endpoints, status, per-user reads and the
//! behavior event stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bsync_core::time::now_iso8601;
use bsync_core::{ClientBehavior, ClientMeta, DomainEvent, EngineId, StatusSummary, SyncError};
use bsync_store::UserProfile;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::service::{EnqueueReceipt, StatusReport, SyncService};

pub const NONCE_HEADER: &str = "x-sync-nonce";
const DEFAULT_INSIGHT_LIMIT: usize = 20;
const MAX_INSIGHT_LIMIT: usize = 100;
const STREAM_BATCH: usize = 100;
/// Largest `/sync` batch accepted in one request.
pub const MAX_SYNC_BEHAVIORS: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub service: SyncService,
    pub sync_token: Arc<str>,
    /// How often the event stream looks for new rows.
    pub stream_poll: Duration,
}

impl AppState {
    pub fn new(service: SyncService, sync_token: &str) -> Self {
        Self {
            service,
            sync_token: Arc::from(sync_token),
            stream_poll: Duration::from_secs(1),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/events", post(capture_event))
        .route("/users/{id}/metrics", get(user_metrics))
        .route("/users/{id}/insights", get(user_insights))
        .route("/users/{id}/profile", put(update_profile))
        .route("/stream", get(event_stream))
        .layer(middleware::from_fn_with_state(state.clone(), require_token));

    // /sync carries its nonce in the body; tracking scripts call it
    // cross-origin.
    let public = Router::new()
        .route("/sync", post(sync_behaviors))
        .route("/status", get(status))
        .route("/health", get(health));

    Router::new()
        .merge(protected)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "invalid nonce")
    }

    fn rate_limited() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded")
    }

    fn batch_too_large(len: usize) -> Self {
        Self::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("{len} behaviors in one batch; the limit is {MAX_SYNC_BEHAVIORS}"),
        )
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        let status = match e {
            SyncError::Validation(_) => StatusCode::BAD_REQUEST,
            SyncError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            SyncError::Capacity { .. } => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::Transport(_) | SyncError::Engine { .. } => StatusCode::BAD_GATEWAY,
        };
        Self::new(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "success": false, "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Compare without stopping at the first differing byte.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Deserialize)]
struct NonceQuery {
    nonce: Option<String>,
}

/// Accept the token from `X-Sync-Nonce` or, for event-source clients
/// that cannot set headers, a `nonce` query parameter.
async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let from_header = request
        .headers()
        .get(NONCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let token = match from_header {
        Some(token) => Some(token),
        None => Query::<NonceQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.nonce),
    };
    let authorized = token.is_some_and(|t| tokens_match(&t, &state.sync_token));
    if !authorized {
        return Err(ApiError::forbidden());
    }
    Ok(next.run(request).await)
}

/// User agent and client address as reported by the request headers.
/// `Client-IP` wins over the first `X-Forwarded-For` hop.
fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    let forwarded = header("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim);
    ClientMeta {
        user_agent: header("user-agent").map(str::to_string),
        ip_address: header("client-ip").or(forwarded).map(str::to_string),
    }
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    nonce: String,
    #[serde(default)]
    behaviors: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct Rejected {
    index: usize,
    error: String,
}

#[derive(Debug, Serialize)]
struct SyncData {
    processed: usize,
    rejected: Vec<Rejected>,
    queue_size: usize,
    ai_status: BTreeMap<EngineId, StatusSummary>,
}

/// POST /sync: a batch of browser-reported behaviors.
///
/// Invalid entries are reported per index and do not fail the batch.
async fn sync_behaviors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SyncRequest>,
) -> Result<Json<Value>, ApiError> {
    if !tokens_match(&body.nonce, &state.sync_token) {
        return Err(ApiError::forbidden());
    }
    if !state.service.check_rate_limit().await {
        return Err(ApiError::rate_limited());
    }
    if body.behaviors.len() > MAX_SYNC_BEHAVIORS {
        return Err(ApiError::batch_too_large(body.behaviors.len()));
    }

    let client = client_meta(&headers);

    let mut processed = 0;
    let mut rejected = Vec::new();
    for (index, raw) in body.behaviors.into_iter().enumerate() {
        let draft = serde_json::from_value::<ClientBehavior>(raw)
            .map_err(|e| SyncError::Validation(e.to_string()))
            .and_then(ClientBehavior::into_draft);
        let outcome = match draft {
            Ok(draft) => state.service.capture(draft, &client).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => processed += 1,
            Err(e) => {
                debug!("rejected behavior #{index}: {e}");
                rejected.push(Rejected {
                    index,
                    error: e.to_string(),
                });
            }
        }
    }

    let data = SyncData {
        processed,
        rejected,
        queue_size: state.service.queue_size().await,
        ai_status: state.service.ai_status().await,
    };
    Ok(Json(json!({ "success": true, "data": data })))
}

/// POST /events: one server-side domain event.
async fn capture_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<(StatusCode, Json<EnqueueReceipt>), ApiError> {
    if !state.service.check_rate_limit().await {
        return Err(ApiError::rate_limited());
    }
    let event: DomainEvent =
        serde_json::from_value(raw).map_err(|e| SyncError::Validation(e.to_string()))?;
    let receipt = state
        .service
        .capture(event.into_draft(&now_iso8601()), &client_meta(&headers))
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusReport>, ApiError> {
    Ok(Json(state.service.status().await?))
}

async fn user_metrics(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let totals = state.service.user_metrics(user_id).await?;
    Ok(Json(json!({
        "user_id": user_id,
        "groups": totals.by_group(),
        "totals": totals,
    })))
}

#[derive(Debug, Deserialize)]
struct InsightsQuery {
    limit: Option<usize>,
}

async fn user_insights(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<Value>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_INSIGHT_LIMIT)
        .clamp(1, MAX_INSIGHT_LIMIT);
    let insights = state.service.user_insights(user_id, limit).await?;
    Ok(Json(json!({ "user_id": user_id, "insights": insights })))
}

#[derive(Debug, Deserialize)]
struct ProfileUpdate {
    subscription_plan: Option<String>,
    #[serde(default)]
    completed_milestones: Vec<String>,
}

async fn update_profile(
    State(state): State<AppState>,
    Path(user_id): Path<u64>,
    Json(update): Json<ProfileUpdate>,
) -> Result<Json<UserProfile>, ApiError> {
    let profile = UserProfile {
        user_id,
        subscription_plan: update.subscription_plan,
        completed_milestones: update.completed_milestones,
    };
    state.service.update_profile(profile.clone()).await?;
    Ok(Json(profile))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    last_event_id: Option<i64>,
}

/// GET /stream: newly persisted behavior rows as server-sent events.
///
/// Resumes after `Last-Event-ID` (header first, then query).
async fn event_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let mut cursor = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .or(query.last_event_id)
        .unwrap_or(0);
    let service = state.service.clone();
    let poll = state.stream_poll;
    debug!("event stream client connected after seq {cursor}");

    let stream = async_stream::stream! {
        loop {
            match service.recent_events(cursor, STREAM_BATCH).await {
                Ok(rows) => {
                    for row in rows {
                        cursor = row.seq;
                        yield Event::default()
                            .id(row.seq.to_string())
                            .event("behavior")
                            .json_data(&row);
                    }
                }
                Err(e) => warn!("event stream query failed: {e}"),
            }
            tokio::time::sleep(poll).await;
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use bsync_core::EngineSpec;
    use bsync_store::Store;
    use eventsource_stream::Eventsource;
    use futures_util::StreamExt;
    use tower::util::ServiceExt;

    use crate::service::ServiceOptions;
    use crate::testing::MockTransport;

    const TOKEN: &str = "test-token";

    fn state_and_mock(options: ServiceOptions) -> (AppState, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::accepting());
        let service = SyncService::new(
            Store::open_in_memory().unwrap(),
            EngineSpec::defaults(),
            mock.clone(),
            options,
        )
        .unwrap();
        let mut state = AppState::new(service, TOKEN);
        state.stream_poll = Duration::from_millis(50);
        (state, mock)
    }

    fn state_with(options: ServiceOptions) -> AppState {
        state_and_mock(options).0
    }

    fn state() -> AppState {
        state_with(ServiceOptions::default())
    }

    fn json_request(method: &str, uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(NONCE_HEADER, TOKEN)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_request(uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .uri(uri)
            .header(NONCE_HEADER, TOKEN)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_sync_rejects_wrong_nonce() {
        let app = build_router(state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/sync",
                json!({"nonce": "nope", "behaviors": []}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_sync_reports_per_item_results() {
        let app = build_router(state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/sync",
                json!({
                    "nonce": TOKEN,
                    "behaviors": [
                        {"action": "user_interaction", "user_id": 3, "interaction_type": "click"},
                        {"action": "levitate", "user_id": 3},
                        {"action": "page_view", "user_id": 0},
                    ]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        let data = &body["data"];
        assert_eq!(data["processed"], 1);
        assert_eq!(data["queue_size"], 1);
        assert_eq!(data["rejected"][0]["index"], 1);
        assert_eq!(data["rejected"][1]["index"], 2);
        assert_eq!(data["ai_status"]["ARCHER"]["state"], "unknown");
    }

    #[tokio::test]
    async fn test_sync_rate_limited() {
        let app = build_router(state_with(ServiceOptions {
            rate_limit_per_minute: 1,
            ..Default::default()
        }));
        let batch = json!({"nonce": TOKEN, "behaviors": []});

        let first = app
            .clone()
            .oneshot(json_request("POST", "/sync", batch.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app
            .oneshot(json_request("POST", "/sync", batch))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_sync_caps_batch_size() {
        let app = build_router(state());
        let behaviors: Vec<Value> = (0..=MAX_SYNC_BEHAVIORS)
            .map(|_| json!({"action": "page_view", "user_id": 1}))
            .collect();
        let response = app
            .oneshot(json_request(
                "POST",
                "/sync",
                json!({"nonce": TOKEN, "behaviors": behaviors}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_sync_records_client_session() {
        let (state, mock) = state_and_mock(ServiceOptions::default());
        let app = build_router(state.clone());
        let mut request = json_request(
            "POST",
            "/sync",
            json!({
                "nonce": TOKEN,
                "behaviors": [
                    {"action": "page_view", "user_id": 8, "metadata": {"page_url": "/art/1"}},
                ]
            }),
        );
        let headers = request.headers_mut();
        headers.insert("user-agent", "TestBrowser/1.0".parse().unwrap());
        headers.insert("x-forwarded-for", "203.0.113.5, 10.0.0.1".parse().unwrap());
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        state.service.flush(None).await.unwrap();
        let session = mock.last_context().unwrap().session_data.unwrap();
        assert_eq!(session.user_agent, "TestBrowser/1.0");
        assert_eq!(session.ip_address, "203.0.113.5");
        assert_eq!(session.current_page, "/art/1");
        assert_eq!(session.page_views, 1);
    }

    #[test]
    fn test_tokens_match() {
        assert!(tokens_match("abc", "abc"));
        assert!(!tokens_match("abd", "abc"));
        assert!(!tokens_match("ab", "abc"));
        assert!(!tokens_match("", "abc"));
    }

    #[tokio::test]
    async fn test_query_nonce_is_percent_decoded() {
        let mut state = state();
        state.sync_token = Arc::from("a+b/c=");
        let app = build_router(state);
        let request = HttpRequest::builder()
            .uri("/users/5/metrics?nonce=a%2Bb%2Fc%3D")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let request = HttpRequest::builder()
            .uri("/users/5/metrics?nonce=a+b/c=")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_events_requires_token() {
        let app = build_router(state());
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/events")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"action": "page_view", "user_id": 1}).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_events_purchase_is_immediate() {
        let state = state();
        let app = build_router(state.clone());
        let response = app
            .oneshot(json_request(
                "POST",
                "/events",
                json!({
                    "action": "purchase_completed",
                    "user_id": 12,
                    "order_id": 900,
                    "total_amount": 42.5,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let receipt = body_json(response).await;
        assert_eq!(receipt["priority"], 8);
        assert_eq!(receipt["immediate"], true);
        assert_eq!(receipt["action"], "purchase_completed");

        state.service.drain().await;
        assert_eq!(state.service.status().await.unwrap().persisted.processed, 1);
    }

    #[tokio::test]
    async fn test_events_invalid_payload_is_400() {
        let app = build_router(state());
        let response = app
            .oneshot(json_request(
                "POST",
                "/events",
                json!({"action": "purchase_completed", "user_id": 12}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("invalid event"));
    }

    #[tokio::test]
    async fn test_status_and_health_are_public() {
        let app = build_router(state());
        let response = app
            .clone()
            .oneshot(HttpRequest::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["engines"].as_object().unwrap().len(), 5);
        assert_eq!(body["persisted"]["pending"], 0);

        let response = app
            .oneshot(HttpRequest::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_profile_then_metrics_and_insights() {
        let app = build_router(state());
        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/users/5/profile",
                json!({"subscription_plan": "artist-pro", "completed_milestones": ["a"]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["user_id"], 5);

        let response = app
            .clone()
            .oneshot(get_request("/users/5/metrics"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["user_id"], 5);
        assert!(body["totals"].as_object().unwrap().is_empty());

        let response = app
            .oneshot(get_request("/users/5/insights?limit=3"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["insights"], json!([]));
    }

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn activity(user_id: u64) -> bsync_core::EventDraft {
        bsync_core::EventDraft {
            action: Some(bsync_core::BehaviorAction::UserActivity),
            user_id,
            target_engines: [EngineId::Archer].into_iter().collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stream_emits_persisted_behaviors() {
        let state = state();
        state.service.enqueue(activity(21)).await.unwrap();
        let base = serve(state.clone()).await;

        let response = reqwest::get(format!("{base}/stream?nonce={TOKEN}"))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let mut events = response.bytes_stream().eventsource();

        let first = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.event, "behavior");
        assert_eq!(first.id, "1");
        let row: Value = serde_json::from_str(&first.data).unwrap();
        assert_eq!(row["action"], "user_activity");
        assert_eq!(row["user_id"], 21);

        // Rows persisted after connecting arrive on the next poll.
        state.service.enqueue(activity(22)).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(second.id, "2");
    }

    #[tokio::test]
    async fn test_stream_resumes_after_last_event_id() {
        let state = state();
        state.service.enqueue(activity(1)).await.unwrap();
        state.service.enqueue(activity(2)).await.unwrap();
        let base = serve(state).await;

        let response = reqwest::Client::new()
            .get(format!("{base}/stream"))
            .header(NONCE_HEADER, TOKEN)
            .header("Last-Event-ID", "1")
            .send()
            .await
            .unwrap();
        let mut events = response.bytes_stream().eventsource();
        let first = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(first.id, "2");
        let row: Value = serde_json::from_str(&first.data).unwrap();
        assert_eq!(row["user_id"], 2);
    }

    #[tokio::test]
    async fn test_stream_requires_token() {
        let base = serve(state()).await;
        let response = reqwest::get(format!("{base}/stream")).await.unwrap();
        assert_eq!(response.status(), 403);
    }
}
