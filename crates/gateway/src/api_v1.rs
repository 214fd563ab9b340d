//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST /v1/sessions/{id}/turns`        start a turn, returns the job id
//! - `GET  /v1/sessions`                   list the caller's sessions
//! - `GET  /v1/sessions/{id}`              the session document
//! - `GET  /v1/sessions/{id}/pending`      pending proposal or clarification
//! - `GET  /v1/sessions/{id}/undelivered`  drain queued turn outcomes
//! - `GET  /v1/jobs/{id}`                  job record
//! - `GET  /v1/jobs/{id}/events`           SSE progress stream
//!
//! Every request names its user in the `x-user-id` header. Sessions and jobs
//! are only visible to the user that owns them.

use crate::error::GatewayError;
use crate::jobs::{JobManager, JobRecord, Undelivered};
use axum::{
    Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post},
};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use turnkeep_core::event::ProgressEvent;
use turnkeep_core::pending::PendingState;
use turnkeep_core::session::{SessionDocument, SessionKey};
use turnkeep_engine::{TurnEngine, TurnRequest};

pub const USER_HEADER: &str = "x-user-id";

// ── State ─────────────────────────────────────────────────────────────────

pub struct ApiV1State {
    pub jobs: Arc<JobManager>,
    pub keep_alive: Duration,
}

impl ApiV1State {
    pub fn new(engine: Arc<TurnEngine>) -> Self {
        let keep_alive = Duration::from_secs(engine.config().gateway.keep_alive_secs.max(1));
        Self {
            jobs: Arc::new(JobManager::new(engine)),
            keep_alive,
        }
    }

    pub fn with_keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }
}

pub type SharedApiState = Arc<ApiV1State>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{id}", get(get_session_handler))
        .route("/sessions/{id}/turns", post(submit_turn_handler))
        .route("/sessions/{id}/pending", get(pending_handler))
        .route("/sessions/{id}/undelivered", get(undelivered_handler))
        .route("/jobs/{id}", get(get_job_handler))
        .route("/jobs/{id}/events", get(job_events_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Serialize)]
struct TurnAccepted {
    job_id: String,
    session_id: String,
    events_url: String,
    /// Outcomes of earlier turns this caller never received.
    undelivered: Vec<Undelivered>,
}

#[derive(Serialize)]
struct SessionListResponse {
    sessions: Vec<String>,
    count: usize,
}

#[derive(Serialize)]
struct PendingResponse {
    pending: Option<PendingState>,
    active_mode: Option<String>,
    in_flight_job: Option<String>,
}

#[derive(Serialize)]
struct UndeliveredResponse {
    undelivered: Vec<Undelivered>,
}

fn user_id(headers: &HeaderMap) -> Result<String, GatewayError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(GatewayError::MissingUser)
}

fn session_key(headers: &HeaderMap, session_id: String) -> Result<SessionKey, GatewayError> {
    Ok(SessionKey::new(user_id(headers)?, session_id))
}

// ── Handlers ──────────────────────────────────────────────────────────────

async fn submit_turn_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<TurnRequest>,
) -> Result<(StatusCode, Json<TurnAccepted>), GatewayError> {
    let key = session_key(&headers, session_id)?;
    if payload.message.trim().is_empty() {
        return Err(GatewayError::BadRequest("message is empty".into()));
    }
    info!(
        session = %key,
        mode = payload.mode.as_deref().unwrap_or("pipeline"),
        "v1 turn request"
    );

    let job_id = state.jobs.submit(key.clone(), payload).await?;
    let undelivered = state.jobs.drain_undelivered(&key);
    Ok((
        StatusCode::ACCEPTED,
        Json(TurnAccepted {
            events_url: format!("/v1/jobs/{job_id}/events"),
            job_id,
            session_id: key.session_id,
            undelivered,
        }),
    ))
}

async fn list_sessions_handler(
    State(state): State<SharedApiState>,
    headers: HeaderMap,
) -> Result<Json<SessionListResponse>, GatewayError> {
    let user = user_id(&headers)?;
    let sessions = state.jobs.engine().store().list(&user).await?;
    let count = sessions.len();
    Ok(Json(SessionListResponse { sessions, count }))
}

async fn get_session_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionDocument>, GatewayError> {
    let key = session_key(&headers, session_id)?;
    state
        .jobs
        .engine()
        .store()
        .load(&key)
        .await?
        .map(Json)
        .ok_or(GatewayError::SessionNotFound(key.session_id))
}

async fn pending_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<PendingResponse>, GatewayError> {
    let key = session_key(&headers, session_id)?;
    let doc = state.jobs.engine().store().load(&key).await?;
    let (pending, active_mode) = doc.map(|d| (d.pending, d.active_mode)).unwrap_or_default();
    Ok(Json(PendingResponse {
        pending,
        active_mode,
        in_flight_job: state.jobs.in_flight(&key),
    }))
}

async fn undelivered_handler(
    State(state): State<SharedApiState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<UndeliveredResponse>, GatewayError> {
    let key = session_key(&headers, session_id)?;
    Ok(Json(UndeliveredResponse {
        undelivered: state.jobs.drain_undelivered(&key),
    }))
}

async fn get_job_handler(
    State(state): State<SharedApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<JobRecord>, GatewayError> {
    let user = user_id(&headers)?;
    state.jobs.get(&job_id, &user).await.map(Json)
}

// ── SSE ───────────────────────────────────────────────────────────────────

fn sse_event(event: &ProgressEvent) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_default();
    SseEvent::default().event(event.event_type()).data(data)
}

/// `GET /v1/jobs/{id}/events`: progress of one job, ending with `done` or
/// `error`. Idle streams carry `ping` events.
async fn job_events_handler(
    State(state): State<SharedApiState>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Sse<impl futures::Stream<Item = Result<SseEvent, Infallible>>>, GatewayError> {
    let user = user_id(&headers)?;
    let feed = state.jobs.feed(&job_id, &user).await?;
    info!(job_id = %job_id, "v1 event stream opened");

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(feed.pump(tx));
    let stream = ReceiverStream::new(rx).map(|event| Ok(sse_event(&event)));

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.keep_alive)
            .event(sse_event(&ProgressEvent::Ping)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStatus;
    use crate::test_support::{TestProvider, engine, wait_finished};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(provider: TestProvider) -> SharedApiState {
        Arc::new(ApiV1State::new(engine(provider)))
    }

    fn app(state: &SharedApiState) -> Router {
        v1_router(state.clone())
    }

    fn turn_request(session: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/sessions/{session}/turns"))
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_as(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn turn_without_user_is_unauthorized() {
        let state = test_state(TestProvider::new());
        let response = app(&state)
            .oneshot(turn_request("s1", None, serde_json::json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let state = test_state(TestProvider::new());
        let response = app(&state)
            .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepted_turn_commits_and_is_user_scoped() {
        let state = test_state(TestProvider::new().with_reply("Hello there."));
        let response = app(&state)
            .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = json_body(response).await;
        let job_id = body["job_id"].as_str().unwrap().to_string();
        assert_eq!(body["events_url"], format!("/v1/jobs/{job_id}/events"));

        let record = wait_finished(&state.jobs, &job_id, "u1").await;
        assert_eq!(record.status, JobStatus::Completed);

        let response = app(&state)
            .oneshot(get_as(&format!("/jobs/{job_id}"), "u1"))
            .await
            .unwrap();
        let job = json_body(response).await;
        assert_eq!(job["status"], "completed");
        assert_eq!(job["result"]["reply"], "Hello there.");

        let response = app(&state).oneshot(get_as("/sessions/s1", "u1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["turn_count"], 1);

        let response = app(&state).oneshot(get_as("/sessions/s1", "u2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = app(&state)
            .oneshot(get_as(&format!("/jobs/{job_id}"), "u2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app(&state).oneshot(get_as("/sessions", "u1")).await.unwrap();
        assert_eq!(json_body(response).await["sessions"], serde_json::json!(["s1"]));
    }

    #[tokio::test]
    async fn overlapping_turn_gets_conflict() {
        let provider = TestProvider::gated();
        let gate = provider.gate();
        let state = test_state(provider);

        let first = json_body(
            app(&state)
                .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "one"})))
                .await
                .unwrap(),
        )
        .await;
        let response = app(&state)
            .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "two"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["job_id"], first["job_id"]);

        let response = app(&state).oneshot(get_as("/sessions/s1/pending", "u1")).await.unwrap();
        assert_eq!(json_body(response).await["in_flight_job"], first["job_id"]);
        gate.add_permits(100);
    }

    #[tokio::test]
    async fn event_stream_ends_with_done() {
        let state = test_state(TestProvider::new().with_reply("All set."));
        let body = json_body(
            app(&state)
                .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "hi"})))
                .await
                .unwrap(),
        )
        .await;
        let job_id = body["job_id"].as_str().unwrap();

        let response = app(&state)
            .oneshot(get_as(&format!("/jobs/{job_id}/events"), "u1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("event: job_accepted"));
        assert!(text.contains("event: done"));
        assert!(text.contains("All set."));
    }

    #[tokio::test]
    async fn missed_outcome_rides_along_with_next_turn() {
        let state = test_state(TestProvider::failing());
        let body = json_body(
            app(&state)
                .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "hi"})))
                .await
                .unwrap(),
        )
        .await;
        let first = body["job_id"].as_str().unwrap().to_string();
        wait_finished(&state.jobs, &first, "u1").await;

        let body = json_body(
            app(&state)
                .oneshot(turn_request("s1", Some("u1"), serde_json::json!({"message": "again"})))
                .await
                .unwrap(),
        )
        .await;
        let undelivered = body["undelivered"].as_array().unwrap();
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0]["job_id"], first.as_str());
        assert_eq!(undelivered[0]["event"]["type"], "error");
    }
}
