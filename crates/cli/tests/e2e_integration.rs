//! End-to-end tests: HTTP gateway, background jobs, engine and a SQLite
//! session store wired together the way `turnkeep serve` wires them.

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use turnkeep_config::AppConfig;
use turnkeep_core::error::ProviderError;
use turnkeep_core::message::Message;
use turnkeep_core::provider::{Provider, ProviderRequest, ProviderResponse};
use turnkeep_engine::{Stage, TurnEngine};
use turnkeep_gateway::api_v1::{ApiV1State, USER_HEADER};
use turnkeep_gateway::build_router;
use turnkeep_store::SqliteSessionStore;
use turnkeep_tools::{CollectionSchema, FieldKind, InMemoryDatastore};

// ── Mock Provider ────────────────────────────────────────────────────────

/// Answers each stage from its own queue, then with a fixed default.
#[derive(Default)]
struct ScriptedProvider {
    queues: Mutex<HashMap<Stage, VecDeque<String>>>,
}

impl ScriptedProvider {
    fn script(self, stage: Stage, replies: &[&str]) -> Self {
        self.queues
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .extend(replies.iter().map(|r| r.to_string()));
        self
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let stage = Stage::from_header(&request.messages[0].content).ok_or_else(|| {
            ProviderError::ApiError {
                status_code: 400,
                message: "no stage header".into(),
            }
        })?;
        let scripted = self
            .queues
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front);
        let text = scripted.unwrap_or_else(|| {
            match stage {
                Stage::Route => r#"{"intent": "general", "scope": ["general"]}"#,
                Stage::Understand => r#"{"retain": [], "demote": []}"#,
                Stage::Plan => r#"{"decision": "direct", "steps": []}"#,
                Stage::Execute => r#"{"action": "step_complete"}"#,
                Stage::Handoff => r#"{"summary": "Talked about bread", "action": "close"}"#,
                _ => "Okay.",
            }
            .to_string()
        });
        Ok(ProviderResponse {
            message: Message::assistant(text),
            usage: None,
            model: "e2e-model".into(),
        })
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

async fn app(provider: ScriptedProvider, data: &InMemoryDatastore, db: &str) -> Router {
    let store = SqliteSessionStore::new(db).await.unwrap();
    let engine = Arc::new(TurnEngine::new(
        Arc::new(AppConfig::default()),
        Arc::new(provider),
        Arc::new(data.clone()),
        Arc::new(store),
    ));
    build_router(Arc::new(ApiV1State::new(engine)))
}

fn pantry() -> InMemoryDatastore {
    InMemoryDatastore::new(vec![
        CollectionSchema::new("pantry")
            .with_field("name", FieldKind::Text, true)
            .with_field("quantity", FieldKind::Number, false),
    ])
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

async fn post_turn(app: &Router, session: &str, body: Value) -> String {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/v1/sessions/{session}/turns"))
        .header("content-type", "application/json")
        .header(USER_HEADER, "u1")
        .body(Body::from(body.to_string()))
        .unwrap();
    let (status, bytes) = send(app, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    body["job_id"].as_str().unwrap().to_string()
}

async fn get_json(app: &Router, uri: &str) -> Value {
    let request = Request::builder()
        .uri(uri)
        .header(USER_HEADER, "u1")
        .body(Body::empty())
        .unwrap();
    let (status, bytes) = send(app, request).await;
    assert_eq!(status, StatusCode::OK, "GET {uri}");
    serde_json::from_slice(&bytes).unwrap()
}

async fn finished_job(app: &Router, job_id: &str) -> Value {
    for _ in 0..400 {
        let job = get_json(app, &format!("/v1/jobs/{job_id}")).await;
        if job["status"] != "running" {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {job_id} did not finish");
}

// ── Tests ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn e2e_pantry_turn_over_http_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db").to_string_lossy().to_string();
    let data = pantry();
    data.seed("u1", "pantry", vec![json!({"name": "Rice"}), json!({"name": "Cod"})])
        .await;

    let provider = ScriptedProvider::default()
        .script(
            Stage::Plan,
            &[r#"{"decision": "direct", "goal": "list pantry", "steps": [
                {"description": "Read the pantry", "step_type": "read"}]}"#],
        )
        .script(
            Stage::Execute,
            &[
                r#"{"action": "tool_call", "op": "read", "collection": "pantry"}"#,
                r#"{"action": "step_complete", "note": "two items"}"#,
            ],
        )
        .script(Stage::Reply, &["You have rice and cod."]);
    let first = app(provider, &data, &db).await;

    let job_id = post_turn(&first, "kitchen", json!({"message": "what's in the pantry?"})).await;

    let request = Request::builder()
        .uri(format!("/v1/jobs/{job_id}/events"))
        .header(USER_HEADER, "u1")
        .body(Body::empty())
        .unwrap();
    let (status, bytes) = send(&first, request).await;
    assert_eq!(status, StatusCode::OK);
    let events = String::from_utf8(bytes).unwrap();
    assert!(events.contains("event: done"));
    assert!(events.contains("You have rice and cod."));

    let job = finished_job(&first, &job_id).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["result"]["turn_number"], 1);

    let session = get_json(&first, "/v1/sessions/kitchen").await;
    let tokens: Vec<&str> = session["registry"]["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["ref_token"].as_str().unwrap())
        .collect();
    assert_eq!(tokens, vec!["pantry_1", "pantry_2"]);

    // A fresh process over the same database picks the session back up
    let second = app(ScriptedProvider::default(), &data, &db).await;
    let job_id = post_turn(&second, "kitchen", json!({"message": "thanks"})).await;
    assert_eq!(finished_job(&second, &job_id).await["result"]["turn_number"], 2);
    let session = get_json(&second, "/v1/sessions/kitchen").await;
    assert_eq!(session["turn_count"], 2);
    assert_eq!(session["registry"]["entries"][1]["ref_token"], "pantry_2");
}

#[tokio::test]
async fn e2e_bypass_mode_then_handoff() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db").to_string_lossy().to_string();
    let provider = ScriptedProvider::default().script(Stage::Bypass, &["Use a long, cold proof."]);
    let app = app(provider, &pantry(), &db).await;

    let job_id = post_turn(
        &app,
        "s1",
        json!({"message": "tips for sourdough?", "mode": "freeform"}),
    )
    .await;
    let job = finished_job(&app, &job_id).await;
    assert_eq!(job["result"]["reply"], "Use a long, cold proof.");
    assert_eq!(job["result"]["mode"], "freeform");

    let pending = get_json(&app, "/v1/sessions/s1/pending").await;
    assert_eq!(pending["active_mode"], "freeform");

    let job_id = post_turn(&app, "s1", json!({"message": "ok, back to planning"})).await;
    let job = finished_job(&app, &job_id).await;
    assert_eq!(job["result"]["handoff"]["summary"], "Talked about bread");

    let session = get_json(&app, "/v1/sessions/s1").await;
    assert!(session["active_mode"].is_null());
    assert!(
        session["history"]["history_summary"]
            .as_str()
            .unwrap()
            .starts_with("In freeform mode: Talked about bread.")
    );
}

#[tokio::test]
async fn e2e_health() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("sessions.db").to_string_lossy().to_string();
    let app = app(ScriptedProvider::default(), &pantry(), &db).await;
    let (status, bytes) = send(&app, Request::builder().uri("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "ok");
}
