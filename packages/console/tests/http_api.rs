use std::path::Path;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::util::ServiceExt;
use tower_http::cors::CorsLayer;

use agent_console::config::Config;
use agent_console::router::{build_router, AppState};

struct TestApp {
    app: Router,
    _workspace: TempDir,
}

impl TestApp {
    /// Router wired to a fake agent binary written into a temp workspace.
    fn new(agent_script: &str) -> Self {
        let workspace = tempfile::tempdir().expect("create temp workspace");
        let bin_path = workspace.path().join("fake-agent");
        write_script(&bin_path, agent_script);

        let mut config = Config::for_workspace(workspace.path().join("ws"));
        config.agent_bin = bin_path.to_string_lossy().to_string();
        config.agent_args = Vec::new();
        config.skip_repo_check = false;
        config.agent_home = workspace.path().join("agent-home");

        let state = Arc::new(AppState::new(config));
        let app = build_router(state, CorsLayer::new());
        Self {
            app,
            _workspace: workspace,
        }
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
}

async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, value)
}

async fn create_session(app: &Router) -> String {
    let (status, body) = send_json(app, Method::POST, "/api/sessions", Some(json!({}))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().expect("session id").to_string()
}

async fn poll_until_saved(app: &Router, job_id: &str) -> Value {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let (status, body) =
            send_json(app, Method::GET, &format!("/api/jobs/{job_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        if body["done"] == json!(true) && body["saved"] == json!(true) {
            return body;
        }
        assert!(Instant::now() < deadline, "job did not finish in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn health_and_root_respond() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = send_json(&app.app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "agent-console");
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/sessions"].is_object());
    assert!(body["paths"]["/api/jobs/{job_id}"].is_object());
}

#[tokio::test]
async fn session_lifecycle_roundtrip() {
    let app = TestApp::new("echo ok");
    let session_id = create_session(&app.app).await;

    let (status, body) = send_json(&app.app, Method::GET, "/api/sessions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let (status, body) = send_json(
        &app.app,
        Method::PATCH,
        &format!("/api/sessions/{session_id}"),
        Some(json!({ "title": "Renamed" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Renamed");

    let (status, body) = send_json(
        &app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["session"]["title"], "Renamed");
    assert!(body.get("active_job_id").is_none());

    let (status, _) = send_json(
        &app.app,
        Method::DELETE,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send_json(
        &app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-console:error:not_found");
}

#[tokio::test]
async fn empty_rename_is_rejected() {
    let app = TestApp::new("echo ok");
    let session_id = create_session(&app.app).await;
    let (status, body) = send_json(
        &app.app,
        Method::PATCH,
        &format!("/api/sessions/{session_id}"),
        Some(json!({ "title": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-console:error:invalid_argument");
}

#[tokio::test]
async fn blocking_message_returns_full_exchange() {
    let app = TestApp::new("echo sync-reply");
    let session_id = create_session(&app.app).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages"),
        Some(json!({ "prompt": "Fix the login bug" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user_message"]["role"], "user");
    assert_eq!(body["user_message"]["content"], "Fix the login bug");
    assert_eq!(body["reply_message"]["role"], "assistant");
    assert_eq!(body["reply_message"]["content"], "sync-reply");
    assert!(body["reply_message"]["duration_ms"].is_i64() || body["reply_message"]["duration_ms"].is_u64());
    // First prompt becomes the title.
    assert_eq!(body["session"]["title"], "Fix the login bug");
    assert_eq!(body["session"]["messages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn failing_agent_becomes_error_message() {
    let app = TestApp::new("echo kaput 1>&2; exit 2");
    let session_id = create_session(&app.app).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages"),
        Some(json!({ "prompt": "p" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["reply_message"]["role"], "error");
    assert_eq!(body["reply_message"]["content"], "kaput");
}

#[tokio::test]
async fn invalid_prompts_are_rejected() {
    let app = TestApp::new("echo ok");
    let session_id = create_session(&app.app).await;
    let (status, _) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages"),
        Some(json!({ "prompt": "  " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let long_prompt = "x".repeat(4001);
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages/stream"),
        Some(json!({ "prompt": long_prompt })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-console:error:invalid_argument");
}

#[tokio::test]
async fn streaming_turn_polls_to_saved_message() {
    let app = TestApp::new("echo streamed-line");
    let session_id = create_session(&app.app).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages/stream"),
        Some(json!({ "prompt": "stream it" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["user_message"]["role"], "user");
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let done = poll_until_saved(&app.app, &job_id).await;
    assert_eq!(done["exit_code"], 0);
    assert_eq!(done["session_id"], session_id);

    // The transcript is committed exactly once regardless of poll count.
    let (status, body) = send_json(
        &app.app,
        Method::GET,
        &format!("/api/sessions/{session_id}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let messages = body["session"]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "streamed-line");
}

#[tokio::test]
async fn concurrent_turn_is_conflict_and_stop_resolves_it() {
    let app = TestApp::new("echo working; sleep 30");
    let session_id = create_session(&app.app).await;
    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages/stream"),
        Some(json!({ "prompt": "first" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages/stream"),
        Some(json!({ "prompt": "second" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "urn:agent-console:error:already_running");
    assert_eq!(body["jobId"], job_id);

    // Rename is also blocked while the job runs.
    let (status, _) = send_json(
        &app.app,
        Method::PATCH,
        &format!("/api/sessions/{session_id}"),
        Some(json!({ "title": "nope" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/jobs/{job_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");

    let (status, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/jobs/{job_id}/stop"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_cancelled");
}

#[tokio::test]
async fn job_listing_filters_finished_jobs() {
    let app = TestApp::new("echo quick");
    let session_id = create_session(&app.app).await;
    let (_, body) = send_json(
        &app.app,
        Method::POST,
        &format!("/api/sessions/{session_id}/messages/stream"),
        Some(json!({ "prompt": "p" })),
    )
    .await;
    let job_id = body["job_id"].as_str().unwrap().to_string();
    poll_until_saved(&app.app, &job_id).await;

    let (status, body) = send_json(&app.app, Method::GET, "/api/jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["jobs"].as_array().unwrap().is_empty());

    let (status, body) =
        send_json(&app.app, Method::GET, "/api/jobs?include_done=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
    assert_eq!(body["jobs"][0]["id"], job_id);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/api/jobs/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-console:error:not_found");
    assert_eq!(body["jobId"], "nope");
}

#[tokio::test]
async fn settings_roundtrip_with_validation() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/api/settings", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["reasoning_options"]
        .as_array()
        .unwrap()
        .contains(&json!("medium")));

    let (status, body) = send_json(
        &app.app,
        Method::PATCH,
        "/api/settings",
        Some(json!({ "model": "gpt-5-codex", "reasoning_effort": "high" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settings"]["model"], "gpt-5-codex");
    assert_eq!(body["settings"]["reasoning_effort"], "high");

    let (status, _) = send_json(
        &app.app,
        Method::PATCH,
        "/api/settings",
        Some(json!({ "model": "m".repeat(81) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn usage_endpoint_serves_empty_summary() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/api/usage", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["account_name"], "");
}

#[tokio::test]
async fn unknown_vcs_action_is_rejected() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::POST, "/api/vcs/rebase", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:agent-console:error:invalid_argument");
}

#[tokio::test]
async fn unknown_route_is_problem_details() {
    let app = TestApp::new("echo ok");
    let (status, body) = send_json(&app.app, Method::GET, "/definitely/not/here", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:agent-console:error:not_found");
}
