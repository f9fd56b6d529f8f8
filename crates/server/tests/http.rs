use std::fs;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use vibe_common::{OracleReply, OracleRequest, PlanningOracle};
use vibe_core::{ChangeControl, MutationClass, VibeConfig};
use vibe_server::{build_router, AppState};

/// Always asks a question back.
struct AskingOracle;

#[async_trait]
impl PlanningOracle for AskingOracle {
    fn name(&self) -> &str {
        "asking"
    }

    async fn complete(&self, _request: &OracleRequest) -> Result<OracleReply> {
        Ok(OracleReply::from_value(json!({
            "message": "Which page?",
            "actions": [{"type": "ASK_INPUT", "question": "Which page should change?"}]
        })))
    }
}

fn setup() -> (TempDir, Arc<ChangeControl>, Router) {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), "hello\nworld\n").unwrap();
    let control = Arc::new(ChangeControl::open(dir.path(), VibeConfig::default()).unwrap());
    let router = build_router(AppState::new(Arc::clone(&control), Arc::new(AskingOracle)));
    (dir, control, router)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn ping_and_config() {
    let (_dir, _control, router) = setup();
    let (status, body) = send(&router, "GET", "/api/ping", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["provider"], "asking");

    let (_, body) = send(&router, "GET", "/api/config", None).await;
    assert_eq!(body["perms"], json!({"read": false, "write": false, "test": false}));
    assert_eq!(body["limits"]["max_ops"], 50);
}

#[tokio::test]
async fn patch_revert_round_trip_over_http() {
    let (dir, _control, router) = setup();
    let diff = "--- a/hello.txt\n+++ b/hello.txt\n@@ -1,2 +1,2 @@\n hello\n-world\n+there\n";

    let (status, body) = send(&router, "POST", "/api/patch/diff", Some(json!({"diff": diff}))).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["changesetId"].as_str().unwrap().to_string();
    assert_eq!(body["changes"][0]["type"], "modified");
    assert_eq!(body["changes"][0]["appliedHunks"], 1);
    assert_eq!(fs::read_to_string(dir.path().join("hello.txt")).unwrap(), "hello\nthere\n");

    let (_, check) = send(&router, "POST", "/api/revert/check", Some(json!({"changesetId": id}))).await;
    assert_eq!(check["ok"], true);

    let (status, body) = send(&router, "POST", "/api/revert", Some(json!({"changesetId": id}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["direction"], "before");
    assert_eq!(body["restored"][0]["action"], "restored");
    assert_eq!(fs::read_to_string(dir.path().join("hello.txt")).unwrap(), "hello\nworld\n");

    let (_, events) = send(&router, "GET", "/api/events?limit=5", None).await;
    let kinds: Vec<&str> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds, vec!["PATCH_APPLIED", "REVERT"]);
    assert!(events["summary"].as_str().unwrap().contains("recent=[hello.txt]"));

    let (_, snaps) = send(&router, "GET", "/api/snapshots", None).await;
    assert_eq!(snaps["snapshots"][0]["id"], id.as_str());
}

#[tokio::test]
async fn errors_map_to_status_codes() {
    let (_dir, control, router) = setup();

    let (status, body) = send(&router, "POST", "/api/patch/diff", Some(json!({"diff": "nothing here"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "E_INVALID_DIFF");

    let (status, _) = send(&router, "GET", "/api/file?path=../etc/passwd", None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&router, "GET", "/api/file?path=missing.txt", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &router,
        "POST",
        "/api/revert",
        Some(json!({"changesetId": "1700000000000_abcdefabcdef"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let permit = control.coordinator().try_acquire(MutationClass::Patch).unwrap();
    let (status, body) = send(
        &router,
        "POST",
        "/api/patch",
        Some(json!({"ops": [{"op": "add", "path": "a.txt", "content": "a"}]})),
    )
    .await;
    assert_eq!(status, StatusCode::LOCKED);
    assert_eq!(body["error"], "patch in progress, try again");
    drop(permit);

    let (status, _) = send(&router, "POST", "/api/patch", Some(json!({"ops": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reads_and_diff_preview() {
    let (_dir, _control, router) = setup();

    let (_, tree) = send(&router, "GET", "/api/tree?depth=0", None).await;
    assert_eq!(tree["entries"][0]["path"], "hello.txt");
    assert_eq!(tree["entries"][0]["type"], "file");

    let (_, file) = send(&router, "GET", "/api/file?path=hello.txt&maxBytes=5", None).await;
    assert_eq!(file["content"], "hello\n\n/* truncated 7 bytes */");

    let (_, found) = send(&router, "GET", "/api/search?q=WORLD", None).await;
    assert_eq!(found["matches"][0]["line"], 2);

    let (_, diff) = send(
        &router,
        "POST",
        "/api/diff",
        Some(json!({"path": "hello.txt", "newContent": "hello\n"})),
    )
    .await;
    assert!(diff["diff"].as_str().unwrap().contains("-world"));
}

#[tokio::test]
async fn events_and_test_results_are_recorded() {
    let (_dir, _control, router) = setup();

    let (status, _) = send(&router, "POST", "/api/events", Some(json!({"type": "ANSWER", "data": {"text": "yes"}}))).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&router, "POST", "/api/events", Some(json!({"data": {}}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, body) = send(
        &router,
        "POST",
        "/api/test-result",
        Some(json!({"ok": true, "code": 0, "stdout": "all green", "stderr": ""})),
    )
    .await;
    assert_eq!(body["event"]["type"], "TEST_RESULT");

    let (_, events) = send(&router, "GET", "/api/events", None).await;
    assert!(events["summary"].as_str().unwrap().contains("tests=1"));
}

#[tokio::test]
async fn agent_chat_resolves_a_turn() {
    let (_dir, _control, router) = setup();

    let (status, body) = send(
        &router,
        "POST",
        "/api/agent/chat",
        Some(json!({
            "text": "change the landing page",
            "history": [{"role": "user", "content": "change the landing page"}],
            "client": {"pendingCount": 0, "autopilot": false, "perms": {"read": true}}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["provider"], "asking");
    assert_eq!(body["actions"][0]["type"], "ASK_INPUT");

    let (_, debug) = send(&router, "GET", "/api/debug?limit=1", None).await;
    assert_eq!(debug["entries"][0]["kind"], "chat_out");

    let (status, _) = send(&router, "POST", "/api/agent/chat", Some(json!({"text": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
