mod common;

use axum::{body::Body, Router};
use common::app_state;
use http::{header, Method, Request, StatusCode};
use ops_daemon::server;
use ops_types::CommandId;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn start(app: &Router, body: Value) -> String {
    let (status, value) = call(app, Method::POST, "/api/commands", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", value);
    assert_eq!(value["status"], "running");
    value["id"].as_str().unwrap().to_string()
}

async fn wait_for_finish(app: &Router, id: &str) -> Value {
    for _ in 0..200 {
        let (status, record) = call(app, Method::GET, &format!("/api/commands/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        if record["status"] != "running" {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Command {} never finished", id);
}

#[tokio::test]
async fn test_root_reports_running() {
    let app = server::app(app_state());
    let (status, body) = call(&app, Method::GET, "/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"message": "Server is running", "status": "OK"}));
}

#[tokio::test]
async fn test_start_and_query_command() {
    let app = server::app(app_state());
    let id = start(&app, json!({"command": "sh -c 'exit 0'"})).await;

    let record = wait_for_finish(&app, &id).await;
    assert_eq!(record["status"], "completed");
    assert_eq!(record["exitCode"], 0);
    assert_eq!(record["invocation"]["program"], "sh");
    assert_eq!(record["invocation"]["args"], json!(["-c", "exit 0"]));
    assert!(record.get("pid").is_none());

    let (status, list) = call(&app, Method::GET, "/api/commands", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id);
}

#[tokio::test]
async fn test_shell_mode_reports_exit_code() {
    let app = server::app(app_state());
    let id = start(&app, json!({"command": "exit 7", "shell": true})).await;
    let record = wait_for_finish(&app, &id).await;
    assert_eq!(record["status"], "failed");
    assert_eq!(record["exitCode"], 7);
}

#[tokio::test]
async fn test_spawn_failures_map_to_status_codes() {
    let app = server::app(app_state());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/commands",
        Some(json!({"command": "definitely-not-a-real-binary-4242"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "EXECUTABLE_NOT_FOUND");

    let (status, body) = call(&app, Method::POST, "/api/commands", Some(json!({"command": "  "}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "EMPTY_COMMAND");

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/commands",
        Some(json!({"command": "echo 'unterminated"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_COMMAND");

    let (status, list) = call(&app, Method::GET, "/api/commands", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_unknown_and_malformed_ids() {
    let app = server::app(app_state());
    let missing = CommandId::new();

    let (status, body) = call(&app, Method::GET, &format!("/api/commands/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "COMMAND_NOT_FOUND");

    let (status, _) = call(&app, Method::POST, &format!("/api/commands/{}/stop", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&app, Method::GET, "/api/commands/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stop_returns_the_stopped_record() {
    let app = server::app(app_state());
    let id = start(&app, json!({"command": "sleep 30"})).await;

    let (status, record) = call(&app, Method::POST, &format!("/api/commands/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "stopped");
    assert!(record.get("exitCode").is_none());
    assert!(record.get("finishedAt").is_some());

    // Stopping again is harmless.
    let (status, record) = call(&app, Method::POST, &format!("/api/commands/{}/stop", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["status"], "stopped");
}

#[tokio::test]
async fn test_stop_all_and_system_status() {
    let state = app_state();
    let app = server::app(state.clone());
    start(&app, json!({"command": "sleep 30"})).await;
    start(&app, json!({"command": "sleep", "args": ["30"]})).await;

    let (status, body) = call(&app, Method::GET, "/api/system/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "healthy");
    assert_eq!(body["activeCommands"], 2);
    assert_eq!(body["connectedClients"], 0);

    let (status, body) = call(&app, Method::POST, "/api/system/stop-all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"stopped": 2}));
    assert_eq!(state.supervisor.active_count(), 0);
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let app = server::app(app_state());
    let request = Request::builder()
        .uri("/api/system/status")
        .header(header::ORIGIN, "http://example.com")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(
        response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
        "*"
    );
}
