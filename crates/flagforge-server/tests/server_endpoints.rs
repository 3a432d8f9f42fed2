use std::sync::Arc;

use flagforge_db_memory::InMemoryFlagStorage;
use flagforge_server::{AppConfig, AppState, CacheLayer, build_app};
use serde_json::{Value, json};
use tokio::task::JoinHandle;

async fn start_server() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let mut cfg = AppConfig::default();
    // Deterministic reads right after a write
    cfg.invalidation.await_before_response = true;

    let store = InMemoryFlagStorage::new()
        .with_environment("proj1", "env-prod", "prod")
        .with_environment("proj1", "env-dev", "dev");
    let layer = CacheLayer::local(&cfg.invalidation.channel);
    let state = AppState::new(Arc::new(store), &layer, &cfg);
    let app = build_app(state, &cfg);

    // Bind to an ephemeral port
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, server)
}

#[tokio::test]
async fn health_and_readiness() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{base}/readyz")).send().await.unwrap();
    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["cache"], "local");

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn flags_write_read_and_conditional_get() {
    flagforge_server::metrics::init_metrics();
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let flags_url = format!("{base}/v1/flags");

    // Missing query parameters
    let resp = client.get(&flags_url).send().await.unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "project_id and env are required");

    let resp = client
        .get(format!("{flags_url}?project_id=proj1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Empty snapshot before any write
    let resp = client
        .get(format!("{flags_url}?project_id=proj1&env=prod"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let empty_tag = resp.headers()["etag"].to_str().unwrap().to_string();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["flags"], json!([]));

    // Create
    let resp = client
        .post(&flags_url)
        .json(&json!({
            "project_id": "proj1",
            "key": "dark_mode",
            "type": "boolean",
            "description": "Dark theme",
            "values": { "env-prod": true, "env-dev": false }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let body: Value = resp.json().await.unwrap();
    let flag_id = body["id"].as_str().expect("id").to_string();

    // Duplicate key
    let resp = client
        .post(&flags_url)
        .json(&json!({
            "project_id": "proj1",
            "key": "dark_mode",
            "type": "boolean",
            "values": { "env-prod": false }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // Write invalidated the cached empty snapshot
    let resp = client
        .get(format!("{flags_url}?project_id=proj1&env=prod"))
        .header("if-none-match", &empty_tag)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let tag = resp.headers()["etag"].to_str().unwrap().to_string();
    assert_ne!(tag, empty_tag);
    let body: Value = resp.json().await.unwrap();
    let flags = body["flags"].as_array().expect("flags array");
    assert_eq!(flags.len(), 1);
    assert_eq!(flags[0]["key"], "dark_mode");
    assert_eq!(flags[0]["value_json"], json!(true));

    // Matching tag short-circuits
    let resp = client
        .get(format!("{flags_url}?project_id=proj1&env=prod"))
        .header("if-none-match", &tag)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 304);

    // Audit trail
    let resp = client
        .get(format!("{flags_url}/{flag_id}/audit"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let logs = body["logs"].as_array().expect("logs array");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["action"], "flag.created");

    // Cache counters are exported
    let resp = client.get(format!("{base}/metrics")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let text = resp.text().await.unwrap();
    assert!(text.contains("flag_cache_hits_total"));
    assert!(text.contains("flag_cache_misses_total"));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn rejected_writes() {
    let (base, shutdown_tx, handle) = start_server().await;
    let client = reqwest::Client::new();
    let flags_url = format!("{base}/v1/flags");

    // Malformed body
    let resp = client
        .post(&flags_url)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Empty values
    let resp = client
        .post(&flags_url)
        .json(&json!({ "project_id": "proj1", "key": "k", "type": "boolean", "values": {} }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"], "values cannot be empty");

    // Unknown environment
    let resp = client
        .post(&flags_url)
        .json(&json!({
            "project_id": "proj1",
            "key": "k",
            "type": "boolean",
            "values": { "env-nope": true }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    // Nothing was written
    let resp = client
        .get(format!("{flags_url}?project_id=proj1&env=prod"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["flags"], json!([]));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}
