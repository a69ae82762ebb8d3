use std::sync::Arc;
use std::time::Duration;

use jobforge_api::app::{build_app, services};
use jobforge_infra::config::AppConfig;
use jobforge_infra::jobs::WorkerHandle;
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _worker: Option<WorkerHandle>,
}

impl TestServer {
    /// In-memory store and channel, embedded worker, instant simulated work.
    async fn spawn() -> Self {
        Self::spawn_with(&[("SIMULATED_WORK_MS", "0")]).await
    }

    async fn spawn_with(env: &[(&str, &str)]) -> Self {
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = AppConfig::from_lookup(|key| {
            env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .expect("config");

        // Same router as prod, bound to an ephemeral port.
        let (services, worker) = services::build_services(&config).await.expect("services");
        let app = build_app(Arc::new(services));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _worker: worker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, srv: &TestServer, body: serde_json::Value) -> i64 {
    let res = client.post(srv.url("/jobs")).json(&body).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    body["job_id"].as_i64().unwrap()
}

async fn wait_for_terminal(client: &reqwest::Client, srv: &TestServer, id: i64) -> serde_json::Value {
    // The worker runs asynchronously; poll until the job settles.
    for _ in 0..200 {
        let res = client
            .get(srv.url(&format!("/jobs/{id}")))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body: serde_json::Value = res.json().await.unwrap();
        if body["status"] == "DONE" || body["status"] == "FAILED" {
            return body;
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("job {id} did not reach a terminal status within timeout");
}

#[tokio::test]
async fn health_is_ok() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(srv.url("/health")).await.unwrap();

    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn submitted_jobs_get_increasing_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let a = submit(&client, &srv, json!({"type": "email", "payload": {"to": "x"}})).await;
    let b = submit(&client, &srv, json!({"type": "email", "payload": {"to": "y"}})).await;

    assert!(b > a);
}

#[tokio::test]
async fn simulated_work_drives_jobs_to_terminal_states() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let odd = submit(&client, &srv, json!({"type": "report", "payload": {}})).await;
    let even = submit(&client, &srv, json!({"type": "report", "payload": {}})).await;
    assert_eq!(odd % 2, 1);
    assert_eq!(even, odd + 1);

    let failed = wait_for_terminal(&client, &srv, odd).await;
    assert_eq!(failed["status"], "FAILED");
    assert_eq!(failed["retry_count"], 3);
    assert_eq!(failed["max_retries"], 3);
    assert_eq!(failed["last_error"], "simulated failure");
    assert_eq!(failed["type"], "report");

    let done = wait_for_terminal(&client, &srv, even).await;
    assert_eq!(done["status"], "DONE");
    assert_eq!(done["retry_count"], 0);
    assert!(done["last_error"].is_null());
}

#[tokio::test]
async fn configured_max_retries_applies_to_new_jobs() {
    let srv = TestServer::spawn_with(&[("SIMULATED_WORK_MS", "0"), ("MAX_RETRIES", "5")]).await;
    let client = reqwest::Client::new();

    let id = submit(&client, &srv, json!({"type": "x", "payload": 1})).await;
    let job = wait_for_terminal(&client, &srv, id).await;

    assert_eq!(job["status"], "FAILED");
    assert_eq!(job["retry_count"], 5);
}

#[tokio::test]
async fn malformed_submissions_are_rejected() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let cases = [
        "not json".to_string(),
        json!({"payload": {}}).to_string(),
        json!({"type": "", "payload": {}}).to_string(),
        json!({"type": "x"}).to_string(),
        json!({"type": "x", "payload": null}).to_string(),
    ];

    for body in cases {
        let res = client
            .post(srv.url("/jobs"))
            .header("content-type", "application/json")
            .body(body.clone())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "body: {body}");
        let err: serde_json::Value = res.json().await.unwrap();
        assert_eq!(err["error"], "validation_error");
    }

    // Nothing was created.
    let res = client.get(srv.url("/jobs/1")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_and_invalid_ids() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs/999")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let err: serde_json::Value = res.json().await.unwrap();
    assert_eq!(err["error"], "not_found");

    let res = client.get(srv.url("/jobs/abc")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let err: serde_json::Value = res.json().await.unwrap();
    assert_eq!(err["error"], "invalid_id");
}

#[tokio::test]
async fn jobs_endpoint_only_accepts_post() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(srv.url("/jobs")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);

    let res = client.put(srv.url("/jobs")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
}
