use millwatch_devkit::fixtures::{encode_pixels, part_with_blob, uniform_gray};
use millwatch_devkit::{MockController, TestHarness};
use millwatch_kernel::health::HealthTracker;
use millwatch_kernel::http::{build_router, AppState};
use millwatch_kernel::models::MachineState;
use millwatch_kernel::vision::QualityInspector;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

struct Api {
    base: String,
    client: reqwest::Client,
    harness: TestHarness,
    server: JoinHandle<()>,
}

impl Api {
    async fn start() -> Self {
        let harness = TestHarness::new();
        let state = AppState {
            manager: harness.manager.clone(),
            broadcaster: harness.broadcaster.clone(),
            inspector: Arc::new(QualityInspector::default()),
            health_tracker: HealthTracker::new(),
        };
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            client: reqwest::Client::new(),
            harness,
            server,
        }
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.client.get(format!("{}{path}", self.base)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, serde_json::from_str(&resp.text().await.unwrap()).unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{path}", self.base))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, serde_json::from_str(&resp.text().await.unwrap()).unwrap_or(Value::Null))
    }

    async fn stop(self) {
        self.harness.shutdown().await;
        self.server.abort();
    }
}

#[tokio::test]
async fn health_endpoints_answer() {
    let api = Api::start().await;
    let resp = api.client.get(format!("{}/health", api.base)).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(resp.text().await.unwrap(), "ok");

    let (status, health) = api.get("/system/health").await;
    assert_eq!(status, 200);
    assert_eq!(health["machines_tracked"], 0);
    assert_eq!(health["subscribers"], 1);
    assert_eq!(health["mqtt_status"], "disabled");
    api.stop().await;
}

#[tokio::test]
async fn machine_routes_map_error_codes() {
    let api = Api::start().await;
    let silent = Arc::new(MockController::new("silent-01"));
    api.harness.add_mock(silent).await;
    let live = Arc::new(MockController::new("live-02"));
    live.push_state(MachineState::Active);
    api.harness.add_mock(live).await;
    assert!(api.harness.wait_for_history("live-02", 1, 2000).await);

    let (status, body) = api.get("/api/v1/machines/ghost").await;
    assert_eq!(status, 404);
    assert_eq!(body["error_code"], "UNKNOWN_MACHINE");

    let (status, _) = api.get("/api/v1/machines/silent-01").await;
    assert_eq!(status, 503);

    let (status, body) = api.get("/api/v1/machines/live-02").await;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["state"], "ACTIVE");

    let (status, body) = api.get("/api/v1/machines/live-02/history?limit=1").await;
    assert_eq!(status, 200);
    assert_eq!(body["result"].as_array().map(Vec::len), Some(1));
    api.stop().await;
}

#[tokio::test]
async fn critical_command_needs_confirmation() {
    let api = Api::start().await;
    let mock = Arc::new(MockController::new("mill-03"));
    mock.push_state(MachineState::Ready);
    api.harness.add_mock(mock.clone()).await;

    let (status, body) = api
        .post("/api/v1/machines/mill-03/command", json!({"command": "start_program"}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);
    assert!(mock.commands().is_empty());

    let (status, body) = api
        .post(
            "/api/v1/machines/mill-03/command",
            json!({"command": "start_program", "safety_confirmation": true}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["result"], true);
    assert_eq!(mock.commands().len(), 1);
    api.stop().await;
}

#[tokio::test]
async fn fleet_emergency_stop_over_http() {
    let api = Api::start().await;
    let mock = Arc::new(MockController::new("mill-04"));
    mock.push_state(MachineState::Active);
    api.harness.add_mock(mock).await;

    let (status, body) = api.post("/api/v1/emergency-stop", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["mill-04"], true);
    assert!(api.harness.wait_for_event("emergency_stop", 2000).await.is_some());
    api.stop().await;
}

#[tokio::test]
async fn inspection_endpoint_reports_and_broadcasts() {
    let api = Api::start().await;
    let part = part_with_blob();
    let request = json!({
        "part_id": "blob-http",
        "width": part.width(),
        "height": part.height(),
        "pixels": encode_pixels(&part),
    });

    let (status, body) = api.post("/api/v1/quality/inspect", request).await;
    assert_eq!(status, 200);
    assert_eq!(body["result"]["inspection_result"], "FAIL");
    assert_eq!(body["result"]["part_id"], "blob-http");

    let event = api.harness.wait_for_event("quality_inspection", 2000).await.unwrap();
    assert_eq!(event["priority"], "HIGH");
    assert_eq!(event["data"]["result"], "FAIL");
    assert_eq!(event["source_component"], "quality-inspector");
    api.stop().await;
}

#[tokio::test]
async fn malformed_images_are_rejected() {
    let api = Api::start().await;

    let (status, body) = api
        .post(
            "/api/v1/quality/inspect",
            json!({"part_id": "bad-b64", "width": 4, "height": 4, "pixels": "not base64!"}),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error_code"], "INVALID_IMAGE");

    let short = uniform_gray(4, 4, 128);
    let (status, _) = api
        .post(
            "/api/v1/quality/inspect",
            json!({"part_id": "bad-len", "width": 8, "height": 8, "pixels": encode_pixels(&short)}),
        )
        .await;
    assert_eq!(status, 400);

    let tiny = uniform_gray(4, 4, 128);
    let (status, body) = api
        .post(
            "/api/v1/quality/inspect",
            json!({"part_id": "tiny", "width": 4, "height": 4, "pixels": encode_pixels(&tiny)}),
        )
        .await;
    assert_eq!(status, 422);
    assert_eq!(body["error_code"], "PREPROCESSING_FAILED");
    assert!(api.harness.events.events_of_type("quality_inspection").is_empty());
    api.stop().await;
}
