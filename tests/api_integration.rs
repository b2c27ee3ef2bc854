use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

use cmdb_reconcile::config::AppConfig;
use cmdb_reconcile::seed::{
    load_seed_data, DEMO_BUSINESS_ID, DEMO_MODULE_ID, DEMO_SERVICE_TEMPLATE_ID,
};
use cmdb_reconcile::{build_app, MemoryStore};

// Test client wrapper for making API calls in one business
struct TestClient {
    client: Client,
    base_url: String,
    business_id: i64,
}

impl TestClient {
    fn new(base_url: String, business_id: i64) -> Self {
        Self {
            client: Client::new(),
            base_url,
            business_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(&self, path: &str, json: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .header("X-Business-Id", self.business_id)
            .json(&json)
            .send()
            .await
    }

    async fn get(&self, path: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(self.url(path))
            .header("X-Business-Id", self.business_id)
            .send()
            .await
    }

    async fn delete(&self, path: &str, json: Option<Value>) -> reqwest::Result<reqwest::Response> {
        let request = self
            .client
            .delete(self.url(path))
            .header("X-Business-Id", self.business_id);
        match json {
            Some(body) => request.json(&body).send().await,
            None => request.send().await,
        }
    }
}

async fn spawn_server() -> String {
    let store = MemoryStore::new();
    load_seed_data(&store).await.expect("seed data");
    let app = build_app(Arc::new(store), &AppConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server");
    });
    format!("http://{}", address)
}

fn drifted_count(report: &Value) -> usize {
    report["differences"]
        .as_array()
        .expect("differences array")
        .iter()
        .filter(|d| {
            let detail = &d["differences"];
            ["changed", "added", "removed"]
                .iter()
                .any(|list| !detail[list].as_array().map_or(true, Vec::is_empty))
        })
        .count()
}

#[tokio::test]
async fn test_health_and_topology() {
    let base_url = spawn_server().await;
    let client = TestClient::new(base_url.clone(), DEMO_BUSINESS_ID);

    let health = client.get("/health").await.unwrap();
    assert_eq!(health.status(), StatusCode::OK);

    let model: Value = client.get("/topo/model").await.unwrap().json().await.unwrap();
    assert_eq!(model["bk_obj_id"], "biz");
    assert_eq!(model["children"][0]["bk_obj_id"], "set");

    let tree: Value = client
        .get("/topo/instance?with_detail=true")
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(tree["bk_inst_id"], DEMO_BUSINESS_ID);
    assert_eq!(tree["detail"]["bk_biz_maintainer"], "admin");
    assert_eq!(tree["children"].as_array().unwrap().len(), 2);

    // no business header
    let response = Client::new()
        .get(format!("{}/topo/instance", base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let unknown = TestClient::new(base_url, 404);
    let response = unknown.get("/topo/instance").await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_differences_then_force_sync_converges() {
    let base_url = spawn_server().await;
    let client = TestClient::new(base_url, DEMO_BUSINESS_ID);
    let differences_path = format!("/service_templates/{}/differences", DEMO_SERVICE_TEMPLATE_ID);

    let report: Value = client
        .post(&differences_path, json!({ "module_id": DEMO_MODULE_ID }))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(drifted_count(&report), 1);

    let targets: Vec<i64> = report["differences"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["service_instance_id"].as_i64().unwrap())
        .collect();

    let plan: Value = client
        .post(
            &format!("/service_templates/{}/force_sync/plan", DEMO_SERVICE_TEMPLATE_ID),
            json!({ "service_instances": targets }),
        )
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let ops: Vec<&str> = plan["mutations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["op"].as_str().unwrap())
        .collect();
    assert_eq!(ops, vec!["update_process", "create_process"]);

    let response = client
        .post(
            &format!("/service_templates/{}/force_sync", DEMO_SERVICE_TEMPLATE_ID),
            json!({ "service_instances": targets }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let sync: Value = response.json().await.unwrap();
    assert_eq!(sync["updated"], 1);
    assert_eq!(sync["created"].as_array().unwrap().len(), 1);

    let report: Value = client
        .post(&differences_path, json!({ "module_id": DEMO_MODULE_ID }))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(drifted_count(&report), 0);

    let response = client
        .post("/service_templates/999/differences", json!({ "module_id": DEMO_MODULE_ID }))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .post(
            &format!("/service_templates/{}/force_sync", DEMO_SERVICE_TEMPLATE_ID),
            json!({ "service_instances": [] }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = client
        .post(
            &format!("/service_templates/{}/force_sync/resume", DEMO_SERVICE_TEMPLATE_ID),
            json!({ "run_id": "00000000-0000-0000-0000-000000000000" }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn test_service_instance_lifecycle() {
    let base_url = spawn_server().await;
    let client = TestClient::new(base_url, DEMO_BUSINESS_ID);
    let module_path = format!("/modules/{}/service_instances", DEMO_MODULE_ID);

    let listed: Value = client.get(&module_path).await.unwrap().json().await.unwrap();
    assert_eq!(listed["total"], 2);

    let response = client
        .post(
            "/service_instances",
            json!({
                "name": "nginx-1003",
                "bk_module_id": DEMO_MODULE_ID,
                "service_template_id": DEMO_SERVICE_TEMPLATE_ID,
                "instances": [{
                    "bk_host_id": 1003,
                    "processes": [{
                        "process_template_id": 101,
                        "process_info": { "attributes": { "bk_func_name": "nginx", "port": 80 } }
                    }]
                }]
            }),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let created: Value = response.json().await.unwrap();
    let service_instance_id = created["service_instance_ids"][0].as_i64().unwrap();

    let page: Value = client
        .get(&format!("{}?start=2&limit=5", module_path))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["items"][0]["id"], service_instance_id);

    let response = client
        .delete(&format!("/service_instances/{}", service_instance_id), None)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = client
        .delete(&format!("/service_instances/{}", service_instance_id), None)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // ids from another business are not visible
    let other_business = TestClient::new(client.base_url.clone(), 3);
    let listed: Value = client.get(&module_path).await.unwrap().json().await.unwrap();
    let seeded_instance = listed["items"][0]["id"].as_i64().unwrap();
    let response = other_business
        .delete(&format!("/service_instances/{}", seeded_instance), None)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = client
        .delete("/process_instances", Some(json!({ "process_instance_ids": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
