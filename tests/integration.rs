use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::{fs, path::PathBuf};

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use stepcheck::{
    CaseDefinition, CaseLoader, CaseRunner, DefaultCaseRunner, MemoryTestDataStore,
    RelationalClient, Row, RunnerConfig, StepStatus, TestDataStore,
};
use stepcheck::db::DbError;
use tokio::task::JoinHandle;

#[derive(Default)]
struct Hits {
    items: AtomicUsize,
    flaky: AtomicUsize,
    gated: AtomicUsize,
}

struct TestServer {
    base_url: String,
    hits: Arc<Hits>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(Hits::default());

        let app = Router::new()
            .route(
                "/orders",
                post(|Json(body): Json<Value>| async move {
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "id": "ord-1",
                            "customer": body["customer"],
                            "items": body["items"]
                        })),
                    )
                }),
            )
            .route(
                "/orders/:id",
                get(|Path(id): Path<String>| async move {
                    Json(json!({"id": id, "status": "open", "total": 12.5}))
                }),
            )
            .route(
                "/items/:sku",
                get(|State(hits): State<Arc<Hits>>, Path(sku): Path<String>| async move {
                    hits.items.fetch_add(1, Ordering::SeqCst);
                    Json(json!({"sku": sku}))
                }),
            )
            .route(
                "/flaky",
                get(|State(hits): State<Arc<Hits>>| async move {
                    let calls = hits.flaky.fetch_add(1, Ordering::SeqCst) + 1;
                    let state = if calls >= 3 { "done" } else { "pending" };
                    Json(json!({"state": state}))
                }),
            )
            .route(
                "/gated",
                get(|State(hits): State<Arc<Hits>>| async move {
                    hits.gated.fetch_add(1, Ordering::SeqCst);
                    Json(json!({}))
                }),
            )
            .route(
                "/slow",
                get(|| async move {
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    Json(json!({"late": true}))
                }),
            )
            .with_state(hits.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });
        let base_url = format!("http://{addr}");

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Relational client answering every query with fixed rows and
/// remembering the statements it saw.
#[derive(Default)]
struct FakeDatabase {
    rows: Vec<Row>,
    statements: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl RelationalClient for FakeDatabase {
    async fn query(
        &self,
        connection: &str,
        sql: &str,
        _params: &[Value],
    ) -> Result<Vec<Row>, DbError> {
        self.statements
            .lock()
            .unwrap()
            .push((connection.to_string(), sql.to_string()));
        Ok(self.rows.clone())
    }
}

fn load_case(path: &str, base_url: &str) -> CaseDefinition {
    let manifest_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let case_path = manifest_dir.join("tests/fixtures").join(path);
    let content = fs::read_to_string(&case_path)
        .unwrap_or_else(|e| panic!("failed to read {case_path:?}: {e}"));
    let content = content.replace("__BASE_URL__", base_url);

    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join(path);
    fs::write(&target, content).unwrap();
    CaseLoader::new()
        .load_case(&target)
        .unwrap_or_else(|e| panic!("failed to parse case {path}: {e:#}"))
}

fn case(definition: Value) -> CaseDefinition {
    serde_json::from_value(definition).expect("invalid case definition")
}

fn runner(config: RunnerConfig) -> DefaultCaseRunner {
    DefaultCaseRunner::new(config)
        .with_run_id("run-it")
        .with_database(Arc::new(FakeDatabase::default()))
}

#[tokio::test]
async fn http_case_with_assertions_passes() {
    let server = TestServer::spawn().await;
    let case = load_case("order_flow.yaml", &server.base_url);

    let result = runner(RunnerConfig::default())
        .run(&case)
        .await
        .expect("runner returned error for order flow");

    assert!(
        result.success,
        "case should succeed: {:?}",
        result.steps.iter().filter_map(|s| s.first_error()).collect::<Vec<_>>()
    );
    assert_eq!(result.steps.len(), 2);
    let output = &result.steps[1].instances[0].output;
    assert!(output.contains(&"Success: Assertion passed for 'order is open'".to_string()));
    assert!(output.iter().any(|line| line == "Path: /orders/ord-1"));

    server.shutdown().await;
}

#[tokio::test]
async fn loop_step_sends_one_request_per_element() {
    let server = TestServer::spawn().await;
    let case = load_case("item_loop.json", &server.base_url);

    let result = runner(RunnerConfig::default())
        .run(&case)
        .await
        .expect("runner returned error for loop case");

    assert!(result.success, "{:?}", result.steps[0].first_error());
    assert_eq!(server.hits.items.load(Ordering::SeqCst), 3);
    let step = &result.steps[0];
    assert_eq!(step.status, StepStatus::Passed);
    let names: Vec<&str> = step.instances.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["Fetch item (Loop 1)", "Fetch item (Loop 2)", "Fetch item (Loop 3)"]
    );
    let indexes: Vec<usize> = step.instances.iter().map(|i| i.index).collect();
    assert_eq!(indexes, vec![1, 2, 3]);

    server.shutdown().await;
}

#[tokio::test]
async fn unmet_dependency_skips_step_and_records_status() {
    let server = TestServer::spawn().await;
    let case = case(json!({
        "caseId": "gated",
        "region": "apac",
        "env": "uat",
        "steps": [
            {
                "id": 1,
                "name": "Only when enabled",
                "dependency": [{"id": 1, "assert": [
                    {"key": "{{feature}}", "condition": "IsEqual", "value": "on"}
                ]}],
                "test": {"baseUrl": server.base_url, "path": "/gated"}
            },
            {
                "id": 2,
                "name": "Always",
                "test": {"baseUrl": server.base_url, "path": "/items/x"}
            }
        ]
    }));
    let data = json!({"feature": "off"}).as_object().cloned().unwrap();
    let store = Arc::new(MemoryTestDataStore::seeded("run-it", "gated", data));

    let result = runner(RunnerConfig::default())
        .with_store(store.clone())
        .run(&case)
        .await
        .unwrap();

    assert!(result.success, "skipped steps do not fail the case");
    assert_eq!(result.steps[0].status, StepStatus::Skipped);
    assert!(result.steps[0].instances[0].error_message.is_empty());
    assert_eq!(server.hits.gated.load(Ordering::SeqCst), 0);

    let document = store.get("run-it", "gated").await.unwrap();
    assert_eq!(document["testDataTrack"], json!({"1": "skipped", "2": "passed"}));

    server.shutdown().await;
}

#[tokio::test]
async fn slow_endpoint_times_out_as_failure() {
    let server = TestServer::spawn().await;
    let case = case(json!({
        "caseId": "slow",
        "steps": [
            {"id": 1, "name": "Slow call", "test": {"baseUrl": server.base_url, "path": "/slow"}},
            {"id": 2, "name": "Never reached", "test": {"baseUrl": server.base_url, "path": "/items/y"}}
        ]
    }));
    let config = RunnerConfig {
        request_timeout: 1,
        ..Default::default()
    };

    let result = runner(config).run(&case).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.steps.len(), 1, "a timed out step stops the case");
    let instance = &result.steps[0].instances[0];
    assert_eq!(instance.status, StepStatus::TimeOut);
    assert_eq!(instance.report_status(), "failed");
    assert!(instance
        .error_message
        .ends_with("Request send takes so long, which is more than 1s."));
    assert_eq!(server.hits.items.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retry_stops_once_body_matches() {
    let server = TestServer::spawn().await;
    let case = case(json!({
        "caseId": "poll",
        "steps": [{
            "id": 1,
            "name": "Poll until done",
            "test": {
                "baseUrl": server.base_url,
                "path": "/flaky",
                "retry": {"attempt": 5, "interval": 0, "stopCondition": {"contentContains": "DONE"}}
            },
            "afterTest": [{"id": 1, "assert": [
                {"key": "{{response1.responseBody.state}}", "condition": "IsEqual", "value": "done"}
            ]}]
        }]
    }));

    let result = runner(RunnerConfig::default()).run(&case).await.unwrap();

    assert!(result.success, "{:?}", result.steps[0].first_error());
    assert_eq!(server.hits.flaky.load(Ordering::SeqCst), 3);

    server.shutdown().await;
}

#[tokio::test]
async fn database_result_feeds_later_http_step() {
    let server = TestServer::spawn().await;
    let database = Arc::new(FakeDatabase {
        rows: vec![json!({"order_id": "ord-9"}).as_object().cloned().unwrap()],
        ..Default::default()
    });
    let case = case(json!({
        "caseId": "db-flow",
        "region": "APAC",
        "env": "UAT",
        "testData": {"customer": "O'Brien"},
        "steps": [
            {
                "id": 1,
                "name": "Find order",
                "test": {
                    "sql": "select order_id from orders where customer = '{{customer}}' limit 1",
                    "dbType": "Orders",
                    "storedKey": "orderId"
                }
            },
            {
                "id": 2,
                "name": "Read order",
                "test": {"baseUrl": server.base_url, "path": "/orders/{{orderId}}"},
                "afterTest": [{"id": 1, "assert": [
                    {"key": "{{response2.responseBody.id}}", "condition": "IsEqual", "value": "ord-9"}
                ]}]
            }
        ]
    }));

    let result = DefaultCaseRunner::new(RunnerConfig::default())
        .with_database(database.clone())
        .with_debug(true)
        .run(&case)
        .await
        .unwrap();

    assert!(
        result.success,
        "{:?}",
        result.steps.iter().filter_map(|s| s.first_error()).collect::<Vec<_>>()
    );
    let statements = database.statements.lock().unwrap().clone();
    assert_eq!(
        statements,
        vec![(
            "apacuat-orders".to_string(),
            "select order_id from orders where customer = 'O''Brien' limit 1".to_string()
        )]
    );

    server.shutdown().await;
}
