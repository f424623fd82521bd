//! HTTP collector against a local feed.

use axum::{http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use mobility_harvester::collector_http::HttpCollector;
use mobility_harvester::config::{parse_component_file, ComponentSpec};
use mobility_harvester::runner::collect_once;
use mobility_harvester_core::component::Collector;
use mobility_harvester_core::models::Payload;
use mobility_harvester_core::store::memory::InMemoryStore;
use mobility_harvester_core::store::{ItemQuery, Store};

async fn start_feed() -> SocketAddr {
    let app = Router::new()
        .route(
            "/positions",
            get(|| async { Json(json!([{"line": "46", "direction": "A", "distance": 12.5}])) }),
        )
        .route("/notice", get(|| async { "service disrupted on line 46" }))
        .route(
            "/down",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "maintenance") }),
        )
        .route("/garbage", get(|| async { "{not json" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

fn spec(addr: SocketAddr, path: &str, data_type: &str) -> ComponentSpec {
    let content = format!(
        r#"
[collectors.feed]
implementation = "http"
data_type = "{data_type}"
schedule = "30s"
url = "http://{addr}{path}"
timeout_secs = 5
"#
    );
    parse_component_file("op", &content).unwrap().remove(0)
}

#[tokio::test]
async fn test_json_feed_is_decoded() {
    let addr = start_feed().await;
    let collector = HttpCollector::from_spec(&spec(addr, "/positions", "json")).unwrap();
    let payload = collector.run().await.unwrap();
    assert_eq!(
        payload,
        Payload::Json(json!([{"line": "46", "direction": "A", "distance": 12.5}]))
    );
}

#[tokio::test]
async fn test_text_and_binary_feeds() {
    let addr = start_feed().await;

    let text = HttpCollector::from_spec(&spec(addr, "/notice", "text")).unwrap();
    assert_eq!(
        text.run().await.unwrap(),
        Payload::Text("service disrupted on line 46".into())
    );

    let binary = HttpCollector::from_spec(&spec(addr, "/notice", "binary")).unwrap();
    assert_eq!(
        binary.run().await.unwrap(),
        Payload::Binary(b"service disrupted on line 46".to_vec())
    );
}

#[tokio::test]
async fn test_error_status_and_bad_body_fail() {
    let addr = start_feed().await;

    let down = HttpCollector::from_spec(&spec(addr, "/down", "json")).unwrap();
    let err = down.run().await.unwrap_err();
    assert!(err.to_string().contains("503"), "{err}");

    let garbage = HttpCollector::from_spec(&spec(addr, "/garbage", "json")).unwrap();
    assert!(garbage.run().await.is_err());
}

#[tokio::test]
async fn test_collect_once_stores_under_component_name() {
    let addr = start_feed().await;
    let spec = spec(addr, "/positions", "json");
    let collector = HttpCollector::from_spec(&spec).unwrap();
    let store = InMemoryStore::new();

    let receipt = collect_once(&store, &spec, &collector).await.unwrap();
    assert!(!receipt.deduplicated);

    let items = store.query("op_feed", &ItemQuery::all()).await.unwrap();
    assert_eq!(items.len(), 1);
    assert!(items[0].payload().unwrap().is_some());

    let down_spec = spec_for_down(addr);
    let down = HttpCollector::from_spec(&down_spec).unwrap();
    assert!(collect_once(&store, &down_spec, &down).await.is_err());
    assert!(store.latest("op_down").await.unwrap().is_none());
}

fn spec_for_down(addr: SocketAddr) -> ComponentSpec {
    let content = format!(
        r#"
[collectors.down]
implementation = "http"
schedule = "30s"
url = "http://{addr}/down"
"#
    );
    parse_component_file("op", &content).unwrap().remove(0)
}
