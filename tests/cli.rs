//! End-to-end tests of the `harvest` binary.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("harvest");
    path
}

/// Config plus one component file whose collector polls `feed_url`.
fn setup_test_env(feed_url: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let components_dir = root.join("components");
    fs::create_dir_all(&components_dir).unwrap();

    fs::write(
        components_dir.join("city.toml"),
        format!(
            r#"
[collectors.positions]
implementation = "http"
schedule = "30s"
url = "{feed_url}"

[harvesters.archive]
implementation = "concat"
source = "positions"

[harvesters.digest]
implementation = "concat"
source = "archive"

[handlers.recent]
implementation = "range"
collection = "positions"
query_parameters = {{ start = "int?", end = "int?" }}
"#
        ),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[components]
dir = "{}/components"
"#,
        root.display(),
        root.display()
    );
    let config_path = config_dir.join("harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

async fn start_feed() -> SocketAddr {
    let app = Router::new().route(
        "/positions",
        get(|| async { Json(json!([{"line": "46", "direction": "A", "distance": 10.0}])) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    addr
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9/positions");

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/harvest.sqlite").exists());

    let (_, _, again) = run_harvest(&config_path, &["init"]);
    assert!(again, "Second init failed (not idempotent)");
}

#[test]
fn test_components_lists_tree_and_order() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9/positions");

    let (stdout, stderr, success) = run_harvest(&config_path, &["components"]);
    assert!(success, "components failed: {}", stderr);
    for name in ["city_positions", "city_archive", "city_digest"] {
        assert!(stdout.contains(name), "missing {name} in {stdout}");
    }
    assert!(stdout.contains("Catch-up order: city_archive, city_digest"));
}

#[test]
fn test_invalid_component_tree_fails() {
    let (tmp, config_path) = setup_test_env("http://127.0.0.1:9/positions");
    fs::write(
        tmp.path().join("components/broken.toml"),
        r#"
[harvesters.orphan]
implementation = "concat"
source = "nowhere"
"#,
    )
    .unwrap();

    let (_, stderr, success) = run_harvest(&config_path, &["components"]);
    assert!(!success);
    assert!(stderr.contains("broken_nowhere"), "stderr={}", stderr);
}

#[test]
fn test_run_requires_a_selection() {
    let (_tmp, config_path) = setup_test_env("http://127.0.0.1:9/positions");
    let (_, stderr, success) = run_harvest(&config_path, &["run"]);
    assert!(!success);
    assert!(stderr.contains("nothing to run"), "stderr={}", stderr);

    let (_, stderr, success) = run_harvest(&config_path, &["run", "--collectors", "city_nope", "--now"]);
    assert!(!success);
    assert!(stderr.contains("city_nope"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_now_then_query_and_catch_up() {
    let addr = start_feed().await;
    let (_tmp, config_path) = setup_test_env(&format!("http://{}/positions", addr));

    let cfg = config_path.clone();
    let (stdout, stderr, success) = tokio::task::spawn_blocking(move || {
        run_harvest(
            &cfg,
            &["run", "--collectors", "all", "--harvesters", "city.archive", "--now"],
        )
    })
    .await
    .unwrap();
    assert!(success, "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("city_positions"));
    assert!(stdout.contains("city_archive"));

    let cfg = config_path.clone();
    let (stdout, stderr, success) =
        tokio::task::spawn_blocking(move || run_harvest(&cfg, &["query", "city.positions"]))
            .await
            .unwrap();
    assert!(success, "query failed: {}", stderr);
    let lines: Vec<Value> = stdout
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["data"][0]["line"], "46");

    // The archive step ran in the same invocation; digest catches up now.
    let cfg = config_path.clone();
    let (stdout, stderr, success) =
        tokio::task::spawn_blocking(move || run_harvest(&cfg, &["catch-up"]))
            .await
            .unwrap();
    assert!(success, "catch-up failed: {}", stderr);
    assert!(stdout.contains("city_digest"));

    let cfg = config_path.clone();
    let (stdout, _, success) =
        tokio::task::spawn_blocking(move || run_harvest(&cfg, &["collections"]))
            .await
            .unwrap();
    assert!(success);
    for name in ["city_positions", "city_archive", "city_digest"] {
        assert!(stdout.contains(name), "missing {name} in {stdout}");
    }

    let cfg = config_path.clone();
    let (stdout, _, success) = tokio::task::spawn_blocking(move || {
        run_harvest(&cfg, &["query", "city_digest", "--limit", "5", "--desc"])
    })
    .await
    .unwrap();
    assert!(success);
    let digest: Value = serde_json::from_str(stdout.lines().next().unwrap()).unwrap();
    assert_eq!(digest["data"][0]["data"][0]["data"][0]["distance"], 10.0);
}
