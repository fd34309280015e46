mod common;

use cli::{load_config, render_check, render_start, render_status, render_status_json, render_stop};
use common::{run_with_timeout, write_config};
use kindling_core::{MockLauncher, Supervisor};
use std::sync::Arc;
use std::time::Duration;

const STACK: &str = r#"
[[services]]
id = "rag"
displayName = "RAG server"
launchCommand = ["python", "rag.py"]
dependsOn = ["embedding"]

[[services]]
id = "llama"
launchCommand = ["sh", "start_llama.sh"]
[services.readiness]
type = "tcpConnect"
port = 8080

[[services]]
id = "embedding"
launchCommand = ["sh", "start_embedding.sh"]
dependsOn = ["llama"]
requires = ["start_embedding.sh"]
"#;

fn mock_supervisor(path: &std::path::Path, launcher: &MockLauncher) -> Supervisor {
    let config = load_config(path).expect("load config");
    Supervisor::new(config.services, Arc::new(launcher.clone()), config.supervisor)
}

#[test]
fn test_check_prints_start_order_and_missing_paths() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), STACK);
    let config = load_config(&path).expect("load config");
    let sup = mock_supervisor(&path, &MockLauncher::new());

    let out = render_check(&config, &sup).expect("check");
    let llama = out.find("1. llama [tcp://127.0.0.1:8080]").expect("llama first");
    let embedding = out.find("2. embedding").expect("embedding second");
    let rag = out.find("3. rag").expect("rag third");
    assert!(llama < embedding && embedding < rag, "{out}");
    assert!(out.contains("(after llama)"));
    assert!(out.contains("Missing prerequisites:"));
    assert!(out.contains("embedding:"));
    assert!(out.contains("start_embedding.sh"));
}

#[test]
fn test_check_rejects_cycles_as_config_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(
        dir.path(),
        r#"
        [a]
        launchCommand = ["a"]
        dependsOn = ["b"]

        [b]
        launchCommand = ["b"]
        dependsOn = ["a"]
        "#,
    );
    let config = load_config(&path).expect("cycles parse; the graph rejects them");
    let sup = mock_supervisor(&path, &MockLauncher::new());

    let err = render_check(&config, &sup).expect_err("cycle");
    assert!(err.is_config());
    assert!(err.to_string().contains("a, b"), "{err}");
}

#[test]
fn test_invalid_config_is_a_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), "[[services]]\nid = \"x\"\nlaunchCommand = []\n");
    let err = load_config(&path).expect_err("empty command");
    assert!(err.is_config());
    assert!(err.to_string().contains("services[0].launchCommand"));

    let missing = load_config(&dir.path().join("absent.toml")).expect_err("missing file");
    assert!(missing.is_config());
}

#[tokio::test]
async fn test_session_reports_render() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), STACK);
    let launcher = MockLauncher::new();
    let port = {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let mut config = load_config(&path).expect("load config");
    config.services[1].readiness = kindling_core::ReadinessSpec::tcp(port)
        .with_retries(20, Duration::from_millis(20));
    launcher.serve_on_launch("llama", port);
    let sup = Supervisor::new(config.services, Arc::new(launcher.clone()), config.supervisor);

    let report = run_with_timeout(Duration::from_secs(10), sup.start())
        .await
        .expect("start");
    let out = render_start(&report);
    assert!(out.contains("llama\tready"), "{out}");
    assert!(out.contains("embedding\tfailed\tmissing prerequisite"), "{out}");
    assert!(out.contains("rag\tfailed\tdependency 'embedding' failed"), "{out}");
    assert!(out.contains("Session running (partial)"), "{out}");

    let status = sup.status().await.expect("status");
    let table = render_status(&status);
    assert!(table.starts_with("Session: running"), "{table}");
    assert!(table.contains("rag\tRAG server\tfailed"), "{table}");
    let json = render_status_json(&status).expect("json");
    assert!(json.contains("\"session\""));
    assert!(json.contains("\"dependencyFailed\""));

    let stopped = run_with_timeout(Duration::from_secs(10), sup.stop()).await;
    let out = render_stop(&stopped);
    assert!(out.contains("Terminated: llama"), "{out}");
    assert!(out.contains("Swept 0 leftover process(es)"), "{out}");
}
