mod common;

use cli::{
    clear_session, load_config, render_stop, restore_session, save_session, session_file,
    unreachable_services,
};
use common::{run_with_timeout, write_config};
use kindling_core::{MockLauncher, SessionState, Supervisor};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const STACK: &str = r#"
[[services]]
id = "llama"
launchCommand = ["sh", "start_llama.sh"]

[[services]]
id = "rag"
launchCommand = ["python", "rag.py"]
dependsOn = ["llama"]
matchPattern = "rag.py"
"#;

fn mock_supervisor(path: &Path, launcher: &MockLauncher) -> Supervisor {
    let config = load_config(path).expect("load config");
    Supervisor::new(config.services, Arc::new(launcher.clone()), config.supervisor)
}

#[tokio::test]
async fn test_stop_in_a_later_invocation_reaches_started_services() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), STACK);
    let session = session_file(&path);
    let launcher = MockLauncher::new();

    let starter = mock_supervisor(&path, &launcher);
    run_with_timeout(Duration::from_secs(10), starter.start())
        .await
        .expect("start");
    save_session(&starter, &session).await.expect("save");
    assert!(session.exists());
    drop(starter);

    let stopper = mock_supervisor(&path, &launcher);
    let restored = restore_session(&stopper, &session)
        .await
        .expect("restore")
        .expect("session recorded");
    assert_eq!(stopper.session(), SessionState::Running(kindling_core::Coverage::Full));
    let config = load_config(&path).expect("load config");
    assert!(unreachable_services(&config, Some(&restored)).is_empty());

    let report = run_with_timeout(Duration::from_secs(10), stopper.stop()).await;
    let out = render_stop(&report);
    assert!(out.contains("Terminated: rag, llama"), "{out}");
    assert!(!launcher.is_running("llama"));
    clear_session(&session).expect("clear");
    assert!(!session.exists());
}

#[tokio::test]
async fn test_without_session_file_unpatterned_services_are_unreachable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), STACK);
    let config = load_config(&path).expect("load config");
    let sup = mock_supervisor(&path, &MockLauncher::new());

    let restored = restore_session(&sup, &session_file(&path))
        .await
        .expect("no file is not an error");
    assert!(restored.is_none());
    assert_eq!(sup.session(), SessionState::Idle);
    assert_eq!(unreachable_services(&config, None), vec!["llama".to_string()]);
}

#[tokio::test]
async fn test_saving_without_session_clears_the_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_config(dir.path(), STACK);
    let session = session_file(&path);
    std::fs::write(&session, "stale").expect("write");

    let sup = mock_supervisor(&path, &MockLauncher::new());
    save_session(&sup, &session).await.expect("save");
    assert!(!session.exists());
}
