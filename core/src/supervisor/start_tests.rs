//! Start sequencing, concurrency and serialisation

use super::test_support::*;
use crate::error::CoreError;
use crate::launcher::{MockLauncher, ProcessExit};
use schema::{
    Coverage, EventSeverity, FailureReason, ReadinessSpec, Service, ServiceState, SessionState,
    SupervisorEvent,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn delayed(id: &str, secs: u64) -> Service {
    Service::new(id, ["sh", &format!("{id}.sh")])
        .with_readiness(ReadinessSpec::delay(Duration::from_secs(secs)))
}

#[tokio::test(start_paused = true)]
async fn test_dependent_waits_for_dependency_but_independents_do_not() {
    let launcher = MockLauncher::new();
    let services = vec![
        delayed("llama", 5),
        delayed("embedding", 0).depends_on(["llama"]),
        delayed("tools", 0),
    ];
    let sup = supervisor(services, &launcher);

    let report = sup.start().await.expect("start");
    assert_eq!(report.coverage, Coverage::Full);
    assert_eq!(
        launcher.launched(),
        vec!["llama".to_string(), "tools".to_string(), "embedding".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unrelated_services_probe_concurrently() {
    let launcher = MockLauncher::new();
    let services = vec![
        delayed("a", 10),
        delayed("b", 10),
        delayed("c", 1).depends_on(["a", "b"]),
    ];
    let sup = supervisor(services, &launcher);

    let started = Instant::now();
    let report = sup.start().await.expect("start");
    let elapsed = started.elapsed();
    assert_eq!(report.coverage, Coverage::Full);
    assert!(elapsed >= Duration::from_secs(11), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(20), "{elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_pacing_delays_readiness_probe() {
    let launcher = MockLauncher::new();
    let options = schema::SupervisorOptions {
        pacing_ms: 2_000,
        ..fast_options()
    };
    let sup = supervisor_with(vec![delayed("llama", 0)], &launcher, options);

    let started = Instant::now();
    sup.start().await.expect("start");
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_unconfirmed_launch_times_out() {
    let launcher = MockLauncher::new();
    launcher.delay_launch("llama", Duration::from_secs(60));
    let options = schema::SupervisorOptions {
        launch_timeout_ms: 1_000,
        ..fast_options()
    };
    let sup = supervisor_with(
        vec![delayed("llama", 0), delayed("rag", 0).depends_on(["llama"])],
        &launcher,
        options,
    );

    let report = sup.start().await.expect("start");
    match report.failure_of("llama") {
        Some(FailureReason::LaunchFailed { cause }) => assert!(cause.contains("not confirmed")),
        other => panic!("expected LaunchFailed, got {other:?}"),
    }
    assert_eq!(report.state_of("rag"), Some(ServiceState::Failed));
    assert!(!launcher.is_running("llama"));
}

#[tokio::test]
async fn test_second_start_reports_already_running() {
    let launcher = MockLauncher::new();
    let sup = supervisor(vec![delayed("llama", 0), delayed("rag", 0)], &launcher);

    sup.start().await.expect("first start");
    let mut events = sup.subscribe();
    assert!(matches!(sup.start().await, Err(CoreError::AlreadyRunning)));

    assert_eq!(launcher.launch_count("llama"), 1);
    assert_eq!(launcher.launch_count("rag"), 1);
    assert_eq!(sup.session(), SessionState::Running(Coverage::Full));
    let warned = drain(&mut events)
        .iter()
        .any(|e| e.kind() == "warning" && e.detail().contains("already running"));
    assert!(warned);

    let status = sup.status().await.expect("status");
    assert_eq!(status.get("llama").and_then(|s| s.tracked_state), Some(ServiceState::Ready));
}

#[tokio::test]
async fn test_operations_during_start_are_busy() {
    let launcher = MockLauncher::new();
    launcher.delay_launch("llama", Duration::from_millis(300));
    let sup = Arc::new(supervisor(vec![delayed("llama", 0)], &launcher));

    let starting = {
        let sup = Arc::clone(&sup);
        tokio::spawn(async move { sup.start().await })
    };
    assert!(eventually(|| sup.session() == SessionState::Starting).await);

    assert!(matches!(sup.start().await, Err(CoreError::Busy)));
    assert!(matches!(sup.status().await, Err(CoreError::Busy)));

    let report = starting.await.expect("join").expect("start");
    assert_eq!(report.coverage, Coverage::Full);
    assert_eq!(launcher.launch_count("llama"), 1);
    sup.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let launcher = MockLauncher::new();
    let sup = supervisor(vec![delayed("llama", 0)], &launcher);

    sup.start().await.expect("start");
    sup.stop().await;
    sup.start().await.expect("start again");
    assert_eq!(launcher.launch_count("llama"), 2);
    assert_eq!(sup.session(), SessionState::Running(Coverage::Full));
    sup.stop().await;
}

#[tokio::test]
async fn test_empty_command_is_a_launch_failure() {
    let launcher = MockLauncher::new();
    let sup = supervisor(vec![Service::new("broken", Vec::<String>::new())], &launcher);

    let report = sup.start().await.expect("start");
    assert!(matches!(
        report.failure_of("broken"),
        Some(FailureReason::LaunchFailed { .. })
    ));
    assert_eq!(report.coverage, Coverage::Partial);
}

#[tokio::test(start_paused = true)]
async fn test_command_exiting_during_delay_fails_service() {
    let launcher = MockLauncher::new();
    launcher.exit_on_launch("llama", ProcessExit::Code(3));
    let sup = supervisor(
        vec![delayed("llama", 5), delayed("rag", 0).depends_on(["llama"])],
        &launcher,
    );
    let mut events = sup.subscribe();

    let started = Instant::now();
    let report = sup.start().await.expect("start");
    assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
    assert_eq!(report.coverage, Coverage::Partial);
    assert_eq!(
        report.failure_of("llama"),
        Some(&FailureReason::LaunchFailed {
            cause: "exited with code 3".to_string()
        })
    );
    assert_eq!(
        report.failure_of("rag"),
        Some(&FailureReason::DependencyFailed {
            dependency: "llama".to_string()
        })
    );
    assert_eq!(launcher.launch_count("rag"), 0);

    let exited = drain(&mut events).into_iter().find_map(|e| match e {
        SupervisorEvent::ProcessExited { service_id, code, .. } => Some((service_id, code)),
        _ => None,
    });
    assert_eq!(exited, Some(("llama".to_string(), Some(3))));
    sup.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_command_exiting_during_tcp_readiness_fails_fast() {
    let launcher = MockLauncher::new();
    launcher.exit_on_launch("embedding", ProcessExit::Signal(9));
    let sup = supervisor(
        vec![Service::new("embedding", ["sh", "embedding.sh"])
            .with_readiness(tcp(free_port(), 50))],
        &launcher,
    );

    let report = sup.start().await.expect("start");
    assert_eq!(report.state_of("embedding"), Some(ServiceState::Failed));
    assert_eq!(
        report.failure_of("embedding"),
        Some(&FailureReason::LaunchFailed {
            cause: "killed by signal 9".to_string()
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_clean_exit_keeps_probing() {
    let launcher = MockLauncher::new();
    launcher.exit_on_launch("llama", ProcessExit::Code(0));
    let sup = supervisor(
        vec![delayed("llama", 2), delayed("rag", 0).depends_on(["llama"])],
        &launcher,
    );
    let mut events = sup.subscribe();

    let report = sup.start().await.expect("start");
    assert_eq!(report.coverage, Coverage::Full);
    assert_eq!(report.state_of("llama"), Some(ServiceState::Ready));
    let clean_exit = drain(&mut events).iter().any(|e| {
        e.kind() == "processExited"
            && e.service_id() == Some("llama")
            && e.severity() == EventSeverity::Info
    });
    assert!(clean_exit);
    sup.stop().await;
}

#[tokio::test]
async fn test_stop_before_token_is_published_cancels_start() {
    let launcher = MockLauncher::new();
    let sup = supervisor(vec![delayed("llama", 0)], &launcher);

    // A start that has the lock but has not published its token yet
    let stops_seen = sup.stop_requests.load(Ordering::SeqCst);
    sup.stop().await;
    let cancel = CancellationToken::new();
    sup.install_cancel(&cancel, stops_seen);
    assert!(cancel.is_cancelled());

    let fresh = CancellationToken::new();
    sup.install_cancel(&fresh, sup.stop_requests.load(Ordering::SeqCst));
    assert!(!fresh.is_cancelled());
    sup.cancel_slot().take();
}
