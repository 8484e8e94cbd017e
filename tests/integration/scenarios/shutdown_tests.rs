//! Termination escalation against cooperative and stubborn services

use std::time::Duration;

use svharness::ServiceSupervisor;

use crate::integration::{init_tracing, pid_alive, shell_service};

#[tokio::test]
async fn cooperative_service_stops_on_the_graceful_path() {
    init_tracing();

    let mut supervisor = ServiceSupervisor::new(shell_service("echo ready; sleep 30"));
    supervisor.start().await.unwrap();
    supervisor.wait_ready().await.unwrap();
    let root = supervisor.pid().unwrap();

    let unresponsive = supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert!(unresponsive.is_empty(), "clean shutdown must not escalate");
    assert!(!pid_alive(root));
}

#[tokio::test]
async fn term_ignoring_service_is_escalated_and_reported() {
    init_tracing();

    let mut supervisor =
        ServiceSupervisor::new(shell_service("trap '' TERM; echo ready; sleep 30"));
    supervisor.start().await.unwrap();
    supervisor.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let root = supervisor.pid().unwrap();

    let unresponsive = supervisor.stop(Duration::from_secs(2)).await.unwrap();
    assert!(
        unresponsive.contains(&root),
        "the root must be reported unresponsive, got {unresponsive:?}"
    );
    assert!(
        !pid_alive(root),
        "root pid must be absent from the process table after shutdown"
    );
}

#[tokio::test]
async fn descendants_are_taken_down_with_the_root() {
    init_tracing();

    let mut supervisor =
        ServiceSupervisor::new(shell_service("echo ready; sleep 30 & sleep 30 & wait"));
    supervisor.start().await.unwrap();
    supervisor.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let root = supervisor.pid().unwrap();
    let set = svharness::discover(&svharness::ProcInspector, root, &[], &[]).unwrap();
    assert!(set.len() >= 2);

    let unresponsive = supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert!(unresponsive.is_empty());
    for pid in set.pids() {
        assert!(!pid_alive(pid), "descendant {pid} survived shutdown");
    }
}
