//! Process-tree discovery against live children

use std::time::Duration;

use nix::unistd::getpid;

use svharness::{discover, ProcInspector, ServiceSupervisor};

use crate::integration::{init_tracing, shell_service};

#[tokio::test]
async fn discovered_set_contains_service_root_and_excludes_harness() {
    init_tracing();

    let mut supervisor = ServiceSupervisor::new(shell_service("echo ready; sleep 30"));
    supervisor.start().await.unwrap();
    supervisor.wait_ready().await.unwrap();

    let root = supervisor.pid().unwrap();
    let set = discover(&ProcInspector, root, &[], &[getpid()]).unwrap();

    assert!(set.contains(root), "service root must be in its own set");
    assert!(
        !set.contains(getpid()),
        "the harness's own pid must never join the set"
    );

    let unresponsive = supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert!(unresponsive.is_empty());
}

#[tokio::test]
async fn discovery_spans_forked_descendants() {
    init_tracing();

    // The service forks a child that forks again.
    let mut supervisor =
        ServiceSupervisor::new(shell_service("echo ready; (sleep 30 & sleep 30); sleep 30"));
    supervisor.start().await.unwrap();
    supervisor.wait_ready().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let root = supervisor.pid().unwrap();
    let set = discover(&ProcInspector, root, &[], &[getpid()]).unwrap();
    assert!(set.len() >= 2, "expected descendants, got {:?}", set.records());

    let unresponsive = supervisor.stop(Duration::from_secs(5)).await.unwrap();
    assert!(unresponsive.is_empty());
}
