//! Full scenario lifecycles: cleanup on every exit path

use std::time::Duration;

use serde_json::json;

use svharness::{
    EventAggregator, LoopbackBus, ProcInspector, ProcessInspector, QuitCondition,
    ScenarioContext, ScenarioFuture, ScenarioOutcome, ScenarioRunner, ServiceSupervisor,
    SessionEvent,
};

use crate::integration::{init_tracing, shell_service};

fn supervisor_with_marker(marker: &str) -> ServiceSupervisor {
    ServiceSupervisor::new(shell_service(&format!(
        "echo ready; exec sleep {marker}"
    )))
}

/// True while any process whose command line carries `marker` is alive.
fn marker_alive(marker: &str) -> bool {
    ProcInspector
        .snapshot()
        .unwrap()
        .iter()
        .any(|record| record.cmdline.contains(marker))
}

#[tokio::test]
async fn successful_scenario_leaves_no_processes_behind() {
    init_tracing();
    let marker = "31741";

    let bus = LoopbackBus::new();
    let aggregator = EventAggregator::subscribe(&bus, "/session/ok").unwrap();
    let runner = ScenarioRunner::new("clean", Duration::from_secs(30), Duration::from_secs(5));

    let publisher = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher.publish(SessionEvent::status("/session/ok", json!({"status": "done"})));
    });

    fn wait_done(cx: &mut ScenarioContext) -> ScenarioFuture<'_> {
        Box::pin(async move {
            let done = QuitCondition::new("done", |events: &[SessionEvent]| {
                events.iter().any(|event| event.payload["status"] == "done")
            });
            cx.collect_until(&[done], true).await?;
            Ok(())
        })
    }
    let report = runner
        .run(supervisor_with_marker(marker), aggregator, wait_done)
        .await;

    assert!(report.passed(), "report: {report:?}");
    assert!(
        !marker_alive(marker),
        "service must be gone after a passing scenario"
    );
}

#[tokio::test]
async fn deadline_abort_still_tears_the_service_down() {
    init_tracing();
    let marker = "31742";

    let bus = LoopbackBus::new();
    let aggregator = EventAggregator::subscribe(&bus, "/session/hang").unwrap();
    let runner = ScenarioRunner::new(
        "hung",
        Duration::from_millis(800),
        Duration::from_secs(5),
    );

    fn hang(_cx: &mut ScenarioContext) -> ScenarioFuture<'_> {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        })
    }
    let report = runner
        .run(supervisor_with_marker(marker), aggregator, hang)
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::DeadlineExpired);
    assert!(
        !marker_alive(marker),
        "service must be gone even when the body was aborted"
    );
}

#[tokio::test]
async fn stubborn_service_failure_is_annotated_on_the_report() {
    init_tracing();

    let bus = LoopbackBus::new();
    let aggregator = EventAggregator::subscribe(&bus, "/session/stubborn").unwrap();
    let runner = ScenarioRunner::new(
        "stubborn",
        Duration::from_secs(30),
        Duration::from_secs(2),
    );

    let supervisor =
        ServiceSupervisor::new(shell_service("trap '' TERM; echo ready; sleep 30"));

    fn noop(_cx: &mut ScenarioContext) -> ScenarioFuture<'_> {
        Box::pin(async { Ok(()) })
    }
    let report = runner.run(supervisor, aggregator, noop).await;

    assert_eq!(report.outcome, ScenarioOutcome::Passed);
    assert!(
        !report.unresponsive.is_empty(),
        "forceful kill must be annotated as a failure"
    );
    assert!(!report.passed(), "unresponsive pids always fail the scenario");
}

#[tokio::test]
async fn deadline_wait_failure_attaches_the_event_log() {
    init_tracing();

    let bus = LoopbackBus::new();
    let aggregator = EventAggregator::subscribe(&bus, "/session/log").unwrap();
    let runner = ScenarioRunner::new(
        "attach-log",
        Duration::from_millis(800),
        Duration::from_secs(5),
    );

    bus.publish(SessionEvent::progress("/session/log", json!({"pct": 10})));
    bus.publish(SessionEvent::progress("/session/log", json!({"pct": 60})));

    fn wait_forever(cx: &mut ScenarioContext) -> ScenarioFuture<'_> {
        Box::pin(async move {
            let never = QuitCondition::new("never", |_: &[SessionEvent]| false);
            cx.collect_until(&[never], true).await?;
            Ok(())
        })
    }
    let report = runner
        .run(
            ServiceSupervisor::new(shell_service("echo ready; sleep 30")),
            aggregator,
            wait_forever,
        )
        .await;

    assert_eq!(report.outcome, ScenarioOutcome::DeadlineExpired);
    assert_eq!(report.events.len(), 2, "buffered events must be attached");
    assert!(report.service_output.contains(&"ready".to_string()));
    assert!(report.unresponsive.is_empty(), "sleep exits on SIGTERM");
}
