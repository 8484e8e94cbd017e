use std::time::Duration;

use thiserror::Error;

use crate::bus::SessionEvent;

/// Scenario-level failure categories.
///
/// Components report failures through regular `eyre` results; the categories
/// a caller may want to react to are carried as this typed error so they can
/// be recovered with `downcast_ref` at the scenario boundary.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// The whole-scenario deadline fired before any quit condition held.
    /// Carries every event buffered up to the failure point.
    #[error("scenario deadline expired after {waited:?} ({} buffered events)", events.len())]
    DeadlineExpired {
        waited: Duration,
        events: Vec<SessionEvent>,
    },

    /// The service never met its readiness precondition.
    #[error("service not ready within {waited:?}")]
    ReadinessTimeout { waited: Duration },

    /// A notification payload did not have the expected shape.
    #[error("malformed notification from {source_path}: {detail}")]
    MalformedNotification {
        source_path: String,
        detail: String,
    },

    /// The service exited while the scenario still needed it.
    #[error("service exited unexpectedly (status code {code:?})")]
    ServiceExited { code: Option<i32> },

    /// Non-blocking collect found no satisfied quit condition.
    #[error("no quit condition satisfied and blocking was not permitted")]
    NotSatisfied,
}
