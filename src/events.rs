use std::time::Instant as StdInstant;

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use super::Result;
use crate::bus::{EventSource, SessionEvent, Subscription};
use crate::error::ScenarioError;

/// A predicate over the accumulated event log that ends a wait.
pub struct QuitCondition {
    name: String,
    predicate: Box<dyn Fn(&[SessionEvent]) -> bool + Send + Sync>,
}

impl QuitCondition {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&[SessionEvent]) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates against the full log. Predicates that panic on malformed
    /// payloads propagate as assertion failures; nothing is swallowed here.
    pub fn holds(&self, events: &[SessionEvent]) -> bool {
        (self.predicate)(events)
    }
}

/// Buffers a session's notifications in bus-delivery order and evaluates
/// quit conditions over them.
///
/// One aggregator per scenario, scoped by session path even when scenarios
/// share the underlying bus. The subscription callback feeds a channel; waits
/// are timeout-bounded receives on that channel, so no event is ever
/// reordered or dropped, no matter how many conditions are pending.
pub struct EventAggregator {
    session_path: String,
    rx: UnboundedReceiver<SessionEvent>,
    log: Vec<SessionEvent>,
    subscription: Option<Box<dyn Subscription>>,
}

impl EventAggregator {
    /// Attaches to `session_path` on the bus. Events arriving from this
    /// moment on are buffered even while nobody is waiting.
    pub fn subscribe(bus: &dyn EventSource, session_path: &str) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(session_path, tx)?;
        debug!(session_path, "aggregator subscribed");
        Ok(Self {
            session_path: session_path.to_string(),
            rx,
            log: Vec::new(),
            subscription: Some(subscription),
        })
    }

    pub fn session_path(&self) -> &str {
        &self.session_path
    }

    /// The full event log, in exact delivery order, from the start of the
    /// scenario. Callers may rescan from the beginning as often as they
    /// like; the aggregator itself never rewinds or drops.
    pub fn events(&mut self) -> &[SessionEvent] {
        self.drain();
        &self.log
    }

    /// Waits until one of `conditions` holds over the event log.
    ///
    /// Already-buffered events are checked synchronously first, so a
    /// notification that arrived before the caller got here satisfies the
    /// wait immediately, without blocking. This closes the race between
    /// triggering an action and listening for its effect. With `may_block`
    /// false an unmet condition set is
    /// [`ScenarioError::NotSatisfied`]; otherwise the wait is bounded by
    /// `deadline`, and expiry carries the full buffered log in
    /// [`ScenarioError::DeadlineExpired`].
    ///
    /// Returns the index of the first condition that held.
    pub async fn collect_until(
        &mut self,
        conditions: &[QuitCondition],
        may_block: bool,
        deadline: Instant,
    ) -> Result<usize> {
        self.drain();
        if let Some(index) = self.check(conditions) {
            return Ok(index);
        }
        if !may_block {
            return Err(ScenarioError::NotSatisfied.into());
        }

        let started = StdInstant::now();
        loop {
            match timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(event)) => {
                    self.log.push(event);
                    // Every pending condition is rechecked after each append.
                    if let Some(index) = self.check(conditions) {
                        return Ok(index);
                    }
                }
                Ok(None) => {
                    return Err(eyre::eyre!(
                        "event channel closed while waiting on session {}",
                        self.session_path
                    ));
                }
                Err(_elapsed) => {
                    return Err(ScenarioError::DeadlineExpired {
                        waited: started.elapsed(),
                        events: self.log.clone(),
                    }
                    .into());
                }
            }
        }
    }

    /// Detaches from the bus. Events already buffered stay readable.
    pub fn unsubscribe(&mut self) {
        if let Some(mut subscription) = self.subscription.take() {
            subscription.remove();
        }
    }

    fn drain(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => self.log.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
    }

    fn check(&self, conditions: &[QuitCondition]) -> Option<usize> {
        for (index, condition) in conditions.iter().enumerate() {
            if condition.holds(&self.log) {
                info!(
                    condition = condition.name(),
                    events = self.log.len(),
                    "quit condition satisfied"
                );
                return Some(index);
            }
        }
        None
    }
}
