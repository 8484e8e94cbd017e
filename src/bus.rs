use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use eyre::eyre;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use super::Result;
use crate::error::ScenarioError;

/// Kind of notification a service session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Status,
    Progress,
}

/// One asynchronous notification, immutable once received. Events are
/// appended in strict bus-delivery order for the scenario's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: EventKind,
    pub payload: Value,
    pub source_path: String,
    pub received_at: DateTime<Utc>,
}

impl SessionEvent {
    pub fn status(source_path: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EventKind::Status,
            payload,
            source_path: source_path.into(),
            received_at: Utc::now(),
        }
    }

    pub fn progress(source_path: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EventKind::Progress,
            payload,
            source_path: source_path.into(),
            received_at: Utc::now(),
        }
    }

    /// Extracts a string field from the payload, failing with a
    /// [`ScenarioError::MalformedNotification`] when it is missing or not a
    /// string. Malformed payloads are assertion failures, never swallowed.
    pub fn payload_str(&self, key: &str) -> Result<&str> {
        self.payload
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ScenarioError::MalformedNotification {
                    source_path: self.source_path.clone(),
                    detail: format!("missing string field {key:?}"),
                }
                .into()
            })
    }
}

/// An active bus subscription. Removal is idempotent; dropping the
/// subscription removes it as well.
pub trait Subscription: Send {
    fn remove(&mut self);
}

/// Capability to subscribe to a session's notifications.
///
/// The transport behind this trait is not the harness's concern; it only
/// requires that events for a session path are delivered to the sender in
/// bus order.
pub trait EventSource: Send + Sync {
    fn subscribe(
        &self,
        session_path: &str,
        sender: UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn Subscription>>;
}

pub type CallFuture<'a> = Pin<Box<dyn Future<Output = Result<Value>> + Send + 'a>>;

/// Capability for remote calls into the service under test. Calls carry an
/// effectively unbounded timeout; bounding waits is the scenario deadline's
/// job.
pub trait ServiceClient: Send + Sync {
    fn call<'a>(&'a self, method: &'a str, args: Value) -> CallFuture<'a>;
}

type CallHandler = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

struct LoopbackInner {
    subscribers: Vec<SubscriberEntry>,
    handlers: HashMap<String, CallHandler>,
    next_id: u64,
}

struct SubscriberEntry {
    id: u64,
    session_path: String,
    sender: UnboundedSender<SessionEvent>,
}

/// In-memory bus used by tests and the self-test mode of the binary.
///
/// Publishing fans an event out to every subscriber whose session path
/// prefixes the event's source path, in subscription order.
#[derive(Clone)]
pub struct LoopbackBus {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LoopbackInner {
                subscribers: Vec::new(),
                handlers: HashMap::new(),
                next_id: 0,
            })),
        }
    }

    /// Delivers an event to every matching subscriber. Closed receivers are
    /// pruned lazily.
    pub fn publish(&self, event: SessionEvent) {
        let mut inner = self.inner.lock().expect("bus state poisoned");
        inner.subscribers.retain(|entry| {
            if !event.source_path.starts_with(&entry.session_path) {
                return true;
            }
            trace!(
                subscriber = entry.id,
                source = %event.source_path,
                "delivering event"
            );
            entry.sender.send(event.clone()).is_ok()
        });
    }

    /// Registers a handler for a remote-call method.
    pub fn register_handler<F>(&self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().expect("bus state poisoned");
        inner.handlers.insert(method.into(), Box::new(handler));
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSource for LoopbackBus {
    fn subscribe(
        &self,
        session_path: &str,
        sender: UnboundedSender<SessionEvent>,
    ) -> Result<Box<dyn Subscription>> {
        let mut inner = self.inner.lock().expect("bus state poisoned");
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(SubscriberEntry {
            id,
            session_path: session_path.to_string(),
            sender,
        });
        debug!(id, session_path, "subscription added");
        Ok(Box::new(LoopbackSubscription {
            id,
            inner: Some(self.inner.clone()),
        }))
    }
}

impl ServiceClient for LoopbackBus {
    fn call<'a>(&'a self, method: &'a str, args: Value) -> CallFuture<'a> {
        Box::pin(async move {
            let inner = self.inner.lock().expect("bus state poisoned");
            let handler = inner
                .handlers
                .get(method)
                .ok_or_else(|| eyre!("no handler registered for method {method:?}"))?;
            handler(args)
        })
    }
}

struct LoopbackSubscription {
    id: u64,
    inner: Option<Arc<Mutex<LoopbackInner>>>,
}

impl Subscription for LoopbackSubscription {
    fn remove(&mut self) {
        if let Some(inner) = self.inner.take() {
            let mut inner = inner.lock().expect("bus state poisoned");
            inner.subscribers.retain(|entry| entry.id != self.id);
            debug!(id = self.id, "subscription removed");
        }
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        self.remove();
    }
}
