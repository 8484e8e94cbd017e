//! Test harness for supervising an external service process.
//!
//! The harness starts the service under test in its own process group,
//! aggregates the asynchronous notifications it emits over a messaging bus,
//! and guarantees that every scenario terminates deterministically: a
//! whole-scenario deadline aborts hung bodies, and shutdown escalates from a
//! graceful signal to a forceful kill across the service's entire process
//! tree, tolerating reparenting races along the way.

pub type Result<T> = color_eyre::eyre::Result<T>;

pub mod bus;
pub mod error;
pub mod events;
pub mod process_tree;
pub mod scenario;
pub mod supervisor;
pub mod termination;
pub mod timer;

pub use bus::{
    CallFuture, EventKind, EventSource, LoopbackBus, ServiceClient, SessionEvent, Subscription,
};
pub use error::ScenarioError;
pub use events::{EventAggregator, QuitCondition};
pub use process_tree::{discover, ProcInspector, ProcessInspector, ProcessRecord, ProcessSet};
pub use scenario::{
    ScenarioContext, ScenarioFuture, ScenarioOutcome, ScenarioReport, ScenarioRunner,
};
pub use supervisor::{ServiceConfig, ServiceSupervisor};
pub use termination::{TerminationOutcome, TerminationProtocol};
pub use timer::{TimerBackend, TimerHandle, TimerWheel};
