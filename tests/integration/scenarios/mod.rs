//! Integration test scenarios

pub mod deadline_tests;
pub mod discovery_tests;
pub mod event_wait_tests;
pub mod lifecycle_tests;
pub mod shutdown_tests;
