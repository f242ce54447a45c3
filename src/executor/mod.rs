//! Worker dispatch and status reconciliation.

pub mod client;
pub mod dispatcher;
pub mod reconciler;
pub mod types;

pub use client::WorkerClient;
pub use dispatcher::RoundRobinDispatcher;
pub use reconciler::{Reconciler, RunCompleteHook, StatusUpdate};
