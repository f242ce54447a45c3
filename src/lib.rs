//! smelterd — control plane of the Smelter data-pipeline platform.
//!
//! The daemon owns run orchestration and lifecycle: dispatching runs to the
//! worker fleet, reconciling their terminal states (push-primary,
//! poll-fallback), firing cron schedules and event-driven triggers, and
//! enforcing retention. Durable state lives behind the `smelter-core` port
//! traits; `smelter-postgres` provides the production implementation and
//! `smelter_core::memory` the test one.

pub mod api;
pub mod catalog;
pub mod config;
pub mod cron_util;
pub mod executor;
pub mod leader;
pub mod reaper;
pub mod request_id;
pub mod scheduler;
pub mod triggers;
