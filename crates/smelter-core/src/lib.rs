//! Smelter core — pure domain types, store port traits, and the event-bus
//! contract for the control plane. Zero sqlx: the Postgres adapter and the
//! service layer both depend on this crate and never on each other.

pub mod error;
pub mod events;
pub mod memory;
pub mod ports;
pub mod types;

pub use error::SmelterError;
