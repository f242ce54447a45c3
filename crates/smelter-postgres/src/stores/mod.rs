//! Port implementations over `PgPool`, one module per entity group.
//! All queries are runtime-bound (`sqlx::query` / `query_as`), so the crate
//! builds without a live database.

pub mod admin;
pub mod landing;
pub mod pipelines;
pub mod runs;
pub mod schedules;
pub mod triggers;

use smelter_core::SmelterError;

/// Wrap a driver error as `Internal`, preserving the chain.
pub(crate) fn internal(e: sqlx::Error) -> SmelterError {
    SmelterError::Internal(anyhow::Error::new(e))
}

/// SQLSTATE 23505: unique constraint violation → `AlreadyExists` sentinel.
pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|c| c == "23505")
}
