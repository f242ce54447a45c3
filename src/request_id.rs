//! Request-id propagation.
//!
//! The API layer scopes each request's id into a task-local; outgoing worker
//! RPCs read it back and set `X-Request-ID` so downstream logs correlate.

use std::future::Future;

pub const HEADER: &str = "X-Request-ID";

tokio::task_local! {
    static REQUEST_ID: Option<String>;
}

/// Run a future with the given request id in scope.
pub async fn scope<F: Future>(id: Option<String>, fut: F) -> F::Output {
    REQUEST_ID.scope(id, fut).await
}

/// The request id of the current task, if any.
pub fn current() -> Option<String> {
    REQUEST_ID.try_with(|v| v.clone()).ok().flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn id_is_scoped_to_the_task() {
        assert_eq!(current(), None);
        let seen = scope(Some("req-1".into()), async { current() }).await;
        assert_eq!(seen.as_deref(), Some("req-1"));
        assert_eq!(current(), None);
    }
}
