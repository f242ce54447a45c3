use thiserror::Error;

/// Error taxonomy surfaced to callers of the control plane.
///
/// Sentinel variants carry meaning across layers without string matching:
/// `AlreadyExists` for unique-constraint conflicts, `RunnerBusy` for worker
/// capacity exhaustion. "Not found" on a get-by-key is `Ok(None)`, not an
/// error; `NotFound` is reserved for operations that require the entity.
#[derive(Debug, Error)]
pub enum SmelterError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Worker capacity exhaustion. A normal outcome of submission, not a
    /// failure: callers branch on it to retry on a later tick. Maps to
    /// `RESOURCE_EXHAUSTED` at the API boundary.
    #[error("runner busy: {0}")]
    RunnerBusy(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("gone: {0}")]
    Gone(String),

    #[error("internal: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SmelterError {
    /// Stable error-code token for the REST envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",
            Self::Conflict(_) => "CONFLICT",
            Self::Unauthenticated(_) => "UNAUTHENTICATED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ResourceExhausted(_) | Self::RunnerBusy(_) => "RESOURCE_EXHAUSTED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Gone(_) => "GONE",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidArgument(_) => 400,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::Conflict(_) => 409,
            Self::Unauthenticated(_) => 401,
            Self::Forbidden(_) => 403,
            Self::ResourceExhausted(_) | Self::RunnerBusy(_) => 429,
            Self::Unavailable(_) => 503,
            Self::Gone(_) => 410,
            Self::Internal(_) => 500,
        }
    }

    /// True when the error is the worker capacity sentinel, possibly wrapped
    /// by the dispatcher's "all runners at capacity" context.
    pub fn is_runner_busy(&self) -> bool {
        matches!(self, Self::RunnerBusy(_))
    }
}

impl From<serde_json::Error> for SmelterError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("malformed JSON payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_busy_maps_to_resource_exhausted_code() {
        let e = SmelterError::RunnerBusy("all 3 runners at capacity".into());
        assert_eq!(e.code(), "RESOURCE_EXHAUSTED");
        assert_eq!(e.http_status(), 429);
        assert!(e.is_runner_busy());
    }

    #[test]
    fn cooldown_is_resource_exhausted_but_not_busy() {
        let e = SmelterError::ResourceExhausted("cooldown active".into());
        assert_eq!(e.code(), "RESOURCE_EXHAUSTED");
        assert!(!e.is_runner_busy());
    }

    #[test]
    fn internal_wraps_anyhow() {
        let e: SmelterError = anyhow::anyhow!("pool exhausted").into();
        assert_eq!(e.code(), "INTERNAL");
        assert_eq!(e.http_status(), 500);
    }
}
