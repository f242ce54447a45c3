//! Embedded schema migration.
//!
//! Migrations run at startup inside a session holding a well-known advisory
//! lock, so two replicas starting simultaneously serialize instead of racing
//! DDL. The wait is bounded by `statement_timeout`; a second migrator that
//! cannot get the lock in time errors out and the operator retries.

use sqlx::{Connection, PgPool};

use smelter_core::ports::Result;
use smelter_core::SmelterError;

/// Well-known advisory lock id for schema migration.
pub const MIGRATION_LOCK_KEY: i64 = 0x534d_454c_5445_5201;

/// Bounded wait for the migration lock.
const LOCK_TIMEOUT_SECS: u32 = 30;

/// Ordered migration steps. Append-only; never edit an applied step.
const MIGRATIONS: &[(i32, &str)] = &[(1, INIT_SQL)];

const INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INT PRIMARY KEY,
    applied_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS pipelines (
    id                  UUID PRIMARY KEY,
    namespace           TEXT NOT NULL,
    layer               TEXT NOT NULL,
    name                TEXT NOT NULL,
    description         TEXT,
    owner               TEXT,
    published_versions  JSONB NOT NULL DEFAULT '{}'::jsonb,
    draft_dirty         BOOLEAN NOT NULL DEFAULT false,
    retention_override  JSONB,
    deleted_at          TIMESTAMPTZ,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- Natural key holds over live rows only, so a soft-deleted pipeline's
-- (namespace, layer, name) can be re-created.
CREATE UNIQUE INDEX IF NOT EXISTS pipelines_natural_key
    ON pipelines (namespace, layer, name)
    WHERE deleted_at IS NULL;

CREATE TABLE IF NOT EXISTS runs (
    id            UUID PRIMARY KEY,
    pipeline_id   UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    status        TEXT NOT NULL DEFAULT 'pending',
    "trigger"     TEXT NOT NULL,
    error         TEXT,
    started_at    TIMESTAMPTZ,
    finished_at   TIMESTAMPTZ,
    duration_ms   BIGINT,
    rows_written  BIGINT,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS runs_pipeline_created
    ON runs (pipeline_id, created_at DESC);
CREATE INDEX IF NOT EXISTS runs_status ON runs (status);

CREATE TABLE IF NOT EXISTS schedules (
    id           UUID PRIMARY KEY,
    pipeline_id  UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    cron_expr    TEXT NOT NULL,
    enabled      BOOLEAN NOT NULL DEFAULT true,
    last_run_id  UUID,
    last_run_at  TIMESTAMPTZ,
    next_run_at  TIMESTAMPTZ,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS triggers (
    id                 UUID PRIMARY KEY,
    pipeline_id        UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    kind               TEXT NOT NULL,
    config             JSONB NOT NULL DEFAULT '{}'::jsonb,
    enabled            BOOLEAN NOT NULL DEFAULT true,
    cooldown_seconds   BIGINT NOT NULL DEFAULT 0,
    token_sha256       TEXT,
    last_triggered_at  TIMESTAMPTZ,
    last_run_id        UUID,
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS triggers_token ON triggers (token_sha256)
    WHERE token_sha256 IS NOT NULL;

CREATE TABLE IF NOT EXISTS landing_zones (
    id          UUID PRIMARY KEY,
    namespace   TEXT NOT NULL,
    name        TEXT NOT NULL,
    auto_purge  BOOLEAN NOT NULL DEFAULT false,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (namespace, name)
);

CREATE TABLE IF NOT EXISTS landing_files (
    id            UUID PRIMARY KEY,
    zone_id       UUID NOT NULL REFERENCES landing_zones(id) ON DELETE CASCADE,
    file_name     TEXT NOT NULL,
    size_bytes    BIGINT NOT NULL DEFAULT 0,
    content_type  TEXT,
    uploaded_by   TEXT,
    uploaded_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS landing_files_zone ON landing_files (zone_id);

CREATE TABLE IF NOT EXISTS run_logs (
    id       BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    run_id   UUID NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    ts       TIMESTAMPTZ NOT NULL,
    level    TEXT NOT NULL,
    message  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS run_logs_run ON run_logs (run_id);

CREATE TABLE IF NOT EXISTS audit_log (
    id           UUID PRIMARY KEY,
    actor        TEXT NOT NULL,
    action       TEXT NOT NULL,
    entity_kind  TEXT NOT NULL,
    entity_id    UUID,
    detail       JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS audit_log_created ON audit_log (created_at);

CREATE TABLE IF NOT EXISTS pipeline_versions (
    id                  UUID PRIMARY KEY,
    pipeline_id         UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    version_number      INT NOT NULL,
    published_versions  JSONB NOT NULL DEFAULT '{}'::jsonb,
    published_by        TEXT,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (pipeline_id, version_number)
);

CREATE TABLE IF NOT EXISTS quality_tests (
    id           UUID PRIMARY KEY,
    pipeline_id  UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
    name         TEXT NOT NULL,
    config       JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS quality_results (
    id          UUID PRIMARY KEY,
    test_id     UUID NOT NULL REFERENCES quality_tests(id) ON DELETE CASCADE,
    run_id      UUID,
    passed      BOOLEAN NOT NULL,
    detail      JSONB NOT NULL DEFAULT '{}'::jsonb,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS quality_results_test_created
    ON quality_results (test_id, created_at DESC);

-- Singleton rows keyed by a constant-true id.
CREATE TABLE IF NOT EXISTS retention_config (
    id      BOOLEAN PRIMARY KEY DEFAULT true CHECK (id),
    config  JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS reaper_status (
    id      BOOLEAN PRIMARY KEY DEFAULT true CHECK (id),
    status  JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_flags (
    name   TEXT PRIMARY KEY,
    value  JSONB NOT NULL
);
"#;

/// Apply all pending migrations under the migration advisory lock.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| SmelterError::Unavailable(format!("acquire migration connection: {e}")))?;

    sqlx::query(&format!("SET statement_timeout = '{LOCK_TIMEOUT_SECS}s'"))
        .execute(&mut *conn)
        .await
        .map_err(internal)?;

    match sqlx::query("SELECT pg_advisory_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await
    {
        Ok(_) => {}
        Err(e) => {
            let timed_out = e
                .as_database_error()
                .and_then(|d| d.code())
                .is_some_and(|c| c == "57014");
            return Err(if timed_out {
                SmelterError::Unavailable(format!(
                    "another instance holds the migration lock (waited {LOCK_TIMEOUT_SECS}s)"
                ))
            } else {
                internal(e)
            });
        }
    }

    let result = apply_pending(&mut conn).await;

    // Always unlock before returning the connection to the pool: advisory
    // locks are session-scoped and would otherwise leak with it.
    let _ = sqlx::query("SELECT pg_advisory_unlock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *conn)
        .await;
    let _ = sqlx::query("RESET statement_timeout").execute(&mut *conn).await;

    result
}

async fn apply_pending(conn: &mut sqlx::PgConnection) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
             version INT PRIMARY KEY,
             applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
         )",
    )
    .execute(&mut *conn)
    .await
    .map_err(internal)?;

    for (version, sql) in MIGRATIONS {
        let applied: Option<i32> =
            sqlx::query_scalar("SELECT version FROM schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(&mut *conn)
                .await
                .map_err(internal)?;
        if applied.is_some() {
            continue;
        }

        let mut tx = conn.begin().await.map_err(internal)?;
        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(internal)?;
        sqlx::query("INSERT INTO schema_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await
            .map_err(internal)?;
        tx.commit().await.map_err(internal)?;

        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

fn internal(e: sqlx::Error) -> SmelterError {
    SmelterError::Internal(anyhow::Error::new(e))
}
