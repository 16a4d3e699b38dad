//! Table definitions for the PostgreSQL backend.
//!
//! `ensure_schema` is idempotent and runs at connection time. Foreign keys
//! cascade on delete, so destroying a namespace or a work spec takes its
//! dependents with it in one statement. `work_unit.active_attempt_id` is a
//! plain column rather than a foreign key: it points into `attempt`, which
//! points back at `work_unit`, and the application clears it in the same
//! transaction that terminates the attempt.

use sqlx::PgPool;

use crate::error::Result;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS namespace (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL UNIQUE
    )",
    "CREATE TABLE IF NOT EXISTS work_spec (
        id BIGSERIAL PRIMARY KEY,
        namespace_id BIGINT NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        priority INTEGER NOT NULL DEFAULT 0,
        weight INTEGER NOT NULL DEFAULT 20,
        paused BOOLEAN NOT NULL DEFAULT FALSE,
        continuous BOOLEAN NOT NULL DEFAULT FALSE,
        can_be_continuous BOOLEAN NOT NULL DEFAULT FALSE,
        min_memory_gb DOUBLE PRECISION NOT NULL DEFAULT 0,
        interval_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
        next_continuous TIMESTAMPTZ,
        max_running INTEGER NOT NULL DEFAULT 0,
        max_attempts_returned INTEGER NOT NULL DEFAULT 0,
        max_retries INTEGER NOT NULL DEFAULT 0,
        next_work_spec_name TEXT,
        runtime TEXT NOT NULL DEFAULT '',
        UNIQUE (namespace_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS worker (
        id BIGSERIAL PRIMARY KEY,
        namespace_id BIGINT NOT NULL REFERENCES namespace(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        data JSONB NOT NULL DEFAULT '{}'::jsonb,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        mode TEXT NOT NULL DEFAULT '',
        parent_id BIGINT REFERENCES worker(id) ON DELETE SET NULL,
        expiration TIMESTAMPTZ NOT NULL,
        last_update TIMESTAMPTZ NOT NULL,
        UNIQUE (namespace_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS work_unit (
        id BIGSERIAL PRIMARY KEY,
        work_spec_id BIGINT NOT NULL REFERENCES work_spec(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        data JSONB NOT NULL,
        priority DOUBLE PRECISION NOT NULL DEFAULT 0,
        not_before TIMESTAMPTZ,
        active_attempt_id BIGINT,
        retries INTEGER NOT NULL DEFAULT 0,
        UNIQUE (work_spec_id, name)
    )",
    "CREATE TABLE IF NOT EXISTS attempt (
        id BIGSERIAL PRIMARY KEY,
        work_unit_id BIGINT NOT NULL REFERENCES work_unit(id) ON DELETE CASCADE,
        worker_id BIGINT NOT NULL REFERENCES worker(id) ON DELETE CASCADE,
        status TEXT NOT NULL,
        data JSONB,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ,
        expiration_time TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS work_unit_available
        ON work_unit (work_spec_id, priority DESC, name ASC)
        WHERE active_attempt_id IS NULL",
    "CREATE INDEX IF NOT EXISTS attempt_pending_deadline
        ON attempt (expiration_time)
        WHERE status = 'pending'",
    "CREATE INDEX IF NOT EXISTS attempt_by_worker ON attempt (worker_id)",
    "CREATE INDEX IF NOT EXISTS attempt_by_work_unit ON attempt (work_unit_id)",
];

pub(crate) async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
