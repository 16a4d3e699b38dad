use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, Row};
use tracing::{debug, warn};

use crate::api::{Attempt, AttemptStatus, WorkUnit, Worker};
use crate::error::{Error, Result};
use crate::output::output_work_units;
use crate::value::DataMap;

use super::worker::PgWorker;
use super::workunit::PgWorkUnit;
use super::{decode_data, encode_data, with_tx, workspec, PgCore};

pub(crate) struct PgAttempt {
    core: Arc<PgCore>,
    id: i64,
    unit_id: i64,
    worker_id: i64,
    namespace: String,
    spec_name: String,
    unit_name: String,
    worker_name: String,
}

#[allow(clippy::too_many_arguments)]
impl PgAttempt {
    pub fn new(
        core: Arc<PgCore>,
        id: i64,
        unit_id: i64,
        worker_id: i64,
        namespace: &str,
        spec_name: &str,
        unit_name: &str,
        worker_name: &str,
    ) -> Self {
        Self {
            core,
            id,
            unit_id,
            worker_id,
            namespace: namespace.to_string(),
            spec_name: spec_name.to_string(),
            unit_name: unit_name.to_string(),
            worker_name: worker_name.to_string(),
        }
    }

    async fn fetch_row(&self, column: &str) -> Result<sqlx::postgres::PgRow> {
        let query = format!("SELECT {column} FROM attempt WHERE id = $1");
        sqlx::query(&query)
            .bind(self.id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)
    }
}

/// Everything a transition needs to know about an attempt, fetched with its
/// row locks held.
struct Guarded {
    unit_id: i64,
    namespace_id: i64,
    retries: i32,
    max_retries: i32,
    next_work_spec_name: Option<String>,
    attempt_data: Option<serde_json::Value>,
    unit_data: serde_json::Value,
}

/// Lock the attempt and its unit, then enforce the transition guard: a
/// terminal attempt reports `AttemptTerminated`; an attempt that is no
/// longer its unit's active attempt reports `WrongWorker`.
async fn guard(conn: &mut PgConnection, attempt_id: i64) -> Result<Guarded> {
    let row = sqlx::query(
        "SELECT a.status, a.data AS attempt_data,
                wu.id AS unit_id, wu.active_attempt_id, wu.retries,
                wu.data AS unit_data,
                ws.id AS spec_id, ws.namespace_id, ws.max_retries,
                ws.next_work_spec_name
         FROM attempt a
         JOIN work_unit wu ON wu.id = a.work_unit_id
         JOIN work_spec ws ON ws.id = wu.work_spec_id
         WHERE a.id = $1
         FOR UPDATE OF a, wu",
    )
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(Error::Gone)?;

    let status: String = row.try_get("status")?;
    if AttemptStatus::parse(&status).map_or(true, AttemptStatus::is_terminal) {
        return Err(Error::AttemptTerminated);
    }
    let active_attempt_id: Option<i64> = row.try_get("active_attempt_id")?;
    if active_attempt_id != Some(attempt_id) {
        return Err(Error::WrongWorker);
    }
    Ok(Guarded {
        unit_id: row.try_get("unit_id")?,
        namespace_id: row.try_get("namespace_id")?,
        retries: row.try_get("retries")?,
        max_retries: row.try_get("max_retries")?,
        next_work_spec_name: row.try_get("next_work_spec_name")?,
        attempt_data: row.try_get("attempt_data")?,
        unit_data: row.try_get("unit_data")?,
    })
}

async fn set_attempt_terminal(
    conn: &mut PgConnection,
    attempt_id: i64,
    status: AttemptStatus,
    end_time: DateTime<Utc>,
    data: Option<&serde_json::Value>,
) -> Result<()> {
    sqlx::query(
        "UPDATE attempt SET status = $2, end_time = $3, data = COALESCE($4, data)
         WHERE id = $1",
    )
    .bind(attempt_id)
    .bind(status.as_str())
    .bind(end_time)
    .bind(data)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn release_unit(
    conn: &mut PgConnection,
    unit_id: i64,
    not_before: Option<DateTime<Utc>>,
    bump_retries: bool,
) -> Result<()> {
    sqlx::query(
        "UPDATE work_unit SET
            active_attempt_id = NULL,
            not_before = $2,
            retries = retries + $3
         WHERE id = $1",
    )
    .bind(unit_id)
    .bind(not_before)
    .bind(if bump_retries { 1i32 } else { 0i32 })
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Create a pending attempt for a unit and point the unit at it. Any
/// previously active pending attempt is displaced in place; the sweep will
/// collect it once its own deadline passes.
pub(super) async fn insert_attempt(
    conn: &mut PgConnection,
    unit_id: i64,
    worker_id: i64,
    now: DateTime<Utc>,
    lifetime: Duration,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO attempt (work_unit_id, worker_id, status, start_time, expiration_time)
         VALUES ($1, $2, 'pending', $3, $4)
         RETURNING id",
    )
    .bind(unit_id)
    .bind(worker_id)
    .bind(now)
    .bind(now + lifetime)
    .fetch_one(&mut *conn)
    .await?;
    let attempt_id: i64 = row.try_get("id")?;
    sqlx::query("UPDATE work_unit SET active_attempt_id = $2 WHERE id = $1")
        .bind(unit_id)
        .bind(attempt_id)
        .execute(&mut *conn)
        .await?;
    Ok(attempt_id)
}

/// Expire one pending attempt inside an open transaction. Releases the
/// unit unless its retry budget is exhausted; a displaced attempt is
/// terminated without touching the unit.
pub(super) async fn expire_one(
    conn: &mut PgConnection,
    attempt_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT wu.id AS unit_id, wu.active_attempt_id, wu.retries, ws.max_retries
         FROM attempt a
         JOIN work_unit wu ON wu.id = a.work_unit_id
         JOIN work_spec ws ON ws.id = wu.work_spec_id
         WHERE a.id = $1
         FOR UPDATE OF a, wu",
    )
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?;
    set_attempt_terminal(conn, attempt_id, AttemptStatus::Expired, now, None).await?;
    if let Some(row) = row {
        let active_attempt_id: Option<i64> = row.try_get("active_attempt_id")?;
        if active_attempt_id == Some(attempt_id) {
            let retries: i32 = row.try_get("retries")?;
            let max_retries: i32 = row.try_get("max_retries")?;
            let exhausted = max_retries > 0 && retries >= max_retries;
            if !exhausted {
                release_unit(conn, row.try_get("unit_id")?, None, false).await?;
            }
        }
    }
    debug!(attempt = attempt_id, "attempt expired");
    Ok(())
}

#[async_trait]
impl Attempt for PgAttempt {
    fn work_spec_name(&self) -> &str {
        &self.spec_name
    }

    fn work_unit_name(&self) -> &str {
        &self.unit_name
    }

    fn worker_name(&self) -> &str {
        &self.worker_name
    }

    async fn work_unit(&self) -> Result<Arc<dyn WorkUnit>> {
        Ok(Arc::new(PgWorkUnit::new(
            self.core.clone(),
            self.unit_id,
            &self.namespace,
            &self.spec_name,
            &self.unit_name,
        )))
    }

    async fn worker(&self) -> Result<Arc<dyn Worker>> {
        let row = sqlx::query("SELECT namespace_id FROM worker WHERE id = $1")
            .bind(self.worker_id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)?;
        Ok(Arc::new(PgWorker::new(
            self.core.clone(),
            self.worker_id,
            row.try_get("namespace_id")?,
            &self.namespace,
            &self.worker_name,
        )))
    }

    async fn status(&self) -> Result<AttemptStatus> {
        let status: String = self.fetch_row("status").await?.try_get("status")?;
        AttemptStatus::parse(&status).ok_or(Error::Gone)
    }

    async fn data(&self) -> Result<DataMap> {
        let row = sqlx::query(
            "SELECT a.data AS attempt_data, wu.data AS unit_data
             FROM attempt a
             JOIN work_unit wu ON wu.id = a.work_unit_id
             WHERE a.id = $1",
        )
        .bind(self.id)
        .fetch_optional(&self.core.pool)
        .await?
        .ok_or(Error::Gone)?;
        let attempt_data: Option<serde_json::Value> = row.try_get("attempt_data")?;
        match attempt_data {
            Some(data) => decode_data(data),
            None => decode_data(row.try_get("unit_data")?),
        }
    }

    async fn start_time(&self) -> Result<DateTime<Utc>> {
        Ok(self.fetch_row("start_time").await?.try_get("start_time")?)
    }

    async fn end_time(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.fetch_row("end_time").await?.try_get("end_time")?)
    }

    async fn expiration_time(&self) -> Result<DateTime<Utc>> {
        Ok(self
            .fetch_row("expiration_time")
            .await?
            .try_get("expiration_time")?)
    }

    async fn renew(&self, extension: Duration, data: Option<DataMap>) -> Result<()> {
        let now = self.core.clock.now();
        let attempt_id = self.id;
        let payload = data.as_ref().map(encode_data).transpose()?;
        with_tx(&self.core, |conn| {
            let payload = payload.clone();
            Box::pin(async move {
                guard(conn, attempt_id).await?;
                sqlx::query(
                    "UPDATE attempt SET expiration_time = $2, data = COALESCE($3, data)
                     WHERE id = $1",
                )
                .bind(attempt_id)
                .bind(now + extension)
                .bind(&payload)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    async fn finish(&self, data: Option<DataMap>) -> Result<()> {
        let now = self.core.clock.now();
        let attempt_id = self.id;
        let payload = data.as_ref().map(encode_data).transpose()?;
        with_tx(&self.core, |conn| {
            let payload = payload.clone();
            Box::pin(async move {
                let guarded = guard(conn, attempt_id).await?;
                set_attempt_terminal(
                    conn,
                    attempt_id,
                    AttemptStatus::Finished,
                    now,
                    payload.as_ref(),
                )
                .await?;
                debug!(attempt = attempt_id, "attempt finished");

                let Some(target) = guarded.next_work_spec_name.clone() else {
                    return Ok(());
                };
                let chain_payload = payload
                    .clone()
                    .or(guarded.attempt_data.clone())
                    .unwrap_or_else(|| guarded.unit_data.clone());
                let chain_data = decode_data(chain_payload)?;
                let chained = output_work_units(&chain_data, now);
                if chained.is_empty() {
                    return Ok(());
                }
                let successor = sqlx::query(
                    "SELECT id FROM work_spec WHERE namespace_id = $1 AND name = $2",
                )
                .bind(guarded.namespace_id)
                .bind(&target)
                .fetch_optional(&mut *conn)
                .await?;
                match successor {
                    Some(row) => {
                        let successor_id: i64 = row.try_get("id")?;
                        for (name, data, meta) in &chained {
                            workspec::upsert_unit(conn, successor_id, name, data, meta).await?;
                        }
                        debug!(to = %target, count = chained.len(), "chained work units");
                    }
                    None => warn!(spec = %target, "chained successor work spec does not exist"),
                }
                Ok(())
            })
        })
        .await
    }

    async fn fail(&self, data: Option<DataMap>) -> Result<()> {
        let now = self.core.clock.now();
        let attempt_id = self.id;
        let payload = data.as_ref().map(encode_data).transpose()?;
        with_tx(&self.core, |conn| {
            let payload = payload.clone();
            Box::pin(async move {
                let guarded = guard(conn, attempt_id).await?;
                let retry_instead =
                    guarded.max_retries > 0 && guarded.retries < guarded.max_retries;
                if retry_instead {
                    set_attempt_terminal(
                        conn,
                        attempt_id,
                        AttemptStatus::Retryable,
                        now,
                        payload.as_ref(),
                    )
                    .await?;
                    release_unit(conn, guarded.unit_id, None, true).await?;
                    debug!(attempt = attempt_id, "failed attempt retried");
                } else {
                    set_attempt_terminal(
                        conn,
                        attempt_id,
                        AttemptStatus::Failed,
                        now,
                        payload.as_ref(),
                    )
                    .await?;
                    debug!(attempt = attempt_id, "attempt failed");
                }
                Ok(())
            })
        })
        .await
    }

    async fn retry(&self, delay: Duration) -> Result<()> {
        let now = self.core.clock.now();
        let attempt_id = self.id;
        with_tx(&self.core, |conn| {
            Box::pin(async move {
                let guarded = guard(conn, attempt_id).await?;
                set_attempt_terminal(conn, attempt_id, AttemptStatus::Retryable, now, None)
                    .await?;
                let not_before = (delay > Duration::zero()).then(|| now + delay);
                release_unit(conn, guarded.unit_id, not_before, true).await?;
                debug!(attempt = attempt_id, "attempt returned for retry");
                Ok(())
            })
        })
        .await
    }

    async fn expire(&self) -> Result<()> {
        let now = self.core.clock.now();
        let attempt_id = self.id;
        with_tx(&self.core, |conn| {
            Box::pin(async move {
                guard(conn, attempt_id).await?;
                expire_one(conn, attempt_id, now).await
            })
        })
        .await
    }
}
