use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};

use crate::api::{UnitRow, WorkSpec, WorkUnit, WorkUnitQuery, WorkUnitStatus};
use crate::error::{Error, Result};
use crate::meta::{work_spec_name, WorkSpecMeta, WorkUnitMeta};
use crate::value::DataMap;

use super::workunit::PgWorkUnit;
use super::{decode_data, derived_status, encode_data, with_tx, PgCore};

pub(crate) struct PgWorkSpec {
    core: Arc<PgCore>,
    id: i64,
    namespace: String,
    name: String,
}

impl PgWorkSpec {
    pub fn new(core: Arc<PgCore>, id: i64, namespace: &str, name: &str) -> Self {
        Self {
            core,
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn unit_handle(&self, unit_id: i64, unit_name: &str) -> Arc<dyn WorkUnit> {
        Arc::new(PgWorkUnit::new(
            self.core.clone(),
            unit_id,
            &self.namespace,
            &self.name,
            unit_name,
        ))
    }
}

/// Decode a `work_spec` row (or a join carrying its columns) into metadata.
/// Counts are zero; callers that asked for counts fill them in.
pub(super) fn meta_from_row(row: &PgRow) -> Result<WorkSpecMeta> {
    let interval_seconds: f64 = row.try_get("interval_seconds")?;
    Ok(WorkSpecMeta {
        priority: row.try_get("priority")?,
        weight: row.try_get("weight")?,
        paused: row.try_get("paused")?,
        continuous: row.try_get("continuous")?,
        can_start_continuous: row.try_get("can_be_continuous")?,
        min_memory_gb: row.try_get("min_memory_gb")?,
        interval: Duration::milliseconds((interval_seconds * 1000.0) as i64),
        next_continuous: row.try_get("next_continuous")?,
        max_running: row.try_get::<i32, _>("max_running")?.max(0) as usize,
        max_attempts_returned: row.try_get::<i32, _>("max_attempts_returned")?.max(0) as usize,
        max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as usize,
        next_work_spec_name: row.try_get("next_work_spec_name")?,
        runtime: row.try_get("runtime")?,
        available_count: 0,
        pending_count: 0,
    })
}

/// Count a spec's available and pending units.
pub(super) async fn unit_counts(
    conn: &mut PgConnection,
    spec_id: i64,
    now: DateTime<Utc>,
) -> Result<(usize, usize)> {
    let row = sqlx::query(
        "SELECT
            COUNT(*) FILTER (
                WHERE wu.active_attempt_id IS NULL
                  AND (wu.not_before IS NULL OR wu.not_before <= $2)
            )::bigint AS available,
            COUNT(*) FILTER (
                WHERE a.status = 'pending'
            )::bigint AS pending
         FROM work_unit wu
         LEFT JOIN attempt a ON a.id = wu.active_attempt_id
         WHERE wu.work_spec_id = $1",
    )
    .bind(spec_id)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    let available: i64 = row.try_get("available")?;
    let pending: i64 = row.try_get("pending")?;
    Ok((available.max(0) as usize, pending.max(0) as usize))
}

/// Insert or replace one unit inside an open transaction. A unit mid-
/// attempt keeps its attempt; the fresh data applies once that attempt
/// retries or expires.
pub(super) async fn upsert_unit(
    conn: &mut PgConnection,
    spec_id: i64,
    name: &str,
    data: &DataMap,
    meta: &WorkUnitMeta,
) -> Result<i64> {
    let payload = encode_data(data)?;
    let row = sqlx::query(
        "INSERT INTO work_unit (work_spec_id, name, data, priority, not_before, retries)
         VALUES ($1, $2, $3, $4, $5, 0)
         ON CONFLICT (work_spec_id, name) DO UPDATE SET
            data = EXCLUDED.data,
            priority = EXCLUDED.priority,
            not_before = EXCLUDED.not_before,
            retries = 0
         RETURNING id",
    )
    .bind(spec_id)
    .bind(name)
    .bind(&payload)
    .bind(meta.priority)
    .bind(meta.not_before)
    .fetch_one(&mut *conn)
    .await?;
    Ok(row.try_get("id")?)
}

/// Fetch (name, priority, derived status) rows for every unit of a spec.
pub(super) async fn unit_rows(
    conn: &mut PgConnection,
    spec_id: i64,
    now: DateTime<Utc>,
) -> Result<Vec<UnitRow>> {
    let rows = sqlx::query(
        "SELECT wu.name, wu.priority, wu.not_before, a.status AS attempt_status
         FROM work_unit wu
         LEFT JOIN attempt a ON a.id = wu.active_attempt_id
         WHERE wu.work_spec_id = $1",
    )
    .bind(spec_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter()
        .map(|row| {
            let attempt_status: Option<String> = row.try_get("attempt_status")?;
            Ok(UnitRow {
                name: row.try_get("name")?,
                priority: row.try_get("priority")?,
                status: derived_status(
                    attempt_status.as_deref(),
                    row.try_get("not_before")?,
                    now,
                ),
            })
        })
        .collect()
}

#[async_trait]
impl WorkSpec for PgWorkSpec {
    fn name(&self) -> &str {
        &self.name
    }

    async fn data(&self) -> Result<DataMap> {
        let row = sqlx::query("SELECT data FROM work_spec WHERE id = $1")
            .bind(self.id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)?;
        decode_data(row.try_get("data")?)
    }

    async fn set_data(&self, data: DataMap) -> Result<()> {
        let name = work_spec_name(&data)?;
        if name != self.name {
            return Err(Error::BadWorkSpecName);
        }
        let meta = crate::meta::derive_meta(&data);
        let payload = encode_data(&data)?;
        let updated = sqlx::query(
            "UPDATE work_spec SET
                data = $2,
                priority = $3,
                weight = $4,
                paused = $5,
                continuous = $6,
                can_be_continuous = $7,
                min_memory_gb = $8,
                interval_seconds = $9,
                max_running = $10,
                max_attempts_returned = $11,
                max_retries = $12,
                next_work_spec_name = $13,
                runtime = $14
             WHERE id = $1",
        )
        .bind(self.id)
        .bind(&payload)
        .bind(meta.priority)
        .bind(meta.weight)
        .bind(meta.paused)
        .bind(meta.continuous)
        .bind(meta.can_start_continuous)
        .bind(meta.min_memory_gb)
        .bind(meta.interval.num_milliseconds() as f64 / 1000.0)
        .bind(meta.max_running as i32)
        .bind(meta.max_attempts_returned as i32)
        .bind(meta.max_retries as i32)
        .bind(&meta.next_work_spec_name)
        .bind(&meta.runtime)
        .execute(&self.core.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::Gone);
        }
        Ok(())
    }

    async fn meta(&self, with_counts: bool) -> Result<WorkSpecMeta> {
        let now = self.core.clock.now();
        let spec_id = self.id;
        with_tx(&self.core, |conn| {
            Box::pin(async move {
                let row = sqlx::query("SELECT * FROM work_spec WHERE id = $1")
                    .bind(spec_id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or(Error::Gone)?;
                let mut meta = meta_from_row(&row)?;
                if with_counts {
                    let (available, pending) = unit_counts(conn, spec_id, now).await?;
                    meta.available_count = available;
                    meta.pending_count = pending;
                }
                Ok(meta)
            })
        })
        .await
    }

    async fn set_meta(&self, meta: WorkSpecMeta) -> Result<()> {
        let spec_id = self.id;
        with_tx(&self.core, |conn| {
            let meta = meta.clone();
            Box::pin(async move {
                let row = sqlx::query("SELECT * FROM work_spec WHERE id = $1 FOR UPDATE")
                    .bind(spec_id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or(Error::Gone)?;
                let mut stored = meta_from_row(&row)?;
                stored.apply_update(&meta);
                sqlx::query(
                    "UPDATE work_spec SET
                        priority = $2,
                        weight = $3,
                        paused = $4,
                        continuous = $5,
                        interval_seconds = $6,
                        next_continuous = $7,
                        max_running = $8,
                        max_attempts_returned = $9
                     WHERE id = $1",
                )
                .bind(spec_id)
                .bind(stored.priority)
                .bind(stored.weight)
                .bind(stored.paused)
                .bind(stored.continuous)
                .bind(stored.interval.num_milliseconds() as f64 / 1000.0)
                .bind(stored.next_continuous)
                .bind(stored.max_running as i32)
                .bind(stored.max_attempts_returned as i32)
                .execute(&mut *conn)
                .await?;
                Ok(())
            })
        })
        .await
    }

    async fn add_work_unit(
        &self,
        name: &str,
        data: DataMap,
        meta: WorkUnitMeta,
    ) -> Result<Arc<dyn WorkUnit>> {
        let spec_id = self.id;
        let unit_id = with_tx(&self.core, |conn| {
            let name = name.to_string();
            let data = data.clone();
            Box::pin(async move { upsert_unit(conn, spec_id, &name, &data, &meta).await })
        })
        .await?;
        Ok(self.unit_handle(unit_id, name))
    }

    async fn add_work_units(&self, units: Vec<(String, DataMap, WorkUnitMeta)>) -> Result<()> {
        let spec_id = self.id;
        with_tx(&self.core, |conn| {
            let units = units.clone();
            Box::pin(async move {
                for (name, data, meta) in &units {
                    upsert_unit(conn, spec_id, name, data, meta).await?;
                }
                Ok(())
            })
        })
        .await
    }

    async fn work_unit(&self, name: &str) -> Result<Arc<dyn WorkUnit>> {
        let row = sqlx::query("SELECT id FROM work_unit WHERE work_spec_id = $1 AND name = $2")
            .bind(self.id)
            .bind(name)
            .fetch_optional(&self.core.pool)
            .await?;
        let Some(row) = row else {
            return Err(Error::NoSuchWorkUnit {
                name: name.to_string(),
            });
        };
        Ok(self.unit_handle(row.try_get("id")?, name))
    }

    async fn work_units(&self, query: WorkUnitQuery) -> Result<Vec<Arc<dyn WorkUnit>>> {
        let now = self.core.clock.now();
        let spec_id = self.id;
        let selected = with_tx(&self.core, |conn| {
            let query = query.clone();
            Box::pin(async move {
                let rows = unit_rows(conn, spec_id, now).await?;
                let selected = query.select(rows);
                let mut units = Vec::with_capacity(selected.len());
                for name in selected {
                    let row = sqlx::query(
                        "SELECT id FROM work_unit WHERE work_spec_id = $1 AND name = $2",
                    )
                    .bind(spec_id)
                    .bind(&name)
                    .fetch_optional(&mut *conn)
                    .await?;
                    if let Some(row) = row {
                        units.push((row.try_get::<i64, _>("id")?, name));
                    }
                }
                Ok(units)
            })
        })
        .await?;
        Ok(selected
            .into_iter()
            .map(|(id, name)| self.unit_handle(id, &name))
            .collect())
    }

    async fn count_work_unit_status(&self) -> Result<HashMap<WorkUnitStatus, usize>> {
        let now = self.core.clock.now();
        let spec_id = self.id;
        with_tx(&self.core, |conn| {
            Box::pin(async move {
                let rows = unit_rows(conn, spec_id, now).await?;
                let mut counts = HashMap::new();
                for row in rows {
                    *counts.entry(row.status).or_insert(0) += 1;
                }
                Ok(counts)
            })
        })
        .await
    }

    async fn delete_work_units(&self, query: WorkUnitQuery) -> Result<usize> {
        let now = self.core.clock.now();
        let spec_id = self.id;
        with_tx(&self.core, |conn| {
            let query = query.clone();
            Box::pin(async move {
                let rows = unit_rows(conn, spec_id, now).await?;
                let selected = query.select(rows);
                if selected.is_empty() {
                    return Ok(0);
                }
                let deleted = sqlx::query(
                    "DELETE FROM work_unit WHERE work_spec_id = $1 AND name = ANY($2)",
                )
                .bind(spec_id)
                .bind(&selected)
                .execute(&mut *conn)
                .await?;
                Ok(deleted.rows_affected() as usize)
            })
        })
        .await
    }
}
