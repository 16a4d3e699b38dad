use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, Row};
use tracing::debug;

use crate::api::{
    default_attempt_lifetime, Attempt, AttemptRequest, Worker,
};
use crate::error::{Error, Result};
use crate::meta::{WorkSpecMeta, WorkUnitMeta};
use crate::scheduler;
use crate::value::DataMap;

use super::attempt::{self, PgAttempt};
use super::{decode_data, encode_data, with_tx, workspec, PgCore};

pub(crate) struct PgWorker {
    core: Arc<PgCore>,
    id: i64,
    namespace_id: i64,
    namespace: String,
    name: String,
}

impl PgWorker {
    pub fn new(
        core: Arc<PgCore>,
        id: i64,
        namespace_id: i64,
        namespace: &str,
        name: &str,
    ) -> Self {
        Self {
            core,
            id,
            namespace_id,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    async fn fetch_row(&self, column: &str) -> Result<sqlx::postgres::PgRow> {
        // column comes from a fixed set of callers, never user input
        let query = format!("SELECT {column} FROM worker WHERE id = $1");
        sqlx::query(&query)
            .bind(self.id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)
    }
}

/// Create the worker row on first reference; already-present rows are left
/// untouched. Returns the worker id.
pub(super) async fn ensure_worker(
    conn: &mut PgConnection,
    namespace_id: i64,
    name: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let exists = sqlx::query("SELECT 1 FROM namespace WHERE id = $1")
        .bind(namespace_id)
        .fetch_optional(&mut *conn)
        .await?;
    if exists.is_none() {
        return Err(Error::Gone);
    }
    sqlx::query(
        "INSERT INTO worker (namespace_id, name, expiration, last_update)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (namespace_id, name) DO NOTHING",
    )
    .bind(namespace_id)
    .bind(name)
    .bind(now + default_attempt_lifetime())
    .bind(now)
    .execute(&mut *conn)
    .await?;
    let row = sqlx::query("SELECT id FROM worker WHERE namespace_id = $1 AND name = $2")
        .bind(namespace_id)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(row.try_get("id")?)
}

/// Mark one worker inactive and expire its pending attempts. Returns how
/// many attempts were expired.
pub(super) async fn expire_worker(
    conn: &mut PgConnection,
    worker_id: i64,
    now: DateTime<Utc>,
) -> Result<usize> {
    sqlx::query("UPDATE worker SET active = FALSE WHERE id = $1")
        .bind(worker_id)
        .execute(&mut *conn)
        .await?;
    let held = sqlx::query(
        "SELECT id FROM attempt WHERE worker_id = $1 AND status = 'pending' FOR UPDATE",
    )
    .bind(worker_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut expired = 0;
    for row in held {
        attempt::expire_one(conn, row.try_get("id")?, now).await?;
        expired += 1;
    }
    Ok(expired)
}

#[async_trait]
impl Worker for PgWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parent(&self) -> Result<Option<Arc<dyn Worker>>> {
        let row = sqlx::query(
            "SELECT p.id AS parent_id, p.name AS parent_name
             FROM worker w
             LEFT JOIN worker p ON p.id = w.parent_id
             WHERE w.id = $1",
        )
        .bind(self.id)
        .fetch_optional(&self.core.pool)
        .await?
        .ok_or(Error::Gone)?;
        let parent_id: Option<i64> = row.try_get("parent_id")?;
        let parent_name: Option<String> = row.try_get("parent_name")?;
        Ok(match (parent_id, parent_name) {
            (Some(id), Some(name)) => Some(Arc::new(PgWorker::new(
                self.core.clone(),
                id,
                self.namespace_id,
                &self.namespace,
                &name,
            )) as Arc<dyn Worker>),
            _ => None,
        })
    }

    async fn set_parent(&self, parent: Option<String>) -> Result<()> {
        let now = self.core.clock.now();
        let worker_id = self.id;
        let namespace_id = self.namespace_id;
        with_tx(&self.core, |conn| {
            let parent = parent.clone();
            Box::pin(async move {
                let parent_id = match &parent {
                    Some(name) => Some(ensure_worker(conn, namespace_id, name, now).await?),
                    None => None,
                };
                let updated = sqlx::query("UPDATE worker SET parent_id = $2 WHERE id = $1")
                    .bind(worker_id)
                    .bind(parent_id)
                    .execute(&mut *conn)
                    .await?;
                if updated.rows_affected() == 0 {
                    return Err(Error::Gone);
                }
                Ok(())
            })
        })
        .await
    }

    async fn children(&self) -> Result<Vec<Arc<dyn Worker>>> {
        let rows = sqlx::query("SELECT id, name FROM worker WHERE parent_id = $1 ORDER BY name")
            .bind(self.id)
            .fetch_all(&self.core.pool)
            .await?;
        let mut children: Vec<Arc<dyn Worker>> = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            children.push(Arc::new(PgWorker::new(
                self.core.clone(),
                row.try_get("id")?,
                self.namespace_id,
                &self.namespace,
                &name,
            )));
        }
        Ok(children)
    }

    async fn is_active(&self) -> Result<bool> {
        Ok(self.fetch_row("active").await?.try_get("active")?)
    }

    async fn mode(&self) -> Result<String> {
        Ok(self.fetch_row("mode").await?.try_get("mode")?)
    }

    async fn data(&self) -> Result<DataMap> {
        decode_data(self.fetch_row("data").await?.try_get("data")?)
    }

    async fn expiration(&self) -> Result<DateTime<Utc>> {
        Ok(self.fetch_row("expiration").await?.try_get("expiration")?)
    }

    async fn last_update(&self) -> Result<DateTime<Utc>> {
        Ok(self.fetch_row("last_update").await?.try_get("last_update")?)
    }

    async fn update(&self, data: DataMap, expiration: DateTime<Utc>, mode: String) -> Result<()> {
        let now = self.core.clock.now();
        let payload = encode_data(&data)?;
        let updated = sqlx::query(
            "UPDATE worker SET
                data = $2, expiration = $3, mode = $4,
                last_update = $5, active = TRUE
             WHERE id = $1",
        )
        .bind(self.id)
        .bind(&payload)
        .bind(expiration)
        .bind(&mode)
        .bind(now)
        .execute(&self.core.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::Gone);
        }
        Ok(())
    }

    async fn expire(&self) -> Result<()> {
        let now = self.core.clock.now();
        let worker_id = self.id;
        with_tx(&self.core, |conn| {
            Box::pin(async move {
                let exists = sqlx::query("SELECT 1 FROM worker WHERE id = $1 FOR UPDATE")
                    .bind(worker_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if exists.is_none() {
                    return Err(Error::Gone);
                }
                expire_worker(conn, worker_id, now).await?;
                Ok(())
            })
        })
        .await
    }

    async fn request_attempts(&self, request: AttemptRequest) -> Result<Vec<Arc<dyn Attempt>>> {
        if request.number_of_work_units == 0 {
            return Ok(Vec::new());
        }
        let now = self.core.clock.now();
        let lifetime = request.lifetime.unwrap_or_else(default_attempt_lifetime);
        let worker_id = self.id;
        let namespace_id = self.namespace_id;
        let core = self.core.clone();

        let leased = with_tx(&self.core, |conn| {
            let request = request.clone();
            let core = core.clone();
            Box::pin(async move {
                let exists = sqlx::query("SELECT 1 FROM worker WHERE id = $1 FOR UPDATE")
                    .bind(worker_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if exists.is_none() {
                    return Err(Error::Gone);
                }

                let spec_rows = sqlx::query(
                    "SELECT * FROM work_spec WHERE namespace_id = $1 ORDER BY name FOR UPDATE",
                )
                .bind(namespace_id)
                .fetch_all(&mut *conn)
                .await?;

                let mut metas: BTreeMap<String, WorkSpecMeta> = BTreeMap::new();
                let mut spec_ids: BTreeMap<String, i64> = BTreeMap::new();
                for row in &spec_rows {
                    let name: String = row.try_get("name")?;
                    let id: i64 = row.try_get("id")?;
                    let mut meta = workspec::meta_from_row(row)?;
                    let (available, pending) = workspec::unit_counts(conn, id, now).await?;
                    meta.available_count = available;
                    meta.pending_count = pending;
                    spec_ids.insert(name.clone(), id);
                    metas.insert(name, meta);
                }

                let chosen = {
                    let mut rng = core.rng.lock();
                    scheduler::choose_work_spec(&metas, &request, now, &mut *rng)
                        .map(str::to_string)
                };
                let Some(spec_name) = chosen else {
                    return Ok(Vec::new());
                };
                let (Some(meta), Some(&spec_id)) =
                    (metas.get(&spec_name), spec_ids.get(&spec_name))
                else {
                    return Ok(Vec::new());
                };

                if meta.available_count == 0 && scheduler::continuous_due(meta, now) {
                    let unit_name = format!("{:020}", now.timestamp_micros());
                    workspec::upsert_unit(
                        conn,
                        spec_id,
                        &unit_name,
                        &DataMap::new(),
                        &WorkUnitMeta::default(),
                    )
                    .await?;
                    sqlx::query("UPDATE work_spec SET next_continuous = $2 WHERE id = $1")
                        .bind(spec_id)
                        .bind(now + meta.interval)
                        .execute(&mut *conn)
                        .await?;
                    debug!(spec = %spec_name, unit = %unit_name, "synthesized continuous work unit");
                }

                let budget = scheduler::lease_budget(meta, request.number_of_work_units);
                if budget == 0 {
                    return Ok(Vec::new());
                }

                let unit_rows = sqlx::query(
                    "SELECT id, name FROM work_unit
                     WHERE work_spec_id = $1
                       AND active_attempt_id IS NULL
                       AND (not_before IS NULL OR not_before <= $2)
                     ORDER BY priority DESC, name ASC
                     LIMIT $3
                     FOR UPDATE",
                )
                .bind(spec_id)
                .bind(now)
                .bind(budget as i64)
                .fetch_all(&mut *conn)
                .await?;

                let mut leased = Vec::with_capacity(unit_rows.len());
                for row in unit_rows {
                    let unit_id: i64 = row.try_get("id")?;
                    let unit_name: String = row.try_get("name")?;
                    let attempt_id =
                        attempt::insert_attempt(conn, unit_id, worker_id, now, lifetime).await?;
                    debug!(spec = %spec_name, unit = %unit_name, attempt = attempt_id, "leased attempt");
                    leased.push((attempt_id, unit_id, spec_name.clone(), unit_name));
                }
                Ok(leased)
            })
        })
        .await?;

        Ok(leased
            .into_iter()
            .map(|(attempt_id, unit_id, spec_name, unit_name)| {
                Arc::new(PgAttempt::new(
                    self.core.clone(),
                    attempt_id,
                    unit_id,
                    self.id,
                    &self.namespace,
                    &spec_name,
                    &unit_name,
                    &self.name,
                )) as Arc<dyn Attempt>
            })
            .collect())
    }

    async fn make_attempt(
        &self,
        work_spec: &str,
        work_unit: &str,
        lifetime: Duration,
    ) -> Result<Arc<dyn Attempt>> {
        let now = self.core.clock.now();
        let worker_id = self.id;
        let namespace_id = self.namespace_id;

        let (attempt_id, unit_id) = with_tx(&self.core, |conn| {
            let work_spec = work_spec.to_string();
            let work_unit = work_unit.to_string();
            Box::pin(async move {
                let spec_row = sqlx::query(
                    "SELECT id FROM work_spec WHERE namespace_id = $1 AND name = $2",
                )
                .bind(namespace_id)
                .bind(&work_spec)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| Error::NoSuchWorkSpec {
                    name: work_spec.clone(),
                })?;
                let spec_id: i64 = spec_row.try_get("id")?;
                let unit_row = sqlx::query(
                    "SELECT id FROM work_unit WHERE work_spec_id = $1 AND name = $2 FOR UPDATE",
                )
                .bind(spec_id)
                .bind(&work_unit)
                .fetch_optional(&mut *conn)
                .await?
                .ok_or_else(|| Error::NoSuchWorkUnit {
                    name: work_unit.clone(),
                })?;
                let unit_id: i64 = unit_row.try_get("id")?;
                let attempt_id =
                    attempt::insert_attempt(conn, unit_id, worker_id, now, lifetime).await?;
                Ok((attempt_id, unit_id))
            })
        })
        .await?;

        Ok(Arc::new(PgAttempt::new(
            self.core.clone(),
            attempt_id,
            unit_id,
            self.id,
            &self.namespace,
            work_spec,
            work_unit,
            &self.name,
        )))
    }

    async fn active_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        self.attempts_where("AND a.status = 'pending'").await
    }

    async fn all_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        self.attempts_where("").await
    }
}

impl PgWorker {
    async fn attempts_where(&self, filter: &str) -> Result<Vec<Arc<dyn Attempt>>> {
        let query = format!(
            "SELECT a.id, a.work_unit_id, wu.name AS unit_name, ws.name AS spec_name
             FROM attempt a
             JOIN work_unit wu ON wu.id = a.work_unit_id
             JOIN work_spec ws ON ws.id = wu.work_spec_id
             WHERE a.worker_id = $1 {filter}
             ORDER BY a.id"
        );
        let rows = sqlx::query(&query)
            .bind(self.id)
            .fetch_all(&self.core.pool)
            .await?;
        let mut attempts: Vec<Arc<dyn Attempt>> = Vec::with_capacity(rows.len());
        for row in rows {
            let unit_name: String = row.try_get("unit_name")?;
            let spec_name: String = row.try_get("spec_name")?;
            attempts.push(Arc::new(PgAttempt::new(
                self.core.clone(),
                row.try_get("id")?,
                row.try_get("work_unit_id")?,
                self.id,
                &self.namespace,
                &spec_name,
                &unit_name,
                &self.name,
            )));
        }
        Ok(attempts)
    }
}
