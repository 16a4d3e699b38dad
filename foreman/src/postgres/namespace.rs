use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;

use crate::api::{Namespace, WorkSpec, Worker};
use crate::error::{Error, Result};
use crate::meta::{derive_meta, work_spec_name};
use crate::value::DataMap;

use super::worker::PgWorker;
use super::workspec::PgWorkSpec;
use super::{encode_data, with_tx, PgCore};

pub(crate) struct PgNamespace {
    core: Arc<PgCore>,
    id: i64,
    name: String,
}

impl PgNamespace {
    pub fn new(core: Arc<PgCore>, id: i64, name: &str) -> Self {
        Self {
            core,
            id,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Namespace for PgNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn destroy(&self) -> Result<()> {
        sqlx::query("DELETE FROM namespace WHERE id = $1")
            .bind(self.id)
            .execute(&self.core.pool)
            .await?;
        Ok(())
    }

    async fn set_work_spec(&self, data: DataMap) -> Result<Arc<dyn WorkSpec>> {
        let spec_name = work_spec_name(&data)?;
        let meta = derive_meta(&data);
        let payload = encode_data(&data)?;
        let namespace_id = self.id;

        let spec_id = with_tx(&self.core, |conn| {
            let spec_name = spec_name.clone();
            let meta = meta.clone();
            let payload = payload.clone();
            Box::pin(async move {
                let exists = sqlx::query("SELECT 1 FROM namespace WHERE id = $1")
                    .bind(namespace_id)
                    .fetch_optional(&mut *conn)
                    .await?;
                if exists.is_none() {
                    return Err(Error::Gone);
                }
                // Replacing preserves existing units and the spec's
                // continuous-synthesis cursor.
                let row = sqlx::query(
                    "INSERT INTO work_spec (
                        namespace_id, name, data, priority, weight, paused,
                        continuous, can_be_continuous, min_memory_gb,
                        interval_seconds, next_continuous, max_running,
                        max_attempts_returned, max_retries,
                        next_work_spec_name, runtime
                     )
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL,
                             $11, $12, $13, $14, $15)
                     ON CONFLICT (namespace_id, name) DO UPDATE SET
                        data = EXCLUDED.data,
                        priority = EXCLUDED.priority,
                        weight = EXCLUDED.weight,
                        paused = EXCLUDED.paused,
                        continuous = EXCLUDED.continuous,
                        can_be_continuous = EXCLUDED.can_be_continuous,
                        min_memory_gb = EXCLUDED.min_memory_gb,
                        interval_seconds = EXCLUDED.interval_seconds,
                        max_running = EXCLUDED.max_running,
                        max_attempts_returned = EXCLUDED.max_attempts_returned,
                        max_retries = EXCLUDED.max_retries,
                        next_work_spec_name = EXCLUDED.next_work_spec_name,
                        runtime = EXCLUDED.runtime
                     RETURNING id",
                )
                .bind(namespace_id)
                .bind(&spec_name)
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
                .fetch_one(&mut *conn)
                .await?;
                Ok(row.try_get::<i64, _>("id")?)
            })
        })
        .await?;

        Ok(Arc::new(PgWorkSpec::new(
            self.core.clone(),
            spec_id,
            &self.name,
            &spec_name,
        )))
    }

    async fn work_spec(&self, name: &str) -> Result<Arc<dyn WorkSpec>> {
        let row = sqlx::query("SELECT id FROM work_spec WHERE namespace_id = $1 AND name = $2")
            .bind(self.id)
            .bind(name)
            .fetch_optional(&self.core.pool)
            .await?;
        let Some(row) = row else {
            return Err(Error::NoSuchWorkSpec {
                name: name.to_string(),
            });
        };
        Ok(Arc::new(PgWorkSpec::new(
            self.core.clone(),
            row.try_get("id")?,
            &self.name,
            name,
        )))
    }

    async fn work_spec_names(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT name FROM work_spec WHERE namespace_id = $1 ORDER BY name")
                .bind(self.id)
                .fetch_all(&self.core.pool)
                .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("name")?))
            .collect()
    }

    async fn destroy_work_spec(&self, name: &str) -> Result<()> {
        let deleted =
            sqlx::query("DELETE FROM work_spec WHERE namespace_id = $1 AND name = $2")
                .bind(self.id)
                .bind(name)
                .execute(&self.core.pool)
                .await?;
        if deleted.rows_affected() == 0 {
            return Err(Error::NoSuchWorkSpec {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    async fn worker(&self, name: &str) -> Result<Arc<dyn Worker>> {
        let now = self.core.clock.now();
        let namespace_id = self.id;
        let worker_id = with_tx(&self.core, |conn| {
            let name = name.to_string();
            Box::pin(async move {
                super::worker::ensure_worker(conn, namespace_id, &name, now).await
            })
        })
        .await?;
        Ok(Arc::new(PgWorker::new(
            self.core.clone(),
            worker_id,
            namespace_id,
            &self.name,
            name,
        )))
    }

    async fn workers(&self) -> Result<Vec<Arc<dyn Worker>>> {
        let rows = sqlx::query("SELECT id, name FROM worker WHERE namespace_id = $1 ORDER BY name")
            .bind(self.id)
            .fetch_all(&self.core.pool)
            .await?;
        let mut workers: Vec<Arc<dyn Worker>> = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            workers.push(Arc::new(PgWorker::new(
                self.core.clone(),
                id,
                self.id,
                &self.name,
                &name,
            )));
        }
        Ok(workers)
    }
}
