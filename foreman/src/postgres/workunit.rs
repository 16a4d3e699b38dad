use std::sync::Arc;

use async_trait::async_trait;
use sqlx::Row;

use crate::api::{Attempt, WorkUnit, WorkUnitStatus};
use crate::error::{Error, Result};
use crate::value::DataMap;

use super::attempt::PgAttempt;
use super::{decode_data, derived_status, PgCore};

pub(crate) struct PgWorkUnit {
    core: Arc<PgCore>,
    id: i64,
    namespace: String,
    spec_name: String,
    name: String,
}

impl PgWorkUnit {
    pub fn new(core: Arc<PgCore>, id: i64, namespace: &str, spec_name: &str, name: &str) -> Self {
        Self {
            core,
            id,
            namespace: namespace.to_string(),
            spec_name: spec_name.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl WorkUnit for PgWorkUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_spec_name(&self) -> &str {
        &self.spec_name
    }

    async fn data(&self) -> Result<DataMap> {
        let row = sqlx::query("SELECT data FROM work_unit WHERE id = $1")
            .bind(self.id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)?;
        decode_data(row.try_get("data")?)
    }

    async fn status(&self) -> Result<WorkUnitStatus> {
        let now = self.core.clock.now();
        let row = sqlx::query(
            "SELECT wu.not_before, a.status AS attempt_status
             FROM work_unit wu
             LEFT JOIN attempt a ON a.id = wu.active_attempt_id
             WHERE wu.id = $1",
        )
        .bind(self.id)
        .fetch_optional(&self.core.pool)
        .await?
        .ok_or(Error::Gone)?;
        let attempt_status: Option<String> = row.try_get("attempt_status")?;
        Ok(derived_status(
            attempt_status.as_deref(),
            row.try_get("not_before")?,
            now,
        ))
    }

    async fn priority(&self) -> Result<f64> {
        let row = sqlx::query("SELECT priority FROM work_unit WHERE id = $1")
            .bind(self.id)
            .fetch_optional(&self.core.pool)
            .await?
            .ok_or(Error::Gone)?;
        Ok(row.try_get("priority")?)
    }

    async fn set_priority(&self, priority: f64) -> Result<()> {
        let updated = sqlx::query("UPDATE work_unit SET priority = $2 WHERE id = $1")
            .bind(self.id)
            .bind(priority)
            .execute(&self.core.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::Gone);
        }
        Ok(())
    }

    async fn active_attempt(&self) -> Result<Option<Arc<dyn Attempt>>> {
        let row = sqlx::query(
            "SELECT wu.active_attempt_id, a.worker_id, w.name AS worker_name
             FROM work_unit wu
             LEFT JOIN attempt a ON a.id = wu.active_attempt_id
             LEFT JOIN worker w ON w.id = a.worker_id
             WHERE wu.id = $1",
        )
        .bind(self.id)
        .fetch_optional(&self.core.pool)
        .await?
        .ok_or(Error::Gone)?;
        let attempt_id: Option<i64> = row.try_get("active_attempt_id")?;
        let Some(attempt_id) = attempt_id else {
            return Ok(None);
        };
        let worker_id: Option<i64> = row.try_get("worker_id")?;
        let worker_name: Option<String> = row.try_get("worker_name")?;
        let (Some(worker_id), Some(worker_name)) = (worker_id, worker_name) else {
            return Ok(None);
        };
        Ok(Some(Arc::new(PgAttempt::new(
            self.core.clone(),
            attempt_id,
            self.id,
            worker_id,
            &self.namespace,
            &self.spec_name,
            &self.name,
            &worker_name,
        ))))
    }

    async fn attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        let rows = sqlx::query(
            "SELECT a.id, a.worker_id, w.name AS worker_name
             FROM attempt a
             JOIN worker w ON w.id = a.worker_id
             WHERE a.work_unit_id = $1
             ORDER BY a.id",
        )
        .bind(self.id)
        .fetch_all(&self.core.pool)
        .await?;
        let mut attempts: Vec<Arc<dyn Attempt>> = Vec::with_capacity(rows.len());
        for row in rows {
            let worker_name: String = row.try_get("worker_name")?;
            attempts.push(Arc::new(PgAttempt::new(
                self.core.clone(),
                row.try_get("id")?,
                self.id,
                row.try_get("worker_id")?,
                &self.namespace,
                &self.spec_name,
                &self.name,
                &worker_name,
            )));
        }
        Ok(attempts)
    }
}
