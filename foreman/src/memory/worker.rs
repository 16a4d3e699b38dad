use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::api::{
    default_attempt_lifetime, Attempt, AttemptRequest, AttemptStatus, Worker,
};
use crate::error::{Error, Result};
use crate::meta::{WorkSpecMeta, WorkUnitMeta};
use crate::scheduler;
use crate::value::DataMap;

use super::attempt::{self, MemAttempt};
use super::{workspec, AttemptState, Core, NamespaceState, WorkerState};

pub(crate) struct MemWorker {
    core: Arc<Core>,
    namespace: String,
    name: String,
}

impl MemWorker {
    pub fn new(core: Arc<Core>, namespace: &str, name: &str) -> Self {
        Self {
            core,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn with_worker<T>(&self, f: impl FnOnce(&NamespaceState, &WorkerState) -> T) -> Result<T> {
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        let worker = ns.workers.get(&self.name).ok_or(Error::Gone)?;
        Ok(f(ns, worker))
    }

    fn worker_handle(&self, name: &str) -> Arc<dyn Worker> {
        Arc::new(MemWorker::new(self.core.clone(), &self.namespace, name))
    }

    fn attempt_handle(&self, attempt: &AttemptState) -> Arc<dyn Attempt> {
        Arc::new(MemAttempt::new(
            self.core.clone(),
            &self.namespace,
            attempt.id,
            &attempt.spec,
            &attempt.unit,
            &attempt.worker,
        ))
    }
}

/// Workers come into existence on first reference, already active, with a
/// default heartbeat deadline.
pub(super) fn ensure_worker(ns: &mut NamespaceState, name: &str, now: DateTime<Utc>) {
    ns.workers
        .entry(name.to_string())
        .or_insert_with(|| WorkerState::new(name, now, now + default_attempt_lifetime()));
}

#[async_trait]
impl Worker for MemWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn parent(&self) -> Result<Option<Arc<dyn Worker>>> {
        self.with_worker(|_, worker| {
            worker
                .parent
                .as_deref()
                .map(|parent| self.worker_handle(parent))
        })
    }

    async fn set_parent(&self, parent: Option<String>) -> Result<()> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        if !ns.workers.contains_key(&self.name) {
            return Err(Error::Gone);
        }
        if let Some(parent_name) = &parent {
            ensure_worker(ns, parent_name, now);
        }
        let old = ns
            .workers
            .get_mut(&self.name)
            .ok_or(Error::Gone)?
            .parent
            .take();
        if let Some(old_parent) = old {
            if let Some(record) = ns.workers.get_mut(&old_parent) {
                record.children.remove(&self.name);
            }
        }
        if let Some(parent_name) = &parent {
            if let Some(record) = ns.workers.get_mut(parent_name) {
                record.children.insert(self.name.clone());
            }
        }
        ns.workers.get_mut(&self.name).ok_or(Error::Gone)?.parent = parent;
        Ok(())
    }

    async fn children(&self) -> Result<Vec<Arc<dyn Worker>>> {
        self.with_worker(|_, worker| {
            worker
                .children
                .iter()
                .map(|child| self.worker_handle(child))
                .collect()
        })
    }

    async fn is_active(&self) -> Result<bool> {
        self.with_worker(|_, worker| worker.active)
    }

    async fn mode(&self) -> Result<String> {
        self.with_worker(|_, worker| worker.mode.clone())
    }

    async fn data(&self) -> Result<DataMap> {
        self.with_worker(|_, worker| worker.data.clone())
    }

    async fn expiration(&self) -> Result<DateTime<Utc>> {
        self.with_worker(|_, worker| worker.expiration)
    }

    async fn last_update(&self) -> Result<DateTime<Utc>> {
        self.with_worker(|_, worker| worker.last_update)
    }

    async fn update(&self, data: DataMap, expiration: DateTime<Utc>, mode: String) -> Result<()> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        let worker = ns.workers.get_mut(&self.name).ok_or(Error::Gone)?;
        worker.data = data;
        worker.expiration = expiration;
        worker.mode = mode;
        worker.last_update = now;
        worker.active = true;
        Ok(())
    }

    async fn expire(&self) -> Result<()> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        if !ns.workers.contains_key(&self.name) {
            return Err(Error::Gone);
        }
        let NamespaceState {
            work_specs,
            workers,
            attempts,
            ..
        } = ns;
        attempt::expire_worker(work_specs, workers, attempts, &self.name, now);
        Ok(())
    }

    async fn request_attempts(&self, request: AttemptRequest) -> Result<Vec<Arc<dyn Attempt>>> {
        if request.number_of_work_units == 0 {
            return Ok(Vec::new());
        }
        let now = self.core.clock.now();
        let lifetime = request.lifetime.unwrap_or_else(default_attempt_lifetime);

        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        if !ns.workers.contains_key(&self.name) {
            return Err(Error::Gone);
        }

        let metas: BTreeMap<String, WorkSpecMeta> = ns
            .work_specs
            .iter()
            .map(|(name, spec)| (name.clone(), spec.meta_snapshot(&ns.attempts, now, true)))
            .collect();
        let chosen = {
            let mut rng = self.core.rng.lock();
            scheduler::choose_work_spec(&metas, &request, now, &mut *rng).map(str::to_string)
        };
        let Some(spec_name) = chosen else {
            return Ok(Vec::new());
        };
        let meta = match metas.get(&spec_name) {
            Some(meta) => meta.clone(),
            None => return Ok(Vec::new()),
        };

        let NamespaceState {
            work_specs,
            workers,
            attempts,
            next_attempt_id,
            ..
        } = ns;
        let spec = work_specs.get_mut(&spec_name).ok_or(Error::Gone)?;

        if meta.available_count == 0 && scheduler::continuous_due(&meta, now) {
            // Monotone timestamp token; a second synthesis within the same
            // microsecond reuses the existing unit.
            let unit_name = format!("{:020}", now.timestamp_micros());
            workspec::upsert_unit(spec, &unit_name, DataMap::new(), WorkUnitMeta::default());
            spec.meta.next_continuous = Some(now + spec.meta.interval);
            debug!(spec = %spec_name, unit = %unit_name, "synthesized continuous work unit");
        }

        let budget = scheduler::lease_budget(&meta, request.number_of_work_units);
        if budget == 0 {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<(String, f64)> = spec
            .units
            .values()
            .filter(|unit| unit.is_available(attempts, now))
            .map(|unit| (unit.name.clone(), unit.priority))
            .collect();
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        candidates.truncate(budget);

        let worker = workers.get_mut(&self.name).ok_or(Error::Gone)?;
        let mut leased = Vec::with_capacity(candidates.len());
        for (unit_name, _) in candidates {
            let Some(unit) = spec.units.get_mut(&unit_name) else {
                continue;
            };
            let id = *next_attempt_id;
            *next_attempt_id += 1;
            attempts.insert(
                id,
                AttemptState {
                    id,
                    spec: spec_name.clone(),
                    unit: unit_name.clone(),
                    worker: self.name.clone(),
                    status: AttemptStatus::Pending,
                    data: None,
                    start_time: now,
                    end_time: None,
                    expiration_time: now + lifetime,
                },
            );
            unit.active_attempt = Some(id);
            unit.attempts.push(id);
            worker.active_attempts.push(id);
            worker.attempts.push(id);
            debug!(
                namespace = %self.namespace,
                spec = %spec_name,
                unit = %unit_name,
                worker = %self.name,
                "leased attempt"
            );
            leased.push(Arc::new(MemAttempt::new(
                self.core.clone(),
                &self.namespace,
                id,
                &spec_name,
                &unit_name,
                &self.name,
            )) as Arc<dyn Attempt>);
        }
        Ok(leased)
    }

    async fn make_attempt(
        &self,
        work_spec: &str,
        work_unit: &str,
        lifetime: Duration,
    ) -> Result<Arc<dyn Attempt>> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        if !ns.workers.contains_key(&self.name) {
            return Err(Error::Gone);
        }
        let NamespaceState {
            work_specs,
            workers,
            attempts,
            next_attempt_id,
            ..
        } = ns;
        let spec = work_specs
            .get_mut(work_spec)
            .ok_or_else(|| Error::NoSuchWorkSpec {
                name: work_spec.to_string(),
            })?;
        let unit = spec
            .units
            .get_mut(work_unit)
            .ok_or_else(|| Error::NoSuchWorkUnit {
                name: work_unit.to_string(),
            })?;
        let worker = workers.get_mut(&self.name).ok_or(Error::Gone)?;

        let id = *next_attempt_id;
        *next_attempt_id += 1;
        attempts.insert(
            id,
            AttemptState {
                id,
                spec: work_spec.to_string(),
                unit: work_unit.to_string(),
                worker: self.name.clone(),
                status: AttemptStatus::Pending,
                data: None,
                start_time: now,
                end_time: None,
                expiration_time: now + lifetime,
            },
        );
        // Any previous pending attempt is displaced: it stays recorded but
        // is no longer the unit's active attempt, so its transitions will
        // report WrongWorker until the sweep expires it.
        unit.active_attempt = Some(id);
        unit.attempts.push(id);
        worker.active_attempts.push(id);
        worker.attempts.push(id);
        Ok(Arc::new(MemAttempt::new(
            self.core.clone(),
            &self.namespace,
            id,
            work_spec,
            work_unit,
            &self.name,
        )))
    }

    async fn active_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        self.with_worker(|ns, worker| {
            worker
                .active_attempts
                .iter()
                .filter_map(|id| ns.attempts.get(id))
                .map(|attempt| self.attempt_handle(attempt))
                .collect()
        })
    }

    async fn all_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        self.with_worker(|ns, worker| {
            worker
                .attempts
                .iter()
                .filter_map(|id| ns.attempts.get(id))
                .map(|attempt| self.attempt_handle(attempt))
                .collect()
        })
    }
}
