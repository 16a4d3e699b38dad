use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::api::{Attempt, AttemptStatus, WorkUnit, Worker};
use crate::error::{Error, Result};
use crate::output::output_work_units;
use crate::value::DataMap;

use super::worker::MemWorker;
use super::workspec::upsert_unit;
use super::workunit::MemWorkUnit;
use super::{AttemptState, Core, NamespaceState, SpecState, WorkerState};

pub(crate) struct MemAttempt {
    core: Arc<Core>,
    namespace: String,
    id: u64,
    spec: String,
    unit: String,
    worker: String,
}

impl MemAttempt {
    pub fn new(
        core: Arc<Core>,
        namespace: &str,
        id: u64,
        spec: &str,
        unit: &str,
        worker: &str,
    ) -> Self {
        Self {
            core,
            namespace: namespace.to_string(),
            id,
            spec: spec.to_string(),
            unit: unit.to_string(),
            worker: worker.to_string(),
        }
    }

    fn with_attempt<T>(&self, f: impl FnOnce(&NamespaceState, &AttemptState) -> T) -> Result<T> {
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        let attempt = ns.attempts.get(&self.id).ok_or(Error::Gone)?;
        Ok(f(ns, attempt))
    }

    fn transition<T>(
        &self,
        f: impl FnOnce(&mut NamespaceState, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        f(ns, now)
    }
}

#[async_trait]
impl Attempt for MemAttempt {
    fn work_spec_name(&self) -> &str {
        &self.spec
    }

    fn work_unit_name(&self) -> &str {
        &self.unit
    }

    fn worker_name(&self) -> &str {
        &self.worker
    }

    async fn work_unit(&self) -> Result<Arc<dyn WorkUnit>> {
        Ok(Arc::new(MemWorkUnit::new(
            self.core.clone(),
            &self.namespace,
            &self.spec,
            &self.unit,
        )))
    }

    async fn worker(&self) -> Result<Arc<dyn Worker>> {
        Ok(Arc::new(MemWorker::new(
            self.core.clone(),
            &self.namespace,
            &self.worker,
        )))
    }

    async fn status(&self) -> Result<AttemptStatus> {
        self.with_attempt(|_, attempt| attempt.status)
    }

    async fn data(&self) -> Result<DataMap> {
        self.with_attempt(|ns, attempt| match &attempt.data {
            Some(data) => data.clone(),
            None => ns
                .work_specs
                .get(&attempt.spec)
                .and_then(|spec| spec.units.get(&attempt.unit))
                .map(|unit| unit.data.clone())
                .unwrap_or_default(),
        })
    }

    async fn start_time(&self) -> Result<DateTime<Utc>> {
        self.with_attempt(|_, attempt| attempt.start_time)
    }

    async fn end_time(&self) -> Result<Option<DateTime<Utc>>> {
        self.with_attempt(|_, attempt| attempt.end_time)
    }

    async fn expiration_time(&self) -> Result<DateTime<Utc>> {
        self.with_attempt(|_, attempt| attempt.expiration_time)
    }

    async fn renew(&self, extension: Duration, data: Option<DataMap>) -> Result<()> {
        self.transition(|ns, now| {
            check_transition(ns, self.id)?;
            let attempt = ns.attempts.get_mut(&self.id).ok_or(Error::Gone)?;
            attempt.expiration_time = now + extension;
            if let Some(data) = data {
                attempt.data = Some(data);
            }
            Ok(())
        })
    }

    async fn finish(&self, data: Option<DataMap>) -> Result<()> {
        self.transition(|ns, now| finish(ns, self.id, data, now))
    }

    async fn fail(&self, data: Option<DataMap>) -> Result<()> {
        self.transition(|ns, now| fail(ns, self.id, data, now))
    }

    async fn retry(&self, delay: Duration) -> Result<()> {
        self.transition(|ns, now| retry(ns, self.id, delay, now))
    }

    async fn expire(&self) -> Result<()> {
        self.transition(|ns, now| {
            check_transition(ns, self.id)?;
            let NamespaceState {
                work_specs,
                workers,
                attempts,
                ..
            } = ns;
            apply_expire(work_specs, workers, attempts, self.id, now);
            Ok(())
        })
    }
}

/// Transition guard: the receiver must still be pending, and must still be
/// its unit's active attempt. A terminal receiver reports
/// `AttemptTerminated`; a displaced but still-pending receiver reports
/// `WrongWorker`.
fn check_transition(ns: &NamespaceState, id: u64) -> Result<()> {
    let attempt = ns.attempts.get(&id).ok_or(Error::Gone)?;
    if attempt.status.is_terminal() {
        return Err(Error::AttemptTerminated);
    }
    let unit = ns
        .work_specs
        .get(&attempt.spec)
        .and_then(|spec| spec.units.get(&attempt.unit))
        .ok_or(Error::Gone)?;
    if unit.active_attempt != Some(id) {
        return Err(Error::WrongWorker);
    }
    Ok(())
}

fn remove_from_active(workers: &mut BTreeMap<String, WorkerState>, worker: &str, id: u64) {
    if let Some(record) = workers.get_mut(worker) {
        record.active_attempts.retain(|a| *a != id);
    }
}

pub(super) fn finish(
    ns: &mut NamespaceState,
    id: u64,
    data: Option<DataMap>,
    now: DateTime<Utc>,
) -> Result<()> {
    check_transition(ns, id)?;
    let NamespaceState {
        work_specs,
        workers,
        attempts,
        ..
    } = ns;
    let attempt = attempts.get_mut(&id).ok_or(Error::Gone)?;
    attempt.status = AttemptStatus::Finished;
    attempt.end_time = Some(now);
    if let Some(data) = data {
        attempt.data = Some(data);
    }
    let spec_name = attempt.spec.clone();
    let unit_name = attempt.unit.clone();
    let worker_name = attempt.worker.clone();
    let attempt_data = attempt.data.clone();

    remove_from_active(workers, &worker_name, id);
    debug!(spec = %spec_name, unit = %unit_name, "attempt finished");

    let spec = work_specs.get(&spec_name).ok_or(Error::Gone)?;
    let Some(target) = spec.meta.next_work_spec_name.clone() else {
        return Ok(());
    };
    let chain_data = attempt_data.unwrap_or_else(|| {
        spec.units
            .get(&unit_name)
            .map(|unit| unit.data.clone())
            .unwrap_or_default()
    });
    let chained = output_work_units(&chain_data, now);
    if chained.is_empty() {
        return Ok(());
    }
    match work_specs.get_mut(&target) {
        Some(successor) => {
            debug!(from = %spec_name, to = %target, count = chained.len(), "chaining work units");
            for (name, data, meta) in chained {
                upsert_unit(successor, &name, data, meta);
            }
        }
        None => warn!(spec = %target, "chained successor work spec does not exist"),
    }
    Ok(())
}

pub(super) fn fail(
    ns: &mut NamespaceState,
    id: u64,
    data: Option<DataMap>,
    now: DateTime<Utc>,
) -> Result<()> {
    check_transition(ns, id)?;
    let NamespaceState {
        work_specs,
        workers,
        attempts,
        ..
    } = ns;
    let attempt = attempts.get_mut(&id).ok_or(Error::Gone)?;
    attempt.end_time = Some(now);
    if let Some(data) = data {
        attempt.data = Some(data);
    }
    let spec_name = attempt.spec.clone();
    let unit_name = attempt.unit.clone();
    let worker_name = attempt.worker.clone();

    let spec = work_specs.get_mut(&spec_name).ok_or(Error::Gone)?;
    let max_retries = spec.meta.max_retries;
    let unit = spec.units.get_mut(&unit_name).ok_or(Error::Gone)?;

    if max_retries > 0 && unit.retries < max_retries {
        // Retry budget remains; this failure behaves as a zero-delay retry.
        attempt.status = AttemptStatus::Retryable;
        unit.active_attempt = None;
        unit.not_before = None;
        unit.retries += 1;
        debug!(spec = %spec_name, unit = %unit_name, retries = unit.retries, "failed attempt retried");
    } else {
        attempt.status = AttemptStatus::Failed;
        debug!(spec = %spec_name, unit = %unit_name, "attempt failed");
    }
    remove_from_active(workers, &worker_name, id);
    Ok(())
}

pub(super) fn retry(
    ns: &mut NamespaceState,
    id: u64,
    delay: Duration,
    now: DateTime<Utc>,
) -> Result<()> {
    check_transition(ns, id)?;
    let NamespaceState {
        work_specs,
        workers,
        attempts,
        ..
    } = ns;
    let attempt = attempts.get_mut(&id).ok_or(Error::Gone)?;
    attempt.status = AttemptStatus::Retryable;
    attempt.end_time = Some(now);
    let spec_name = attempt.spec.clone();
    let unit_name = attempt.unit.clone();
    let worker_name = attempt.worker.clone();

    let spec = work_specs.get_mut(&spec_name).ok_or(Error::Gone)?;
    let unit = spec.units.get_mut(&unit_name).ok_or(Error::Gone)?;
    unit.active_attempt = None;
    unit.not_before = (delay > Duration::zero()).then(|| now + delay);
    unit.retries += 1;

    remove_from_active(workers, &worker_name, id);
    debug!(spec = %spec_name, unit = %unit_name, "attempt returned for retry");
    Ok(())
}

/// Terminate a pending attempt whose deadline passed. The unit is released
/// back to available unless its retry budget is exhausted, in which case
/// the expired attempt stays active and the unit reads as failed. Displaced
/// attempts (no longer their unit's active attempt) are terminated without
/// touching the unit.
fn apply_expire(
    work_specs: &mut BTreeMap<String, SpecState>,
    workers: &mut BTreeMap<String, WorkerState>,
    attempts: &mut HashMap<u64, AttemptState>,
    id: u64,
    now: DateTime<Utc>,
) {
    let Some(attempt) = attempts.get_mut(&id) else {
        return;
    };
    attempt.status = AttemptStatus::Expired;
    attempt.end_time = Some(now);
    let spec_name = attempt.spec.clone();
    let unit_name = attempt.unit.clone();
    let worker_name = attempt.worker.clone();

    remove_from_active(workers, &worker_name, id);

    if let Some(spec) = work_specs.get_mut(&spec_name) {
        let max_retries = spec.meta.max_retries;
        if let Some(unit) = spec.units.get_mut(&unit_name) {
            if unit.active_attempt == Some(id) {
                let exhausted = max_retries > 0 && unit.retries >= max_retries;
                if !exhausted {
                    unit.active_attempt = None;
                    unit.not_before = None;
                }
            }
        }
    }
    debug!(spec = %spec_name, unit = %unit_name, worker = %worker_name, "attempt expired");
}

/// One sweep pass over a namespace: expire overdue pending attempts, then
/// release workers whose heartbeat deadline passed, expiring whatever they
/// still held. Returns the number of attempts expired.
pub(super) fn expire_due(ns: &mut NamespaceState, now: DateTime<Utc>) -> usize {
    let overdue: Vec<u64> = ns
        .attempts
        .values()
        .filter(|a| a.status == AttemptStatus::Pending && a.expiration_time < now)
        .map(|a| a.id)
        .collect();
    let stale_workers: Vec<String> = ns
        .workers
        .values()
        .filter(|w| w.active && w.expiration < now)
        .map(|w| w.name.clone())
        .collect();

    let NamespaceState {
        work_specs,
        workers,
        attempts,
        ..
    } = ns;
    let mut expired = 0;
    for id in overdue {
        apply_expire(work_specs, workers, attempts, id, now);
        expired += 1;
    }
    for name in stale_workers {
        expired += expire_worker(work_specs, workers, attempts, &name, now);
    }
    expired
}

/// Expire one worker: mark it inactive and terminate its pending attempts.
pub(super) fn expire_worker(
    work_specs: &mut BTreeMap<String, SpecState>,
    workers: &mut BTreeMap<String, WorkerState>,
    attempts: &mut HashMap<u64, AttemptState>,
    name: &str,
    now: DateTime<Utc>,
) -> usize {
    let Some(worker) = workers.get_mut(name) else {
        return 0;
    };
    worker.active = false;
    let held = worker.active_attempts.clone();
    let mut expired = 0;
    for id in held {
        let pending = attempts
            .get(&id)
            .map_or(false, |a| a.status == AttemptStatus::Pending);
        if pending {
            apply_expire(work_specs, workers, attempts, id, now);
            expired += 1;
        }
    }
    if expired > 0 {
        debug!(worker = %name, expired, "expired worker's attempts");
    }
    expired
}
