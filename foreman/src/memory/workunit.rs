use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{Attempt, WorkUnit, WorkUnitStatus};
use crate::error::{Error, Result};
use crate::value::DataMap;

use super::attempt::MemAttempt;
use super::{AttemptState, Core, NamespaceState, UnitState, WorkerState};

pub(crate) struct MemWorkUnit {
    core: Arc<Core>,
    namespace: String,
    spec: String,
    name: String,
}

impl MemWorkUnit {
    pub fn new(core: Arc<Core>, namespace: &str, spec: &str, name: &str) -> Self {
        Self {
            core,
            namespace: namespace.to_string(),
            spec: spec.to_string(),
            name: name.to_string(),
        }
    }

    fn with_unit<T>(&self, f: impl FnOnce(&NamespaceState, &UnitState) -> T) -> Result<T> {
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        let unit = super::workspec::spec(ns, &self.spec)?
            .units
            .get(&self.name)
            .ok_or(Error::Gone)?;
        Ok(f(ns, unit))
    }
}

/// Remove a destroyed unit's attempts from the arena and from every
/// worker's attempt lists.
pub(super) fn purge_unit_attempts(
    attempts: &mut HashMap<u64, AttemptState>,
    workers: &mut BTreeMap<String, WorkerState>,
    ids: &[u64],
) {
    for id in ids {
        if let Some(attempt) = attempts.remove(id) {
            if let Some(worker) = workers.get_mut(&attempt.worker) {
                worker.active_attempts.retain(|a| a != id);
                worker.attempts.retain(|a| a != id);
            }
        }
    }
}

#[async_trait]
impl WorkUnit for MemWorkUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn work_spec_name(&self) -> &str {
        &self.spec
    }

    async fn data(&self) -> Result<DataMap> {
        self.with_unit(|_, unit| unit.data.clone())
    }

    async fn status(&self) -> Result<WorkUnitStatus> {
        let now = self.core.clock.now();
        self.with_unit(|ns, unit| unit.status(&ns.attempts, now))
    }

    async fn priority(&self) -> Result<f64> {
        self.with_unit(|_, unit| unit.priority)
    }

    async fn set_priority(&self, priority: f64) -> Result<()> {
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        let unit = super::workspec::spec_mut(ns, &self.spec)?
            .units
            .get_mut(&self.name)
            .ok_or(Error::Gone)?;
        unit.priority = priority;
        Ok(())
    }

    async fn active_attempt(&self) -> Result<Option<Arc<dyn Attempt>>> {
        self.with_unit(|ns, unit| {
            unit.active_attempt
                .and_then(|id| ns.attempts.get(&id))
                .map(|attempt| self.attempt_handle(attempt))
        })
    }

    async fn attempts(&self) -> Result<Vec<Arc<dyn Attempt>>> {
        self.with_unit(|ns, unit| {
            unit.attempts
                .iter()
                .filter_map(|id| ns.attempts.get(id))
                .map(|attempt| self.attempt_handle(attempt))
                .collect()
        })
    }
}

impl MemWorkUnit {
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
