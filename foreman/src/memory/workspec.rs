use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{UnitRow, WorkSpec, WorkUnit, WorkUnitQuery, WorkUnitStatus};
use crate::error::{Error, Result};
use crate::meta::{derive_meta, work_spec_name, WorkSpecMeta, WorkUnitMeta};
use crate::value::DataMap;

use super::workunit::{self, MemWorkUnit};
use super::{Core, NamespaceState, SpecState, UnitState};

pub(crate) struct MemWorkSpec {
    core: Arc<Core>,
    namespace: String,
    name: String,
}

impl MemWorkSpec {
    pub fn new(core: Arc<Core>, namespace: &str, name: &str) -> Self {
        Self {
            core,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn unit_handle(&self, unit: &str) -> Arc<dyn WorkUnit> {
        Arc::new(MemWorkUnit::new(
            self.core.clone(),
            &self.namespace,
            &self.name,
            unit,
        ))
    }
}

pub(super) fn spec<'a>(ns: &'a NamespaceState, name: &str) -> Result<&'a SpecState> {
    ns.work_specs.get(name).ok_or(Error::Gone)
}

pub(super) fn spec_mut<'a>(ns: &'a mut NamespaceState, name: &str) -> Result<&'a mut SpecState> {
    ns.work_specs.get_mut(name).ok_or(Error::Gone)
}

/// Insert or replace a unit, leaving any in-flight attempt untouched. The
/// replacement data takes effect once the current attempt retries or
/// expires.
pub(super) fn upsert_unit(
    spec: &mut SpecState,
    name: &str,
    data: DataMap,
    meta: WorkUnitMeta,
) {
    match spec.units.get_mut(name) {
        Some(unit) => {
            unit.data = data;
            unit.priority = meta.priority;
            unit.not_before = meta.not_before;
            unit.retries = 0;
        }
        None => {
            spec.units.insert(
                name.to_string(),
                UnitState::new(name, data, meta.priority, meta.not_before),
            );
        }
    }
}

#[async_trait]
impl WorkSpec for MemWorkSpec {
    fn name(&self) -> &str {
        &self.name
    }

    async fn data(&self) -> Result<DataMap> {
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        Ok(spec(ns, &self.name)?.data.clone())
    }

    async fn set_data(&self, data: DataMap) -> Result<()> {
        let name = work_spec_name(&data)?;
        if name != self.name {
            return Err(Error::BadWorkSpecName);
        }
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        let spec = spec_mut(ns, &self.name)?;
        let mut meta = derive_meta(&data);
        meta.next_continuous = spec.meta.next_continuous;
        spec.data = data;
        spec.meta = meta;
        Ok(())
    }

    async fn meta(&self, with_counts: bool) -> Result<WorkSpecMeta> {
        let now = self.core.clock.now();
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        Ok(spec(ns, &self.name)?.meta_snapshot(&ns.attempts, now, with_counts))
    }

    async fn set_meta(&self, meta: WorkSpecMeta) -> Result<()> {
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        spec_mut(ns, &self.name)?.meta.apply_update(&meta);
        Ok(())
    }

    async fn add_work_unit(
        &self,
        name: &str,
        data: DataMap,
        meta: WorkUnitMeta,
    ) -> Result<Arc<dyn WorkUnit>> {
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        upsert_unit(spec_mut(ns, &self.name)?, name, data, meta);
        Ok(self.unit_handle(name))
    }

    async fn add_work_units(&self, units: Vec<(String, DataMap, WorkUnitMeta)>) -> Result<()> {
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        let spec = spec_mut(ns, &self.name)?;
        for (name, data, meta) in units {
            upsert_unit(spec, &name, data, meta);
        }
        Ok(())
    }

    async fn work_unit(&self, name: &str) -> Result<Arc<dyn WorkUnit>> {
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        if !spec(ns, &self.name)?.units.contains_key(name) {
            return Err(Error::NoSuchWorkUnit {
                name: name.to_string(),
            });
        }
        Ok(self.unit_handle(name))
    }

    async fn work_units(&self, query: WorkUnitQuery) -> Result<Vec<Arc<dyn WorkUnit>>> {
        let now = self.core.clock.now();
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        let spec = spec(ns, &self.name)?;
        let rows = unit_rows(spec, &ns.attempts, now);
        Ok(query
            .select(rows)
            .into_iter()
            .map(|name| self.unit_handle(&name))
            .collect())
    }

    async fn count_work_unit_status(&self) -> Result<HashMap<WorkUnitStatus, usize>> {
        let now = self.core.clock.now();
        let state = self.core.read();
        let ns = state.ns(&self.namespace)?;
        let spec = spec(ns, &self.name)?;
        let mut counts = HashMap::new();
        for unit in spec.units.values() {
            *counts.entry(unit.status(&ns.attempts, now)).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_work_units(&self, query: WorkUnitQuery) -> Result<usize> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.namespace)?;
        let selected = {
            let spec = spec(ns, &self.name)?;
            query.select(unit_rows(spec, &ns.attempts, now))
        };
        let NamespaceState {
            work_specs,
            workers,
            attempts,
            ..
        } = ns;
        let spec = work_specs.get_mut(&self.name).ok_or(Error::Gone)?;
        for name in &selected {
            if let Some(unit) = spec.units.remove(name) {
                workunit::purge_unit_attempts(attempts, workers, &unit.attempts);
            }
        }
        Ok(selected.len())
    }
}

fn unit_rows(
    spec: &SpecState,
    attempts: &HashMap<u64, super::AttemptState>,
    now: chrono::DateTime<chrono::Utc>,
) -> Vec<UnitRow> {
    spec.units
        .values()
        .map(|unit| UnitRow {
            name: unit.name.clone(),
            priority: unit.priority,
            status: unit.status(attempts, now),
        })
        .collect()
}
