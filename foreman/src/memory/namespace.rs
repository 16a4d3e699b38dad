use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{Namespace, WorkSpec, Worker};
use crate::error::{Error, Result};
use crate::meta::{derive_meta, work_spec_name};
use crate::value::DataMap;

use super::workspec::MemWorkSpec;
use super::worker::MemWorker;
use super::{Core, SpecState};

pub(crate) struct MemNamespace {
    core: Arc<Core>,
    name: String,
}

impl MemNamespace {
    pub fn new(core: Arc<Core>, name: &str) -> Self {
        Self {
            core,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Namespace for MemNamespace {
    fn name(&self) -> &str {
        &self.name
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.core.write();
        state.namespaces.remove(&self.name);
        Ok(())
    }

    async fn set_work_spec(&self, data: DataMap) -> Result<Arc<dyn WorkSpec>> {
        let spec_name = work_spec_name(&data)?;
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.name)?;
        let mut meta = derive_meta(&data);
        match ns.work_specs.get_mut(&spec_name) {
            Some(spec) => {
                // Replacing a spec recomputes its derived metadata but
                // preserves its units and its continuous-synthesis cursor.
                meta.next_continuous = spec.meta.next_continuous;
                spec.data = data;
                spec.meta = meta;
            }
            None => {
                ns.work_specs.insert(
                    spec_name.clone(),
                    SpecState {
                        name: spec_name.clone(),
                        data,
                        meta,
                        units: Default::default(),
                    },
                );
            }
        }
        Ok(Arc::new(MemWorkSpec::new(
            self.core.clone(),
            &self.name,
            &spec_name,
        )))
    }

    async fn work_spec(&self, name: &str) -> Result<Arc<dyn WorkSpec>> {
        let state = self.core.read();
        let ns = state.ns(&self.name)?;
        if !ns.work_specs.contains_key(name) {
            return Err(Error::NoSuchWorkSpec {
                name: name.to_string(),
            });
        }
        Ok(Arc::new(MemWorkSpec::new(self.core.clone(), &self.name, name)))
    }

    async fn work_spec_names(&self) -> Result<Vec<String>> {
        let state = self.core.read();
        let ns = state.ns(&self.name)?;
        Ok(ns.work_specs.keys().cloned().collect())
    }

    async fn destroy_work_spec(&self, name: &str) -> Result<()> {
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.name)?;
        let Some(spec) = ns.work_specs.remove(name) else {
            return Err(Error::NoSuchWorkSpec {
                name: name.to_string(),
            });
        };
        for unit in spec.units.values() {
            super::workunit::purge_unit_attempts(
                &mut ns.attempts,
                &mut ns.workers,
                &unit.attempts,
            );
        }
        Ok(())
    }

    async fn worker(&self, name: &str) -> Result<Arc<dyn Worker>> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let ns = state.ns_mut(&self.name)?;
        super::worker::ensure_worker(ns, name, now);
        Ok(Arc::new(MemWorker::new(self.core.clone(), &self.name, name)))
    }

    async fn workers(&self) -> Result<Vec<Arc<dyn Worker>>> {
        let state = self.core.read();
        let ns = state.ns(&self.name)?;
        Ok(ns
            .workers
            .keys()
            .map(|name| {
                Arc::new(MemWorker::new(self.core.clone(), &self.name, name)) as Arc<dyn Worker>
            })
            .collect())
    }
}
