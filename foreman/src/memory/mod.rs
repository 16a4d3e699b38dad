//! In-memory backend.
//!
//! The coordinator owns a tree of namespaces, each owning work specs,
//! workers, and an arena of attempts keyed by id. One process-wide
//! reader-writer lock guards the whole tree; every public operation
//! acquires it on entry, never does I/O while holding it, and releases it
//! on every exit path (the `parking_lot` guards unlock on drop, panics
//! included). Handles returned to clients are logical: they hold keys, not
//! references, and report [`Error::Gone`] once the underlying record has
//! been destroyed.

mod attempt;
mod namespace;
mod worker;
mod workspec;
mod workunit;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::api::{AttemptStatus, Coordinate, Namespace, WorkUnitStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::meta::WorkSpecMeta;
use crate::value::DataMap;

pub(crate) use namespace::MemNamespace;

/// The in-memory coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryCoordinate {
    core: Arc<Core>,
}

impl MemoryCoordinate {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Construct with an injected time source.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(clock, StdRng::from_entropy())
    }

    /// Construct with an injected time source and a fixed scheduler seed,
    /// making weighted spec selection reproducible.
    pub fn with_clock_and_seed(clock: Arc<dyn Clock>, seed: u64) -> Self {
        Self::build(clock, StdRng::seed_from_u64(seed))
    }

    fn build(clock: Arc<dyn Clock>, rng: StdRng) -> Self {
        Self {
            core: Arc::new(Core {
                state: RwLock::new(State {
                    namespaces: HashMap::new(),
                }),
                clock,
                rng: Mutex::new(rng),
            }),
        }
    }
}

impl Default for MemoryCoordinate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinate for MemoryCoordinate {
    async fn namespace(&self, name: &str) -> Result<Arc<dyn Namespace>> {
        let mut state = self.core.write();
        state
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| NamespaceState::new(name));
        Ok(Arc::new(MemNamespace::new(self.core.clone(), name)))
    }

    async fn namespaces(&self) -> Result<Vec<Arc<dyn Namespace>>> {
        let state = self.core.read();
        let mut names: Vec<&String> = state.namespaces.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| Arc::new(MemNamespace::new(self.core.clone(), name)) as Arc<dyn Namespace>)
            .collect())
    }

    async fn expire_attempts(&self) -> Result<usize> {
        let now = self.core.clock.now();
        let mut state = self.core.write();
        let mut expired = 0;
        for ns in state.namespaces.values_mut() {
            expired += attempt::expire_due(ns, now);
        }
        Ok(expired)
    }
}

pub(crate) struct Core {
    state: RwLock<State>,
    pub clock: Arc<dyn Clock>,
    pub rng: Mutex<StdRng>,
}

impl Core {
    pub fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write()
    }
}

pub(crate) struct State {
    pub namespaces: HashMap<String, NamespaceState>,
}

impl State {
    /// Namespace lookup for handle-internal use: a missing record means the
    /// handle outlived a destroy.
    pub fn ns(&self, name: &str) -> Result<&NamespaceState> {
        self.namespaces.get(name).ok_or(Error::Gone)
    }

    pub fn ns_mut(&mut self, name: &str) -> Result<&mut NamespaceState> {
        self.namespaces.get_mut(name).ok_or(Error::Gone)
    }
}

pub(crate) struct NamespaceState {
    pub name: String,
    pub work_specs: BTreeMap<String, SpecState>,
    pub workers: BTreeMap<String, WorkerState>,
    pub attempts: HashMap<u64, AttemptState>,
    pub next_attempt_id: u64,
}

impl NamespaceState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            work_specs: BTreeMap::new(),
            workers: BTreeMap::new(),
            attempts: HashMap::new(),
            next_attempt_id: 1,
        }
    }
}

pub(crate) struct SpecState {
    pub name: String,
    pub data: DataMap,
    pub meta: WorkSpecMeta,
    pub units: BTreeMap<String, UnitState>,
}

impl SpecState {
    /// Metadata snapshot; counts are filled in only when requested.
    pub fn meta_snapshot(
        &self,
        attempts: &HashMap<u64, AttemptState>,
        now: DateTime<Utc>,
        with_counts: bool,
    ) -> WorkSpecMeta {
        let mut meta = self.meta.clone();
        if with_counts {
            for unit in self.units.values() {
                match unit.status(attempts, now) {
                    WorkUnitStatus::Available => meta.available_count += 1,
                    WorkUnitStatus::Pending => meta.pending_count += 1,
                    _ => {}
                }
            }
        }
        meta
    }
}

pub(crate) struct UnitState {
    pub name: String,
    pub data: DataMap,
    pub priority: f64,
    pub not_before: Option<DateTime<Utc>>,
    pub active_attempt: Option<u64>,
    pub attempts: Vec<u64>,
    pub retries: usize,
}

impl UnitState {
    pub fn new(
        name: &str,
        data: DataMap,
        priority: f64,
        not_before: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            data,
            priority,
            not_before,
            active_attempt: None,
            attempts: Vec::new(),
            retries: 0,
        }
    }

    /// Unit status is a pure function of the active attempt's status, or of
    /// the not-before time when there is none. An expired attempt only
    /// stays active when the unit ran out of retries, which reads as
    /// failed.
    pub fn status(
        &self,
        attempts: &HashMap<u64, AttemptState>,
        now: DateTime<Utc>,
    ) -> WorkUnitStatus {
        match self.active_attempt.and_then(|id| attempts.get(&id)) {
            Some(attempt) => match attempt.status {
                AttemptStatus::Pending => WorkUnitStatus::Pending,
                AttemptStatus::Finished => WorkUnitStatus::Finished,
                AttemptStatus::Failed
                | AttemptStatus::Expired
                | AttemptStatus::Retryable => WorkUnitStatus::Failed,
            },
            None => match self.not_before {
                Some(not_before) if not_before > now => WorkUnitStatus::Delayed,
                _ => WorkUnitStatus::Available,
            },
        }
    }

    pub fn is_available(
        &self,
        attempts: &HashMap<u64, AttemptState>,
        now: DateTime<Utc>,
    ) -> bool {
        self.status(attempts, now) == WorkUnitStatus::Available
    }
}

pub(crate) struct WorkerState {
    pub name: String,
    pub data: DataMap,
    pub active: bool,
    pub parent: Option<String>,
    pub children: BTreeSet<String>,
    pub mode: String,
    pub expiration: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub active_attempts: Vec<u64>,
    pub attempts: Vec<u64>,
}

impl WorkerState {
    pub fn new(name: &str, now: DateTime<Utc>, expiration: DateTime<Utc>) -> Self {
        Self {
            name: name.to_string(),
            data: DataMap::new(),
            active: true,
            parent: None,
            children: BTreeSet::new(),
            mode: String::new(),
            expiration,
            last_update: now,
            active_attempts: Vec::new(),
            attempts: Vec::new(),
        }
    }
}

pub(crate) struct AttemptState {
    pub id: u64,
    pub spec: String,
    pub unit: String,
    pub worker: String,
    pub status: AttemptStatus,
    pub data: Option<DataMap>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub expiration_time: DateTime<Utc>,
}
