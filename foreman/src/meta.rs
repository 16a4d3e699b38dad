use chrono::{DateTime, Duration, Utc};

use crate::error::{Error, Result};
use crate::value::DataMap;

/// Default scheduling weight when a work spec provides neither `weight` nor
/// `nice`.
pub const DEFAULT_WEIGHT: i32 = 20;

/// Derived scheduling metadata for one work spec.
///
/// Most fields are computed from the spec's data dictionary by
/// [`derive_meta`]; `next_continuous` is runtime state owned by the
/// scheduler, and the two counts are filled in only when a snapshot is
/// requested with counts.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkSpecMeta {
    /// Scheduling priority; higher wins outright.
    pub priority: i32,
    /// Weighted-random share among specs of equal priority. Zero or
    /// negative weight removes the spec from scheduling.
    pub weight: i32,
    /// Paused specs accept unit mutations but are never scheduled.
    pub paused: bool,
    /// Whether the scheduler currently may synthesize units for this spec.
    pub continuous: bool,
    /// Whether the spec's data dictionary permits continuous operation;
    /// `continuous` can only be switched on while this holds.
    pub can_start_continuous: bool,
    /// Minimum memory a worker must offer to lease units from this spec.
    pub min_memory_gb: f64,
    /// Cadence of continuous unit synthesis.
    pub interval: Duration,
    /// Earliest instant the next continuous unit may be synthesized.
    /// `None` means a unit may be synthesized immediately.
    pub next_continuous: Option<DateTime<Utc>>,
    /// Cap on concurrently pending attempts; zero means unlimited.
    pub max_running: usize,
    /// Cap on attempts handed out by a single lease request; zero means
    /// unlimited.
    pub max_attempts_returned: usize,
    /// Retries granted to each unit before a failure sticks; zero means
    /// failures stick immediately.
    pub max_retries: usize,
    /// Successor spec receiving chained units when attempts finish.
    pub next_work_spec_name: Option<String>,
    /// Runtime tag workers use to filter specs they can execute.
    pub runtime: String,
    /// Units currently available for lease (snapshot-with-counts only).
    pub available_count: usize,
    /// Units currently held by a pending attempt (snapshot-with-counts
    /// only).
    pub pending_count: usize,
}

impl Default for WorkSpecMeta {
    fn default() -> Self {
        Self {
            priority: 0,
            weight: DEFAULT_WEIGHT,
            paused: false,
            continuous: false,
            can_start_continuous: false,
            min_memory_gb: 0.0,
            interval: Duration::zero(),
            next_continuous: None,
            max_running: 0,
            max_attempts_returned: 0,
            max_retries: 0,
            next_work_spec_name: None,
            runtime: String::new(),
            available_count: 0,
            pending_count: 0,
        }
    }
}

impl WorkSpecMeta {
    /// Apply a caller-supplied metadata update to this stored metadata.
    ///
    /// Only the scheduling knobs are mutable through this path. Fields that
    /// restate the data dictionary (`next_work_spec_name`, `runtime`,
    /// `min_memory_gb`, `max_retries`, `can_start_continuous`) and the
    /// counts are ignored. `continuous` can only be enabled while the data
    /// dictionary permits it.
    pub fn apply_update(&mut self, update: &WorkSpecMeta) {
        self.priority = update.priority;
        self.weight = update.weight;
        self.paused = update.paused;
        self.continuous = update.continuous && self.can_start_continuous;
        self.interval = update.interval;
        self.next_continuous = update.next_continuous;
        self.max_running = update.max_running;
        self.max_attempts_returned = update.max_attempts_returned;
    }
}

/// Scheduling metadata for one work unit.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct WorkUnitMeta {
    /// Unit-level priority; overrides the spec's ordering among its own
    /// units. Ties break by name ascending.
    pub priority: f64,
    /// The unit is withheld from scheduling until this instant.
    pub not_before: Option<DateTime<Utc>>,
}

/// Validate `set_work_spec` data and extract the spec name.
pub fn work_spec_name(data: &DataMap) -> Result<String> {
    let value = data.get("name").ok_or(Error::NoWorkSpecName)?;
    let name = value.as_text().ok_or(Error::BadWorkSpecName)?;
    if name.is_empty() {
        return Err(Error::BadWorkSpecName);
    }
    Ok(name)
}

/// Compute a spec's metadata from its data dictionary.
///
/// `weight` must be a positive integer; an absent weight falls back to the
/// Unix-flavored `nice` knob (`weight = 20 - nice`) and then to
/// [`DEFAULT_WEIGHT`]. An explicit zero or negative weight is preserved,
/// which excludes the spec from scheduling. Runtime state
/// (`next_continuous`) and counts are left at their defaults; callers merge
/// those from the stored record.
pub fn derive_meta(data: &DataMap) -> WorkSpecMeta {
    let mut meta = WorkSpecMeta::default();

    if let Some(priority) = data.get("priority").and_then(|v| v.as_i64()) {
        meta.priority = priority as i32;
    }
    meta.weight = data
        .get("weight")
        .and_then(|v| v.as_i64())
        .map(|w| w as i32)
        .or_else(|| {
            data.get("nice")
                .and_then(|v| v.as_i64())
                .map(|nice| DEFAULT_WEIGHT - nice as i32)
        })
        .unwrap_or(DEFAULT_WEIGHT);
    meta.paused = data
        .get("disabled")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let continuous = data
        .get("continuous")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    meta.continuous = continuous;
    meta.can_start_continuous = continuous;
    if let Some(interval) = data.get("interval").and_then(|v| v.as_f64()) {
        meta.interval = Duration::milliseconds((interval * 1000.0) as i64);
    }
    if let Some(max_running) = data.get("max_running").and_then(|v| v.as_i64()) {
        meta.max_running = max_running.max(0) as usize;
    }
    if let Some(max_getwork) = data.get("max_getwork").and_then(|v| v.as_i64()) {
        meta.max_attempts_returned = max_getwork.max(0) as usize;
    }
    if let Some(max_retries) = data.get("max_retries").and_then(|v| v.as_i64()) {
        meta.max_retries = max_retries.max(0) as usize;
    }
    meta.next_work_spec_name = data
        .get("then")
        .and_then(|v| v.as_text())
        .filter(|s| !s.is_empty());
    if let Some(min_gb) = data.get("min_gb").and_then(|v| v.as_f64()) {
        meta.min_memory_gb = min_gb;
    }
    if let Some(runtime) = data.get("runtime").and_then(|v| v.as_text()) {
        meta.runtime = runtime;
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn data(pairs: &[(&str, Value)]) -> DataMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn name_validation() {
        assert!(matches!(
            work_spec_name(&DataMap::new()),
            Err(Error::NoWorkSpecName)
        ));
        assert!(matches!(
            work_spec_name(&data(&[("name", Value::Int(3))])),
            Err(Error::BadWorkSpecName)
        ));
        assert!(matches!(
            work_spec_name(&data(&[("name", Value::String(String::new()))])),
            Err(Error::BadWorkSpecName)
        ));
        assert_eq!(
            work_spec_name(&data(&[("name", Value::from("s1"))])).unwrap(),
            "s1"
        );
        // CBOR byte strings decode as text
        assert_eq!(
            work_spec_name(&data(&[("name", Value::Bytes(b"s1".to_vec()))])).unwrap(),
            "s1"
        );
    }

    #[test]
    fn weight_defaults_and_nice() {
        assert_eq!(derive_meta(&data(&[])).weight, 20);
        assert_eq!(derive_meta(&data(&[("weight", Value::Int(7))])).weight, 7);
        assert_eq!(derive_meta(&data(&[("nice", Value::Int(5))])).weight, 15);
        // explicit weight wins over nice
        let both = data(&[("weight", Value::Int(3)), ("nice", Value::Int(5))]);
        assert_eq!(derive_meta(&both).weight, 3);
        // non-positive weights survive derivation; the scheduler skips them
        assert_eq!(derive_meta(&data(&[("weight", Value::Int(0))])).weight, 0);
        assert_eq!(derive_meta(&data(&[("weight", Value::Int(-4))])).weight, -4);
    }

    #[test]
    fn scheduling_knobs() {
        let meta = derive_meta(&data(&[
            ("priority", Value::Int(3)),
            ("disabled", Value::Bool(true)),
            ("continuous", Value::Bool(true)),
            ("interval", Value::Float(1.5)),
            ("max_running", Value::Int(4)),
            ("max_getwork", Value::Int(2)),
            ("max_retries", Value::Int(6)),
            ("then", Value::from("s2")),
            ("min_gb", Value::Float(0.5)),
            ("runtime", Value::from("python_gil")),
        ]));
        assert_eq!(meta.priority, 3);
        assert!(meta.paused);
        assert!(meta.continuous);
        assert!(meta.can_start_continuous);
        assert_eq!(meta.interval, Duration::milliseconds(1500));
        assert_eq!(meta.max_running, 4);
        assert_eq!(meta.max_attempts_returned, 2);
        assert_eq!(meta.max_retries, 6);
        assert_eq!(meta.next_work_spec_name.as_deref(), Some("s2"));
        assert_eq!(meta.min_memory_gb, 0.5);
        assert_eq!(meta.runtime, "python_gil");
    }

    #[test]
    fn meta_update_respects_data_derived_fields() {
        let mut stored = derive_meta(&data(&[("then", Value::from("s2"))]));
        let mut update = WorkSpecMeta::default();
        update.priority = 9;
        update.continuous = true;
        update.next_work_spec_name = Some("elsewhere".to_string());
        stored.apply_update(&update);
        assert_eq!(stored.priority, 9);
        // data did not permit continuous operation
        assert!(!stored.continuous);
        // `then` restates the data dictionary and is immutable here
        assert_eq!(stored.next_work_spec_name.as_deref(), Some("s2"));
    }
}
