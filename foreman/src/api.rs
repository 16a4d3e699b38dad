use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::meta::{WorkSpecMeta, WorkUnitMeta};
use crate::value::DataMap;

/// Lease lifetime applied when a request does not specify one.
pub fn default_attempt_lifetime() -> Duration {
    Duration::minutes(15)
}

/// Status of one work unit, derived from its active attempt (or its
/// not-before time when it has none).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WorkUnitStatus {
    /// No active attempt and eligible for scheduling.
    Available,
    /// No active attempt, withheld until its not-before time.
    Delayed,
    /// Leased by a pending attempt.
    Pending,
    /// Last attempt finished successfully.
    Finished,
    /// Last attempt failed (or expired with retries exhausted).
    Failed,
}

impl WorkUnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkUnitStatus::Available => "available",
            WorkUnitStatus::Delayed => "delayed",
            WorkUnitStatus::Pending => "pending",
            WorkUnitStatus::Finished => "finished",
            WorkUnitStatus::Failed => "failed",
        }
    }
}

/// Status of one attempt. `Pending` is the only non-terminal status.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum AttemptStatus {
    Pending,
    Finished,
    Failed,
    Retryable,
    Expired,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Finished => "finished",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Retryable => "retryable",
            AttemptStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AttemptStatus::Pending),
            "finished" => Some(AttemptStatus::Finished),
            "failed" => Some(AttemptStatus::Failed),
            "retryable" => Some(AttemptStatus::Retryable),
            "expired" => Some(AttemptStatus::Expired),
            _ => None,
        }
    }
}

/// Parameters of one `request_attempts` call.
#[derive(Clone, Debug)]
pub struct AttemptRequest {
    /// Upper bound on attempts returned. Zero yields an empty result.
    pub number_of_work_units: usize,
    /// Memory the worker can offer; `None` means unconstrained. Specs with
    /// a larger `min_gb` are excluded.
    pub available_gb: Option<f64>,
    /// Lease lifetime for the created attempts; defaults to
    /// [`default_attempt_lifetime`].
    pub lifetime: Option<Duration>,
    /// Runtimes the worker can execute. Empty means unconstrained;
    /// otherwise a spec's runtime tag must be listed or be empty.
    pub runtimes: Vec<String>,
}

impl Default for AttemptRequest {
    fn default() -> Self {
        Self {
            number_of_work_units: 1,
            available_gb: None,
            lifetime: None,
            runtimes: Vec::new(),
        }
    }
}

/// Filter for `work_units` / `delete_work_units`.
///
/// An empty `names` or `statuses` list means "no constraint". Results are
/// ordered by (priority descending, name ascending); `previous_name` is a
/// resume cursor naming the last unit of the prior page.
#[derive(Clone, Debug, Default)]
pub struct WorkUnitQuery {
    pub names: Vec<String>,
    pub statuses: Vec<WorkUnitStatus>,
    pub previous_name: Option<String>,
    pub limit: Option<usize>,
}

/// One row fed to [`WorkUnitQuery::select`].
#[derive(Clone, Debug)]
pub(crate) struct UnitRow {
    pub name: String,
    pub priority: f64,
    pub status: WorkUnitStatus,
}

impl WorkUnitQuery {
    /// Apply this query to a set of unit rows, returning selected names in
    /// result order. Both backends funnel through this so ordering and
    /// cursor semantics cannot drift apart.
    pub(crate) fn select(&self, mut rows: Vec<UnitRow>) -> Vec<String> {
        rows.retain(|row| {
            (self.names.is_empty() || self.names.iter().any(|n| *n == row.name))
                && (self.statuses.is_empty() || self.statuses.contains(&row.status))
        });
        rows.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.name.cmp(&b.name))
        });
        let start = match &self.previous_name {
            Some(prev) => match rows.iter().position(|row| row.name == *prev) {
                Some(pos) => pos + 1,
                // Cursor names a unit that no longer matches; fall back to
                // name ordering so pagination still makes progress.
                None => rows.iter().filter(|row| row.name <= *prev).count(),
            },
            None => 0,
        };
        rows.into_iter()
            .skip(start)
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|row| row.name)
            .collect()
    }
}

/// Root of the coordinator object tree. Both backends implement this and
/// consumers never branch on which one they hold.
#[async_trait]
pub trait Coordinate: Send + Sync {
    /// Fetch the namespace with this name, creating it if absent. The empty
    /// string is a valid default namespace name.
    async fn namespace(&self, name: &str) -> Result<Arc<dyn Namespace>>;

    /// All current namespaces.
    async fn namespaces(&self) -> Result<Vec<Arc<dyn Namespace>>>;

    /// One pass of the expiration sweep: terminate attempts past their
    /// deadline and release workers past theirs. Returns the number of
    /// attempts expired. Idempotent, safe to interleave with foreground
    /// operations.
    async fn expire_attempts(&self) -> Result<usize>;
}

/// Tenant scope owning disjoint sets of work specs and workers.
#[async_trait]
pub trait Namespace: Send + Sync {
    fn name(&self) -> &str;

    /// Remove this namespace from its coordinator. Handles into the
    /// destroyed namespace report [`crate::Error::Gone`] on next use.
    async fn destroy(&self) -> Result<()>;

    /// Insert or replace a work spec from its data dictionary. The
    /// dictionary must carry a non-empty string `name`. Replacement
    /// recomputes derived metadata and preserves existing work units.
    async fn set_work_spec(&self, data: DataMap) -> Result<Arc<dyn WorkSpec>>;

    async fn work_spec(&self, name: &str) -> Result<Arc<dyn WorkSpec>>;

    async fn work_spec_names(&self) -> Result<Vec<String>>;

    /// Destroy a work spec along with all of its work units and attempts.
    async fn destroy_work_spec(&self, name: &str) -> Result<()>;

    /// Fetch the worker with this name, creating it if absent.
    async fn worker(&self, name: &str) -> Result<Arc<dyn Worker>>;

    async fn workers(&self) -> Result<Vec<Arc<dyn Worker>>>;
}

/// Named template describing a class of work and its scheduling knobs.
#[async_trait]
pub trait WorkSpec: Send + Sync {
    fn name(&self) -> &str;

    async fn data(&self) -> Result<DataMap>;

    /// Replace the data dictionary, recomputing derived metadata. The new
    /// dictionary must name this same spec.
    async fn set_data(&self, data: DataMap) -> Result<()>;

    /// Metadata snapshot. Counts are only computed when `with_counts` is
    /// set; they require a scan of the spec's units.
    async fn meta(&self, with_counts: bool) -> Result<WorkSpecMeta>;

    /// Adjust scheduling knobs without re-submitting data. Fields that
    /// restate the data dictionary are ignored; see
    /// [`WorkSpecMeta::apply_update`].
    async fn set_meta(&self, meta: WorkSpecMeta) -> Result<()>;

    /// Insert or replace one work unit. Replacing a unit that is being
    /// worked on does not cancel the attempt; the new data takes effect if
    /// that attempt later retries or expires.
    async fn add_work_unit(
        &self,
        name: &str,
        data: DataMap,
        meta: WorkUnitMeta,
    ) -> Result<Arc<dyn WorkUnit>>;

    /// Batch form of [`WorkSpec::add_work_unit`].
    async fn add_work_units(&self, units: Vec<(String, DataMap, WorkUnitMeta)>) -> Result<()>;

    async fn work_unit(&self, name: &str) -> Result<Arc<dyn WorkUnit>>;

    /// Query work units; see [`WorkUnitQuery`] for filter and ordering
    /// semantics.
    async fn work_units(&self, query: WorkUnitQuery) -> Result<Vec<Arc<dyn WorkUnit>>>;

    /// Counts of this spec's units bucketed by derived status.
    async fn count_work_unit_status(&self) -> Result<HashMap<WorkUnitStatus, usize>>;

    /// Delete matching units (and their attempts); returns how many were
    /// deleted.
    async fn delete_work_units(&self, query: WorkUnitQuery) -> Result<usize>;
}

/// One enqueued job under a work spec.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    fn name(&self) -> &str;

    fn work_spec_name(&self) -> &str;

    async fn data(&self) -> Result<DataMap>;

    async fn status(&self) -> Result<WorkUnitStatus>;

    async fn priority(&self) -> Result<f64>;

    async fn set_priority(&self, priority: f64) -> Result<()>;

    /// The unit's current attempt, if any. The returned attempt may already
    /// be terminal (a finished or failed unit keeps its last attempt here).
    async fn active_attempt(&self) -> Result<Option<Arc<dyn Attempt>>>;

    /// Every attempt ever made on this unit, oldest first.
    async fn attempts(&self) -> Result<Vec<Arc<dyn Attempt>>>;
}

/// A client process that leases and executes work units.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    async fn parent(&self) -> Result<Option<Arc<dyn Worker>>>;

    /// Attach this worker under a parent (or detach with `None`). Parents
    /// are created lazily like any other worker reference.
    async fn set_parent(&self, parent: Option<String>) -> Result<()>;

    async fn children(&self) -> Result<Vec<Arc<dyn Worker>>>;

    async fn is_active(&self) -> Result<bool>;

    async fn mode(&self) -> Result<String>;

    async fn data(&self) -> Result<DataMap>;

    async fn expiration(&self) -> Result<DateTime<Utc>>;

    async fn last_update(&self) -> Result<DateTime<Utc>>;

    /// Heartbeat: record fresh data, push out the expiration deadline, and
    /// mark the worker active.
    async fn update(&self, data: DataMap, expiration: DateTime<Utc>, mode: String) -> Result<()>;

    /// Forcefully expire this worker: terminate its pending attempts and
    /// mark it inactive.
    async fn expire(&self) -> Result<()>;

    /// Lease available work units as attempts; the scheduler picks the spec.
    /// An empty result is normal and means no work matched the request.
    async fn request_attempts(&self, request: AttemptRequest) -> Result<Vec<Arc<dyn Attempt>>>;

    /// Directly lease one specific unit, bypassing spec selection. The
    /// unit's current pending attempt, if any, is displaced. Intended for
    /// tests and administrative repair.
    async fn make_attempt(
        &self,
        work_spec: &str,
        work_unit: &str,
        lifetime: Duration,
    ) -> Result<Arc<dyn Attempt>>;

    /// Attempts owned by this worker that have not terminated.
    async fn active_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>>;

    /// Every attempt this worker has ever held, oldest first.
    async fn all_attempts(&self) -> Result<Vec<Arc<dyn Attempt>>>;
}

/// A lease of one work unit by one worker.
///
/// Transitions are only legal while the attempt is `Pending` and still the
/// unit's active attempt; see the crate-level docs for the full state
/// machine.
#[async_trait]
pub trait Attempt: Send + Sync {
    fn work_spec_name(&self) -> &str;

    fn work_unit_name(&self) -> &str;

    fn worker_name(&self) -> &str;

    async fn work_unit(&self) -> Result<Arc<dyn WorkUnit>>;

    async fn worker(&self) -> Result<Arc<dyn Worker>>;

    async fn status(&self) -> Result<AttemptStatus>;

    /// Per-attempt output data; falls back to the unit's data while the
    /// attempt has recorded none of its own.
    async fn data(&self) -> Result<DataMap>;

    async fn start_time(&self) -> Result<DateTime<Utc>>;

    async fn end_time(&self) -> Result<Option<DateTime<Utc>>>;

    async fn expiration_time(&self) -> Result<DateTime<Utc>>;

    /// Extend the lease deadline, optionally replacing the attempt data.
    async fn renew(&self, extension: Duration, data: Option<DataMap>) -> Result<()>;

    /// Complete successfully. If the spec chains to a successor, units are
    /// derived from the final data's `output` key.
    async fn finish(&self, data: Option<DataMap>) -> Result<()>;

    /// Fail. While the spec grants retries and the unit has some left this
    /// behaves as `retry` with no delay.
    async fn fail(&self, data: Option<DataMap>) -> Result<()>;

    /// Give the unit back, delaying its availability by `delay`.
    async fn retry(&self, delay: Duration) -> Result<()>;

    /// Deadline passed: terminate the attempt and make the unit available
    /// again. Normally invoked by the expiration sweep.
    async fn expire(&self) -> Result<()>;
}
