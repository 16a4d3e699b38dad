use thiserror::Error;

/// Errors surfaced by coordinator operations.
///
/// Validation failures and lifecycle violations are reported as distinct
/// variants so callers can branch on them; backend-internal failures are
/// wrapped and propagated verbatim.
#[derive(Debug, Error)]
pub enum Error {
    /// `set_work_spec` data had no `name` key.
    #[error("work spec data lacks a \"name\" key")]
    NoWorkSpecName,

    /// `set_work_spec` data had a `name` that was not a non-empty string.
    #[error("work spec \"name\" must be a non-empty string")]
    BadWorkSpecName,

    /// Lookup of a work spec that does not exist.
    #[error("no such work spec: {name}")]
    NoSuchWorkSpec { name: String },

    /// Lookup of a work unit that does not exist.
    #[error("no such work unit: {name}")]
    NoSuchWorkUnit { name: String },

    /// Lookup of a worker that does not exist.
    #[error("no such worker: {name}")]
    NoSuchWorker { name: String },

    /// An attempt transition was requested, but the work unit's active
    /// attempt is now held by a different worker.
    #[error("attempt is no longer the work unit's active attempt")]
    WrongWorker,

    /// An attempt transition was requested on an attempt that has already
    /// reached a terminal status.
    #[error("attempt has already terminated")]
    AttemptTerminated,

    /// A handle was used after its underlying record was destroyed.
    #[error("object has been destroyed")]
    Gone,

    /// A SQL transaction kept failing with serialization conflicts after
    /// exhausting its retry budget.
    #[error("transaction conflict persisted after retries")]
    Conflict,

    #[cfg(feature = "postgres")]
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "postgres")]
    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
