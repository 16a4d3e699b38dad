//! Foreman - distributed work-unit coordination.
//!
//! A central dispatch and bookkeeping engine for batch pipelines: producers
//! declare *work specs* and enqueue *work units* against them; workers pull
//! units as leased *attempts*, report outcomes, and chain follow-on work
//! onto successor specs.
//!
//! # Core Concepts
//!
//! - **Namespace**: tenant scope; spec and worker names are unique within
//!   one namespace. The empty string is a valid default namespace.
//!
//! - **Work spec**: a named job template carrying a free-form data
//!   dictionary plus derived scheduling metadata (priority, weight, pause
//!   flag, concurrency caps, continuous cadence, chaining target).
//!
//! - **Work unit**: one enqueued job under a spec, with its own data and
//!   priority, and at most one active attempt at a time.
//!
//! - **Worker**: a client process that leases work. Workers heartbeat via
//!   [`Worker::update`] and form parent/child trees; a worker whose
//!   deadline lapses is released by the expiration sweep.
//!
//! - **Attempt**: a deadline-bound lease of one unit by one worker,
//!   transitioning from `Pending` to `Finished`, `Failed`, `Retryable`, or
//!   `Expired`.
//!
//! # Backends
//!
//! Two interchangeable backends implement the same [`Coordinate`]
//! capability set:
//!
//! - [`MemoryCoordinate`]: the whole object tree behind one process-wide
//!   reader-writer lock; trivially serializable, no I/O under the lock.
//! - `PostgresCoordinate` (feature `postgres`): every operation in a
//!   serializable sqlx transaction, retried on serialization failure and
//!   capped by a retry budget that surfaces [`Error::Conflict`].
//!
//! Consumers hold `Arc<dyn Coordinate>` and never branch on backend
//! identity.
//!
//! # Scheduling
//!
//! [`Worker::request_attempts`] picks one spec per call: highest priority
//! outright, weighted random by weight among ties, deterministic under the
//! `*_with_seed` constructors. The chosen spec hands out its available
//! units ordered by (priority desc, name asc), capped by `max_getwork` and
//! `max_running`. Continuous specs synthesize timestamp-named units when
//! idle and due.
//!
//! # Quick Start
//!
//! ```ignore
//! use foreman::{AttemptRequest, MemoryCoordinate, Coordinate};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let coordinate = Arc::new(MemoryCoordinate::new());
//!     let ns = coordinate.namespace("").await?;
//!     // declare a spec, add units, lease them as a worker...
//!     Ok(())
//! }
//! ```
//!
//! See `examples/memory_pipeline.rs` for a complete producer/worker round
//! trip and `examples/postgres_coordinator.rs` for the SQL backend.

/// Backend-neutral capability traits and request/query types.
///
/// The `api` module defines the object graph every backend implements:
/// [`Coordinate`], [`Namespace`], [`WorkSpec`], [`WorkUnit`], [`Worker`],
/// and [`Attempt`], plus [`AttemptRequest`], [`WorkUnitQuery`], and the
/// status enums.
pub mod api;

/// Injectable time source.
///
/// The `clock` module defines the [`Clock`] trait and the production
/// [`SystemClock`]. Every deadline computation routes through it; tests
/// substitute an advanceable mock.
pub mod clock;

/// Typed errors for coordinator operations.
pub mod error;

/// Work-spec metadata: [`WorkSpecMeta`], [`WorkUnitMeta`], data-dictionary
/// validation and derivation.
pub mod meta;

/// Chaining: derive follow-on work units from a finished attempt's
/// `output` data.
pub mod output;

/// Spec selection and lease arithmetic shared by both backends.
pub mod scheduler;

/// Tagged-union [`Value`] and the [`DataMap`] data dictionaries.
pub mod value;

/// In-memory backend.
pub mod memory;

#[cfg(feature = "postgres")]
/// PostgreSQL backend (feature `postgres`).
pub mod postgres;

/// Periodic expiration sweeper and shutdown signaling.
pub mod sweep;

pub use api::{
    default_attempt_lifetime, Attempt, AttemptRequest, AttemptStatus, Coordinate, Namespace,
    WorkSpec, WorkUnit, WorkUnitQuery, WorkUnitStatus, Worker,
};
pub use clock::{Clock, SystemClock};
pub use error::{Error, Result};
pub use memory::MemoryCoordinate;
pub use meta::{WorkSpecMeta, WorkUnitMeta};
pub use sweep::{ExpirySweeper, ShutdownToken};
pub use value::{DataMap, Value};

#[cfg(feature = "postgres")]
pub use postgres::PostgresCoordinate;
