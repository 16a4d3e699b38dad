//! PostgreSQL backend.
//!
//! Observable semantics match the in-memory backend exactly; the
//! differences are all below the waterline. Every public operation runs in
//! one transaction at serializable isolation. Serialization failures
//! (SQLSTATE `40001`) roll the transaction back and re-execute the whole
//! closure from scratch, up to [`MAX_TX_RETRIES`] times before surfacing
//! [`Error::Conflict`]. `SELECT ... FOR UPDATE` guards every
//! read-then-write row. Data dictionaries are stored as JSONB in the
//! tagged [`Value`](crate::Value) encoding, which round-trips tuples,
//! byte strings, and UUIDs intact.

mod attempt;
mod namespace;
mod schema;
mod worker;
mod workspec;
mod workunit;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool, Row};

use crate::api::{Coordinate, Namespace, WorkUnitStatus};
use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::value::DataMap;

use namespace::PgNamespace;

/// Serialization-failure retry budget per operation.
pub(crate) const MAX_TX_RETRIES: u32 = 10;

/// The PostgreSQL coordinator. Carries a connection pool; clone freely and
/// share one per application.
#[derive(Clone)]
pub struct PostgresCoordinate {
    core: Arc<PgCore>,
}

impl PostgresCoordinate {
    /// Connect using anything libpq accepts. A connection string with a
    /// leading `//` is rewritten to a `postgres:` URL first.
    pub async fn connect(connection_string: &str) -> Result<Self> {
        Self::connect_with_clock(connection_string, Arc::new(SystemClock)).await
    }

    /// Connect with an injected time source; intended for tests that need
    /// deterministic deadlines.
    pub async fn connect_with_clock(
        connection_string: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::build(connection_string, clock, StdRng::from_entropy()).await
    }

    /// Connect with an injected time source and a fixed scheduler seed.
    pub async fn connect_with_clock_and_seed(
        connection_string: &str,
        clock: Arc<dyn Clock>,
        seed: u64,
    ) -> Result<Self> {
        Self::build(connection_string, clock, StdRng::seed_from_u64(seed)).await
    }

    async fn build(connection_string: &str, clock: Arc<dyn Clock>, rng: StdRng) -> Result<Self> {
        let connection_string = normalize_connection_string(connection_string);
        let pool = PgPoolOptions::new().connect(&connection_string).await?;
        schema::ensure_schema(&pool).await?;
        Ok(Self {
            core: Arc::new(PgCore {
                pool,
                clock,
                rng: Mutex::new(rng),
            }),
        })
    }

    /// The underlying connection pool, for operational tooling and tests.
    pub fn pool(&self) -> &PgPool {
        &self.core.pool
    }
}

fn normalize_connection_string(connection_string: &str) -> String {
    if let Some(rest) = connection_string.strip_prefix("//") {
        format!("postgres://{rest}")
    } else {
        connection_string.to_string()
    }
}

#[async_trait]
impl Coordinate for PostgresCoordinate {
    async fn namespace(&self, name: &str) -> Result<Arc<dyn Namespace>> {
        let core = self.core.clone();
        let id = with_tx(&core, |conn| {
            let name = name.to_string();
            Box::pin(async move {
                sqlx::query("INSERT INTO namespace (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                    .bind(&name)
                    .execute(&mut *conn)
                    .await?;
                let row = sqlx::query("SELECT id FROM namespace WHERE name = $1")
                    .bind(&name)
                    .fetch_one(&mut *conn)
                    .await?;
                Ok(row.try_get::<i64, _>("id")?)
            })
        })
        .await?;
        Ok(Arc::new(PgNamespace::new(self.core.clone(), id, name)))
    }

    async fn namespaces(&self) -> Result<Vec<Arc<dyn Namespace>>> {
        let rows = sqlx::query("SELECT id, name FROM namespace ORDER BY name")
            .fetch_all(&self.core.pool)
            .await?;
        let mut namespaces: Vec<Arc<dyn Namespace>> = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let name: String = row.try_get("name")?;
            namespaces.push(Arc::new(PgNamespace::new(self.core.clone(), id, &name)));
        }
        Ok(namespaces)
    }

    async fn expire_attempts(&self) -> Result<usize> {
        let now = self.core.clock.now();
        with_tx(&self.core, move |conn| {
            Box::pin(async move {
                let mut expired = 0;

                let overdue = sqlx::query(
                    "SELECT id FROM attempt \
                     WHERE status = 'pending' AND expiration_time < $1 \
                     FOR UPDATE",
                )
                .bind(now)
                .fetch_all(&mut *conn)
                .await?;
                for row in overdue {
                    attempt::expire_one(conn, row.try_get("id")?, now).await?;
                    expired += 1;
                }

                let stale = sqlx::query(
                    "SELECT id FROM worker WHERE active AND expiration < $1 FOR UPDATE",
                )
                .bind(now)
                .fetch_all(&mut *conn)
                .await?;
                for row in stale {
                    let worker_id: i64 = row.try_get("id")?;
                    expired += worker::expire_worker(conn, worker_id, now).await?;
                }

                Ok(expired)
            })
        })
        .await
    }
}

pub(crate) struct PgCore {
    pub pool: PgPool,
    pub clock: Arc<dyn Clock>,
    pub rng: Mutex<StdRng>,
}

/// Boxed future tied to one transaction's connection borrow.
pub(crate) type TxFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'c>>;

fn is_serialization_failure(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("40001")
    )
}

/// Run a closure inside a serializable transaction, retrying the whole
/// closure from scratch on serialization failure.
pub(crate) async fn with_tx<T, F>(core: &PgCore, mut op: F) -> Result<T>
where
    F: for<'c> FnMut(&'c mut PgConnection) -> TxFuture<'c, T>,
{
    for _ in 0..MAX_TX_RETRIES {
        let mut tx = core.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        match op(&mut *tx).await {
            Ok(value) => match tx.commit().await {
                Ok(()) => return Ok(value),
                Err(error) if is_serialization_failure(&error) => continue,
                Err(error) => return Err(error.into()),
            },
            Err(Error::Database(error)) if is_serialization_failure(&error) => {
                let _ = tx.rollback().await;
            }
            Err(error) => {
                let _ = tx.rollback().await;
                return Err(error);
            }
        }
    }
    Err(Error::Conflict)
}

pub(crate) fn encode_data(data: &DataMap) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(data)?)
}

pub(crate) fn decode_data(value: serde_json::Value) -> Result<DataMap> {
    Ok(serde_json::from_value(value)?)
}

/// Unit status derived from the active attempt's status (SQL text form) or
/// the unit's not-before time. The mapping is the same one the memory
/// backend applies.
pub(crate) fn derived_status(
    attempt_status: Option<&str>,
    not_before: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> WorkUnitStatus {
    match attempt_status {
        Some("pending") => WorkUnitStatus::Pending,
        Some("finished") => WorkUnitStatus::Finished,
        Some(_) => WorkUnitStatus::Failed,
        None => match not_before {
            Some(not_before) if not_before > now => WorkUnitStatus::Delayed,
            _ => WorkUnitStatus::Available,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_string_rewrite() {
        assert_eq!(
            normalize_connection_string("//user:pw@localhost/db"),
            "postgres://user:pw@localhost/db"
        );
        assert_eq!(
            normalize_connection_string("postgres://localhost/db"),
            "postgres://localhost/db"
        );
        assert_eq!(
            normalize_connection_string("host=localhost dbname=db"),
            "host=localhost dbname=db"
        );
    }
}
