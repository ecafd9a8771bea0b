//! Storage sinks for decoded fixes.

use std::sync::{
    Arc,
    atomic::{
        AtomicBool,
        Ordering,
    },
};

use outpost_proto::Fix;
use parking_lot::Mutex;
use sqlx::PgPool;

/// Where accepted batches go.
///
/// `append` persists one ordered batch and reports success or failure
/// synchronously with the request handler; the resource maps a failure to
/// an internal server error and the client drops the batch.
#[allow(async_fn_in_trait)]
pub trait Sink {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn append(&self, fixes: &[Fix]) -> Result<(), Self::Error>;

    /// Whether the sink can currently accept writes.
    async fn healthy(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
#[error("database error")]
pub enum PostgresError {
    Sqlx(#[from] sqlx::Error),
}

const SCHEMA: &str = "
create extension if not exists postgis;

create table if not exists position (
    id bigserial primary key,
    timestamp timestamptz not null,
    location geometry(Point, 4326) not null,
    speed double precision,
    altitude double precision,
    created_at timestamptz default now()
);

create index if not exists idx_position_timestamp on position (timestamp);
create index if not exists idx_position_location on position using gist (location);
";

/// PostGIS-backed sink. Fixes become point rows in the `position` table.
#[derive(Clone, Debug)]
pub struct PostgresSink {
    pool: PgPool,
}

impl PostgresSink {
    /// Connects and makes sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, PostgresError> {
        let pool = PgPool::connect(database_url).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

impl Sink for PostgresSink {
    type Error = PostgresError;

    async fn append(&self, fixes: &[Fix]) -> Result<(), PostgresError> {
        let mut transaction = self.pool.begin().await?;

        for fix in fixes {
            sqlx::query(
                "insert into position (timestamp, location, speed, altitude) \
                 values ($1, ST_SetSRID(ST_MakePoint($2, $3), 4326), $4, $5)",
            )
            .bind(fix.time)
            .bind(fix.longitude)
            .bind(fix.latitude)
            .bind(fix.speed)
            .bind(fix.altitude)
            .execute(&mut *transaction)
            .await?;
        }

        transaction.commit().await?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        sqlx::query("select 1").execute(&self.pool).await.is_ok()
    }
}

/// In-memory sink, for tests and dry runs.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    inner: Arc<MemorySinkInner>,
}

#[derive(Debug, Default)]
struct MemorySinkInner {
    fixes: Mutex<Vec<Fix>>,
    failing: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything appended so far, in order.
    pub fn fixes(&self) -> Vec<Fix> {
        self.inner.fixes.lock().clone()
    }

    /// Makes every following `append` fail.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::Relaxed);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("memory sink is set to fail")]
pub struct MemorySinkError;

impl Sink for MemorySink {
    type Error = MemorySinkError;

    async fn append(&self, fixes: &[Fix]) -> Result<(), MemorySinkError> {
        if self.inner.failing.load(Ordering::Relaxed) {
            return Err(MemorySinkError);
        }
        self.inner.fixes.lock().extend_from_slice(fixes);
        Ok(())
    }

    async fn healthy(&self) -> bool {
        !self.inner.failing.load(Ordering::Relaxed)
    }
}
