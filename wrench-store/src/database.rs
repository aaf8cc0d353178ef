use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;
use wrench_core::StoreError;

#[derive(Clone)]
pub struct DbClient {
    pub pool: Pool<Postgres>,
}

impl DbClient {
    pub async fn new(connection_string: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(3))
            .connect(connection_string)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await?;
        info!("Migrations completed successfully.");
        Ok(())
    }
}

/// Classify a driver error so the engine can tell a lost unique-index race
/// from an outage.
pub(crate) fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::UniqueViolation(db.constraint().unwrap_or("unique").to_string())
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound(err.to_string()),
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Stored enum columns are plain text; a value we cannot parse means the
/// row was written by something else.
pub(crate) fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value.parse::<T>().map_err(StoreError::Backend)
}
