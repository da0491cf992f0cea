use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectOptions, DatabaseConnection, DbErr};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{ExponentialBackoff, jitter};

pub enum StateBackend {
    Memory,
    Sqlite {
        endpoint: String,
        opts: ConnectOptions,
    },
    Postgres {
        endpoint: String,
        opts: ConnectOptions,
    },
}

#[derive(Clone)]
pub struct State {
    pub conn: DatabaseConnection,
    pub endpoint: String,
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
}

impl State {
    pub async fn with(backend: StateBackend) -> Result<Self, StateError> {
        const MAX_DURATION: Duration = Duration::new(u64::MAX / 4, 0);

        match backend {
            StateBackend::Memory => {
                const IN_MEMORY_DB: &str = "sqlite::memory:";

                let conn = sea_orm::Database::connect(
                    ConnectOptions::new(IN_MEMORY_DB)
                        .min_connections(1)
                        .max_connections(1)
                        .acquire_timeout(MAX_DURATION)
                        .connect_timeout(MAX_DURATION)
                        .to_owned(),
                )
                .await?;
                Ok(Self {
                    conn,
                    endpoint: IN_MEMORY_DB.to_owned(),
                })
            }
            StateBackend::Sqlite { endpoint, opts } | StateBackend::Postgres { endpoint, opts } => {
                let conn = sea_orm::Database::connect(opts).await?;
                Ok(Self { conn, endpoint })
            }
        }
    }

    /// Fresh in-memory store with migrations applied. Test helper,
    /// also used by downstream crates' integration tests.
    pub async fn for_test() -> Self {
        let this = Self::with(StateBackend::Memory).await.unwrap();
        Migrator::up(&this.conn, None).await.unwrap();
        this
    }

    pub async fn migrate(&self) -> Result<(), StateError> {
        Migrator::up(&self.conn, None).await?;
        Ok(())
    }

    /// Transient connection failures are worth retrying; everything
    /// else (constraint violations, malformed queries) is not.
    pub fn should_retry(err: &DbErr) -> bool {
        matches!(
            err,
            DbErr::Conn(_) | DbErr::ConnectionAcquire(_) | DbErr::Exec(_)
        )
    }

    pub fn retry_strategy() -> impl Iterator<Item = Duration> {
        const DB_BASE_RETRY_DURATION: u64 = 50;
        const DB_MAX_RETRIES: usize = 5;

        ExponentialBackoff::from_millis(DB_BASE_RETRY_DURATION)
            .map(jitter)
            .take(DB_MAX_RETRIES)
    }
}
