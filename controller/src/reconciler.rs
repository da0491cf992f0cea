//! Periodic reconciliation of the live kernel against the external
//! configuration store: fetch a snapshot (no kernel lock held), then
//! apply it as one atomic generation swap.

use crate::scheduler::Scheduler;
use crate::selector::SelectorCompileError;
use async_trait::async_trait;
use catalog::{ConfigStore, NotifiableStore};
use model::config::ConfigSnapshot;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

const RECONCILE_POLLING_DURATION: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
#[error("Failed to fetch configuration snapshot: {0}")]
pub struct ConfigurationError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl ConfigurationError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(err))
    }
}

/// The external configuration collaborator, reduced to the one read
/// the kernel performs.
#[async_trait]
pub trait ConfigurationSource: Send + Sync {
    async fn fetch_snapshot(&self) -> Result<ConfigSnapshot, ConfigurationError>;

    /// Edge-triggered change hint. Sources without one are covered by
    /// the polling interval alone.
    fn subscribe(&self) -> watch::Receiver<()>;
}

#[async_trait]
impl ConfigurationSource for ConfigStore {
    async fn fetch_snapshot(&self) -> Result<ConfigSnapshot, ConfigurationError> {
        ConfigStore::fetch_snapshot(self)
            .await
            .map_err(ConfigurationError::new)
    }

    fn subscribe(&self) -> watch::Receiver<()> {
        self.subscribe_intent()
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Fetch(#[from] ConfigurationError),
    #[error("Rejected configuration snapshot: {0}")]
    Apply(#[from] SelectorCompileError),
}

pub struct Reconciler {
    source: Arc<dyn ConfigurationSource>,
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(source: Arc<dyn ConfigurationSource>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Self::with_interval(source, scheduler, RECONCILE_POLLING_DURATION)
    }

    pub fn with_interval(
        source: Arc<dyn ConfigurationSource>,
        scheduler: Arc<Scheduler>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            source,
            scheduler,
            interval,
        })
    }

    /// One explicit reconciliation cycle. Fetch may suspend on store
    /// I/O; no tree or selector lock is held until the fast apply step.
    pub async fn load(&self) -> Result<(), ReconcileError> {
        let snapshot = self.source.fetch_snapshot().await?;
        self.scheduler.apply_snapshot(&snapshot)?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let mut intent = self.source.subscribe();
        info!("Starting");
        self.try_load().await;

        loop {
            if let Ok(result) = tokio::time::timeout(self.interval, intent.changed()).await {
                result.expect("Configuration intent channel closed unexpectedly")
            }
            self.try_load().await;
        }
    }

    async fn try_load(&self) {
        // A failed cycle is logged and skipped; the previous snapshot
        // stays fully in effect.
        if let Err(err) = self.load().await {
            warn!("Reconciliation failed: {err}");
        }
    }
}
