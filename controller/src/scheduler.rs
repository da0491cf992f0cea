//! Admission and queueing controller. One coarse lock guards the whole
//! tree (admission walks cross arbitrary groups root-to-leaf, so
//! per-node locking buys nothing here); the selector set lives beside
//! it as an immutable snapshot behind an atomic swap, so classification
//! reads never block on reconciliation and never see a torn rule set.

use crate::group::tree::{AdmissionVerdict, GroupTree, ResourceGroupInfo};
use crate::selector::{SelectorCompileError, SelectorIndex};
use model::config::ConfigSnapshot;
use model::group::ResourceGroupId;
use model::query::{ErrorCode, QueryError, QueryId, QuerySubmission};
use model::selector::SelectorAction;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Total memory the percentage-based group limits resolve against.
    pub cluster_memory_bytes: u64,
    /// Cap on queued queries across all groups; 0 disables the cap.
    pub max_queued_queries: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            cluster_memory_bytes: 8 << 30,
            max_queued_queries: 0,
        }
    }
}

/// A query the last scheduling tick moved to RUNNING.
#[derive(Debug, Clone, PartialEq)]
pub struct Admitted {
    pub id: QueryId,
    pub group: ResourceGroupId,
}

struct Location {
    leaf: usize,
    queued: bool,
}

struct TreeState {
    tree: GroupTree,
    locations: HashMap<QueryId, Location>,
    next_sequence: u64,
    total_queued: u64,
}

pub struct Scheduler {
    config: SchedulerConfig,
    state: Mutex<TreeState>,
    selectors: RwLock<Arc<SelectorIndex>>,
    wakeup_tx: watch::Sender<()>,
    wakeup_rx: watch::Receiver<()>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let (wakeup_tx, wakeup_rx) = watch::channel(());
        Arc::new(Self {
            state: Mutex::new(TreeState {
                tree: GroupTree::new(config.cluster_memory_bytes),
                locations: HashMap::new(),
                next_sequence: 0,
                total_queued: 0,
            }),
            config,
            selectors: RwLock::new(Arc::new(SelectorIndex::empty())),
            wakeup_tx,
            wakeup_rx,
        })
    }

    /// Classify and enqueue one submission. Bounded work: no I/O, no
    /// waiting for admission. Failures come back as the terminal error
    /// the bridge attaches to the FAILED state.
    pub fn submit(&self, submission: &QuerySubmission) -> Result<ResourceGroupId, QueryError> {
        // Classification runs against one immutable selector generation.
        let index = self.selectors.read().clone();
        let selector = index.classify(submission).map_err(|err| {
            QueryError::new(ErrorCode::InvalidResourceGroup, err.to_string())
        })?;
        if selector.action == SelectorAction::Reject {
            return Err(QueryError::new(
                ErrorCode::QueryRejected,
                format!("Query rejected by administrative policy (selector {})", selector.id),
            ));
        }

        let mut state = self.state.lock();
        if self.config.max_queued_queries > 0
            && state.total_queued >= self.config.max_queued_queries
        {
            return Err(QueryError::new(
                ErrorCode::QueryQueueFull,
                "Too many queued queries",
            ));
        }

        let leaf = state
            .tree
            .materialize(
                &selector.group_template,
                &submission.user,
                submission.source.as_deref(),
            )
            .map_err(|err| QueryError::new(ErrorCode::InvalidResourceGroup, err.to_string()))?;
        let priority = submission
            .priority
            .unwrap_or_else(|| state.tree.default_priority(leaf));
        let sequence = state.next_sequence;
        state.next_sequence += 1;

        state
            .tree
            .enqueue(leaf, submission.id.clone(), priority, sequence)
            .map_err(|err| QueryError::new(ErrorCode::QueryQueueFull, err.to_string()))?;
        let path = state.tree.path_of(leaf).clone();
        state.locations.insert(
            submission.id.clone(),
            Location { leaf, queued: true },
        );
        state.total_queued += 1;
        debug!(query = %submission.id, group = %path, "Queued");
        Ok(path)
    }

    /// Admit queued queries in policy order until capacity is
    /// exhausted. Triggered by the bridge on submission, completion,
    /// telemetry, and reconciliation.
    pub fn tick(&self) -> Vec<Admitted> {
        let mut state = self.state.lock();
        let mut admitted = Vec::new();
        while let Some((id, leaf)) = state.tree.start_next() {
            let group = state.tree.path_of(leaf).clone();
            if let Some(location) = state.locations.get_mut(&id) {
                location.queued = false;
            }
            state.total_queued = state.total_queued.saturating_sub(1);
            debug!(query = %id, group = %group, "Admitted");
            admitted.push(Admitted { id, group });
        }
        admitted
    }

    /// Release the capacity of a running query. Returns false when the
    /// query is unknown or still queued.
    pub fn complete(&self, id: &QueryId) -> bool {
        let mut state = self.state.lock();
        let Some(location) = state.locations.get(id) else {
            return false;
        };
        if location.queued {
            return false;
        }
        let leaf = location.leaf;
        let released = state.tree.complete(leaf, id);
        debug_assert!(released, "Location map and tree agree on running queries");
        state.locations.remove(id);
        drop(state);
        self.notify();
        released
    }

    /// Drop a queued query without side effects on running counters.
    pub fn cancel_queued(&self, id: &QueryId) -> bool {
        let mut state = self.state.lock();
        let Some(location) = state.locations.get(id) else {
            return false;
        };
        if !location.queued {
            return false;
        }
        let leaf = location.leaf;
        let removed = state.tree.remove_queued(leaf, id);
        debug_assert!(removed, "Location map and tree agree on queued queries");
        state.locations.remove(id);
        state.total_queued = state.total_queued.saturating_sub(1);
        removed
    }

    /// Asynchronous memory telemetry for a running query.
    pub fn update_memory(&self, id: &QueryId, bytes: u64) -> bool {
        let mut state = self.state.lock();
        let Some(location) = state.locations.get(id) else {
            return false;
        };
        if location.queued {
            return false;
        }
        let leaf = location.leaf;
        state.tree.update_memory(leaf, id, bytes)
    }

    /// Capacity walk verdict for a concrete group, for observability
    /// and tests.
    pub fn can_admit(&self, path: &ResourceGroupId, priority: i32) -> Option<AdmissionVerdict> {
        let state = self.state.lock();
        let leaf = state.tree.resolve(path)?;
        Some(state.tree.can_admit(leaf, priority))
    }

    pub fn group_info(&self, path: &ResourceGroupId) -> Option<ResourceGroupInfo> {
        let state = self.state.lock();
        let idx = state.tree.resolve(path)?;
        Some(state.tree.info(idx))
    }

    pub fn selector_count(&self) -> usize {
        self.selectors.read().len()
    }

    /// Swap in a new configuration generation. The selector set is
    /// compiled before any state changes, so a bad snapshot leaves both
    /// the rules and the tree untouched.
    pub fn apply_snapshot(&self, snapshot: &ConfigSnapshot) -> Result<(), SelectorCompileError> {
        let index = SelectorIndex::compile(&snapshot.selectors)?;
        {
            let mut state = self.state.lock();
            state.tree.apply_snapshot(&snapshot.groups);
        }
        *self.selectors.write() = Arc::new(index);
        self.notify();
        Ok(())
    }

    /// Fires whenever capacity may have been freed or configuration
    /// changed; the bridge runs a scheduling tick on each signal.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.wakeup_rx.clone()
    }

    fn notify(&self) {
        self.wakeup_tx
            .send(())
            .expect("Receiver is owned and should therefore be alive");
    }
}
