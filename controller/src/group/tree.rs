//! Runtime resource-group tree: an arena of concrete group instances,
//! lazily materialized from configured templates, carrying the live
//! running/queued/memory accounting that admission decisions read.
//!
//! All counters are propagated leaf to root on every transition, so a
//! node's numbers always cover its whole subtree. The owner serializes
//! access; nothing in here locks.

use model::group::{
    GroupPathError, GroupSpec, ResourceGroupId, ResourceGroupIdTemplate, SchedulingPolicy,
};
use model::query::QueryId;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use thiserror::Error;

/// Group limits with memory quantities resolved against the configured
/// cluster memory.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedLimits {
    pub soft_memory_bytes: u64,
    pub hard_memory_bytes: u64,
    pub max_queued: u64,
    pub hard_concurrency: u64,
    pub soft_concurrency: u64,
    pub soft_reserved_memory_bytes: Option<u64>,
    pub hard_reserved_concurrency: Option<u64>,
    pub scheduling_policy: SchedulingPolicy,
    pub scheduling_weight: u64,
    pub query_priority: i32,
}

impl ResolvedLimits {
    fn from_spec(spec: &GroupSpec, cluster_memory_bytes: u64) -> Self {
        Self {
            soft_memory_bytes: spec.soft_memory_limit.resolve(cluster_memory_bytes),
            hard_memory_bytes: spec.hard_memory_limit.resolve(cluster_memory_bytes),
            max_queued: spec.max_queued,
            hard_concurrency: spec.hard_concurrency,
            soft_concurrency: spec.soft_concurrency,
            soft_reserved_memory_bytes: spec
                .soft_reserved_memory
                .map(|limit| limit.resolve(cluster_memory_bytes)),
            hard_reserved_concurrency: spec.hard_reserved_concurrency,
            scheduling_policy: spec.scheduling_policy,
            scheduling_weight: spec.scheduling_weight,
            query_priority: spec.query_priority,
        }
    }

    /// Concurrency available to queries that do not clear the
    /// reservation threshold.
    fn general_concurrency(&self) -> u64 {
        self.hard_concurrency
            .saturating_sub(self.hard_reserved_concurrency.unwrap_or(0))
    }

    /// Memory available to queries that do not clear the reservation
    /// threshold.
    fn general_memory(&self) -> u64 {
        self.hard_memory_bytes
            .saturating_sub(self.soft_reserved_memory_bytes.unwrap_or(0))
    }
}

#[derive(Debug)]
struct QueuedEntry {
    id: QueryId,
    /// Global submission sequence; drives FIFO / RECENT_QUERIES order.
    sequence: u64,
    priority: i32,
}

#[derive(Debug)]
struct RunningEntry {
    memory_bytes: u64,
}

struct Node {
    path: ResourceGroupId,
    template: ResourceGroupIdTemplate,
    limits: ResolvedLimits,
    parent: Option<usize>,
    children: BTreeMap<String, usize>,
    /// Leaf only; internal nodes aggregate via the counters below.
    queued: VecDeque<QueuedEntry>,
    running: HashMap<QueryId, RunningEntry>,
    running_count: u64,
    queued_count: u64,
    memory_usage: u64,
    /// Template vanished from configuration: limits are frozen, no new
    /// classifications arrive, the node drains and is then deleted.
    retired: bool,
}

impl Node {
    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn over_soft_limits(&self) -> bool {
        self.running_count >= self.limits.soft_concurrency
            || self.memory_usage >= self.limits.soft_memory_bytes
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MaterializeError {
    #[error("Selector resolved to unknown resource group \"{0}\"")]
    UnknownGroup(String),
    #[error("Cannot add queries to \"{0}\". It is not a leaf group.")]
    NonLeaf(String),
    #[error(transparent)]
    Expansion(#[from] GroupPathError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Too many queued queries for \"{group}\"")]
pub struct EnqueueDenied {
    pub group: ResourceGroupId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Concurrency,
    Memory,
}

/// Outcome of the leaf-to-root capacity walk, naming the first group
/// that denied and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admit,
    Deny {
        group: ResourceGroupId,
        reason: DenyReason,
    },
}

/// Observability view of one concrete group.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceGroupInfo {
    pub path: ResourceGroupId,
    pub running: u64,
    pub queued: u64,
    pub memory_usage_bytes: u64,
    pub soft_memory_limit_bytes: u64,
    pub hard_memory_limit_bytes: u64,
    pub max_queued: u64,
    pub hard_concurrency: u64,
    pub soft_concurrency: u64,
    pub scheduling_policy: SchedulingPolicy,
    pub retired: bool,
}

pub(crate) struct GroupTree {
    cluster_memory_bytes: u64,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    index: HashMap<ResourceGroupId, usize>,
    roots: BTreeMap<String, usize>,
    specs: HashMap<ResourceGroupIdTemplate, GroupSpec>,
    /// Templates that are the parent of another template; queries may
    /// not run in them.
    non_leaf: HashSet<ResourceGroupIdTemplate>,
}

impl GroupTree {
    pub fn new(cluster_memory_bytes: u64) -> Self {
        Self {
            cluster_memory_bytes,
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            roots: BTreeMap::new(),
            specs: HashMap::new(),
            non_leaf: HashSet::new(),
        }
    }

    fn node(&self, idx: usize) -> &Node {
        self.nodes[idx].as_ref().expect("Node index is live")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node {
        self.nodes[idx].as_mut().expect("Node index is live")
    }

    /// Indices from the given node up to its root, inclusive.
    fn path_indices(&self, idx: usize) -> Vec<usize> {
        let mut indices = vec![idx];
        let mut current = idx;
        while let Some(parent) = self.node(current).parent {
            indices.push(parent);
            current = parent;
        }
        indices
    }

    /// Replace the configured template set. Live instances pick up the
    /// new limits in place; instances whose template vanished are
    /// retired with frozen limits and deleted once drained. Running
    /// queries are untouched regardless of how limits moved.
    pub fn apply_snapshot(&mut self, groups: &[GroupSpec]) {
        self.specs = groups
            .iter()
            .map(|spec| (spec.id_template.clone(), spec.clone()))
            .collect();
        self.non_leaf = groups
            .iter()
            .filter_map(|spec| spec.id_template.parent())
            .collect();

        let live: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.nodes[i].is_some())
            .collect();
        for idx in live {
            let template = self.node(idx).template.clone();
            match self.specs.get(&template) {
                Some(spec) => {
                    let limits = ResolvedLimits::from_spec(spec, self.cluster_memory_bytes);
                    let node = self.node_mut(idx);
                    node.limits = limits;
                    node.retired = false;
                }
                None => self.node_mut(idx).retired = true,
            }
        }
        self.sweep_retired();
    }

    /// Lazily instantiate the concrete group (and its ancestors) for a
    /// template. Idempotent: an existing instance is returned as-is.
    pub fn materialize(
        &mut self,
        template: &ResourceGroupIdTemplate,
        user: &str,
        source: Option<&str>,
    ) -> Result<usize, MaterializeError> {
        if !self.specs.contains_key(template) {
            return Err(MaterializeError::UnknownGroup(template.to_string()));
        }
        if self.non_leaf.contains(template) {
            return Err(MaterializeError::NonLeaf(template.to_string()));
        }
        let path = template.expand(user, source)?;

        let mut parent: Option<usize> = None;
        for depth in 1..=template.depth() {
            let prefix_path = ResourceGroupId::new(path.segments()[..depth].to_vec());
            let idx = match self.index.get(&prefix_path) {
                Some(&idx) => idx,
                None => {
                    let prefix_template =
                        ResourceGroupIdTemplate::new(template.segments()[..depth].to_vec());
                    let spec = self.specs.get(&prefix_template).ok_or_else(|| {
                        MaterializeError::UnknownGroup(prefix_template.to_string())
                    })?;
                    let limits = ResolvedLimits::from_spec(spec, self.cluster_memory_bytes);
                    self.insert_node(prefix_path.clone(), prefix_template, limits, parent)
                }
            };
            parent = Some(idx);
        }
        Ok(parent.expect("Templates have at least one segment"))
    }

    fn insert_node(
        &mut self,
        path: ResourceGroupId,
        template: ResourceGroupIdTemplate,
        limits: ResolvedLimits,
        parent: Option<usize>,
    ) -> usize {
        let segment = path.leaf_name().to_owned();
        let node = Node {
            path: path.clone(),
            template,
            limits,
            parent,
            children: BTreeMap::new(),
            queued: VecDeque::new(),
            running: HashMap::new(),
            running_count: 0,
            queued_count: 0,
            memory_usage: 0,
            retired: false,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.index.insert(path, idx);
        match parent {
            Some(parent_idx) => {
                self.node_mut(parent_idx).children.insert(segment, idx);
            }
            None => {
                self.roots.insert(segment, idx);
            }
        }
        idx
    }

    pub fn resolve(&self, path: &ResourceGroupId) -> Option<usize> {
        self.index.get(path).copied()
    }

    pub fn path_of(&self, idx: usize) -> &ResourceGroupId {
        &self.node(idx).path
    }

    pub fn info(&self, idx: usize) -> ResourceGroupInfo {
        let node = self.node(idx);
        ResourceGroupInfo {
            path: node.path.clone(),
            running: node.running_count,
            queued: node.queued_count,
            memory_usage_bytes: node.memory_usage,
            soft_memory_limit_bytes: node.limits.soft_memory_bytes,
            hard_memory_limit_bytes: node.limits.hard_memory_bytes,
            max_queued: node.limits.max_queued,
            hard_concurrency: node.limits.hard_concurrency,
            soft_concurrency: node.limits.soft_concurrency,
            scheduling_policy: node.limits.scheduling_policy,
            retired: node.retired,
        }
    }

    /// Default priority for queries that did not declare one: the leaf
    /// group's configured query priority.
    pub fn default_priority(&self, leaf: usize) -> i32 {
        self.node(leaf).limits.query_priority
    }

    /// Queue-depth gate, walked leaf to root. A zero hard-concurrency
    /// group anywhere on the path can never run anything, so queueing
    /// into it is refused outright (the "reject all" pattern).
    pub fn enqueue(
        &mut self,
        leaf: usize,
        id: QueryId,
        priority: i32,
        sequence: u64,
    ) -> Result<(), EnqueueDenied> {
        debug_assert!(self.node(leaf).is_leaf(), "Queries queue at leaves only");
        for &idx in &self.path_indices(leaf) {
            let node = self.node(idx);
            if node.limits.hard_concurrency == 0 || node.queued_count >= node.limits.max_queued {
                return Err(EnqueueDenied {
                    group: node.path.clone(),
                });
            }
        }
        self.node_mut(leaf).queued.push_back(QueuedEntry {
            id,
            sequence,
            priority,
        });
        for idx in self.path_indices(leaf) {
            self.node_mut(idx).queued_count += 1;
        }
        Ok(())
    }

    /// Remove a queued query without admitting it (cancellation). No
    /// running counters are touched; the query never held capacity.
    pub fn remove_queued(&mut self, leaf: usize, id: &QueryId) -> bool {
        let Some(pos) = self.node(leaf).queued.iter().position(|entry| entry.id == *id) else {
            return false;
        };
        self.node_mut(leaf).queued.remove(pos);
        for idx in self.path_indices(leaf) {
            let node = self.node_mut(idx);
            debug_assert!(node.queued_count > 0, "Queued counter underflow");
            node.queued_count = node.queued_count.saturating_sub(1);
        }
        self.sweep_retired_path(leaf);
        true
    }

    /// Leaf-to-root capacity walk for one query, short-circuiting at
    /// the first group that denies and naming the reason.
    pub fn can_admit(&self, leaf: usize, priority: i32) -> AdmissionVerdict {
        for &idx in &self.path_indices(leaf) {
            let node = self.node(idx);
            let clears_reserve = priority > node.limits.query_priority;
            let (concurrency_limit, memory_limit) = if clears_reserve {
                (node.limits.hard_concurrency, node.limits.hard_memory_bytes)
            } else {
                (node.limits.general_concurrency(), node.limits.general_memory())
            };
            if node.running_count >= concurrency_limit {
                return AdmissionVerdict::Deny {
                    group: node.path.clone(),
                    reason: DenyReason::Concurrency,
                };
            }
            if node.memory_usage >= memory_limit {
                return AdmissionVerdict::Deny {
                    group: node.path.clone(),
                    reason: DenyReason::Memory,
                };
            }
        }
        AdmissionVerdict::Admit
    }

    /// Admit the next query according to the per-group scheduling
    /// policies, or return `None` when no queued query fits anywhere.
    pub fn start_next(&mut self) -> Option<(QueryId, usize)> {
        let roots: Vec<usize> = self.roots.values().copied().collect();
        for root in roots {
            if let Some((leaf, pos)) = self.find_admissible(root, None) {
                let id = self.admit_at(leaf, pos);
                return Some((id, leaf));
            }
        }
        None
    }

    /// Descend from `idx` towards a leaf with an admissible queued
    /// query. `floor` carries the minimum priority imposed by
    /// ancestors whose remaining capacity is reserved.
    fn find_admissible(&self, idx: usize, floor: Option<i32>) -> Option<(usize, usize)> {
        let node = self.node(idx);
        if node.queued_count == 0 {
            return None;
        }
        if node.running_count >= node.limits.hard_concurrency
            || node.memory_usage >= node.limits.hard_memory_bytes
        {
            return None;
        }
        let general_open = node.running_count < node.limits.general_concurrency()
            && node.memory_usage < node.limits.general_memory();
        let floor = if general_open {
            floor
        } else {
            // Only the reserve is open here: admissible queries must
            // clear this group's priority threshold.
            Some(floor.unwrap_or(i32::MIN).max(node.limits.query_priority + 1))
        };

        if node.is_leaf() {
            return self.pick_queued(idx, floor).map(|pos| (idx, pos));
        }
        for child in self.order_children(idx) {
            if let Some(found) = self.find_admissible(child, floor) {
                return Some(found);
            }
        }
        None
    }

    /// Position of the next queued entry per the leaf's policy, among
    /// entries clearing the priority floor.
    fn pick_queued(&self, leaf: usize, floor: Option<i32>) -> Option<usize> {
        let node = self.node(leaf);
        let eligible = node
            .queued
            .iter()
            .enumerate()
            .filter(|(_, entry)| floor.is_none_or(|floor| entry.priority >= floor));
        match node.limits.scheduling_policy {
            SchedulingPolicy::RecentQueries => {
                eligible.max_by_key(|(_, entry)| entry.sequence).map(|(pos, _)| pos)
            }
            SchedulingPolicy::Fifo | SchedulingPolicy::WeightedFair => {
                eligible.min_by_key(|(_, entry)| entry.sequence).map(|(pos, _)| pos)
            }
        }
    }

    /// Children with queued work, in the order this node's policy wants
    /// them tried. Subtrees over their soft limits come last: soft
    /// limits steer preference, they never block.
    fn order_children(&self, idx: usize) -> Vec<usize> {
        let node = self.node(idx);
        let mut candidates: Vec<usize> = node
            .children
            .values()
            .copied()
            .filter(|&child| self.node(child).queued_count > 0)
            .collect();

        match node.limits.scheduling_policy {
            SchedulingPolicy::Fifo => {
                candidates.sort_by_key(|&child| self.subtree_min_sequence(child));
            }
            SchedulingPolicy::RecentQueries => {
                candidates.sort_by_key(|&child| Reverse(self.subtree_max_sequence(child)));
            }
            SchedulingPolicy::WeightedFair => {
                candidates.sort_by(|&a, &b| {
                    let (a, b) = (self.node(a), self.node(b));
                    // Lowest running/weight utilization first.
                    let utilization = (a.running_count * b.limits.scheduling_weight)
                        .cmp(&(b.running_count * a.limits.scheduling_weight));
                    utilization
                        .then(b.limits.scheduling_weight.cmp(&a.limits.scheduling_weight))
                        .then(a.path.cmp(&b.path))
                });
            }
        }
        // Stable: keeps the policy order within each partition.
        candidates.sort_by_key(|&child| self.node(child).over_soft_limits());
        candidates
    }

    fn subtree_min_sequence(&self, idx: usize) -> u64 {
        let node = self.node(idx);
        if node.is_leaf() {
            node.queued.iter().map(|e| e.sequence).min().unwrap_or(u64::MAX)
        } else {
            node.children
                .values()
                .map(|&child| self.subtree_min_sequence(child))
                .min()
                .unwrap_or(u64::MAX)
        }
    }

    fn subtree_max_sequence(&self, idx: usize) -> u64 {
        let node = self.node(idx);
        if node.is_leaf() {
            node.queued.iter().map(|e| e.sequence).max().unwrap_or(0)
        } else {
            node.children
                .values()
                .map(|&child| self.subtree_max_sequence(child))
                .max()
                .unwrap_or(0)
        }
    }

    fn admit_at(&mut self, leaf: usize, pos: usize) -> QueryId {
        let entry = self
            .node_mut(leaf)
            .queued
            .remove(pos)
            .expect("Picked position is in range");
        for idx in self.path_indices(leaf) {
            let node = self.node_mut(idx);
            node.queued_count = node.queued_count.saturating_sub(1);
            node.running_count += 1;
        }
        self.node_mut(leaf)
            .running
            .insert(entry.id.clone(), RunningEntry { memory_bytes: 0 });
        entry.id
    }

    /// Release the capacity held by a running query (completion,
    /// failure, or cancellation) and propagate upward.
    pub fn complete(&mut self, leaf: usize, id: &QueryId) -> bool {
        let Some(entry) = self.node_mut(leaf).running.remove(id) else {
            return false;
        };
        for idx in self.path_indices(leaf) {
            let node = self.node_mut(idx);
            debug_assert!(node.running_count > 0, "Running counter underflow");
            node.running_count = node.running_count.saturating_sub(1);
            node.memory_usage = node.memory_usage.saturating_sub(entry.memory_bytes);
        }
        self.sweep_retired_path(leaf);
        true
    }

    /// Asynchronous usage telemetry from the execution engine.
    pub fn update_memory(&mut self, leaf: usize, id: &QueryId, bytes: u64) -> bool {
        let Some(entry) = self.node_mut(leaf).running.get_mut(id) else {
            return false;
        };
        let previous = entry.memory_bytes;
        entry.memory_bytes = bytes;
        for idx in self.path_indices(leaf) {
            let node = self.node_mut(idx);
            node.memory_usage = node.memory_usage.saturating_sub(previous) + bytes;
        }
        true
    }

    /// Delete drained retired nodes along one leaf-to-root path.
    fn sweep_retired_path(&mut self, leaf: usize) {
        let mut current = Some(leaf);
        while let Some(idx) = current {
            let node = self.node(idx);
            let parent = node.parent;
            if !node.retired
                || !node.children.is_empty()
                || node.running_count > 0
                || node.queued_count > 0
            {
                break;
            }
            self.remove_node(idx);
            current = parent;
        }
    }

    /// Delete every drained retired node, bottom-up.
    fn sweep_retired(&mut self) {
        loop {
            let removable: Vec<usize> = (0..self.nodes.len())
                .filter(|&idx| {
                    self.nodes[idx].as_ref().is_some_and(|node| {
                        node.retired
                            && node.children.is_empty()
                            && node.running_count == 0
                            && node.queued_count == 0
                    })
                })
                .collect();
            if removable.is_empty() {
                return;
            }
            for idx in removable {
                self.remove_node(idx);
            }
        }
    }

    fn remove_node(&mut self, idx: usize) {
        let node = self.nodes[idx].take().expect("Node index is live");
        self.index.remove(&node.path);
        let segment = node.path.leaf_name();
        match node.parent {
            Some(parent_idx) => {
                self.node_mut(parent_idx).children.remove(segment);
            }
            None => {
                self.roots.remove(segment);
            }
        }
        self.free.push(idx);
    }
}
