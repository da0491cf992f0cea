use crate::group::{GroupSpec, SchedulingPolicy};
use crate::query::QueryType;
use crate::selector::{SelectorAction, SelectorSpec};
use crate::store::{resource_group, selector};
use sea_orm::ActiveValue::{NotSet, Set};
use serde::{Deserialize, Serialize};

/// One consistent view of the configuration store, assembled by the
/// DAO: full-path group templates plus selectors in evaluation order
/// (priority descending, row id ascending).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub groups: Vec<GroupSpec>,
    pub selectors: Vec<SelectorSpec>,
}

/// Full row payload for inserting or replacing a group template. Row
/// ids are chosen by the administrator, mirroring how parents are
/// referenced by id.
#[derive(Clone, Debug)]
pub struct CreateResourceGroup {
    pub id: i64,
    pub name: String,
    pub parent: Option<i64>,
    pub soft_memory_limit: String,
    pub hard_memory_limit: String,
    pub max_queued: i64,
    pub hard_concurrency: i64,
    pub soft_concurrency: Option<i64>,
    pub soft_reserved_memory: Option<String>,
    pub hard_reserved_concurrency: Option<i64>,
    pub scheduling_policy: Option<SchedulingPolicy>,
    pub scheduling_weight: Option<i64>,
    pub query_priority: Option<i32>,
    pub jmx_export: Option<bool>,
    pub environment: Option<String>,
}

impl CreateResourceGroup {
    pub fn new(
        id: i64,
        name: impl Into<String>,
        soft_memory_limit: impl Into<String>,
        hard_memory_limit: impl Into<String>,
        max_queued: i64,
        hard_concurrency: i64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            parent: None,
            soft_memory_limit: soft_memory_limit.into(),
            hard_memory_limit: hard_memory_limit.into(),
            max_queued,
            hard_concurrency,
            soft_concurrency: None,
            soft_reserved_memory: None,
            hard_reserved_concurrency: None,
            scheduling_policy: None,
            scheduling_weight: None,
            query_priority: None,
            jmx_export: None,
            environment: None,
        }
    }

    pub fn parent(mut self, parent: i64) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn soft_concurrency(mut self, limit: i64) -> Self {
        self.soft_concurrency = Some(limit);
        self
    }

    pub fn soft_reserved_memory(mut self, limit: impl Into<String>) -> Self {
        self.soft_reserved_memory = Some(limit.into());
        self
    }

    pub fn hard_reserved_concurrency(mut self, slots: i64) -> Self {
        self.hard_reserved_concurrency = Some(slots);
        self
    }

    pub fn scheduling_policy(mut self, policy: SchedulingPolicy) -> Self {
        self.scheduling_policy = Some(policy);
        self
    }

    pub fn scheduling_weight(mut self, weight: i64) -> Self {
        self.scheduling_weight = Some(weight);
        self
    }

    pub fn query_priority(mut self, priority: i32) -> Self {
        self.query_priority = Some(priority);
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }
}

impl From<CreateResourceGroup> for resource_group::ActiveModel {
    fn from(req: CreateResourceGroup) -> Self {
        Self {
            id: Set(req.id),
            name: Set(req.name),
            parent: Set(req.parent),
            soft_memory_limit: Set(req.soft_memory_limit),
            hard_memory_limit: Set(req.hard_memory_limit),
            max_queued: Set(req.max_queued),
            hard_concurrency: Set(req.hard_concurrency),
            soft_concurrency: Set(req.soft_concurrency),
            soft_reserved_memory: Set(req.soft_reserved_memory),
            hard_reserved_concurrency: Set(req.hard_reserved_concurrency),
            scheduling_policy: Set(req.scheduling_policy),
            scheduling_weight: Set(req.scheduling_weight),
            query_priority: Set(req.query_priority),
            jmx_export: Set(req.jmx_export),
            environment: Set(req.environment),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CreateSelector {
    pub resource_group_id: i64,
    pub priority: i64,
    pub user_regex: Option<String>,
    pub source_regex: Option<String>,
    pub query_type: Option<QueryType>,
    pub client_tags: Vec<String>,
    pub schema_regex: Option<String>,
    pub action: SelectorAction,
}

impl CreateSelector {
    pub fn new(resource_group_id: i64, priority: i64) -> Self {
        Self {
            resource_group_id,
            priority,
            user_regex: None,
            source_regex: None,
            query_type: None,
            client_tags: Vec::new(),
            schema_regex: None,
            action: SelectorAction::Route,
        }
    }

    pub fn user_regex(mut self, pattern: impl Into<String>) -> Self {
        self.user_regex = Some(pattern.into());
        self
    }

    pub fn source_regex(mut self, pattern: impl Into<String>) -> Self {
        self.source_regex = Some(pattern.into());
        self
    }

    pub fn query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = Some(query_type);
        self
    }

    pub fn client_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn schema_regex(mut self, pattern: impl Into<String>) -> Self {
        self.schema_regex = Some(pattern.into());
        self
    }

    pub fn action(mut self, action: SelectorAction) -> Self {
        self.action = action;
        self
    }
}

impl From<CreateSelector> for selector::ActiveModel {
    fn from(req: CreateSelector) -> Self {
        let client_tags = if req.client_tags.is_empty() {
            None
        } else {
            Some(selector::ClientTags(req.client_tags))
        };
        Self {
            id: NotSet,
            resource_group_id: Set(req.resource_group_id),
            priority: Set(req.priority),
            user_regex: Set(req.user_regex),
            source_regex: Set(req.source_regex),
            query_type: Set(req.query_type),
            client_tags: Set(client_tags),
            schema_regex: Set(req.schema_regex),
            action: Set(Some(req.action)),
        }
    }
}

/// Deletion filter matching the administrative delete operation:
/// selectors are identified by target group plus their patterns.
#[derive(Clone, Debug, Default)]
pub struct DeleteSelector {
    pub resource_group_id: i64,
    pub user_regex: Option<String>,
    pub source_regex: Option<String>,
}

impl DeleteSelector {
    pub fn new(resource_group_id: i64) -> Self {
        Self {
            resource_group_id,
            ..Self::default()
        }
    }

    pub fn user_regex(mut self, pattern: impl Into<String>) -> Self {
        self.user_regex = Some(pattern.into());
        self
    }

    pub fn source_regex(mut self, pattern: impl Into<String>) -> Self {
        self.source_regex = Some(pattern.into());
        self
    }
}
