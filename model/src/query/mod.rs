pub mod query_state;

use crate::group::ResourceGroupId;
use query_state::QueryState;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use strum::{Display, EnumString};
use uuid::Uuid;

pub type QueryId = String;

/// Statement kind as reported by the planner, used by selectors to
/// route e.g. EXPLAIN traffic into its own group.
#[derive(
    Clone,
    Copy,
    Debug,
    Display,
    PartialEq,
    Eq,
    EnumIter,
    EnumString,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "query_type")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum QueryType {
    #[sea_orm(string_value = "DATA_DEFINITION")]
    DataDefinition,
    #[sea_orm(string_value = "DELETE")]
    Delete,
    #[sea_orm(string_value = "DESCRIBE")]
    Describe,
    #[sea_orm(string_value = "EXPLAIN")]
    Explain,
    #[sea_orm(string_value = "ANALYZE")]
    Analyze,
    #[sea_orm(string_value = "INSERT")]
    Insert,
    #[sea_orm(string_value = "SELECT")]
    Select,
}

/// Session attributes of one unit of work. The kernel never looks
/// inside the statement; classification runs on these fields only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySubmission {
    pub id: QueryId,
    pub user: String,
    pub source: Option<String>,
    pub client_tags: BTreeSet<String>,
    pub schema: Option<String>,
    pub query_type: Option<QueryType>,
    /// Declared maximum execution time, measured from RUNNING start.
    pub max_execution_time: Option<Duration>,
    /// Overrides the group's default query priority.
    pub priority: Option<i32>,
}

impl QuerySubmission {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user: user.into(),
            source: None,
            client_tags: BTreeSet::new(),
            schema: None,
            query_type: None,
            max_execution_time: None,
            priority: None,
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
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

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn query_type(mut self, query_type: QueryType) -> Self {
        self.query_type = Some(query_type);
        self
    }

    pub fn max_execution_time(mut self, limit: Duration) -> Self {
        self.max_execution_time = Some(limit);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// Error codes attached to the FAILED state. All are terminal.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, EnumIter, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Selector resolved to a non-leaf or nonexistent group.
    InvalidResourceGroup,
    /// Queue-depth limit hit at submission time, including the
    /// zero-concurrency "reject all" group pattern.
    QueryQueueFull,
    /// An administrative reject selector matched.
    QueryRejected,
    /// Execution-time enforcement fired after RUNNING.
    ExceededTimeLimit,
    Cancelled,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryError {
    pub code: ErrorCode,
    pub message: String,
}

impl QueryError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Externally observable status of a query, as returned by the bridge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryStatus {
    pub id: QueryId,
    pub state: QueryState,
    /// Concrete group the query was classified into, absent when
    /// classification itself failed.
    pub resource_group: Option<ResourceGroupId>,
    pub error: Option<QueryError>,
}
