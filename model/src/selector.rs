use crate::group::ResourceGroupIdTemplate;
use crate::query::QueryType;
use sea_orm::{DeriveActiveEnum, EnumIter};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// What a matching selector does with the query.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    PartialEq,
    Eq,
    EnumIter,
    EnumString,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "Enum", enum_name = "selector_action")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SelectorAction {
    /// Route the query into the selector's target group.
    #[default]
    #[sea_orm(string_value = "route")]
    Route,
    /// Administrative reject rule: fail the query outright.
    #[sea_orm(string_value = "reject")]
    Reject,
}

/// One routing rule, with the target path template already assembled
/// from the store's parent chain.
///
/// Selectors are evaluated in descending `priority` order, ties broken
/// by `id` (insertion order); the first match wins. Regex patterns are
/// matched as written — case-insensitivity is opted into per pattern
/// via `(?i)`, never imposed globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorSpec {
    /// Store row id; also the priority tie-breaker.
    pub id: i64,
    /// Store row id of the target group.
    pub group_id: i64,
    pub group_template: ResourceGroupIdTemplate,
    pub priority: i64,
    pub user_regex: Option<String>,
    pub source_regex: Option<String>,
    pub query_type: Option<QueryType>,
    /// Every listed tag must be present on the submission.
    pub client_tags: Vec<String>,
    pub schema_regex: Option<String>,
    pub action: SelectorAction,
}
