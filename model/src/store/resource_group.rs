use crate::group::SchedulingPolicy;
use sea_orm::entity::prelude::*;

/// One configured group template. `name` is a single path segment
/// (possibly templated, e.g. `user-${USER}`); the full path is the
/// chain of `parent` links up to a root row.
#[derive(Debug, Clone, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "resource_groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
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

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::selector::Entity")]
    Selector,
    #[sea_orm(belongs_to = "Entity", from = "Column::Parent", to = "Column::Id")]
    ParentGroup,
}

impl Related<super::selector::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Selector.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
