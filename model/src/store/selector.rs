use crate::query::QueryType;
use crate::selector::SelectorAction;
use sea_orm::entity::prelude::*;
use sea_orm::FromJsonQueryResult;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "selectors")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub resource_group_id: i64,
    pub priority: i64,
    pub user_regex: Option<String>,
    pub source_regex: Option<String>,
    pub query_type: Option<QueryType>,
    #[sea_orm(column_type = "JsonBinary")]
    pub client_tags: Option<ClientTags>,
    pub schema_regex: Option<String>,
    pub action: Option<SelectorAction>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::resource_group::Entity",
        from = "Column::ResourceGroupId",
        to = "super::resource_group::Column::Id",
        on_delete = "Cascade"
    )]
    ResourceGroup,
}

impl Related<super::resource_group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ResourceGroup.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Required client tags, stored as a JSON array.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromJsonQueryResult)]
pub struct ClientTags(pub Vec<String>);
