use crate::{assert_not_has_tables, drop_tables};
use model::group::SchedulingPolicy;
use model::selector::SelectorAction;
use sea_orm::DbBackend;
use sea_orm::Iterable;
use sea_orm_migration::prelude::{Index as MigrationIndex, Table as MigrationTable, *};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        assert_not_has_tables!(manager, ResourceGroups, Selectors);

        if manager.get_database_backend() == DbBackend::Sqlite {
            manager
                .get_connection()
                .execute_unprepared("PRAGMA foreign_keys = ON")
                .await
                .expect("failed to set foreign key enforcement");
        }

        manager
            .create_table(
                MigrationTable::create()
                    .table(ResourceGroups::Table)
                    .col(
                        ColumnDef::new(ResourceGroups::Id)
                            .big_integer()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ResourceGroups::Name).string().not_null())
                    .col(ColumnDef::new(ResourceGroups::Parent).big_integer())
                    .col(
                        ColumnDef::new(ResourceGroups::SoftMemoryLimit)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResourceGroups::HardMemoryLimit)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ResourceGroups::MaxQueued)
                            .big_integer()
                            .not_null()
                            .check(Expr::col(ResourceGroups::MaxQueued).gte(0)),
                    )
                    .col(
                        ColumnDef::new(ResourceGroups::HardConcurrency)
                            .big_integer()
                            .not_null()
                            .check(Expr::col(ResourceGroups::HardConcurrency).gte(0)),
                    )
                    .col(ColumnDef::new(ResourceGroups::SoftConcurrency).big_integer())
                    .col(ColumnDef::new(ResourceGroups::SoftReservedMemory).string())
                    .col(
                        ColumnDef::new(ResourceGroups::HardReservedConcurrency)
                            .big_integer()
                            .check(Expr::col(ResourceGroups::HardReservedConcurrency).gte(0)),
                    )
                    .col(
                        ColumnDef::new(ResourceGroups::SchedulingPolicy)
                            .string()
                            .check(
                                Expr::col(ResourceGroups::SchedulingPolicy).is_in(
                                    SchedulingPolicy::iter()
                                        .map(|p| p.to_string())
                                        .collect::<Vec<_>>(),
                                ),
                            ),
                    )
                    .col(
                        ColumnDef::new(ResourceGroups::SchedulingWeight)
                            .big_integer()
                            .check(Expr::col(ResourceGroups::SchedulingWeight).gte(1)),
                    )
                    .col(ColumnDef::new(ResourceGroups::QueryPriority).integer())
                    .col(ColumnDef::new(ResourceGroups::JmxExport).boolean())
                    .col(ColumnDef::new(ResourceGroups::Environment).string())
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_resource_groups_parent")
                            .from(ResourceGroups::Table, ResourceGroups::Parent)
                            .to(ResourceGroups::Table, ResourceGroups::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                MigrationTable::create()
                    .table(Selectors::Table)
                    .col(
                        ColumnDef::new(Selectors::Id)
                            .big_integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Selectors::ResourceGroupId)
                            .big_integer()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Selectors::Priority).big_integer().not_null())
                    .col(ColumnDef::new(Selectors::UserRegex).string())
                    .col(ColumnDef::new(Selectors::SourceRegex).string())
                    .col(ColumnDef::new(Selectors::QueryType).string())
                    .col(ColumnDef::new(Selectors::ClientTags).json_binary())
                    .col(ColumnDef::new(Selectors::SchemaRegex).string())
                    .col(
                        ColumnDef::new(Selectors::Action).string().check(
                            Expr::col(Selectors::Action).is_in(
                                SelectorAction::iter()
                                    .map(|a| a.to_string())
                                    .collect::<Vec<_>>(),
                            ),
                        ),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_selectors_resource_group")
                            .from(Selectors::Table, Selectors::ResourceGroupId)
                            .to(ResourceGroups::Table, ResourceGroups::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                MigrationIndex::create()
                    .name("idx_selectors_resource_group_id")
                    .table(Selectors::Table)
                    .col(Selectors::ResourceGroupId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        drop_tables!(manager, Selectors, ResourceGroups);
        Ok(())
    }
}

#[derive(DeriveIden)]
enum ResourceGroups {
    Table,
    Id,
    Name,
    Parent,
    SoftMemoryLimit,
    HardMemoryLimit,
    MaxQueued,
    HardConcurrency,
    SoftConcurrency,
    SoftReservedMemory,
    HardReservedConcurrency,
    SchedulingPolicy,
    SchedulingWeight,
    QueryPriority,
    JmxExport,
    Environment,
}

#[derive(DeriveIden)]
enum Selectors {
    Table,
    Id,
    ResourceGroupId,
    Priority,
    UserRegex,
    SourceRegex,
    QueryType,
    ClientTags,
    SchemaRegex,
    Action,
}
