use crate::database::State;
use crate::notification::{IntentChannel, NotifiableStore};
use crate::snapshot::{self, SnapshotError};
use model::config::{ConfigSnapshot, CreateResourceGroup, CreateSelector, DeleteSelector};
use model::store::{resource_group, selector};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, QueryFilter, QueryOrder,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_retry::RetryIf;

#[derive(Error, Debug)]
pub enum ConfigStoreError {
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("Malformed configuration: {0}")]
    Malformed(#[from] SnapshotError),
}

/// Narrow DAO over the external configuration store. Administrative
/// mutations live here; the kernel itself only ever calls
/// [`ConfigStore::fetch_snapshot`].
pub struct ConfigStore {
    db: State,
    environment: String,
    intent: IntentChannel,
}

impl ConfigStore {
    pub fn new(db: State, environment: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            db,
            environment: environment.into(),
            intent: IntentChannel::new(),
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub async fn insert_resource_group(
        &self,
        req: CreateResourceGroup,
    ) -> Result<resource_group::Model, ConfigStoreError> {
        let model = resource_group::ActiveModel::from(req)
            .insert(&self.db.conn)
            .await?;
        self.intent.notify_intent();
        Ok(model)
    }

    /// Full-row replace keyed by `req.id`, mirroring the insert payload.
    pub async fn update_resource_group(
        &self,
        req: CreateResourceGroup,
    ) -> Result<resource_group::Model, ConfigStoreError> {
        let updated = resource_group::ActiveModel::from(req)
            .update(&self.db.conn)
            .await?;
        self.intent.notify_intent();
        Ok(updated)
    }

    /// Deletes the group row; its selectors go with it (FK cascade).
    pub async fn delete_resource_group(&self, id: i64) -> Result<(), ConfigStoreError> {
        resource_group::Entity::delete_by_id(id)
            .exec(&self.db.conn)
            .await?;
        self.intent.notify_intent();
        Ok(())
    }

    pub async fn insert_selector(
        &self,
        req: CreateSelector,
    ) -> Result<selector::Model, ConfigStoreError> {
        let model = selector::ActiveModel::from(req)
            .insert(&self.db.conn)
            .await?;
        self.intent.notify_intent();
        Ok(model)
    }

    /// Deletes selectors identified by target group and exact patterns
    /// (absent pattern matches NULL, not "anything").
    pub async fn delete_selector(&self, req: DeleteSelector) -> Result<u64, ConfigStoreError> {
        let pattern_condition = |column: selector::Column, pattern: Option<String>| match pattern {
            Some(pattern) => column.eq(pattern),
            None => column.is_null(),
        };
        let condition = Condition::all()
            .add(selector::Column::ResourceGroupId.eq(req.resource_group_id))
            .add(pattern_condition(selector::Column::UserRegex, req.user_regex))
            .add(pattern_condition(
                selector::Column::SourceRegex,
                req.source_regex,
            ));

        let result = selector::Entity::delete_many()
            .filter(condition)
            .exec(&self.db.conn)
            .await?;
        self.intent.notify_intent();
        Ok(result.rows_affected)
    }

    pub async fn get_resource_groups(
        &self,
    ) -> Result<Vec<resource_group::Model>, ConfigStoreError> {
        resource_group::Entity::find()
            .order_by_asc(resource_group::Column::Id)
            .all(&self.db.conn)
            .await
            .map_err(Into::into)
    }

    pub async fn get_selectors(&self) -> Result<Vec<selector::Model>, ConfigStoreError> {
        selector::Entity::find()
            .order_by_asc(selector::Column::Id)
            .all(&self.db.conn)
            .await
            .map_err(Into::into)
    }

    /// One consistent view of the whole configuration. Reads retry on
    /// transient connection errors; assembly failures surface as
    /// [`ConfigStoreError::Malformed`] and leave nothing applied.
    pub async fn fetch_snapshot(&self) -> Result<ConfigSnapshot, ConfigStoreError> {
        let groups = RetryIf::spawn(
            State::retry_strategy(),
            || {
                resource_group::Entity::find()
                    .order_by_asc(resource_group::Column::Id)
                    .all(&self.db.conn)
            },
            State::should_retry,
        )
        .await?;
        let selectors = RetryIf::spawn(
            State::retry_strategy(),
            || {
                selector::Entity::find()
                    .order_by_asc(selector::Column::Id)
                    .all(&self.db.conn)
            },
            State::should_retry,
        )
        .await?;

        snapshot::assemble(groups, selectors, &self.environment).map_err(Into::into)
    }
}

impl NotifiableStore for ConfigStore {
    fn subscribe_intent(&self) -> watch::Receiver<()> {
        self.intent.subscribe_intent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_prop;
    use model::group::SchedulingPolicy;
    use model::query::QueryType;
    use model::selector::SelectorAction;
    use model::testing::{arb_create_selector, arb_resource_group_forest};
    use proptest::prelude::*;
    use std::collections::HashSet;

    const TEST_ENVIRONMENT: &str = "test";

    async fn test_store() -> Arc<ConfigStore> {
        ConfigStore::new(State::for_test().await, TEST_ENVIRONMENT)
    }

    fn dashboard_tree() -> Vec<CreateResourceGroup> {
        vec![
            CreateResourceGroup::new(1, "global", "1MB", "10MB", 100, 100),
            CreateResourceGroup::new(2, "user-${USER}", "1MB", "10MB", 3, 3)
                .parent(1)
                .scheduling_policy(SchedulingPolicy::RecentQueries),
            CreateResourceGroup::new(3, "dashboard-${USER}", "1MB", "10MB", 1, 1)
                .parent(2)
                .scheduling_policy(SchedulingPolicy::RecentQueries),
        ]
    }

    #[tokio::test]
    async fn insert_and_fetch_assembles_paths() {
        let store = test_store().await;
        for group in dashboard_tree() {
            store.insert_resource_group(group).await.unwrap();
        }
        store
            .insert_selector(
                CreateSelector::new(3, 10).source_regex("(?i).*dashboard.*"),
            )
            .await
            .unwrap();

        let snapshot = store.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.groups.len(), 3);
        assert_eq!(
            snapshot.groups[2].id_template.to_string(),
            "global.user-${USER}.dashboard-${USER}"
        );
        assert_eq!(snapshot.selectors.len(), 1);
        assert_eq!(
            snapshot.selectors[0].group_template.to_string(),
            "global.user-${USER}.dashboard-${USER}"
        );
        assert_eq!(
            snapshot.selectors[0].source_regex.as_deref(),
            Some("(?i).*dashboard.*")
        );
    }

    #[tokio::test]
    async fn update_replaces_limits_in_next_snapshot() {
        let store = test_store().await;
        for group in dashboard_tree() {
            store.insert_resource_group(group).await.unwrap();
        }

        let before = store.fetch_snapshot().await.unwrap();
        assert_eq!(before.groups[2].hard_concurrency, 1);

        store
            .update_resource_group(
                CreateResourceGroup::new(3, "dashboard-${USER}", "1MB", "10MB", 1, 2)
                    .parent(2)
                    .scheduling_policy(SchedulingPolicy::RecentQueries),
            )
            .await
            .unwrap();

        let after = store.fetch_snapshot().await.unwrap();
        assert_eq!(after.groups[2].hard_concurrency, 2);
    }

    #[tokio::test]
    async fn selectors_are_ordered_by_priority_then_insertion() {
        let store = test_store().await;
        store
            .insert_resource_group(CreateResourceGroup::new(1, "global", "1MB", "10MB", 10, 10))
            .await
            .unwrap();

        store
            .insert_selector(CreateSelector::new(1, 10).user_regex("low"))
            .await
            .unwrap();
        store
            .insert_selector(CreateSelector::new(1, 200).user_regex("high"))
            .await
            .unwrap();
        store
            .insert_selector(CreateSelector::new(1, 200).user_regex("high-later"))
            .await
            .unwrap();

        let snapshot = store.fetch_snapshot().await.unwrap();
        let users: Vec<_> = snapshot
            .selectors
            .iter()
            .map(|s| s.user_regex.as_deref().unwrap())
            .collect();
        assert_eq!(users, vec!["high", "high-later", "low"]);
    }

    #[tokio::test]
    async fn deleting_a_group_cascades_to_its_selectors() {
        let store = test_store().await;
        store
            .insert_resource_group(CreateResourceGroup::new(1, "global", "1MB", "10MB", 10, 10))
            .await
            .unwrap();
        store
            .insert_selector(CreateSelector::new(1, 10))
            .await
            .unwrap();

        store.delete_resource_group(1).await.unwrap();
        assert!(store.get_selectors().await.unwrap().is_empty());
        assert!(store.fetch_snapshot().await.unwrap().groups.is_empty());
    }

    #[tokio::test]
    async fn delete_selector_matches_exact_patterns() {
        let store = test_store().await;
        store
            .insert_resource_group(CreateResourceGroup::new(4, "adhoc", "1MB", "10MB", 10, 10))
            .await
            .unwrap();
        store
            .insert_selector(
                CreateSelector::new(4, 100_000)
                    .user_regex("user.*")
                    .source_regex("(?i).*reject.*"),
            )
            .await
            .unwrap();
        store
            .insert_selector(CreateSelector::new(4, 10).user_regex("user.*"))
            .await
            .unwrap();

        let deleted = store
            .delete_selector(
                DeleteSelector::new(4)
                    .user_regex("user.*")
                    .source_regex("(?i).*reject.*"),
            )
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.get_selectors().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mutations_fire_the_intent_channel() {
        let store = test_store().await;
        let mut intent = store.subscribe_intent();
        intent.mark_unchanged();

        store
            .insert_resource_group(CreateResourceGroup::new(1, "global", "1MB", "10MB", 10, 10))
            .await
            .unwrap();
        assert!(intent.has_changed().unwrap());
        intent.mark_unchanged();

        store
            .insert_selector(CreateSelector::new(1, 10))
            .await
            .unwrap();
        assert!(intent.has_changed().unwrap());
    }

    #[tokio::test]
    async fn selector_attributes_round_trip() {
        let store = test_store().await;
        store
            .insert_resource_group(CreateResourceGroup::new(7, "tagged", "1MB", "10MB", 10, 10))
            .await
            .unwrap();
        store
            .insert_selector(
                CreateSelector::new(7, 6)
                    .query_type(QueryType::Explain)
                    .client_tags(["tag1", "tag2"])
                    .schema_regex("sf.*")
                    .action(SelectorAction::Reject),
            )
            .await
            .unwrap();

        let snapshot = store.fetch_snapshot().await.unwrap();
        let spec = &snapshot.selectors[0];
        assert_eq!(spec.query_type, Some(QueryType::Explain));
        assert_eq!(spec.client_tags, vec!["tag1", "tag2"]);
        assert_eq!(spec.schema_regex.as_deref(), Some("sf.*"));
        assert_eq!(spec.action, SelectorAction::Reject);
    }

    /// Every inserted row shows up in the snapshot exactly once, and
    /// every non-root template's parent path is itself a template.
    async fn prop_forest_round_trips(forest: Vec<CreateResourceGroup>) {
        let store = test_store().await;
        let expected = forest.len();
        for group in forest {
            store.insert_resource_group(group).await.unwrap();
        }

        let snapshot = store.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.groups.len(), expected);

        let templates: HashSet<String> = snapshot
            .groups
            .iter()
            .map(|g| g.id_template.to_string())
            .collect();
        assert_eq!(templates.len(), expected, "Templates must be unique");

        for group in &snapshot.groups {
            if let Some(parent) = group.id_template.parent() {
                assert!(
                    templates.contains(&parent.to_string()),
                    "Parent path '{parent}' of '{}' missing from snapshot",
                    group.id_template
                );
            }
        }
    }

    /// Selector rows survive the snapshot unchanged and ordered.
    async fn prop_selectors_round_trip(
        forest: Vec<CreateResourceGroup>,
        selectors: Vec<CreateSelector>,
    ) {
        let store = test_store().await;
        for group in forest {
            store.insert_resource_group(group).await.unwrap();
        }
        let expected = selectors.len();
        for selector in selectors {
            store.insert_selector(selector).await.unwrap();
        }

        let snapshot = store.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.selectors.len(), expected);
        for pair in snapshot.selectors.windows(2) {
            assert!(
                pair[0].priority > pair[1].priority
                    || (pair[0].priority == pair[1].priority && pair[0].id < pair[1].id),
                "Selectors must be in evaluation order"
            );
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn forest_round_trips(forest in arb_resource_group_forest(8)) {
            test_prop(|| async move {
                prop_forest_round_trips(forest).await;
            });
        }

        #[test]
        fn selectors_round_trip(
            (forest, selectors) in arb_resource_group_forest(5).prop_flat_map(|forest| {
                let ids: Vec<i64> = forest.iter().map(|g| g.id).collect();
                (
                    Just(forest),
                    proptest::collection::vec(arb_create_selector(ids), 0..6),
                )
            })
        ) {
            test_prop(|| async move {
                prop_selectors_round_trip(forest, selectors).await;
            });
        }
    }
}
