//! Test utilities and proptest strategies for model types.
//!
//! This module is only available when the `testing` feature is enabled.

use crate::config::{CreateResourceGroup, CreateSelector};
use crate::group::SchedulingPolicy;
use crate::query::query_state::QueryState;
use crate::query::{QuerySubmission, QueryType};
use proptest::prelude::*;

fn arb_user() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z][a-z0-9]{2,11}").unwrap()
}

fn arb_source() -> impl Strategy<Value = Option<String>> {
    proptest::option::of(proptest::string::string_regex("[a-z][a-z0-9_-]{2,15}").unwrap())
}

pub fn arb_query_type() -> impl Strategy<Value = QueryType> {
    prop_oneof![
        Just(QueryType::Select),
        Just(QueryType::Explain),
        Just(QueryType::Insert),
        Just(QueryType::Delete),
        Just(QueryType::Describe),
        Just(QueryType::Analyze),
        Just(QueryType::DataDefinition),
    ]
}

pub fn arb_scheduling_policy() -> impl Strategy<Value = SchedulingPolicy> {
    prop_oneof![
        Just(SchedulingPolicy::Fifo),
        Just(SchedulingPolicy::WeightedFair),
        Just(SchedulingPolicy::RecentQueries),
    ]
}

/// Memory limit strings as they appear in store rows.
pub fn arb_memory_limit() -> impl Strategy<Value = String> {
    prop_oneof![
        (1u64..=64, prop_oneof![Just("MB"), Just("GB"), Just("kB")])
            .prop_map(|(n, unit)| format!("{n}{unit}")),
        (1u64..=100).prop_map(|pct| format!("{pct}%")),
    ]
}

prop_compose! {
    /// Strategy for generating query submissions.
    pub fn arb_submission()(
        user in arb_user(),
        source in arb_source(),
        tags in prop::collection::btree_set("[a-z][a-z0-9]{1,7}", 0..4),
        schema in proptest::option::of(proptest::string::string_regex("[a-z][a-z0-9_]{2,11}").unwrap()),
        query_type in proptest::option::of(arb_query_type()),
        priority in proptest::option::of(-10..10i32),
    ) -> QuerySubmission {
        let mut submission = QuerySubmission::new(user);
        submission.source = source;
        submission.client_tags = tags;
        submission.schema = schema;
        submission.query_type = query_type;
        submission.priority = priority;
        submission
    }
}

prop_compose! {
    /// Strategy for one group row with the given id and parent link.
    pub fn arb_create_resource_group(id: i64, parent: Option<i64>)(
        name in proptest::string::string_regex("[a-z][a-z0-9-]{2,15}").unwrap(),
        soft_memory in arb_memory_limit(),
        hard_memory in arb_memory_limit(),
        max_queued in 0..100i64,
        hard_concurrency in 0..50i64,
        policy in proptest::option::of(arb_scheduling_policy()),
        weight in proptest::option::of(1..10i64),
    ) -> CreateResourceGroup {
        let mut req = CreateResourceGroup::new(
            id,
            name,
            soft_memory,
            hard_memory,
            max_queued,
            hard_concurrency,
        );
        req.parent = parent;
        req.scheduling_policy = policy;
        req.scheduling_weight = weight;
        req
    }
}

/// A set of group rows forming a valid forest: every parent link
/// points at an earlier row, and sibling names are unique.
pub fn arb_resource_group_forest(max_groups: usize) -> impl Strategy<Value = Vec<CreateResourceGroup>> {
    prop::collection::vec(proptest::option::of(0..max_groups), 1..=max_groups)
        .prop_flat_map(|parent_choices| {
            let rows: Vec<_> = parent_choices
                .into_iter()
                .enumerate()
                .map(|(i, parent)| {
                    let id = i as i64 + 1;
                    // Clamp the parent to an earlier row; roots keep None.
                    let parent = parent
                        .map(|p| (p % i.max(1)) as i64 + 1)
                        .filter(|_| i > 0);
                    arb_create_resource_group(id, parent)
                })
                .collect();
            rows
        })
        .prop_map(|mut rows| {
            // Sibling names must be unique for paths to be unambiguous.
            for (i, row) in rows.iter_mut().enumerate() {
                row.name = format!("{}-{}", row.name, i);
            }
            rows
        })
}

prop_compose! {
    /// Strategy for one selector row targeting one of `group_ids`.
    pub fn arb_create_selector(group_ids: Vec<i64>)(
        target in 0..group_ids.len(),
        priority in 0..1000i64,
        user_regex in proptest::option::of(Just("[a-z]+".to_string())),
        tags in prop::collection::vec("[a-z][a-z0-9]{1,7}", 0..3),
    ) -> CreateSelector {
        let mut req = CreateSelector::new(group_ids[target], priority);
        req.user_regex = user_regex;
        req.client_tags = tags;
        req
    }
}

/// Strategy that generates one of the 3 valid state paths from Queued
/// to a terminal state.
pub fn arb_valid_state_path() -> impl Strategy<Value = Vec<QueryState>> {
    use QueryState::*;
    prop_oneof![
        Just(vec![Queued, Running, Finished]),
        Just(vec![Queued, Running, Failed]),
        Just(vec![Queued, Failed]),
    ]
}
