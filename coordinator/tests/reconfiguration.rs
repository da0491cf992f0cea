//! Live reconfiguration through the store DAO plus explicit reload,
//! mirroring the reference system's database-driven tests.

mod setup;

use model::config::{CreateResourceGroup, CreateSelector, DeleteSelector};
use model::group::SchedulingPolicy;
use model::query::ErrorCode;
use model::query::query_state::QueryState;
use model::selector::SelectorAction;
use setup::{DASHBOARD, TEST_ENVIRONMENT, USER, dashboard_session, rejecting_session, test_kernel, wait_for_state};
use std::time::Duration;

fn dashboard_group(max_queued: i64, hard_concurrency: i64) -> CreateResourceGroup {
    CreateResourceGroup::new(
        DASHBOARD,
        "dashboard-${USER}",
        "1MB",
        "10%",
        max_queued,
        hard_concurrency,
    )
    .parent(USER)
    .scheduling_policy(SchedulingPolicy::RecentQueries)
    .environment(TEST_ENVIRONMENT)
}

#[tokio::test]
async fn raising_the_limit_admits_a_queued_query_without_resubmission() {
    let kernel = test_kernel().await;

    let first = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &first, QueryState::Running).await;
    let second = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &second, QueryState::Queued).await;

    // Allow one more running query in the dashboard group.
    kernel
        .store
        .update_resource_group(dashboard_group(2, 2))
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();

    wait_for_state(&kernel.dispatcher, &second, QueryState::Running).await;

    let third = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &third, QueryState::Queued).await;
}

#[tokio::test]
async fn lowering_the_limit_never_disrupts_running_queries() {
    let kernel = test_kernel().await;

    kernel
        .store
        .update_resource_group(dashboard_group(2, 2))
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();

    let first = kernel.dispatcher.submit(dashboard_session());
    let second = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &first, QueryState::Running).await;
    wait_for_state(&kernel.dispatcher, &second, QueryState::Running).await;
    let third = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &third, QueryState::Queued).await;

    // Drop the limit below current occupancy.
    kernel
        .store
        .update_resource_group(dashboard_group(2, 1))
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        kernel.dispatcher.get_state(&first).unwrap().state,
        QueryState::Running,
        "Grandfathered query keeps running"
    );
    assert_eq!(
        kernel.dispatcher.get_state(&second).unwrap().state,
        QueryState::Running
    );

    // One completion still leaves the group at its new limit.
    kernel.engine.finish(&first);
    wait_for_state(&kernel.dispatcher, &first, QueryState::Finished).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        kernel.dispatcher.get_state(&third).unwrap().state,
        QueryState::Queued,
        "Still at the lowered limit"
    );

    kernel.engine.finish(&second);
    wait_for_state(&kernel.dispatcher, &third, QueryState::Running).await;
}

#[tokio::test]
async fn selector_insertion_and_deletion_reroute_across_reloads() {
    let kernel = test_kernel().await;

    // No selector matches yet.
    let rejected = kernel.dispatcher.submit(rejecting_session());
    wait_for_state(&kernel.dispatcher, &rejected, QueryState::Failed).await;

    let before = kernel.scheduler.selector_count();
    kernel
        .store
        .insert_selector(
            CreateSelector::new(setup::ADHOC, 100_000)
                .user_regex("user.*")
                .source_regex("(?i).*none-such.*"),
        )
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();
    assert_eq!(kernel.scheduler.selector_count(), before + 1);

    let accepted = kernel.dispatcher.submit(rejecting_session());
    wait_for_state(&kernel.dispatcher, &accepted, QueryState::Running).await;
    kernel.engine.finish(&accepted);

    kernel
        .store
        .delete_selector(
            DeleteSelector::new(setup::ADHOC)
                .user_regex("user.*")
                .source_regex("(?i).*none-such.*"),
        )
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();
    assert_eq!(kernel.scheduler.selector_count(), before);

    let rejected_again = kernel.dispatcher.submit(rejecting_session());
    wait_for_state(&kernel.dispatcher, &rejected_again, QueryState::Failed).await;
}

#[tokio::test]
async fn higher_priority_selector_routes_into_a_reject_all_group() {
    let kernel = test_kernel().await;

    let first = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &first, QueryState::Running).await;
    assert_eq!(
        kernel
            .dispatcher
            .get_state(&first)
            .unwrap()
            .resource_group
            .unwrap()
            .to_string(),
        "global.user-user.dashboard-user"
    );

    // A zero-capacity group plus a selector outranking the dashboard one.
    kernel
        .store
        .insert_resource_group(
            CreateResourceGroup::new(8, "reject-all-queries", "1MB", "1MB", 0, 0)
                .environment(TEST_ENVIRONMENT),
        )
        .await
        .unwrap();
    kernel
        .store
        .insert_selector(
            CreateSelector::new(8, 200)
                .user_regex("user.*")
                .source_regex("(?i).*dashboard.*"),
        )
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();

    let second = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &second, QueryState::Failed).await;
    let status = kernel.dispatcher.get_state(&second).unwrap();
    assert_eq!(status.error.unwrap().code, ErrorCode::QueryQueueFull);
}

#[tokio::test]
async fn reject_selectors_fail_queries_with_query_rejected() {
    let kernel = test_kernel().await;

    kernel
        .store
        .insert_selector(
            CreateSelector::new(DASHBOARD, 300)
                .user_regex("user.*")
                .source_regex("(?i).*dashboard.*")
                .action(SelectorAction::Reject),
        )
        .await
        .unwrap();
    kernel.reconciler.load().await.unwrap();

    let id = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &id, QueryState::Failed).await;
    let status = kernel.dispatcher.get_state(&id).unwrap();
    assert_eq!(status.error.unwrap().code, ErrorCode::QueryRejected);
}

#[tokio::test]
async fn removed_groups_drain_and_disappear() {
    let kernel = test_kernel().await;

    let running = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &running, QueryState::Running).await;

    // Deleting the group row also cascades its selector away.
    kernel.store.delete_resource_group(DASHBOARD).await.unwrap();
    kernel.reconciler.load().await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        kernel.dispatcher.get_state(&running).unwrap().state,
        QueryState::Running,
        "Removal never force-terminates"
    );
    let path = "global.user-user.dashboard-user".parse().unwrap();
    let info = kernel.dispatcher.get_resource_group_info(&path).unwrap();
    assert!(info.retired);

    // New dashboard traffic has nowhere to go.
    let orphan = kernel.dispatcher.submit(dashboard_session());
    wait_for_state(&kernel.dispatcher, &orphan, QueryState::Failed).await;
    assert_eq!(
        kernel.dispatcher.get_state(&orphan).unwrap().error.unwrap().code,
        ErrorCode::InvalidResourceGroup
    );

    // Draining deletes the frozen instance.
    kernel.engine.finish(&running);
    wait_for_state(&kernel.dispatcher, &running, QueryState::Finished).await;
    let gone = tokio::time::timeout(Duration::from_secs(5), async {
        while kernel.dispatcher.get_resource_group_info(&path).is_some() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(gone.is_ok(), "Drained retired group should be deleted");
}
