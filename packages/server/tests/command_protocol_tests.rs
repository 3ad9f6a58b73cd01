//! Idempotent command protocol, end to end, over the in-memory adapters.
//!
//! Covers the guarantees callers rely on:
//! - a retried request replays the stored response instead of re-executing
//! - concurrent duplicates execute at most once
//! - a key reused with a different payload is rejected
//! - a failed command is remembered and not re-attempted with the same key
//! - outbox/audit/domain writes commit or roll back together

mod common;

use std::time::Duration;

use crate::common::{create_lead_cmd, create_restaurant_cmd, tenant_ctx};
use server_core::common::{RestaurantId, TenantId};
use server_core::config::IdempotencyConfig;
use server_core::domains::directory::{
    create_lead, create_restaurant, CREATE_LEAD, CREATE_RESTAURANT, SLUG_ALREADY_EXISTS,
};
use server_core::domains::idempotency::{
    Decision, IdempotencyRequest, IdempotencyScope, IdempotencyStatus,
};
use server_core::kernel::test_dependencies::{MemoryDirectoryRepository, MemoryOutbox};
use server_core::kernel::{CommandContext, CommandError, TestDependencies};

fn scope(tenant: TenantId, action_key: &str, key: &str) -> IdempotencyScope {
    IdempotencyScope::new(Some(tenant), action_key, key)
}

// =============================================================================
// Replay
// =============================================================================

#[tokio::test]
async fn sequential_retry_replays_the_same_lead() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let restaurant = test_deps.seed_restaurant(tenant, "Pho Mai", "pho-mai").await;

    let ctx = tenant_ctx(tenant, "lead-1");
    let cmd = create_lead_cmd(restaurant.id, "ada@example.com");

    let first = create_lead(&deps, &ctx, cmd.clone()).await.unwrap();
    let second = create_lead(&deps, &ctx, cmd).await.unwrap();

    assert_eq!(first.status, 201);
    assert!(!first.replayed);
    assert_eq!(second.status, 201);
    assert!(second.replayed);
    assert_eq!(second.body.id, first.body.id);
    assert_eq!(second.body, first.body);

    assert_eq!(test_deps.leads().await.len(), 1);
    assert_eq!(test_deps.outbox_events().await.len(), 1);
    assert_eq!(test_deps.audit_entries().await.len(), 1);
    assert_eq!(test_deps.directory.restaurant_lookups(), 1);
}

#[tokio::test]
async fn equivalent_payload_after_normalization_replays() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");

    let first = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap();
    let second = create_restaurant(&deps, &ctx, create_restaurant_cmd("  Pho Mai ", "PHO-MAI"))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(second.body.id, first.body.id);
    assert_eq!(first.body.slug, "pho-mai");
    assert_eq!(test_deps.restaurants().await.len(), 1);
}

#[tokio::test]
async fn completed_record_stores_the_response() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");

    let response = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap();

    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_RESTAURANT, "restaurant-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.response_status, Some(201));
    assert_eq!(
        record.response_body.unwrap()["id"],
        serde_json::json!(response.body.id.to_string())
    );
    assert!(record.request_hash.is_some());
    assert_eq!(record.user_id, ctx.user_id);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test]
async fn concurrent_duplicates_execute_once() {
    let test_deps = TestDependencies::new()
        .with_directory(MemoryDirectoryRepository::new().with_latency(Duration::from_millis(50)));
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");
    let cmd = create_restaurant_cmd("Pho Mai", "pho-mai");

    let results = futures::future::join_all(
        (0..5).map(|_| create_restaurant(&deps, &ctx, cmd.clone())),
    )
    .await;

    let executed: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().ok())
        .filter(|r| !r.replayed)
        .collect();
    assert_eq!(executed.len(), 1);

    for result in &results {
        match result {
            Ok(response) => assert_eq!(response.body.id, executed[0].body.id),
            Err(CommandError::IdempotencyInProgress { retry_after_ms }) => {
                assert!(*retry_after_ms >= 1);
            }
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(test_deps.restaurants().await.len(), 1);
    assert_eq!(test_deps.directory.slug_checks(), 1);

    // Once the winner has finished, a retry replays
    let retry = create_restaurant(&deps, &ctx, cmd).await.unwrap();
    assert!(retry.replayed);
    assert_eq!(retry.body.id, executed[0].body.id);
}

#[tokio::test]
async fn in_progress_reports_retry_hint_as_conflict() {
    let config = IdempotencyConfig {
        retry_after: Duration::from_millis(250),
        ..IdempotencyConfig::default()
    };
    let test_deps = TestDependencies::new().with_config(config);
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");
    let cmd = create_restaurant_cmd("Pho Mai", "pho-mai");

    // Someone else holds the key
    let claimed = deps
        .idempotency
        .start_or_replay(&IdempotencyRequest {
            scope: scope(tenant, CREATE_RESTAURANT, "restaurant-1"),
            request_hash: None,
            user_id: None,
        })
        .await
        .unwrap();
    assert!(matches!(claimed, Decision::Started(_)));

    let err = create_restaurant(&deps, &ctx, cmd).await.unwrap_err();

    assert!(matches!(
        err,
        CommandError::IdempotencyInProgress { retry_after_ms: 250 }
    ));
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.response_body()["retryAfterMs"], 250);
    assert!(test_deps.restaurants().await.is_empty());
}

#[tokio::test]
async fn expired_lease_is_taken_over_and_executed() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let key = scope(tenant, CREATE_RESTAURANT, "restaurant-1");

    // A crashed executor left the record IN_PROGRESS
    let stale = deps
        .idempotency
        .start_or_replay(&IdempotencyRequest {
            scope: key.clone(),
            request_hash: None,
            user_id: None,
        })
        .await
        .unwrap();
    let stale_claim = match stale {
        Decision::Started(claim) => claim,
        other => panic!("expected Started, got {other:?}"),
    };
    test_deps.idempotency_store.expire_lease(&key);

    let response = create_restaurant(
        &deps,
        &tenant_ctx(tenant, "restaurant-1"),
        create_restaurant_cmd("Pho Mai", "pho-mai"),
    )
    .await
    .unwrap();
    assert!(!response.replayed);

    let record = test_deps.idempotency_store.get(&key).unwrap();
    assert_eq!(record.attempt, 2);
    assert_eq!(record.status, IdempotencyStatus::Completed);

    // The crashed attempt cannot overwrite the outcome
    let applied = deps
        .idempotency
        .fail(&stale_claim, 500, serde_json::json!({}))
        .await
        .unwrap();
    assert!(!applied);
    assert_eq!(
        test_deps.idempotency_store.get(&key).unwrap().status,
        IdempotencyStatus::Completed
    );
}

// =============================================================================
// Mismatch
// =============================================================================

#[tokio::test]
async fn same_key_different_payload_is_rejected() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let restaurant = test_deps.seed_restaurant(tenant, "Pho Mai", "pho-mai").await;
    let ctx = tenant_ctx(tenant, "lead-1");

    create_lead(&deps, &ctx, create_lead_cmd(restaurant.id, "ada@example.com"))
        .await
        .unwrap();

    let err = create_lead(&deps, &ctx, create_lead_cmd(restaurant.id, "grace@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CommandError::IdempotencyKeyReusedWithDifferentPayload
    ));
    assert_eq!(err.status_code(), 409);
    assert_eq!(err.code(), "IDEMPOTENCY_KEY_REUSED_WITH_DIFFERENT_PAYLOAD");
    assert_eq!(test_deps.leads().await.len(), 1);

    // The stored outcome is untouched
    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_LEAD, "lead-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

// =============================================================================
// Failure memory
// =============================================================================

#[tokio::test]
async fn domain_failure_is_stored_and_not_retried() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    test_deps.seed_restaurant(tenant, "Pho Mai", "pho-mai").await;

    let ctx = tenant_ctx(tenant, "restaurant-2");
    let cmd = create_restaurant_cmd("Pho Mai Two", "pho-mai");

    let err = create_restaurant(&deps, &ctx, cmd.clone()).await.unwrap_err();
    assert_eq!(err.code(), SLUG_ALREADY_EXISTS);
    assert_eq!(err.status_code(), 409);
    assert_eq!(test_deps.directory.slug_checks(), 1);

    let retry = create_restaurant(&deps, &ctx, cmd).await.unwrap_err();
    match retry {
        CommandError::PreviouslyFailed {
            response_status,
            response_body,
        } => {
            assert_eq!(response_status, 409);
            assert_eq!(response_body["code"], SLUG_ALREADY_EXISTS);
        }
        other => panic!("expected PreviouslyFailed, got {other:?}"),
    }

    // The slug check did not run again
    assert_eq!(test_deps.directory.slug_checks(), 1);
    assert_eq!(test_deps.restaurants().await.len(), 1);
    assert!(test_deps.audit_entries().await.is_empty());
}

#[tokio::test]
async fn unknown_restaurant_fails_with_not_found() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "lead-1");

    let err = create_lead(&deps, &ctx, create_lead_cmd(RestaurantId::new(), "ada@example.com"))
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::NotFound { .. }));
    assert_eq!(err.status_code(), 404);

    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_LEAD, "lead-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.response_status, Some(404));
    assert!(test_deps.leads().await.is_empty());
}

#[tokio::test]
async fn restaurant_of_another_tenant_is_not_found() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let owner = TenantId::new();
    let restaurant = test_deps.seed_restaurant(owner, "Pho Mai", "pho-mai").await;

    let err = create_lead(
        &deps,
        &tenant_ctx(TenantId::new(), "lead-1"),
        create_lead_cmd(restaurant.id, "ada@example.com"),
    )
    .await
    .unwrap_err();

    assert_eq!(err.status_code(), 404);
}

// =============================================================================
// Atomicity
// =============================================================================

#[tokio::test]
async fn outbox_failure_rolls_back_the_domain_write() {
    let test_deps = TestDependencies::new().with_outbox(MemoryOutbox::failing());
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");

    let err = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap_err();

    assert!(matches!(err, CommandError::Internal(_)));
    assert_eq!(err.status_code(), 500);
    assert_eq!(test_deps.outbox.enqueue_calls(), 1);
    assert!(test_deps.restaurants().await.is_empty());
    assert!(test_deps.outbox_events().await.is_empty());
    assert!(test_deps.audit_entries().await.is_empty());
    assert_eq!(test_deps.unit_of_work.rollbacks(), 1);
    assert_eq!(test_deps.unit_of_work.commits(), 0);

    // Internal details never reach the stored response
    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_RESTAURANT, "restaurant-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.response_status, Some(500));
    assert!(!record
        .response_body
        .unwrap()
        .to_string()
        .contains("outbox unavailable"));
}

#[tokio::test]
async fn events_are_stamped_with_tenant_and_correlation() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "restaurant-1");

    let response = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap();

    let events = test_deps.outbox_events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "directory.restaurant_created.v1");
    assert_eq!(events[0].tenant_id, Some(tenant));
    assert_eq!(events[0].correlation_id, ctx.correlation_id);
    assert_eq!(
        events[0].payload["restaurant_id"],
        serde_json::json!(response.body.id.to_string())
    );

    let audit = test_deps.audit_entries().await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].action_key, CREATE_RESTAURANT);
    assert_eq!(audit[0].idempotency_key, "restaurant-1");
    assert_eq!(audit[0].actor_id, ctx.user_id);
    assert_eq!(audit[0].correlation_id, ctx.correlation_id);
}

#[tokio::test]
async fn completion_write_failure_still_returns_the_committed_result() {
    let test_deps = TestDependencies::new();
    test_deps.idempotency_store.fail_finish(true);
    let deps = test_deps.deps();
    let tenant = TenantId::new();

    let response = create_restaurant(
        &deps,
        &tenant_ctx(tenant, "restaurant-1"),
        create_restaurant_cmd("Pho Mai", "pho-mai"),
    )
    .await
    .unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(test_deps.restaurants().await.len(), 1);

    // Left IN_PROGRESS, but sealed with the committed response
    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_RESTAURANT, "restaurant-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::InProgress);
    assert!(record.committed_at.is_some());
    assert_eq!(record.response_status, Some(201));
}

#[tokio::test]
async fn unrecorded_completion_is_replayed_after_lease_expiry() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let restaurant = test_deps.seed_restaurant(tenant, "Pho Mai", "pho-mai").await;
    let ctx = tenant_ctx(tenant, "lead-1");
    let cmd = create_lead_cmd(restaurant.id, "ada@example.com");
    let key = scope(tenant, CREATE_LEAD, "lead-1");

    test_deps.idempotency_store.fail_finish(true);
    let first = create_lead(&deps, &ctx, cmd.clone()).await.unwrap();
    test_deps.idempotency_store.fail_finish(false);
    test_deps.idempotency_store.expire_lease(&key);

    let retry = create_lead(&deps, &ctx, cmd).await.unwrap();

    assert!(retry.replayed);
    assert_eq!(retry.body.id, first.body.id);
    assert_eq!(test_deps.leads().await.len(), 1);
    assert_eq!(test_deps.outbox_events().await.len(), 1);
    assert_eq!(test_deps.directory.restaurant_lookups(), 1);

    let record = test_deps.idempotency_store.get(&key).unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.attempt, 1);
}

#[tokio::test]
async fn executor_outliving_its_lease_rolls_back() {
    let config = IdempotencyConfig {
        lease: Duration::from_millis(20),
        ..IdempotencyConfig::default()
    };
    let test_deps = TestDependencies::new()
        .with_config(config)
        .with_directory(MemoryDirectoryRepository::new().with_latency(Duration::from_millis(60)));
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let restaurant = test_deps.seed_restaurant(tenant, "Pho Mai", "pho-mai").await;
    let ctx = tenant_ctx(tenant, "lead-1");
    let cmd = create_lead_cmd(restaurant.id, "ada@example.com");

    // The second request arrives after the first one's lease ran out
    let slow = create_lead(&deps, &ctx, cmd.clone());
    let late = async {
        tokio::time::sleep(Duration::from_millis(30)).await;
        create_lead(&deps, &ctx, cmd.clone()).await
    };
    let (slow, late) = tokio::join!(slow, late);

    assert!(matches!(
        slow,
        Err(CommandError::IdempotencyInProgress { .. })
    ));
    let late = late.unwrap();
    assert!(!late.replayed);

    assert_eq!(test_deps.leads().await.len(), 1);
    assert_eq!(test_deps.outbox_events().await.len(), 1);
    assert_eq!(test_deps.audit_entries().await.len(), 1);
    assert_eq!(test_deps.unit_of_work.rollbacks(), 1);

    let record = test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_LEAD, "lead-1"))
        .unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.attempt, 2);

    let retry = create_lead(&deps, &ctx, cmd).await.unwrap();
    assert!(retry.replayed);
    assert_eq!(retry.body.id, late.body.id);
}

// =============================================================================
// Preconditions and scoping
// =============================================================================

#[tokio::test]
async fn missing_idempotency_key_creates_no_record() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let ctx = CommandContext::builder().tenant_id(TenantId::new()).build();

    let err = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "IDEMPOTENCY_KEY_REQUIRED");
    assert_eq!(err.status_code(), 400);
    assert!(test_deps.idempotency_store.is_empty());
    assert!(test_deps.restaurants().await.is_empty());
}

#[tokio::test]
async fn missing_tenant_creates_no_record() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let ctx = CommandContext::builder().idempotency_key("restaurant-1").build();

    let err = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "TENANT_REQUIRED");
    assert!(test_deps.idempotency_store.is_empty());
}

#[tokio::test]
async fn invalid_fields_create_no_record() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let ctx = tenant_ctx(TenantId::new(), "restaurant-1");

    let err = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho mai!"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), "VALIDATION_ERROR");
    assert!(test_deps.idempotency_store.is_empty());
}

#[tokio::test]
async fn same_key_in_different_tenants_executes_twice() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let cmd = create_restaurant_cmd("Pho Mai", "pho-mai");

    let a = create_restaurant(&deps, &tenant_ctx(TenantId::new(), "shared"), cmd.clone())
        .await
        .unwrap();
    let b = create_restaurant(&deps, &tenant_ctx(TenantId::new(), "shared"), cmd)
        .await
        .unwrap();

    assert!(!a.replayed);
    assert!(!b.replayed);
    assert_ne!(a.body.id, b.body.id);
    assert_eq!(test_deps.restaurants().await.len(), 2);
}

#[tokio::test]
async fn same_key_for_different_actions_is_independent() {
    let test_deps = TestDependencies::new();
    let deps = test_deps.deps();
    let tenant = TenantId::new();
    let ctx = tenant_ctx(tenant, "shared");

    let restaurant = create_restaurant(&deps, &ctx, create_restaurant_cmd("Pho Mai", "pho-mai"))
        .await
        .unwrap();
    let lead = create_lead(&deps, &ctx, create_lead_cmd(restaurant.body.id, "ada@example.com"))
        .await
        .unwrap();

    assert!(!lead.replayed);
    assert_eq!(test_deps.idempotency_store.len(), 2);
}

#[tokio::test]
async fn purge_removes_only_terminal_records() {
    let config = IdempotencyConfig {
        retention: Duration::ZERO,
        ..IdempotencyConfig::default()
    };
    let test_deps = TestDependencies::new().with_config(config);
    let deps = test_deps.deps();
    let tenant = TenantId::new();

    create_restaurant(
        &deps,
        &tenant_ctx(tenant, "restaurant-1"),
        create_restaurant_cmd("Pho Mai", "pho-mai"),
    )
    .await
    .unwrap();
    deps.idempotency
        .start_or_replay(&IdempotencyRequest {
            scope: scope(tenant, CREATE_RESTAURANT, "restaurant-2"),
            request_hash: None,
            user_id: None,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    let purged = deps.idempotency.purge_expired().await.unwrap();

    assert_eq!(purged, 1);
    assert_eq!(test_deps.idempotency_store.len(), 1);
    assert!(test_deps
        .idempotency_store
        .get(&scope(tenant, CREATE_RESTAURANT, "restaurant-2"))
        .is_some());
}
