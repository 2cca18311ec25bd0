#[path = "support/mod.rs"]
mod support;

use aquila_bootstrap::plan::{NaturalKey, SeedRecordSpec};
use aquila_bootstrap::seed::{SeedError, SeedLoader};
use std::collections::BTreeMap;
use std::sync::Arc;
use support::mocks::MockSeedStore;

fn record(label: &str, entity: &str, key: &str) -> SeedRecordSpec {
    SeedRecordSpec {
        label: label.to_string(),
        group: None,
        entity: entity.to_string(),
        natural_key: NaturalKey {
            column: "external_id".to_string(),
            value: key.to_string(),
        },
        columns: BTreeMap::new(),
        refs: BTreeMap::new(),
    }
}

fn subscription_with_cycle() -> Vec<SeedRecordSpec> {
    let mut subscription = record("sub_tenant_001", "subscriptions", "tenant_001");
    subscription.group = Some("tenant_001_billing".to_string());
    subscription
        .columns
        .insert("status".to_string(), "active".to_string());

    let mut cycle = record("cycle_tenant_001", "billing_cycles", "tenant_001_cycle_1");
    cycle.group = Some("tenant_001_billing".to_string());
    cycle.refs.insert(
        "subscription_id".to_string(),
        "sub_tenant_001".to_string(),
    );

    vec![subscription, cycle]
}

#[tokio::test]
async fn existing_natural_keys_are_skipped() {
    let store = MockSeedStore::new();
    let loader = SeedLoader::new(Arc::clone(&store) as _);
    let records = vec![record("tenant", "tenants", "tenant_001")];

    let first = loader.seed(&records).await.expect("first run");
    assert_eq!(first, 1);

    let second = loader.seed(&records).await.expect("second run");
    assert_eq!(second, 0);
    assert_eq!(store.rows("tenants").len(), 1);
}

#[tokio::test]
async fn dependent_rows_receive_the_generated_identifier() {
    let store = MockSeedStore::new();
    let loader = SeedLoader::new(Arc::clone(&store) as _);

    let inserted = loader
        .seed(&subscription_with_cycle())
        .await
        .expect("seed run");
    assert_eq!(inserted, 2);

    let subscription = &store.rows("subscriptions")[0];
    let cycle = &store.rows("billing_cycles")[0];
    assert_eq!(cycle.id_value("subscription_id"), Some(subscription.id));
}

#[tokio::test]
async fn skipped_referents_still_resolve_for_dependents() {
    let store = MockSeedStore::new();
    let loader = SeedLoader::new(Arc::clone(&store) as _);
    let records = subscription_with_cycle();

    loader.seed(&records[..1]).await.expect("subscription only");
    let subscription_id = store.rows("subscriptions")[0].id;

    // Second run: the subscription is skipped but its id still flows into
    // the newly inserted cycle.
    let inserted = loader.seed(&records).await.expect("full run");
    assert_eq!(inserted, 1);

    let cycle = &store.rows("billing_cycles")[0];
    assert_eq!(cycle.id_value("subscription_id"), Some(subscription_id));
}

#[tokio::test]
async fn missing_referent_is_an_error_without_partial_rows() {
    let store = MockSeedStore::new();
    let loader = SeedLoader::new(Arc::clone(&store) as _);

    let mut records = subscription_with_cycle();
    records[1].refs.insert(
        "subscription_id".to_string(),
        "sub_never_seeded".to_string(),
    );

    let error = loader.seed(&records).await.expect_err("missing referent");
    match error {
        SeedError::MissingReferent { record, referent } => {
            assert_eq!(record, "cycle_tenant_001");
            assert_eq!(referent, "sub_never_seeded");
        }
        other => panic!("expected missing referent, got {other}"),
    }

    // The subscription shared the cycle's group, so it rolled back too.
    assert!(store.rows("subscriptions").is_empty());
    assert!(store.rows("billing_cycles").is_empty());
}

#[tokio::test]
async fn constraint_violation_rolls_back_the_whole_group() {
    let store = MockSeedStore::new();
    store.fail_on_entity("billing_cycles");
    let loader = SeedLoader::new(Arc::clone(&store) as _);

    let error = loader
        .seed(&subscription_with_cycle())
        .await
        .expect_err("insert fails");
    match error {
        SeedError::Store { record, .. } => assert_eq!(record, "cycle_tenant_001"),
        other => panic!("expected store error, got {other}"),
    }

    assert!(store.rows("subscriptions").is_empty());
    assert!(store.rows("billing_cycles").is_empty());
}

#[tokio::test]
async fn earlier_groups_stay_committed_when_a_later_group_fails() {
    let store = MockSeedStore::new();
    store.fail_on_entity("billing_cycles");
    let loader = SeedLoader::new(Arc::clone(&store) as _);

    let mut records = vec![record("tenant", "tenants", "tenant_001")];
    records.extend(subscription_with_cycle());

    loader.seed(&records).await.expect_err("cycle insert fails");

    // The standalone tenant committed in its own transaction before the
    // failing group began.
    assert_eq!(store.rows("tenants").len(), 1);
    assert!(store.rows("subscriptions").is_empty());
}
