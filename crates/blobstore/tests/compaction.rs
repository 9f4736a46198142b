//! Compaction coordinator tests against instrumented stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use blobstore::{
    group, BlobStoreConfiguration, BlobStoreError, CompactionCoordinator, CompactionSettings,
    MoveRecord, StoreSelection,
};
use common::{StaticMoves, StaticUsage, TestEnv};
use serde_json::json;

fn coordinator(env: &TestEnv, moves: Vec<MoveRecord>) -> CompactionCoordinator {
    CompactionCoordinator::new(
        env.manager.clone(),
        Arc::new(StaticMoves { records: moves }),
        CompactionSettings::default(),
    )
}

fn compacted(env: &TestEnv) -> Vec<String> {
    let mut names = env.calls.compacted.lock().clone();
    names.sort();
    names
}

#[tokio::test]
async fn test_compacts_only_named_stores() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b", "c"]).await;

    let outcome = coordinator(&env, Vec::new())
        .run(&"a,c".parse().unwrap(), Duration::ZERO)
        .await
        .unwrap();

    assert_eq!(outcome.compacted, 2);
    assert!(outcome.is_success());
    assert_eq!(compacted(&env), vec!["a", "c"]);
    assert!(outcome.message.contains("blob stores 'a', 'c'"));
}

#[tokio::test]
async fn test_unfinished_move_blocks_compaction() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b"]).await;

    let coordinator = coordinator(
        &env,
        vec![MoveRecord {
            source: "a".into(),
            target: "b".into(),
        }],
    );
    let result = coordinator
        .run(&StoreSelection::Named(vec!["B".into()]), Duration::ZERO)
        .await;

    match result {
        Err(BlobStoreError::Conflict(message)) => {
            assert!(message.contains("unfinished move from 'a' to 'b'"), "{message}");
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert!(compacted(&env).is_empty());
    assert!(coordinator.check_for_conflicts("a").await.is_err());
}

#[tokio::test]
async fn test_store_claimed_by_another_task_blocks_whole_run() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b"]).await;

    let coordinator = coordinator(&env, Vec::new());
    let claim = coordinator
        .claims()
        .claim_all(&["b".to_string()], "move of blob store 'b'")
        .unwrap();

    let result = coordinator.run(&StoreSelection::All, Duration::ZERO).await;
    assert!(
        matches!(result, Err(BlobStoreError::Conflict(ref m)) if m.contains("in use by another task: move of blob store 'b'"))
    );
    assert!(compacted(&env).is_empty());

    drop(claim);
    let outcome = coordinator
        .run(&StoreSelection::All, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome.compacted, 2);
    assert_eq!(coordinator.claims().holder("a"), None);
}

#[tokio::test]
async fn test_all_compacts_group_members_once() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b"]).await;
    env.manager
        .create(
            BlobStoreConfiguration::new("pool", group::TYPE).with_attribute(
                group::SECTION,
                group::MEMBERS,
                json!(["a", "b"]),
            ),
        )
        .await
        .unwrap();

    let outcome = coordinator(&env, Vec::new())
        .run(&StoreSelection::All, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome.compacted, 2);
    assert_eq!(compacted(&env), vec!["a", "b"]);

    // naming the group compacts through it
    let outcome = coordinator(&env, Vec::new())
        .run(&"pool".parse().unwrap(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome.compacted, 1);
    assert_eq!(compacted(&env), vec!["a", "a", "b", "b"]);
}

#[tokio::test]
async fn test_named_group_checks_its_members_for_conflicts() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b"]).await;
    env.manager
        .create(
            BlobStoreConfiguration::new("pool", group::TYPE).with_attribute(
                group::SECTION,
                group::MEMBERS,
                json!(["a", "b"]),
            ),
        )
        .await
        .unwrap();

    let migrating = coordinator(
        &env,
        vec![MoveRecord {
            source: "a".into(),
            target: "elsewhere".into(),
        }],
    );
    let result = migrating.run(&"pool".parse().unwrap(), Duration::ZERO).await;
    assert!(
        matches!(result, Err(BlobStoreError::Conflict(ref m)) if m.contains("unfinished move from 'a' to 'elsewhere'"))
    );
    assert!(compacted(&env).is_empty());

    let coordinator = coordinator(&env, Vec::new());
    let claim = coordinator
        .claims()
        .claim_all(&["B".to_string()], "move of blob store 'b'")
        .unwrap();
    let result = coordinator.run(&"pool".parse().unwrap(), Duration::ZERO).await;
    assert!(
        matches!(result, Err(BlobStoreError::Conflict(ref m)) if m.contains("in use by another task"))
    );
    assert!(compacted(&env).is_empty());

    drop(claim);
    let outcome = coordinator
        .run(&"pool".parse().unwrap(), Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome.compacted, 1);
    assert_eq!(compacted(&env), vec!["a", "b"]);
    assert_eq!(coordinator.claims().holder("a"), None);
}

#[tokio::test]
async fn test_store_failures_are_reported_per_store() {
    let env = common::setup(StaticUsage::default());
    common::create_mocks(&env, &["a", "b"]).await;
    env.manager.freeze().await;

    let outcome = coordinator(&env, Vec::new())
        .run(&StoreSelection::All, Duration::ZERO)
        .await
        .unwrap();
    assert_eq!(outcome.compacted, 0);
    assert!(!outcome.is_success());
    let failed: Vec<&str> = outcome.failed.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(failed, vec!["a", "b"]);
    assert!(compacted(&env).is_empty());
}
