use super::{
    cluster_with_keep, digest, test_config, wait_for_share, wait_for_state, TEST_TIMEOUT,
};
use crate::chain::local::{KeepStatus, LocalChainConfig};
use crate::chain::KeepEvent;
use crate::lifecycle::KeepState;
use crate::metrics;
use crate::smoke::{wait_for, LocalCluster};
use crate::storage::ARCHIVED_DIR;
use keep_primitives::KeepId;
use serial_test::serial;

async fn assert_archived(cluster: &LocalCluster, index: usize, keep: &KeepId) {
    let node = cluster.node(index).unwrap();
    assert!(node.registry.get(keep).await.is_none());
    assert!(cluster
        .data_dir(index)
        .join(ARCHIVED_DIR)
        .join(keep.as_str())
        .exists());
    assert!(!cluster.data_dir(index).join(keep.as_str()).exists());
}

/// Waits until no action of the operator is tracked as running.
async fn wait_for_idle(cluster: &LocalCluster, index: usize) {
    let dedup = cluster.node(index).unwrap().controller.dedup();
    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok(dedup.active_counts().iter().all(|(_, count)| *count == 0).then_some(()))
    })
    .await
    .unwrap();
}

async fn keep_ends_archived(terminate: bool) {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    for index in 0..3 {
        wait_for_share(&cluster, index, &keep).await;
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
    }
    let archived_before = metrics::KEEP_KEEPS_ARCHIVED.get();

    let event_block = cluster.chain.current_block() + 1;
    if terminate {
        cluster.chain.terminate_keep(&keep).unwrap();
    } else {
        cluster.chain.close_keep(&keep).unwrap();
    }
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Archived).await;
        assert_archived(&cluster, index, &keep).await;
        wait_for_idle(&cluster, index).await;
    }
    assert!(cluster.chain.current_block() >= event_block + 2);
    assert_eq!(metrics::KEEP_KEEPS_ARCHIVED.get(), archived_before + 3);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_closed_keep_is_archived_after_confirmations() {
    keep_ends_archived(false).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_terminated_keep_is_archived_after_confirmations() {
    keep_ends_archived(true).await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_keep_still_active_after_confirmations_is_kept() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
    }

    // A closing event the chain state does not back, as after a re-org.
    let block_number = cluster.chain.current_block() + 4;
    cluster
        .chain
        .emit_keep_event(&keep, KeepEvent::KeepClosed { block_number })
        .unwrap();
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::ClosingRequested).await;
    }
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
        let node = cluster.node(index).unwrap();
        assert!(node.registry.get(&keep).await.is_some());
    }
    assert!(cluster.chain.current_block() >= block_number + 2);
    assert_eq!(cluster.chain.keep_status(&keep).unwrap(), KeepStatus::Active);

    cluster.chain.request_signature(&keep, digest()).unwrap();
    cluster
        .wait_for_signature(&keep, &digest(), TEST_TIMEOUT)
        .await
        .unwrap();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_signing_proceeds_while_closing_awaits_confirmations() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
    }

    let block_number = cluster.chain.current_block() + 10_000;
    cluster
        .chain
        .emit_keep_event(&keep, KeepEvent::KeepClosed { block_number })
        .unwrap();
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::ClosingRequested).await;
    }
    cluster.chain.request_signature(&keep, digest()).unwrap();
    cluster
        .wait_for_signature(&keep, &digest(), TEST_TIMEOUT)
        .await
        .unwrap();
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_mismatching_published_key_leaves_keep_active() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    let public_key = cluster.chain.public_key(&keep).unwrap().unwrap();
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
    }

    cluster
        .chain
        .emit_keep_event(
            &keep,
            KeepEvent::PublicKeyPublished {
                public_key: [7; 64],
                block_number: cluster.chain.current_block(),
            },
        )
        .unwrap();
    cluster.chain.request_signature(&keep, digest()).unwrap();
    cluster
        .wait_for_signature(&keep, &digest(), TEST_TIMEOUT)
        .await
        .unwrap();
    for index in 0..3 {
        let record = cluster.node(index).unwrap().controller.record(&keep).unwrap();
        assert_eq!(record.state, KeepState::Active);
        assert_eq!(record.public_key, Some(public_key));
    }
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_failed_key_generation_leaves_no_share() {
    crate::tracing::init_logging();
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.tss.protocol_timeout = 10;
    let mut cluster =
        LocalCluster::start(&config, temp_dir.path(), 3, LocalChainConfig::default())
            .await
            .unwrap();
    cluster.stop_node(2).await;
    let failed_before = metrics::KEEP_NUM_KEYGENS_FAILED.get();

    let keep = cluster.open_keep(2).unwrap();
    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok((metrics::KEEP_NUM_KEYGENS_FAILED.get() >= failed_before + 2).then_some(()))
    })
    .await
    .unwrap();

    for index in 0..2 {
        let node = cluster.node(index).unwrap();
        assert_eq!(node.controller.state(&keep), KeepState::AwaitingKey);
        assert!(node.registry.get(&keep).await.is_none());
        assert!(!cluster.data_dir(index).join(keep.as_str()).exists());
        wait_for_idle(&cluster, index).await;
    }
    assert_eq!(cluster.chain.public_key(&keep).unwrap(), None);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_keep_is_followed_when_key_submission_fails() {
    crate::tracing::init_logging();
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config();
    config.chain.mining_check_interval = 1;
    config.chain.max_gas_price = LocalChainConfig::default().gas_price;
    let cluster = LocalCluster::start(&config, temp_dir.path(), 3, LocalChainConfig::default())
        .await
        .unwrap();

    // No transaction gets mined, so every key submission is abandoned.
    cluster.chain.set_min_gas_price(u128::MAX);
    let keep = cluster.open_keep(2).unwrap();
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Active).await;
    }
    assert_eq!(cluster.chain.public_key(&keep).unwrap(), None);

    // The abandoned submissions are still pooled and get mined now.
    cluster.chain.set_min_gas_price(0);
    cluster.wait_for_public_key(&keep, TEST_TIMEOUT).await.unwrap();
    cluster.chain.close_keep(&keep).unwrap();
    for index in 0..3 {
        wait_for_state(&cluster, index, &keep, KeepState::Archived).await;
    }
    cluster.shutdown().await;
}
