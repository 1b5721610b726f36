use super::{cluster_with_keep, digest, rejected, signature_submissions, TEST_TIMEOUT};
use crate::chain::local::verify_signature;
use crate::chain::KeepEvent;
use crate::lifecycle::KeepState;
use crate::metrics;
use crate::smoke::wait_for;
use keep_primitives::Digest;
use serial_test::serial;
use std::time::Duration;

/// Long enough for every selected signer to pass its submission slot.
const SUBMISSION_SETTLE_TIME: Duration = Duration::from_secs(4);

// Three operators generate a key, publish it and produce exactly one
// signature submission for a request.
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_keygen_and_sign() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    let public_key = cluster.chain.public_key(&keep).unwrap().unwrap();

    for index in 0..3 {
        let node = cluster.node(index).unwrap();
        let keep = &keep;
        let share = wait_for(TEST_TIMEOUT, || async move {
            anyhow::Ok(node.registry.get(keep).await)
        })
        .await
        .unwrap();
        assert_eq!(share.public_key_bytes(), public_key);
        wait_for(TEST_TIMEOUT, || async move {
            anyhow::Ok((node.controller.state(keep) == KeepState::Active).then_some(()))
        })
        .await
        .unwrap();
    }

    cluster.chain.request_signature(&keep, digest()).unwrap();
    let signature = cluster
        .wait_for_signature(&keep, &digest(), TEST_TIMEOUT)
        .await
        .unwrap();
    assert!(signature.recovery_id <= 1);
    verify_signature(&public_key, &digest(), &signature).unwrap();

    tokio::time::sleep(SUBMISSION_SETTLE_TIME).await;
    assert_eq!(signature_submissions(&cluster), 1);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_duplicate_signature_request_signs_once() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    let generated_before = metrics::KEEP_NUM_SIGNATURES_GENERATED.get();
    let rejected_before = rejected("signing");

    let block_number = cluster.chain.request_signature(&keep, digest()).unwrap();
    cluster
        .chain
        .emit_keep_event(
            &keep,
            KeepEvent::SignatureRequested {
                digest: digest(),
                block_number,
            },
        )
        .unwrap();

    cluster
        .wait_for_signature(&keep, &digest(), TEST_TIMEOUT)
        .await
        .unwrap();
    // Every operator drops the second delivery.
    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok((rejected("signing") >= rejected_before + 3).then_some(()))
    })
    .await
    .unwrap();
    tokio::time::sleep(SUBMISSION_SETTLE_TIME).await;

    // One run with two selected signers.
    assert_eq!(
        metrics::KEEP_NUM_SIGNATURES_GENERATED.get(),
        generated_before + 2
    );
    assert_eq!(signature_submissions(&cluster), 1);
    cluster.shutdown().await;
}

// The chain no longer awaits the digest by the time the operators react, as
// after a re-org.
#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn test_stale_signature_request_is_dropped() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (cluster, keep) = cluster_with_keep(temp_dir.path()).await;
    let generated_before = metrics::KEEP_NUM_SIGNATURES_GENERATED.get();
    let rejected_before = rejected("signing");

    let reverted: Digest = [0x5a; 32].into();
    cluster
        .chain
        .emit_keep_event(
            &keep,
            KeepEvent::SignatureRequested {
                digest: reverted.clone(),
                block_number: cluster.chain.current_block(),
            },
        )
        .unwrap();

    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok((rejected("signing") >= rejected_before + 3).then_some(()))
    })
    .await
    .unwrap();
    for index in 0..3 {
        let dedup = cluster.node(index).unwrap().controller.dedup();
        assert_eq!(dedup.active_counts()[1], ("signing", 0));
    }
    assert_eq!(metrics::KEEP_NUM_SIGNATURES_GENERATED.get(), generated_before);
    assert_eq!(signature_submissions(&cluster), 0);
    assert!(cluster.chain.signatures(&keep).unwrap().is_empty());
    cluster.shutdown().await;
}
