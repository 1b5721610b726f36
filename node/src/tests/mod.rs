//! End-to-end scenarios over an in-process chain and mesh.

use crate::chain::local::LocalChainConfig;
use crate::config::ConfigFile;
use crate::lifecycle::KeepState;
use crate::metrics;
use crate::smoke::{wait_for, LocalCluster};
use hex_literal::hex;
use keep_primitives::{Digest, KeepId};
use std::path::Path;
use std::time::Duration;

mod firewall;
mod lifecycle;
mod signing;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

fn test_config() -> ConfigFile {
    let mut config = ConfigFile::default();
    config.chain.account.key_file = "operator.key".to_string();
    config.chain.mining_check_interval = 5;
    config.chain.block_confirmations = 2;
    config.tss.pre_params_pool_size = 1;
    config.tss.protocol_timeout = 60;
    config.tss.round_timeout = 2;
    config.tss.default_threshold = 2;
    config.signing.submission_stagger = 1;
    config.signing.confirmation_timeout = 2;
    config
}

fn digest() -> Digest {
    Digest::from(hex!(
        "54a6483b8aca55c9df2a35baf71d9965ddfd623468d81d51229bd5eb7d1e1c1b"
    ))
}

/// Three operators with a keep of honest threshold 2 whose key is published.
async fn cluster_with_keep(base_dir: &Path) -> (LocalCluster, KeepId) {
    crate::tracing::init_logging();
    let cluster = LocalCluster::start(&test_config(), base_dir, 3, LocalChainConfig::default())
        .await
        .unwrap();
    let keep = cluster.open_keep(2).unwrap();
    cluster.wait_for_public_key(&keep, TEST_TIMEOUT).await.unwrap();
    (cluster, keep)
}

fn signature_submissions(cluster: &LocalCluster) -> usize {
    cluster
        .chain
        .mined_calls()
        .iter()
        .filter(|call| call.call.method() == "submitSignature")
        .count()
}

fn rejected(track: &str) -> u64 {
    metrics::KEEP_EVENTS_REJECTED
        .with_label_values(&[track])
        .get()
}

async fn wait_for_share(cluster: &LocalCluster, index: usize, keep: &KeepId) {
    let node = cluster.node(index).unwrap();
    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok(node.registry.get(keep).await.map(|_| ()))
    })
    .await
    .unwrap();
}

async fn wait_for_state(cluster: &LocalCluster, index: usize, keep: &KeepId, state: KeepState) {
    let controller = &cluster.node(index).unwrap().controller;
    wait_for(TEST_TIMEOUT, || async move {
        anyhow::Ok((controller.state(keep) == state).then_some(()))
    })
    .await
    .unwrap_or_else(|err| panic!("operator {} never reached {:?}: {}", index, state, err));
}
