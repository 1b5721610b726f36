//! A cluster of operators over an in-process chain and mesh.
//!
//! Used by the `smoke-test` command and by the end-to-end tests.

use crate::chain::local::{verify_signature, LocalChain, LocalChainConfig};
use crate::chain::{PublicKeyBytes, Signature};
use crate::config::ConfigFile;
use crate::network::local::LocalMeshHub;
use crate::operator::{MeshTransport, OperatorNode};
use crate::tracking::AutoAbortTask;
use anyhow::Context;
use k256::ecdsa::SigningKey;
use keep_primitives::{Digest, KeepId, OperatorId};
use serde::Serialize;
use serde_with::serde_as;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stake and balance every cluster operator starts with.
const OPERATOR_FUNDS: u128 = 1_000_000_000_000_000_000;
const BLOCK_INTERVAL: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const OWNER_APPLICATION: &str = "smoke-test";

pub struct LocalCluster {
    pub chain: Arc<LocalChain>,
    pub hub: LocalMeshHub,
    pub keys: Vec<SigningKey>,
    pub nodes: Vec<Option<OperatorNode>>,
    config: ConfigFile,
    aes_key: [u8; 16],
    base_dir: PathBuf,
    owner: OperatorId,
    _block_producer: AutoAbortTask<()>,
}

impl LocalCluster {
    /// Starts `operators` operators, each with its own data directory under
    /// `base_dir`.
    pub async fn start(
        config: &ConfigFile,
        base_dir: &Path,
        operators: usize,
        chain_config: LocalChainConfig,
    ) -> anyhow::Result<Self> {
        let keys = (0..operators)
            .map(|_| SigningKey::random(&mut rand::thread_rng()))
            .collect::<Vec<_>>();
        let chain = LocalChain::new(chain_config);
        let block_producer = chain.spawn_block_producer(BLOCK_INTERVAL);
        let mut cluster = Self {
            chain,
            hub: LocalMeshHub::new(),
            keys,
            nodes: Vec::new(),
            config: config.clone(),
            aes_key: rand::random(),
            base_dir: base_dir.to_path_buf(),
            owner: OperatorId::from([0xee; 20]),
            _block_producer: block_producer,
        };
        for index in 0..operators {
            let operator = cluster.operator(index);
            cluster.chain.set_stake(operator, OPERATOR_FUNDS);
            cluster.chain.set_balance(operator, OPERATOR_FUNDS);
            let node = cluster.start_node(index).await?;
            cluster.nodes.push(Some(node));
        }
        Ok(cluster)
    }

    pub fn operator(&self, index: usize) -> OperatorId {
        crate::chain::operator_id_of(self.keys[index].verifying_key().as_affine())
    }

    pub fn operators(&self) -> Vec<OperatorId> {
        (0..self.keys.len()).map(|index| self.operator(index)).collect()
    }

    pub fn data_dir(&self, index: usize) -> PathBuf {
        self.base_dir.join(format!("operator-{}", index))
    }

    pub fn node(&self, index: usize) -> Option<&OperatorNode> {
        self.nodes.get(index).and_then(Option::as_ref)
    }

    async fn start_node(&self, index: usize) -> anyhow::Result<OperatorNode> {
        let mut config = self.config.clone();
        config.storage.data_dir = self.data_dir(index);
        config.web_ui = None;
        let cancel = CancellationToken::new();
        let chain = self
            .chain
            .connect(self.keys[index].clone(), &config.chain, cancel.clone());
        OperatorNode::start(
            &config,
            &self.keys[index],
            &self.aes_key,
            chain,
            MeshTransport::Local(self.hub.clone()),
            cancel,
        )
        .await
        .with_context(|| format!("start operator {}", index))
    }

    pub async fn stop_node(&mut self, index: usize) {
        if let Some(node) = self.nodes.get_mut(index).and_then(Option::take) {
            node.shutdown().await;
        }
        self.hub.set_offline(self.operator(index), true);
    }

    /// Starts the operator again over its existing data directory.
    pub async fn restart_node(&mut self, index: usize) -> anyhow::Result<()> {
        self.stop_node(index).await;
        let node = self.start_node(index).await?;
        self.nodes[index] = Some(node);
        Ok(())
    }

    pub fn open_keep(&self, honest_threshold: usize) -> anyhow::Result<KeepId> {
        Ok(self.chain.open_keep(
            self.owner,
            self.operators(),
            honest_threshold,
            OWNER_APPLICATION,
        )?)
    }

    pub async fn wait_for_public_key(
        &self,
        keep: &KeepId,
        timeout: Duration,
    ) -> anyhow::Result<PublicKeyBytes> {
        wait_for(timeout, || async move { anyhow::Ok(self.chain.public_key(keep)?) })
            .await
            .with_context(|| format!("public key of {} not published", keep))
    }

    /// Waits for the first signature submitted for `digest` and checks it
    /// against the keep's public key.
    pub async fn wait_for_signature(
        &self,
        keep: &KeepId,
        digest: &Digest,
        timeout: Duration,
    ) -> anyhow::Result<Signature> {
        let signature = wait_for(timeout, || async move {
            anyhow::Ok(self
                .chain
                .signatures(keep)?
                .into_iter()
                .find(|event| event.digest == *digest)
                .map(|event| event.signature))
        })
        .await
        .with_context(|| format!("no signature for {:?} on {}", digest, keep))?;
        let public_key = self
            .chain
            .public_key(keep)?
            .context("signed keep has no public key")?;
        verify_signature(&public_key, digest, &signature).map_err(anyhow::Error::msg)?;
        Ok(signature)
    }

    pub async fn shutdown(mut self) {
        for index in 0..self.nodes.len() {
            self.stop_node(index).await;
        }
    }
}

/// Polls `check` until it yields a value or `timeout` passes.
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<Option<T>>>,
{
    let result = tokio::time::timeout(timeout, async {
        loop {
            if let Some(value) = check().await? {
                return anyhow::Ok(value);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
    .await;
    match result {
        Ok(value) => value,
        Err(_) => anyhow::bail!("timed out after {:?}", timeout),
    }
}

#[serde_as]
#[derive(Debug, Serialize)]
pub struct SmokeTestReport {
    pub keep: KeepId,
    pub operators: Vec<OperatorId>,
    pub honest_threshold: usize,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_key: PublicKeyBytes,
    pub digest: Digest,
    pub signature: Signature,
    pub submissions: usize,
}

/// Opens a keep over a fresh cluster, waits for its key, requests one
/// signature and checks that exactly one valid signature is submitted.
pub async fn run_smoke_test(
    config: &ConfigFile,
    operators: usize,
    honest_threshold: usize,
) -> anyhow::Result<SmokeTestReport> {
    if honest_threshold == 0 || honest_threshold > operators {
        anyhow::bail!(
            "threshold {} is not within 1..={}",
            honest_threshold,
            operators
        );
    }
    let run_dir = config
        .storage
        .data_dir
        .join(format!("smoke-test-{}", hex::encode(rand::random::<[u8; 4]>())));
    tracing::info!(dir = %run_dir.display(), operators, honest_threshold, "starting smoke test");
    let protocol_timeout = config.tss.protocol_timeout();

    let cluster =
        LocalCluster::start(config, &run_dir, operators, LocalChainConfig::default()).await?;
    let members = cluster.operators();
    let keep = cluster.open_keep(honest_threshold)?;
    let public_key = cluster.wait_for_public_key(&keep, protocol_timeout).await?;
    tracing::info!(%keep, public_key = hex::encode(public_key), "keep public key published");

    let digest = Digest::from(rand::random::<[u8; 32]>());
    cluster.chain.request_signature(&keep, digest.clone())?;
    let signature = cluster
        .wait_for_signature(&keep, &digest, protocol_timeout)
        .await?;
    // Let the stagger of the other signers run out before counting.
    tokio::time::sleep(config.signing.submission_stagger() * honest_threshold as u32).await;
    let submissions = cluster
        .chain
        .mined_calls()
        .iter()
        .filter(|call| call.reverted.is_none() && call.call.method() == "submitSignature")
        .count();
    cluster.shutdown().await;
    if submissions != 1 {
        anyhow::bail!("expected exactly one signature submission, saw {}", submissions);
    }
    Ok(SmokeTestReport {
        keep,
        operators: members,
        honest_threshold,
        public_key,
        digest,
        signature,
        submissions,
    })
}
