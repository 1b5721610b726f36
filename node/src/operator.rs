//! Builds one operator out of its configuration and a chain connection.

use crate::balance::monitor_balance;
use crate::chain::ChainHandles;
use crate::config::ConfigFile;
use crate::dedup::EventDeduplicator;
use crate::firewall::Firewall;
use crate::keygen::pool::PreParamsPool;
use crate::lifecycle::registration::monitor_registration;
use crate::lifecycle::{KeepController, LifecycleConfig, CHAIN_RETRY_TIMEOUT};
use crate::network::local::LocalMeshHub;
use crate::network::tcp::new_tcp_mesh_network;
use crate::network::{run_network_client, MeshNetworkClient};
use crate::registry::SignerRegistry;
use crate::retry::RetryPolicy;
use crate::storage::KeepStorage;
use crate::tracking::{self, AutoAbortTask};
use anyhow::Context;
use k256::ecdsa::SigningKey;
use keep_primitives::OperatorId;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub enum MeshTransport {
    /// In-process mesh shared with the other operators of the hub.
    Local(LocalMeshHub),
    Tcp {
        listen: SocketAddr,
        peers: Vec<String>,
    },
}

/// A running operator. Dropping it stops every task it started.
pub struct OperatorNode {
    pub operator: OperatorId,
    pub chain: ChainHandles,
    pub registry: Arc<SignerRegistry>,
    pub firewall: Arc<Firewall>,
    pub network: Arc<MeshNetworkClient>,
    pub controller: Arc<KeepController>,
    /// Bound address of the TCP mesh listener.
    pub listen_address: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: Vec<AutoAbortTask<()>>,
    _network_task: AutoAbortTask<()>,
}

impl OperatorNode {
    pub async fn start(
        config: &ConfigFile,
        key: &SigningKey,
        aes_key: &[u8; 16],
        chain: ChainHandles,
        transport: MeshTransport,
        cancel: CancellationToken,
    ) -> anyhow::Result<Self> {
        let operator = chain.writer.operator();
        tracing::info!(%operator, data_dir = %config.storage.data_dir.display(), "starting operator");

        let storage = Arc::new(
            KeepStorage::new(config.storage.data_dir.clone())
                .await
                .context("open data directory")?,
        );
        let registry = Arc::new(SignerRegistry::new(storage, aes_key));
        let dedup = Arc::new(EventDeduplicator::with_confirmation(
            registry.clone(),
            chain.queries.clone(),
            RetryPolicy::with_timeout(config.signing.confirmation_timeout()),
        ));
        let pool = PreParamsPool::new(
            config.tss.default_threshold,
            config.tss.pre_params_pool_size,
        );
        pool.start();
        let firewall = Arc::new(Firewall::new(chain.stake.clone(), chain.queries.clone()));

        let (network, network_task, listen_address) = match transport {
            MeshTransport::Local(hub) => {
                let (client, task) = hub.connect_client(operator);
                (client, task, None)
            }
            MeshTransport::Tcp { listen, peers } => {
                let (sender, receiver, address) =
                    new_tcp_mesh_network(listen, &peers, key, firewall.clone())
                        .await
                        .context("start TCP mesh")?;
                tracing::info!(%address, peers = peers.len(), "mesh listening");
                let (client, task) = run_network_client(Arc::new(sender), Box::new(receiver));
                (client, task, Some(address))
            }
        };

        let controller = KeepController::new(
            chain.clone(),
            registry.clone(),
            dedup,
            pool,
            network.clone(),
            LifecycleConfig::from(config),
            cancel.clone(),
        );

        let mut tasks = vec![
            tracking::spawn_checked("keep controller", controller.clone().run()),
            tracking::spawn_checked(
                "balance monitor",
                monitor_balance(
                    cancel.clone(),
                    chain.queries.clone(),
                    operator,
                    config.chain.balance_alert_threshold,
                    config.chain.balance_monitor_interval(),
                ),
            ),
        ];
        if let Some(application) = &config.tbtc.tbtc_system {
            tasks.push(tracking::spawn_checked(
                "registration monitor",
                monitor_registration(
                    cancel.clone(),
                    chain.queries.clone(),
                    chain.writer.clone(),
                    application.clone(),
                    config.chain.status_check_interval(),
                    RetryPolicy::with_timeout(CHAIN_RETRY_TIMEOUT),
                ),
            ));
        }

        Ok(Self {
            operator,
            chain,
            registry,
            firewall,
            network,
            controller,
            listen_address,
            cancel,
            tasks,
            _network_task: network_task,
        })
    }

    /// Cancels every task and waits for the operator's tasks to wind down.
    pub async fn shutdown(self) {
        tracing::info!(operator = %self.operator, "shutting down operator");
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
