use crate::chain::local::{verify_signature, LocalChain, LocalChainConfig};
use crate::chain::{operator_id_of, Signature};
use crate::config::{load_config, parse_aes_key, ChainBackend, Config, ConfigFile};
use crate::operator::{MeshTransport, OperatorNode};
use crate::protocol::ProtocolTimeouts;
use crate::registry::SignerRegistry;
use crate::signing::sign_offline;
use crate::smoke::run_smoke_test;
use crate::storage::KeepStorage;
use crate::tracking::{self, start_root_task};
use crate::web::start_web_server;
use anyhow::Context;
use clap::Parser;
use keep_primitives::{Digest, KeepId};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Funds the operator account of a standalone local chain starts with.
const LOCAL_OPERATOR_FUNDS: u128 = 1_000_000_000_000_000_000;
const LOCAL_BLOCK_INTERVAL: Duration = Duration::from_secs(1);

/// Version and commit the binary was built from.
pub const VERSION: &str = concat!(env!("KEEP_NODE_VERSION"), " (", env!("KEEP_NODE_COMMIT"), ")");

#[derive(Parser, Debug)]
#[command(version = VERSION)]
pub enum Cli {
    /// Runs the operator daemon.
    Start(StartCmd),
    /// Signs a digest offline with shares taken from operator data directories.
    Sign(SignCmd),
    /// Runs key generation and one signing over an in-process cluster.
    SmokeTest(SmokeTestCmd),
}

impl Cli {
    /// Path of the config file the command reads.
    pub fn config_path(&self) -> &PathBuf {
        match self {
            Cli::Start(cmd) => &cmd.config,
            Cli::Sign(cmd) => &cmd.config,
            Cli::SmokeTest(cmd) => &cmd.config,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        match self {
            Cli::Start(start) => start.run().await,
            Cli::Sign(sign) => sign.run().await,
            Cli::SmokeTest(smoke_test) => smoke_test.run().await,
        }
    }
}

#[derive(Parser, Debug)]
pub struct StartCmd {
    #[arg(long, env("KEEP_CONFIG"))]
    pub config: PathBuf,
    /// Hex-encoded 16 byte AES key for share encryption.
    /// This key should come from a secure secret storage.
    #[arg(long, env("KEEP_SECRET_STORE_KEY"))]
    pub secret_store_key_hex: String,
}

impl StartCmd {
    async fn run(self) -> anyhow::Result<()> {
        let config = load_config(&self.config, parse_aes_key(&self.secret_store_key_hex)?)?;
        let (root_future, _) = start_root_task("root", Self::run_operator(config));
        root_future.await
    }

    async fn run_operator(config: Config) -> anyhow::Result<()> {
        let Config { file, secrets } = config;
        tracing::info!(version = VERSION, "starting keep node");
        match file.chain.backend {
            ChainBackend::Local => tracing::info!("using the in-process local chain"),
        }
        let operator = operator_id_of(secrets.operator_key.verifying_key().as_affine());

        let chain = LocalChain::new(LocalChainConfig::default());
        chain.set_stake(operator, LOCAL_OPERATOR_FUNDS);
        chain.set_balance(operator, LOCAL_OPERATOR_FUNDS);
        let _block_producer = chain.spawn_block_producer(LOCAL_BLOCK_INTERVAL);
        let cancel = CancellationToken::new();
        let handles = chain.connect(secrets.operator_key.clone(), &file.chain, cancel.clone());
        let transactions = handles.transactions.clone();

        let listen: SocketAddr = format!("{}:{}", file.peer.host, file.peer.port)
            .parse()
            .context("parse peer listen address")?;
        let node = OperatorNode::start(
            &file,
            &secrets.operator_key,
            &secrets.aes_key,
            handles,
            MeshTransport::Tcp {
                listen,
                peers: file.peer.peers.clone(),
            },
            cancel.clone(),
        )
        .await?;

        let _web_server = match &file.web_ui {
            Some(web_ui) => {
                let web_server = start_web_server(
                    tracking::current_task(),
                    node.controller.clone(),
                    transactions,
                    web_ui.clone(),
                )
                .await?;
                Some(tracking::spawn_checked("web server", web_server))
            }
            None => None,
        };

        shutdown_signal().await;
        tracing::info!("shutdown requested");
        node.shutdown().await;
        Ok(())
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(%err, "cannot listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Parser, Debug)]
pub struct SignCmd {
    #[arg(long, env("KEEP_CONFIG"))]
    pub config: PathBuf,
    /// Hex-encoded 16 byte AES key the shares were encrypted with.
    #[arg(long, env("KEEP_SECRET_STORE_KEY"))]
    pub secret_store_key_hex: String,
    #[arg(long)]
    pub keep: KeepId,
    /// Hex-encoded 32 byte digest.
    #[arg(long)]
    pub digest: Digest,
    /// Data directories holding shares of the keep.
    #[arg(required = true)]
    pub data_dirs: Vec<PathBuf>,
}

#[derive(Serialize)]
struct SignOutput {
    keep: KeepId,
    digest: Digest,
    signature: Signature,
}

impl SignCmd {
    async fn run(self) -> anyhow::Result<()> {
        let config = ConfigFile::from_file(&self.config)?;
        let aes_key = parse_aes_key(&self.secret_store_key_hex)?;
        let mut shares = Vec::new();
        for data_dir in &self.data_dirs {
            let storage = Arc::new(
                KeepStorage::new(data_dir.clone())
                    .await
                    .with_context(|| format!("open {}", data_dir.display()))?,
            );
            let registry = SignerRegistry::new(storage, &aes_key);
            let (loaded, errors) = registry.load_all().await?;
            for err in errors {
                tracing::warn!(data_dir = %data_dir.display(), %err, "skipping unreadable share");
            }
            let found = loaded
                .into_iter()
                .filter(|share| share.keep == self.keep)
                .collect::<Vec<_>>();
            tracing::info!(data_dir = %data_dir.display(), shares = found.len(), "loaded shares");
            shares.extend(found);
        }
        let Some(public_key) = shares.first().map(|share| share.public_key_bytes()) else {
            anyhow::bail!("no share of {} in the given data directories", self.keep);
        };

        let signature = sign_offline(
            &shares,
            &self.digest,
            ProtocolTimeouts::from(&config.tss),
            &CancellationToken::new(),
        )
        .await?;
        verify_signature(&public_key, &self.digest, &signature).map_err(anyhow::Error::msg)?;
        let output = SignOutput {
            keep: self.keep,
            digest: self.digest,
            signature,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct SmokeTestCmd {
    #[arg(long, env("KEEP_CONFIG"))]
    pub config: PathBuf,
    #[arg(long, default_value = "3")]
    pub operators: usize,
    #[arg(long, default_value = "2")]
    pub threshold: usize,
}

impl SmokeTestCmd {
    async fn run(self) -> anyhow::Result<()> {
        let config = ConfigFile::from_file(&self.config)?;
        let (root_future, _) = start_root_task(
            "smoke test",
            async move { run_smoke_test(&config, self.operators, self.threshold).await },
        );
        let report = root_future.await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
