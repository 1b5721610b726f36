//! TCP mesh transport.
//!
//! Every operator dials each configured peer address and keeps one outgoing
//! connection per peer alive, reconnecting when it breaks; outgoing
//! connections only carry messages from us. Messages from a peer arrive on the
//! connection that peer dialed to us. Both directions start with
//! [`p2p_handshake`] and admit the remote key through a [`PeerAdmission`]
//! policy before any message flows.

use super::handshake::{p2p_handshake, PeerIdentity};
use super::{MeshNetworkTransportReceiver, MeshNetworkTransportSender};
use crate::error::{KeepError, KeepResult};
use crate::firewall::Firewall;
use crate::metrics;
use crate::primitives::{MpcMessage, MpcPeerMessage};
use crate::tracking::{self, AutoAbortTask, AutoAbortTaskCollection};
use anyhow::Context;
use async_trait::async_trait;
use borsh::BorshDeserialize;
use k256::ecdsa::SigningKey;
use keep_primitives::OperatorId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);
const CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_CONNECTION_RETRY_DELAY: Duration = Duration::from_secs(30);
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const INCOMING_CHANNEL_CAPACITY: usize = 4096;

const PING_TAG: u8 = 0;
const DATA_TAG: u8 = 1;

/// Decides whether an authenticated peer may exchange messages with us.
#[async_trait]
pub trait PeerAdmission: Send + Sync + 'static {
    async fn admit(&self, peer: &PeerIdentity) -> KeepResult<()>;
}

#[async_trait]
impl PeerAdmission for Firewall {
    async fn admit(&self, peer: &PeerIdentity) -> KeepResult<()> {
        self.validate_remote_public_key(&peer.public_key).await
    }
}

enum Packet {
    Ping,
    Data(Vec<u8>),
}

/// One live outgoing connection. Dropping it closes the socket.
struct TcpConnection {
    sender: mpsc::UnboundedSender<Packet>,
    _sender_task: AutoAbortTask<()>,
    _keepalive_task: AutoAbortTask<()>,
    closed: CancellationToken,
}

struct DropToCancel(CancellationToken);

impl Drop for DropToCancel {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl TcpConnection {
    async fn dial(
        address: &str,
        key: &SigningKey,
        admission: &dyn PeerAdmission,
    ) -> KeepResult<(PeerIdentity, TcpConnection)> {
        let mut stream = TcpStream::connect(address)
            .await
            .map_err(|err| KeepError::Transport(format!("connect {}: {}", address, err)))?;
        let peer = p2p_handshake(&mut stream, key, HANDSHAKE_TIMEOUT).await?;
        admission.admit(&peer).await?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<Packet>();
        let closed = CancellationToken::new();
        let closed_clone = closed.clone();
        let sender_task = tracking::spawn_checked(
            &format!("TCP connection to {}", peer.operator),
            async move {
                let _drop_to_cancel = DropToCancel(closed_clone);
                let mut sent_bytes: u64 = 0;
                loop {
                    tokio::select! {
                        packet = receiver.recv() => {
                            let Some(packet) = packet else {
                                break;
                            };
                            match packet {
                                Packet::Ping => {
                                    stream.write_u8(PING_TAG).await?;
                                    sent_bytes += 1;
                                }
                                Packet::Data(data) => {
                                    stream.write_u8(DATA_TAG).await?;
                                    stream.write_u32(data.len() as u32).await?;
                                    stream.write_all(&data).await?;
                                    sent_bytes += 5 + data.len() as u64;
                                }
                            }
                            tracking::set_progress(&format!("Sent {} bytes", sent_bytes));
                        }
                        // Nothing is expected from the other side; a read
                        // returning means the connection broke.
                        _ = stream.read_u8() => {
                            break;
                        }
                    }
                }
                anyhow::Ok(())
            },
        );
        let keepalive_sender = sender.clone();
        let keepalive_task = tracking::spawn(
            &format!("TCP keepalive for {}", peer.operator),
            async move {
                loop {
                    tokio::time::sleep(KEEPALIVE_INTERVAL).await;
                    if keepalive_sender.send(Packet::Ping).is_err() {
                        break;
                    }
                }
            },
        );
        Ok((
            peer,
            TcpConnection {
                sender,
                _sender_task: sender_task,
                _keepalive_task: keepalive_task,
                closed,
            },
        ))
    }

    fn send(&self, data: Vec<u8>) -> KeepResult<()> {
        self.sender
            .send(Packet::Data(data))
            .map_err(|_| KeepError::Transport("connection closed".to_string()))
    }
}

type Connections = Arc<Mutex<HashMap<OperatorId, Arc<TcpConnection>>>>;

/// Dials `address` until the returned task is dropped, keeping the
/// connection registered under the identity the peer proved.
fn maintain_connection(
    me: OperatorId,
    address: String,
    key: SigningKey,
    admission: Arc<dyn PeerAdmission>,
    connections: Connections,
) -> AutoAbortTask<()> {
    tracking::spawn(&format!("Persistent connection to {}", address), async move {
        let mut delay = CONNECTION_RETRY_DELAY;
        loop {
            let (peer, connection) =
                match TcpConnection::dial(&address, &key, admission.as_ref()).await {
                    Ok(dialed) => dialed,
                    Err(err) => {
                        tracing::info!(%address, %err, "could not connect to peer, retrying");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(MAX_CONNECTION_RETRY_DELAY);
                        continue;
                    }
                };
            delay = CONNECTION_RETRY_DELAY;
            tracing::info!(%address, peer = %peer.operator, me = %me, "connected to peer");
            let connection = Arc::new(connection);
            connections
                .lock()
                .unwrap()
                .insert(peer.operator, connection.clone());
            let gauge = metrics::NETWORK_LIVE_CONNECTIONS
                .with_label_values(&[&me.to_string(), &peer.operator.to_string()]);
            gauge.set(1);
            connection.closed.cancelled().await;
            gauge.set(0);
            {
                let mut connections = connections.lock().unwrap();
                if connections
                    .get(&peer.operator)
                    .is_some_and(|current| Arc::ptr_eq(current, &connection))
                {
                    connections.remove(&peer.operator);
                }
            }
            tracing::info!(%address, peer = %peer.operator, "connection to peer closed");
            tokio::time::sleep(CONNECTION_RETRY_DELAY).await;
        }
    })
}

pub struct TcpMeshSender {
    me: OperatorId,
    connections: Connections,
    _dialers: Vec<AutoAbortTask<()>>,
}

#[async_trait]
impl MeshNetworkTransportSender for TcpMeshSender {
    fn my_operator_id(&self) -> OperatorId {
        self.me
    }

    async fn send(&self, recipient: OperatorId, message: MpcMessage) -> KeepResult<()> {
        let connection = self
            .connections
            .lock()
            .unwrap()
            .get(&recipient)
            .cloned()
            .ok_or_else(|| KeepError::Transport(format!("no connection to {}", recipient)))?;
        let data = borsh::to_vec(&message)
            .map_err(|err| KeepError::Transport(format!("encode message: {}", err)))?;
        connection.send(data)
    }
}

impl TcpMeshSender {
    /// Operators with a live outgoing connection.
    pub fn connected_peers(&self) -> Vec<OperatorId> {
        let mut peers = self
            .connections
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect::<Vec<_>>();
        peers.sort();
        peers
    }
}

pub struct TcpMeshReceiver {
    receiver: mpsc::Receiver<MpcPeerMessage>,
    _incoming_connections_task: AutoAbortTask<()>,
}

#[async_trait]
impl MeshNetworkTransportReceiver for TcpMeshReceiver {
    async fn receive(&mut self) -> KeepResult<MpcPeerMessage> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| KeepError::Transport("listener stopped".to_string()))
    }
}

async fn handle_incoming(
    mut stream: TcpStream,
    key: SigningKey,
    admission: Arc<dyn PeerAdmission>,
    message_sender: mpsc::Sender<MpcPeerMessage>,
) -> anyhow::Result<()> {
    let peer = p2p_handshake(&mut stream, &key, HANDSHAKE_TIMEOUT).await?;
    admission.admit(&peer).await?;
    tracking::set_progress(&format!("Authenticated as {}", peer.operator));
    let mut received_bytes: u64 = 0;
    loop {
        match stream.read_u8().await? {
            PING_TAG => {
                received_bytes += 1;
            }
            DATA_TAG => {
                let len = stream.read_u32().await? as usize;
                if len > MAX_FRAME_LEN {
                    anyhow::bail!("frame of {} bytes from {} is too large", len, peer.operator);
                }
                let mut buf = vec![0u8; len];
                stream.read_exact(&mut buf).await?;
                let message = MpcPeerMessage {
                    from: peer.operator,
                    message: MpcMessage::try_from_slice(&buf)
                        .with_context(|| format!("decode message from {}", peer.operator))?,
                };
                message_sender.send(message).await?;
                received_bytes += 5 + len as u64;
            }
            tag => anyhow::bail!("invalid frame tag {} from {}", tag, peer.operator),
        }
        tracking::set_progress(&format!("Received {} bytes", received_bytes));
    }
}

/// Binds `listen` and dials every address in `peers`. Returns the transport
/// halves and the bound address.
pub async fn new_tcp_mesh_network(
    listen: SocketAddr,
    peers: &[String],
    key: &SigningKey,
    admission: Arc<dyn PeerAdmission>,
) -> anyhow::Result<(TcpMeshSender, TcpMeshReceiver, SocketAddr)> {
    let me = crate::chain::operator_id_of(key.verifying_key().as_affine());
    let listener = TcpListener::bind(listen).await.context("TCP bind")?;
    let local_addr = listener.local_addr().context("TCP local address")?;

    let (message_sender, message_receiver) = mpsc::channel(INCOMING_CHANNEL_CAPACITY);
    let listener_key = key.clone();
    let listener_admission = admission.clone();
    let incoming_connections_task = tracking::spawn("Handle incoming connections", async move {
        let mut tasks = AutoAbortTaskCollection::new();
        while let Ok((stream, address)) = listener.accept().await {
            tasks.spawn_checked(
                &format!("Handle connection from {}", address),
                handle_incoming(
                    stream,
                    listener_key.clone(),
                    listener_admission.clone(),
                    message_sender.clone(),
                ),
            );
        }
    });

    let connections: Connections = Arc::new(Mutex::new(HashMap::new()));
    let dialers = peers
        .iter()
        .map(|address| {
            maintain_connection(
                me,
                address.clone(),
                key.clone(),
                admission.clone(),
                connections.clone(),
            )
        })
        .collect();

    Ok((
        TcpMeshSender {
            me,
            connections,
            _dialers: dialers,
        },
        TcpMeshReceiver {
            receiver: message_receiver,
            _incoming_connections_task: incoming_connections_task,
        },
        local_addr,
    ))
}
