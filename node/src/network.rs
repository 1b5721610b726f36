pub mod handshake;
pub mod local;
pub mod tcp;

use crate::error::{KeepError, KeepResult};
use crate::primitives::{MpcMessage, MpcPeerMessage, MpcTaskId};
use crate::tracking::{self, AutoAbortTask};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use keep_primitives::OperatorId;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Messages buffered per task before the transport starts dropping them.
const TASK_CHANNEL_CAPACITY: usize = 1024;

/// Messages for a task nobody claimed are discarded after this long.
pub const PENDING_CHANNEL_TTL: Duration = Duration::from_secs(10 * 60);

/// Abstraction of the networking layer, from the view of one operator, the
/// sender side. There is one instance per running operator, shared via Arc.
#[async_trait::async_trait]
pub trait MeshNetworkTransportSender: Send + Sync + 'static {
    fn my_operator_id(&self) -> OperatorId;
    /// Sends a message to the specified recipient. Delivery is not
    /// guaranteed; an error means the message certainly was not sent.
    async fn send(&self, recipient: OperatorId, message: MpcMessage) -> KeepResult<()>;
}

/// The receiving side of the networking layer.
#[async_trait::async_trait]
pub trait MeshNetworkTransportReceiver: Send + 'static {
    async fn receive(&mut self) -> KeepResult<MpcPeerMessage>;
}

enum TaskSlot {
    /// Messages arrived before the local task started.
    Pending {
        sender: mpsc::Sender<MpcPeerMessage>,
        receiver: mpsc::Receiver<MpcPeerMessage>,
        created: Instant,
    },
    Claimed(mpsc::Sender<MpcPeerMessage>),
}

/// Multiplexes protocol runs onto the transport, one channel per [`MpcTaskId`].
#[derive(Clone)]
pub struct MeshNetworkClient {
    transport_sender: Arc<dyn MeshNetworkTransportSender>,
    tasks: Arc<Mutex<HashMap<MpcTaskId, TaskSlot>>>,
}

impl MeshNetworkClient {
    /// Returns the channel for a task this operator is starting. Messages
    /// that peers sent for it earlier are waiting in the channel.
    pub fn new_channel_for_task(&self, task_id: MpcTaskId) -> KeepResult<NetworkTaskChannel> {
        let mut tasks = self.tasks.lock().unwrap();
        let receiver = match tasks.remove(&task_id) {
            Some(TaskSlot::Claimed(sender)) => {
                tasks.insert(task_id.clone(), TaskSlot::Claimed(sender));
                return Err(KeepError::Protocol(format!("{} is already running", task_id)));
            }
            Some(TaskSlot::Pending {
                sender, receiver, ..
            }) => {
                tasks.insert(task_id.clone(), TaskSlot::Claimed(sender));
                receiver
            }
            None => {
                let (sender, receiver) = mpsc::channel(TASK_CHANNEL_CAPACITY);
                tasks.insert(task_id.clone(), TaskSlot::Claimed(sender));
                receiver
            }
        };
        drop(tasks);

        let transport_sender = self.transport_sender.clone();
        let send_task_id = task_id.clone();
        let send_fn: SendFnForTaskChannel = Box::new(move |recipient, data| {
            let transport_sender = transport_sender.clone();
            let task_id = send_task_id.clone();
            async move {
                transport_sender
                    .send(recipient, MpcMessage { task_id, data })
                    .await
            }
            .boxed()
        });
        Ok(NetworkTaskChannel {
            task_id,
            sender: send_fn,
            receiver,
            tasks: self.tasks.clone(),
        })
    }

    pub fn my_operator_id(&self) -> OperatorId {
        self.transport_sender.my_operator_id()
    }

    /// Number of tasks with queued messages that no local task has claimed.
    pub fn pending_tasks(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .values()
            .filter(|slot| matches!(slot, TaskSlot::Pending { .. }))
            .count()
    }

    fn dispatch(&self, message: MpcPeerMessage) {
        let mut tasks = self.tasks.lock().unwrap();
        let now = Instant::now();
        tasks.retain(|task_id, slot| match slot {
            TaskSlot::Pending { created, .. } if now.duration_since(*created) > PENDING_CHANNEL_TTL => {
                tracing::debug!(%task_id, "discarding unclaimed messages");
                false
            }
            _ => true,
        });
        let sender = match tasks.entry(message.message.task_id.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                TaskSlot::Pending { sender, .. } | TaskSlot::Claimed(sender) => sender.clone(),
            },
            Entry::Vacant(entry) => {
                let (sender, receiver) = mpsc::channel(TASK_CHANNEL_CAPACITY);
                entry.insert(TaskSlot::Pending {
                    sender: sender.clone(),
                    receiver,
                    created: now,
                });
                sender
            }
        };
        drop(tasks);
        if let Err(err) = sender.try_send(message) {
            tracing::warn!("dropping message for congested task: {}", err);
        }
    }
}

async fn run_receive_messages_loop(
    client: MeshNetworkClient,
    mut receiver: Box<dyn MeshNetworkTransportReceiver>,
) -> anyhow::Result<()> {
    loop {
        let message = receiver.receive().await?;
        client.dispatch(message);
    }
}

/// Starts routing received messages to task channels. The routing stops when
/// the returned task is dropped.
pub fn run_network_client(
    transport_sender: Arc<dyn MeshNetworkTransportSender>,
    transport_receiver: Box<dyn MeshNetworkTransportReceiver>,
) -> (Arc<MeshNetworkClient>, AutoAbortTask<()>) {
    let client = MeshNetworkClient {
        transport_sender,
        tasks: Arc::new(Mutex::new(HashMap::new())),
    };
    let task = tracking::spawn_checked(
        "network receive loop",
        run_receive_messages_loop(client.clone(), transport_receiver),
    );
    (Arc::new(client), task)
}

/// Channel for one protocol run. Dropping it unsubscribes the task from the
/// transport.
pub struct NetworkTaskChannel {
    pub task_id: MpcTaskId,
    sender: SendFnForTaskChannel,
    receiver: mpsc::Receiver<MpcPeerMessage>,
    tasks: Arc<Mutex<HashMap<MpcTaskId, TaskSlot>>>,
}

type SendFnForTaskChannel =
    Box<dyn Fn(OperatorId, Vec<u8>) -> BoxFuture<'static, KeepResult<()>> + Send + Sync>;

impl Drop for NetworkTaskChannel {
    fn drop(&mut self) {
        self.tasks.lock().unwrap().remove(&self.task_id);
    }
}

impl NetworkTaskChannel {
    /// Sends a message to another member. Messages may be lost; protocols
    /// bound their waits with timeouts.
    pub async fn send(&self, recipient: OperatorId, data: Vec<u8>) -> KeepResult<()> {
        (self.sender)(recipient, data).await
    }

    /// Messages from one sender arrive in the order they were sent; messages
    /// from different senders are interleaved arbitrarily.
    pub async fn receive(&mut self) -> KeepResult<MpcPeerMessage> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| KeepError::Transport("network client stopped".to_string()))
    }
}
