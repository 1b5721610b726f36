//! In-memory transport connecting operators that share a process.

use super::{
    run_network_client, MeshNetworkClient, MeshNetworkTransportReceiver,
    MeshNetworkTransportSender,
};
use crate::error::{KeepError, KeepResult};
use crate::primitives::{MpcMessage, MpcPeerMessage};
use crate::tracking::AutoAbortTask;
use keep_primitives::OperatorId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct HubState {
    inboxes: HashMap<OperatorId, mpsc::UnboundedSender<MpcPeerMessage>>,
    /// Operators whose traffic is dropped in both directions.
    offline: HashSet<OperatorId>,
}

#[derive(Clone, Default)]
pub struct LocalMeshHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalMeshHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `operator`, replacing an earlier registration.
    pub fn connect(
        &self,
        operator: OperatorId,
    ) -> (Arc<LocalTransportSender>, Box<LocalTransportReceiver>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        state.inboxes.insert(operator, sender);
        state.offline.remove(&operator);
        (
            Arc::new(LocalTransportSender {
                hub: self.clone(),
                me: operator,
            }),
            Box::new(LocalTransportReceiver { receiver }),
        )
    }

    /// Connects and starts a network client for `operator`.
    pub fn connect_client(&self, operator: OperatorId) -> (Arc<MeshNetworkClient>, AutoAbortTask<()>) {
        let (sender, receiver) = self.connect(operator);
        run_network_client(sender, receiver)
    }

    pub fn set_offline(&self, operator: OperatorId, offline: bool) {
        let mut state = self.state.lock().unwrap();
        if offline {
            state.offline.insert(operator);
        } else {
            state.offline.remove(&operator);
        }
    }
}

pub struct LocalTransportSender {
    hub: LocalMeshHub,
    me: OperatorId,
}

#[async_trait::async_trait]
impl MeshNetworkTransportSender for LocalTransportSender {
    fn my_operator_id(&self) -> OperatorId {
        self.me
    }

    async fn send(&self, recipient: OperatorId, message: MpcMessage) -> KeepResult<()> {
        let state = self.hub.state.lock().unwrap();
        if state.offline.contains(&self.me) || state.offline.contains(&recipient) {
            return Err(KeepError::Transport(format!("no route to {}", recipient)));
        }
        state
            .inboxes
            .get(&recipient)
            .ok_or_else(|| KeepError::Transport(format!("unknown peer {}", recipient)))?
            .send(MpcPeerMessage {
                from: self.me,
                message,
            })
            .map_err(|_| KeepError::Transport(format!("peer {} disconnected", recipient)))
    }
}

pub struct LocalTransportReceiver {
    receiver: mpsc::UnboundedReceiver<MpcPeerMessage>,
}

#[async_trait::async_trait]
impl MeshNetworkTransportReceiver for LocalTransportReceiver {
    async fn receive(&mut self) -> KeepResult<MpcPeerMessage> {
        self.receiver
            .recv()
            .await
            .ok_or_else(|| KeepError::Transport("hub closed".to_string()))
    }
}
