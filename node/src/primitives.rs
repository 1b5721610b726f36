use borsh::{BorshDeserialize, BorshSerialize};
use cait_sith::protocol::Participant;
use keep_primitives::{Digest, KeepId, OperatorId};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Index of a member in a keep's ordered member list.
#[derive(
    Clone,
    Debug,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub struct ParticipantId(pub u32);

impl ParticipantId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl From<Participant> for ParticipantId {
    fn from(participant: Participant) -> Self {
        ParticipantId(participant.into())
    }
}

impl From<ParticipantId> for Participant {
    fn from(participant_id: ParticipantId) -> Self {
        Participant::from(participant_id.0)
    }
}

impl Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MpcMessage {
    pub task_id: MpcTaskId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MpcPeerMessage {
    pub from: OperatorId,
    pub message: MpcMessage,
}

/// Identifies one protocol run so that concurrent runs can share the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, BorshSerialize, BorshDeserialize)]
pub enum MpcTaskId {
    KeyGeneration {
        keep: KeepId,
    },
    Signing {
        keep: KeepId,
        digest: Digest,
        attempt: u32,
    },
}

impl MpcTaskId {
    pub fn keep(&self) -> &KeepId {
        match self {
            MpcTaskId::KeyGeneration { keep } => keep,
            MpcTaskId::Signing { keep, .. } => keep,
        }
    }
}

impl Display for MpcTaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MpcTaskId::KeyGeneration { keep } => write!(f, "keygen {}", keep),
            MpcTaskId::Signing {
                keep,
                digest,
                attempt,
            } => write!(f, "signing {} {} #{}", keep, digest, attempt),
        }
    }
}
