//! Capability interfaces the operator uses to talk to a chain, and the typed
//! records they carry.
//!
//! The lifecycle controller consumes events through [`ChainEventSource`] and
//! acts through [`ChainWriter`]; reads go through [`ChainQueries`]. A backend
//! implements all of them, so the controller never depends on a concrete chain.

pub mod limiter;
pub mod local;
pub mod tx_sender;

use crate::error::{KeepError, KeepResult};
use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint};
use keep_primitives::{Digest, KeepId, OperatorId};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::sync::Arc;
use tokio::sync::mpsc;

/// On-chain encoding of a keep public key: X || Y, each left padded to 32 bytes.
pub type PublicKeyBytes = [u8; 64];

/// Capacity of every event subscription channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Bounded stream of chain events. The backend drops the sending side when the
/// subscriber falls behind; the consumer then sees the stream end and resubscribes.
pub type EventStream<T> = mpsc::Receiver<T>;

/// ECDSA signature in the on-chain format.
#[serde_as]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, BorshSerialize, BorshDeserialize,
)]
pub struct Signature {
    #[serde_as(as = "serde_with::hex::Hex")]
    pub r: [u8; 32],
    #[serde_as(as = "serde_with::hex::Hex")]
    pub s: [u8; 32],
    /// 0 or 1.
    pub recovery_id: u8,
}

/// Left pads `bytes` with zeros to 32 bytes. Longer inputs are rejected.
pub fn left_pad_to_32_bytes(bytes: &[u8]) -> KeepResult<[u8; 32]> {
    if bytes.len() > 32 {
        return Err(KeepError::Crypto(format!(
            "cannot pad {} bytes into 32",
            bytes.len()
        )));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(padded)
}

/// Encodes a curve point as X || Y. The identity has no such encoding and maps
/// to all zeros, which no chain accepts as a key.
pub fn encode_public_key(point: &AffinePoint) -> PublicKeyBytes {
    let encoded = point.to_encoded_point(false);
    let mut bytes = [0u8; 64];
    if let Some(xy) = encoded.as_bytes().get(1..65) {
        bytes.copy_from_slice(xy);
    }
    bytes
}

pub fn decode_public_key(bytes: &PublicKeyBytes) -> KeepResult<AffinePoint> {
    let encoded = EncodedPoint::from_untagged_bytes(bytes.as_slice().into());
    Option::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| KeepError::Crypto("public key is not a curve point".to_string()))
}

/// Address of the account controlled by the given public key.
pub fn operator_id_of(point: &AffinePoint) -> OperatorId {
    OperatorId::from_public_key_xy(&encode_public_key(point))
}

/// Rejects keep ids minted by a different chain family.
pub fn check_chain_tag(keep: &KeepId, expected: &str) -> KeepResult<()> {
    if keep.chain_tag() != expected {
        return Err(KeepError::ChainFatal(format!(
            "keep {} does not belong to chain {}",
            keep, expected
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepCreatedEvent {
    pub keep: KeepId,
    pub members: Vec<OperatorId>,
    pub honest_threshold: usize,
    pub owner: OperatorId,
    pub application: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeepEvent {
    SignatureRequested {
        digest: Digest,
        block_number: u64,
    },
    PublicKeyPublished {
        public_key: PublicKeyBytes,
        block_number: u64,
    },
    ConflictingPublicKeySubmitted {
        submitter: OperatorId,
        public_key: PublicKeyBytes,
        block_number: u64,
    },
    KeepClosed {
        block_number: u64,
    },
    KeepTerminated {
        block_number: u64,
    },
}

impl KeepEvent {
    pub fn block_number(&self) -> u64 {
        match self {
            KeepEvent::SignatureRequested { block_number, .. }
            | KeepEvent::PublicKeyPublished { block_number, .. }
            | KeepEvent::ConflictingPublicKeySubmitted { block_number, .. }
            | KeepEvent::KeepClosed { block_number }
            | KeepEvent::KeepTerminated { block_number } => *block_number,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureSubmittedEvent {
    pub keep: KeepId,
    pub digest: Digest,
    pub signature: Signature,
    pub submitter: OperatorId,
    pub block_number: u64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainEventSource: Send + Sync {
    async fn subscribe_keep_created(&self) -> KeepResult<EventStream<KeepCreatedEvent>>;
    /// Every per-keep event type, in block order.
    async fn subscribe_keep_events(&self, keep: &KeepId) -> KeepResult<EventStream<KeepEvent>>;
    async fn current_block(&self) -> KeepResult<u64>;
    /// Resolves once the chain has reached `height`.
    async fn wait_for_block(&self, height: u64) -> KeepResult<()>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainQueries: Send + Sync {
    async fn is_active(&self, keep: &KeepId) -> KeepResult<bool>;
    async fn is_awaiting_signature(&self, keep: &KeepId, digest: &Digest) -> KeepResult<bool>;
    async fn latest_digest(&self, keep: &KeepId) -> KeepResult<Option<Digest>>;
    async fn signature_requested_block(
        &self,
        keep: &KeepId,
        digest: &Digest,
    ) -> KeepResult<Option<u64>>;
    /// `None` until a public key has been published.
    async fn get_public_key(&self, keep: &KeepId) -> KeepResult<Option<PublicKeyBytes>>;
    async fn get_members(&self, keep: &KeepId) -> KeepResult<Vec<OperatorId>>;
    async fn get_honest_threshold(&self, keep: &KeepId) -> KeepResult<usize>;
    /// Unix seconds.
    async fn get_opened_timestamp(&self, keep: &KeepId) -> KeepResult<u64>;
    /// Ascending block order.
    async fn past_signature_submitted_events(
        &self,
        keep: &KeepId,
        from_block: u64,
    ) -> KeepResult<Vec<SignatureSubmittedEvent>>;
    async fn get_keep_count(&self) -> KeepResult<u64>;
    async fn get_keep_at_index(&self, index: u64) -> KeepResult<KeepId>;
    async fn balance(&self, account: &OperatorId) -> KeepResult<u128>;
    async fn is_registered_for_application(&self, application: &str) -> KeepResult<bool>;
    async fn is_status_up_to_date(&self, application: &str) -> KeepResult<bool>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainWriter: Send + Sync {
    fn operator(&self) -> OperatorId;
    async fn submit_keep_public_key(
        &self,
        keep: &KeepId,
        public_key: PublicKeyBytes,
    ) -> KeepResult<()>;
    async fn submit_signature(&self, keep: &KeepId, signature: Signature) -> KeepResult<()>;
    async fn register_as_member_candidate(&self, application: &str) -> KeepResult<()>;
    async fn update_status_for_application(&self, application: &str) -> KeepResult<()>;
}

/// External stake policy consulted by the firewall.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StakeMonitor: Send + Sync {
    async fn has_minimum_stake(&self, operator: &OperatorId) -> KeepResult<bool>;
}

/// The capability set one operator holds for one chain.
#[derive(Clone)]
pub struct ChainHandles {
    pub events: Arc<dyn ChainEventSource>,
    pub queries: Arc<dyn ChainQueries>,
    pub writer: Arc<dyn ChainWriter>,
    pub stake: Arc<dyn StakeMonitor>,
    /// Submission history, when writes go through a [`tx_sender::TransactionSubmitter`].
    pub transactions: Option<Arc<tx_sender::TransactionSubmitter>>,
}

/// A state-changing contract call, as carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ContractCall {
    SubmitKeepPublicKey {
        keep: KeepId,
        public_key: PublicKeyBytes,
    },
    SubmitSignature {
        keep: KeepId,
        signature: Signature,
    },
    RegisterMemberCandidate {
        application: String,
    },
    UpdateStatusForApplication {
        application: String,
    },
}

impl ContractCall {
    pub fn method(&self) -> &'static str {
        match self {
            ContractCall::SubmitKeepPublicKey { .. } => "submitPublicKey",
            ContractCall::SubmitSignature { .. } => "submitSignature",
            ContractCall::RegisterMemberCandidate { .. } => "registerMemberCandidate",
            ContractCall::UpdateStatusForApplication { .. } => "updateStatusForApplication",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    #[rstest]
    #[case::empty(vec![], [0u8; 32])]
    #[case::short(vec![0xab, 0xcd], {
        let mut padded = [0u8; 32];
        padded[30] = 0xab;
        padded[31] = 0xcd;
        padded
    })]
    #[case::exact(vec![1u8; 32], [1u8; 32])]
    fn test_left_pad(#[case] input: Vec<u8>, #[case] expected: [u8; 32]) {
        assert_eq!(left_pad_to_32_bytes(&input).unwrap(), expected);
    }

    #[test]
    fn test_left_pad_rejects_long_input() {
        assert_matches!(left_pad_to_32_bytes(&[1u8; 33]), Err(KeepError::Crypto(_)));
    }

    #[test]
    fn test_chain_tag_mismatch_is_fatal() {
        let keep: KeepId = "celo:0x01".parse().unwrap();
        assert_matches!(check_chain_tag(&keep, "local"), Err(KeepError::ChainFatal(_)));
        assert!(check_chain_tag(&keep, "celo").is_ok());
    }

    #[test]
    fn test_operator_id_of_generator() {
        // Address of the secret key 1.
        assert_eq!(
            operator_id_of(&AffinePoint::GENERATOR).to_string(),
            "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
        let encoded = encode_public_key(&AffinePoint::GENERATOR);
        assert_eq!(decode_public_key(&encoded).unwrap(), AffinePoint::GENERATOR);
        assert_matches!(decode_public_key(&[7u8; 64]), Err(KeepError::Crypto(_)));
    }

    #[test]
    fn test_signature_json_is_hex() {
        let signature = Signature {
            r: [1; 32],
            s: [2; 32],
            recovery_id: 1,
        };
        let json = serde_json::to_value(signature).unwrap();
        assert_eq!(json["r"], "01".repeat(32));
        assert_eq!(json["recovery_id"], 1);
        let back: Signature = serde_json::from_value(json).unwrap();
        assert_eq!(back, signature);
    }
}
