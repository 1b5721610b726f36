use super::{operator_id_of, ChainWriter, ContractCall, PublicKeyBytes, Signature};
use crate::error::{KeepError, KeepResult};
use crate::metrics;
use async_trait::async_trait;
use borsh::{BorshDeserialize, BorshSerialize};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use keep_primitives::{Hash32, KeepId, OperatorId};
use lru::LruCache;
use sha3::{Digest as _, Keccak256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionTag;
pub type TxHash = Hash32<TransactionTag>;

const RECENT_TRANSACTIONS: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct UnsignedTransaction {
    pub from: OperatorId,
    pub nonce: u64,
    pub gas_price: u128,
    pub call: ContractCall,
}

impl UnsignedTransaction {
    fn signing_hash(&self) -> KeepResult<[u8; 32]> {
        let bytes = borsh::to_vec(self)
            .map_err(|err| KeepError::ChainFatal(format!("encode transaction: {}", err)))?;
        Ok(Keccak256::digest(bytes).into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct SignedTransaction {
    pub tx: UnsignedTransaction,
    pub signature: [u8; 64],
    pub recovery_id: u8,
}

impl SignedTransaction {
    pub fn sign(tx: UnsignedTransaction, key: &SigningKey) -> KeepResult<Self> {
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&tx.signing_hash()?)
            .map_err(|err| KeepError::Crypto(format!("sign transaction: {}", err)))?;
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&signature.to_bytes());
        Ok(Self {
            tx,
            signature: bytes,
            recovery_id: recovery_id.to_byte(),
        })
    }

    pub fn hash(&self) -> KeepResult<TxHash> {
        let bytes = borsh::to_vec(self)
            .map_err(|err| KeepError::ChainFatal(format!("encode transaction: {}", err)))?;
        Ok(TxHash::from(<[u8; 32]>::from(Keccak256::digest(bytes))))
    }

    /// Recovers the account that signed the transaction.
    pub fn recover_sender(&self) -> KeepResult<OperatorId> {
        let invalid = |what: &str| KeepError::ChainFatal(format!("invalid transaction {}", what));
        let signature = EcdsaSignature::from_slice(&self.signature).map_err(|_| invalid("signature"))?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id).ok_or_else(|| invalid("recovery id"))?;
        let key = VerifyingKey::recover_from_prehash(&self.tx.signing_hash()?, &signature, recovery_id)
            .map_err(|_| invalid("signature"))?;
        Ok(operator_id_of(key.as_affine()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    /// Revert reason, if the call failed.
    pub reverted: Option<String>,
}

/// Raw node access needed to get a transaction mined.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    /// Next nonce for the account, counting transactions still in the mempool.
    async fn pending_nonce(&self, account: &OperatorId) -> KeepResult<u64>;
    async fn gas_price(&self) -> KeepResult<u128>;
    async fn broadcast(&self, tx: SignedTransaction) -> KeepResult<TxHash>;
    async fn receipt(&self, hash: &TxHash) -> KeepResult<Option<TxReceipt>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Pending,
    Replaced,
    Mined(u64),
    Reverted(String),
    Abandoned,
}

#[derive(Debug, Clone)]
pub struct TxRecord {
    pub method: &'static str,
    pub nonce: u64,
    pub gas_price: u128,
    pub status: TxStatus,
}

/// Serializes all writes of one account and drives each of them to inclusion.
///
/// The submission lock is held from the nonce lookup until the broadcast, and
/// released while waiting for the transaction to be mined. A transaction that
/// is not mined within the mining check interval is re-broadcast with the same
/// nonce and a 20% higher gas price, up to `max_gas_price`. The nonce of an
/// abandoned transaction is not remembered, so the next write asks the node
/// again and fills the gap if the node dropped it.
pub struct TransactionSubmitter {
    key: SigningKey,
    operator: OperatorId,
    backend: Arc<dyn TransactionBackend>,
    submission_lock: tokio::sync::Mutex<Option<u64>>,
    mining_check_interval: Duration,
    max_gas_price: u128,
    recent: Mutex<LruCache<TxHash, TxRecord>>,
    cancel: CancellationToken,
}

impl TransactionSubmitter {
    pub fn new(
        key: SigningKey,
        backend: Arc<dyn TransactionBackend>,
        mining_check_interval: Duration,
        max_gas_price: u128,
        cancel: CancellationToken,
    ) -> Self {
        let operator = operator_id_of(key.verifying_key().as_affine());
        Self {
            key,
            operator,
            backend,
            submission_lock: tokio::sync::Mutex::new(None),
            mining_check_interval,
            max_gas_price,
            recent: Mutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_TRANSACTIONS).unwrap(),
            )),
            cancel,
        }
    }

    /// Most recently submitted transactions, newest first.
    pub fn recent_transactions(&self) -> Vec<(TxHash, TxRecord)> {
        self.recent
            .lock()
            .unwrap()
            .iter()
            .map(|(hash, record)| (hash.clone(), record.clone()))
            .collect()
    }

    fn record(&self, hash: &TxHash, tx: &UnsignedTransaction, status: TxStatus) {
        self.recent.lock().unwrap().put(
            hash.clone(),
            TxRecord {
                method: tx.call.method(),
                nonce: tx.nonce,
                gas_price: tx.gas_price,
                status,
            },
        );
    }

    fn set_status(&self, hash: &TxHash, status: TxStatus) {
        if let Some(record) = self.recent.lock().unwrap().peek_mut(hash) {
            record.status = status;
        }
    }

    /// Unless a later write already used a higher nonce, the next write takes
    /// the node's pending nonce.
    async fn forget_nonce(&self, nonce: u64) {
        let mut last_nonce = self.submission_lock.lock().await;
        if *last_nonce == Some(nonce) {
            *last_nonce = nonce.checked_sub(1);
        }
    }

    /// Submits the call and waits until it is mined. Reverts and nonce
    /// exhaustion are `ChainFatal`; shutdown while waiting is `Canceled`.
    pub async fn submit(&self, call: ContractCall) -> KeepResult<TxReceipt> {
        let (mut tx, first_hash) = {
            let mut last_nonce = self.submission_lock.lock().await;
            let pending = self.backend.pending_nonce(&self.operator).await?;
            let nonce = match *last_nonce {
                Some(last) => pending.max(last + 1),
                None => pending,
            };
            let gas_price = self.backend.gas_price().await?.min(self.max_gas_price);
            let tx = SignedTransaction::sign(
                UnsignedTransaction {
                    from: self.operator,
                    nonce,
                    gas_price,
                    call,
                },
                &self.key,
            )?;
            let hash = self.backend.broadcast(tx.clone()).await?;
            *last_nonce = Some(nonce);
            metrics::KEEP_LATEST_NONCE.set(nonce as i64);
            (tx, hash)
        };
        tracing::info!(
            method = tx.tx.call.method(),
            nonce = tx.tx.nonce,
            gas_price = tx.tx.gas_price,
            "broadcast transaction {}",
            first_hash
        );
        self.record(&first_hash, &tx.tx, TxStatus::Pending);
        let mut hashes = vec![first_hash];

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(KeepError::Canceled),
                _ = tokio::time::sleep(self.mining_check_interval) => {}
            }
            for hash in &hashes {
                if let Some(receipt) = self.backend.receipt(hash).await? {
                    for other in hashes.iter().filter(|other| *other != hash) {
                        self.set_status(other, TxStatus::Replaced);
                    }
                    return match receipt.reverted.clone() {
                        None => {
                            self.set_status(hash, TxStatus::Mined(receipt.block_number));
                            Ok(receipt)
                        }
                        Some(reason) => {
                            self.set_status(hash, TxStatus::Reverted(reason.clone()));
                            Err(KeepError::ChainFatal(format!(
                                "{} reverted: {}",
                                tx.tx.call.method(),
                                reason
                            )))
                        }
                    };
                }
            }
            if tx.tx.gas_price >= self.max_gas_price {
                for hash in &hashes {
                    self.set_status(hash, TxStatus::Abandoned);
                }
                self.forget_nonce(tx.tx.nonce).await;
                return Err(KeepError::ChainFatal(format!(
                    "{} with nonce {} not mined at max gas price {}",
                    tx.tx.call.method(),
                    tx.tx.nonce,
                    self.max_gas_price
                )));
            }
            let raised = raise_gas_price(tx.tx.gas_price, self.max_gas_price);
            tx = SignedTransaction::sign(
                UnsignedTransaction {
                    gas_price: raised,
                    ..tx.tx.clone()
                },
                &self.key,
            )?;
            match self.backend.broadcast(tx.clone()).await {
                Ok(hash) => {
                    metrics::KEEP_TX_RESUBMISSIONS.inc();
                    tracing::warn!(
                        method = tx.tx.call.method(),
                        nonce = tx.tx.nonce,
                        gas_price = raised,
                        "transaction not mined in time; resubmitted as {}",
                        hash
                    );
                    self.record(&hash, &tx.tx, TxStatus::Pending);
                    hashes.push(hash);
                }
                // An earlier broadcast may have been mined meanwhile; the next
                // receipt check finds it.
                Err(err) => tracing::warn!(%err, "resubmission rejected"),
            }
        }
    }
}

#[async_trait]
impl ChainWriter for TransactionSubmitter {
    fn operator(&self) -> OperatorId {
        self.operator
    }

    async fn submit_keep_public_key(
        &self,
        keep: &KeepId,
        public_key: PublicKeyBytes,
    ) -> KeepResult<()> {
        self.submit(ContractCall::SubmitKeepPublicKey {
            keep: keep.clone(),
            public_key,
        })
        .await
        .map(|_| ())
    }

    async fn submit_signature(&self, keep: &KeepId, signature: Signature) -> KeepResult<()> {
        self.submit(ContractCall::SubmitSignature {
            keep: keep.clone(),
            signature,
        })
        .await
        .map(|_| ())
    }

    async fn register_as_member_candidate(&self, application: &str) -> KeepResult<()> {
        self.submit(ContractCall::RegisterMemberCandidate {
            application: application.to_string(),
        })
        .await
        .map(|_| ())
    }

    async fn update_status_for_application(&self, application: &str) -> KeepResult<()> {
        self.submit(ContractCall::UpdateStatusForApplication {
            application: application.to_string(),
        })
        .await
        .map(|_| ())
    }
}

/// +20%, capped.
fn raise_gas_price(gas_price: u128, max: u128) -> u128 {
    let raised = gas_price.saturating_add(gas_price / 5).max(gas_price.saturating_add(1));
    raised.min(max)
}
