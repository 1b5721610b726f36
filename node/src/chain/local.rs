//! In-process chain shared by every operator of a test or smoke-test run.
//!
//! It models the keep factory and its keeps, stakes, balances, registrations
//! and a mempool with a miner. Owner-side actions (opening keeps, requesting
//! signatures, closing) are methods on [`LocalChain`]; operators reach it
//! through [`LocalChainClient`], which implements the chain traits.

use super::limiter::{LimitedChain, RequestLimits};
use super::tx_sender::{SignedTransaction, TransactionBackend, TransactionSubmitter, TxHash, TxReceipt};
use super::{
    check_chain_tag, decode_public_key, operator_id_of, ChainEventSource, ChainHandles,
    ChainQueries, ContractCall, EventStream, KeepCreatedEvent, KeepEvent, PublicKeyBytes,
    Signature, SignatureSubmittedEvent, StakeMonitor, EVENT_CHANNEL_CAPACITY,
};
use crate::config::ChainConfig;
use crate::error::{KeepError, KeepResult};
use crate::tracking::{self, AutoAbortTask};
use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use keep_primitives::{Digest, KeepId, OperatorId};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub const LOCAL_CHAIN_TAG: &str = "local";

/// Gas charged for every mined transaction.
const GAS_PER_TRANSACTION: u128 = 100_000;

#[derive(Debug, Clone)]
pub struct LocalChainConfig {
    pub gas_price: u128,
    /// Mine a block as soon as a transaction arrives.
    pub auto_mine: bool,
    /// Transactions paying less stay in the mempool.
    pub min_gas_price: u128,
    pub minimum_stake: u128,
}

impl Default for LocalChainConfig {
    fn default() -> Self {
        Self {
            gas_price: 20_000_000_000,
            auto_mine: true,
            min_gas_price: 0,
            minimum_stake: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepStatus {
    Active,
    Closed,
    Terminated,
}

/// A transaction as executed by the miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinedCall {
    pub block_number: u64,
    pub from: OperatorId,
    pub nonce: u64,
    pub call: ContractCall,
    pub reverted: Option<String>,
}

struct KeepState {
    id: KeepId,
    members: Vec<OperatorId>,
    honest_threshold: usize,
    opened_at: u64,
    status: KeepStatus,
    public_key: Option<PublicKeyBytes>,
    submitted_keys: BTreeMap<OperatorId, PublicKeyBytes>,
    awaiting: Option<Digest>,
    latest_digest: Option<Digest>,
    requested_at: HashMap<Digest, u64>,
    signatures: Vec<SignatureSubmittedEvent>,
    subscribers: Vec<mpsc::Sender<KeepEvent>>,
}

struct ChainState {
    block: u64,
    gas_price: u128,
    min_gas_price: u128,
    auto_mine: bool,
    keeps: Vec<KeepState>,
    index: HashMap<KeepId, usize>,
    stakes: HashMap<OperatorId, u128>,
    balances: HashMap<OperatorId, u128>,
    /// Next nonce the miner accepts per account.
    nonces: HashMap<OperatorId, u64>,
    mempool: BTreeMap<(OperatorId, u64), (TxHash, SignedTransaction)>,
    receipts: HashMap<TxHash, TxReceipt>,
    /// (operator, application) -> status up to date.
    registrations: HashMap<(OperatorId, String), bool>,
    keep_created_subscribers: Vec<mpsc::Sender<KeepCreatedEvent>>,
    mined: Vec<MinedCall>,
}

pub struct LocalChain {
    minimum_stake: u128,
    state: Mutex<ChainState>,
    height: watch::Sender<u64>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Delivers the event to every subscriber. A subscriber whose buffer is full
/// is dropped; it observes the end of its stream and resubscribes.
fn publish<T: Clone>(subscribers: &mut Vec<mpsc::Sender<T>>, event: &T, stream: &str) {
    subscribers.retain(|subscriber| match subscriber.try_send(event.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            tracing::error!("{} subscriber fell behind; dropping its subscription", stream);
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

impl KeepState {
    fn emit(&mut self, event: KeepEvent) {
        publish(&mut self.subscribers, &event, "keep event");
    }
}

impl ChainState {
    fn keep(&self, keep: &KeepId) -> KeepResult<&KeepState> {
        check_chain_tag(keep, LOCAL_CHAIN_TAG)?;
        self.index
            .get(keep)
            .and_then(|index| self.keeps.get(*index))
            .ok_or_else(|| KeepError::ChainFatal(format!("unknown keep {}", keep)))
    }

    fn keep_mut(&mut self, keep: &KeepId) -> KeepResult<&mut KeepState> {
        check_chain_tag(keep, LOCAL_CHAIN_TAG)?;
        let index = *self
            .index
            .get(keep)
            .ok_or_else(|| KeepError::ChainFatal(format!("unknown keep {}", keep)))?;
        self.keeps
            .get_mut(index)
            .ok_or_else(|| KeepError::ChainFatal(format!("unknown keep {}", keep)))
    }

    fn active_keep_mut(&mut self, keep: &KeepId) -> KeepResult<&mut KeepState> {
        let state = self.keep_mut(keep)?;
        if state.status != KeepStatus::Active {
            return Err(KeepError::ChainFatal(format!("keep {} is not active", keep)));
        }
        Ok(state)
    }

    fn pending_nonce(&self, account: &OperatorId) -> u64 {
        let mined = self.nonces.get(account).copied().unwrap_or(0);
        self.mempool
            .range((*account, 0)..=(*account, u64::MAX))
            .next_back()
            .map(|((_, nonce), _)| (nonce + 1).max(mined))
            .unwrap_or(mined)
    }

    /// Advances one block, executing every mempool transaction that is next
    /// in its sender's nonce sequence and pays at least the minimum gas price.
    fn mine_block(&mut self) {
        self.block += 1;
        loop {
            let ready = self
                .mempool
                .iter()
                .find(|((from, nonce), (_, tx))| {
                    self.nonces.get(from).copied().unwrap_or(0) == *nonce
                        && tx.tx.gas_price >= self.min_gas_price
                })
                .map(|(key, _)| *key);
            let Some(key) = ready else {
                break;
            };
            let Some((hash, tx)) = self.mempool.remove(&key) else {
                break;
            };
            let from = tx.tx.from;
            let reverted = self.execute(from, &tx.tx.call).err();
            if let Some(reason) = &reverted {
                tracing::debug!(method = tx.tx.call.method(), %from, "transaction reverted: {}", reason);
            }
            self.nonces.insert(from, tx.tx.nonce + 1);
            let cost = tx.tx.gas_price.saturating_mul(GAS_PER_TRANSACTION);
            let balance = self.balances.entry(from).or_default();
            *balance = balance.saturating_sub(cost);
            self.receipts.insert(
                hash,
                TxReceipt {
                    block_number: self.block,
                    reverted: reverted.clone(),
                },
            );
            self.mined.push(MinedCall {
                block_number: self.block,
                from,
                nonce: tx.tx.nonce,
                call: tx.tx.call,
                reverted,
            });
        }
    }

    fn execute(&mut self, from: OperatorId, call: &ContractCall) -> Result<(), String> {
        let block = self.block;
        match call {
            ContractCall::SubmitKeepPublicKey { keep, public_key } => {
                let state = self.active_keep_mut(keep).map_err(|err| err.to_string())?;
                if !state.members.contains(&from) {
                    return Err("caller is not a keep member".to_string());
                }
                if state.submitted_keys.contains_key(&from) {
                    return Err("public key already submitted".to_string());
                }
                let conflicting = state.submitted_keys.values().any(|key| key != public_key);
                state.submitted_keys.insert(from, *public_key);
                if conflicting {
                    state.emit(KeepEvent::ConflictingPublicKeySubmitted {
                        submitter: from,
                        public_key: *public_key,
                        block_number: block,
                    });
                } else if state.submitted_keys.len() == state.members.len() {
                    state.public_key = Some(*public_key);
                    state.emit(KeepEvent::PublicKeyPublished {
                        public_key: *public_key,
                        block_number: block,
                    });
                }
                Ok(())
            }
            ContractCall::SubmitSignature { keep, signature } => {
                let state = self.active_keep_mut(keep).map_err(|err| err.to_string())?;
                if !state.members.contains(&from) {
                    return Err("caller is not a keep member".to_string());
                }
                let digest = state
                    .awaiting
                    .clone()
                    .ok_or_else(|| "not awaiting a signature".to_string())?;
                let public_key = state
                    .public_key
                    .ok_or_else(|| "public key not published".to_string())?;
                verify_signature(&public_key, &digest, signature)?;
                state.awaiting = None;
                state.signatures.push(SignatureSubmittedEvent {
                    keep: keep.clone(),
                    digest,
                    signature: *signature,
                    submitter: from,
                    block_number: block,
                });
                Ok(())
            }
            ContractCall::RegisterMemberCandidate { application } => {
                let key = (from, application.clone());
                if self.registrations.contains_key(&key) {
                    return Err("already registered".to_string());
                }
                self.registrations.insert(key, true);
                Ok(())
            }
            ContractCall::UpdateStatusForApplication { application } => {
                match self.registrations.get_mut(&(from, application.clone())) {
                    Some(up_to_date) => {
                        *up_to_date = true;
                        Ok(())
                    }
                    None => Err("not registered".to_string()),
                }
            }
        }
    }
}

/// Checks the signature the way the keep contract does: low S, and the
/// recovery id must recover the keep's public key.
pub fn verify_signature(
    public_key: &PublicKeyBytes,
    digest: &Digest,
    signature: &Signature,
) -> Result<(), String> {
    let parsed = EcdsaSignature::from_scalars(signature.r, signature.s)
        .map_err(|_| "malformed signature".to_string())?;
    if parsed.normalize_s().is_some() {
        return Err("signature s is not in the lower half order".to_string());
    }
    let recovery_id = RecoveryId::from_byte(signature.recovery_id)
        .filter(|id| !id.is_x_reduced())
        .ok_or_else(|| "invalid recovery id".to_string())?;
    let recovered = VerifyingKey::recover_from_prehash(digest.as_bytes(), &parsed, recovery_id)
        .map_err(|_| "signature does not recover".to_string())?;
    let expected = decode_public_key(public_key).map_err(|err| err.to_string())?;
    if *recovered.as_affine() != expected {
        return Err("signature does not match keep public key".to_string());
    }
    Ok(())
}

impl LocalChain {
    pub fn new(config: LocalChainConfig) -> Arc<Self> {
        let (height, _) = watch::channel(0);
        Arc::new(Self {
            minimum_stake: config.minimum_stake,
            state: Mutex::new(ChainState {
                block: 0,
                gas_price: config.gas_price,
                min_gas_price: config.min_gas_price,
                auto_mine: config.auto_mine,
                keeps: Vec::new(),
                index: HashMap::new(),
                stakes: HashMap::new(),
                balances: HashMap::new(),
                nonces: HashMap::new(),
                mempool: BTreeMap::new(),
                receipts: HashMap::new(),
                registrations: HashMap::new(),
                keep_created_subscribers: Vec::new(),
                mined: Vec::new(),
            }),
            height,
        })
    }

    /// Runs `f` against the state and publishes the resulting block height.
    fn with_state<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let result = f(&mut state);
        self.height.send_replace(state.block);
        result
    }

    /// Client for one operator, limited as configured and with its own
    /// transaction submitter. Pending writes give up once `cancel` fires.
    pub fn connect(
        self: &Arc<Self>,
        key: SigningKey,
        config: &ChainConfig,
        cancel: CancellationToken,
    ) -> ChainHandles {
        let operator = operator_id_of(key.verifying_key().as_affine());
        let client = Arc::new(LimitedChain::new(
            LocalChainClient {
                chain: self.clone(),
                operator,
            },
            RequestLimits {
                requests_per_second: config.requests_per_second_limit,
                concurrency: config.concurrency_limit,
                timeout: config.request_timeout(),
            },
        ));
        let submitter = Arc::new(TransactionSubmitter::new(
            key,
            client.clone(),
            config.mining_check_interval(),
            config.max_gas_price,
            cancel,
        ));
        ChainHandles {
            events: client.clone(),
            queries: client.clone(),
            writer: submitter.clone(),
            stake: client,
            transactions: Some(submitter),
        }
    }

    pub fn client(self: &Arc<Self>, operator: OperatorId) -> LocalChainClient {
        LocalChainClient {
            chain: self.clone(),
            operator,
        }
    }

    pub fn open_keep(
        &self,
        owner: OperatorId,
        members: Vec<OperatorId>,
        honest_threshold: usize,
        application: &str,
    ) -> KeepResult<KeepId> {
        self.with_state(|state| {
            let address = format!("0x{:040x}", state.keeps.len() + 1);
            let id = KeepId::new(LOCAL_CHAIN_TAG, &address)
                .map_err(|err| KeepError::ChainFatal(err.to_string()))?;
            state.block += 1;
            state.index.insert(id.clone(), state.keeps.len());
            state.keeps.push(KeepState {
                id: id.clone(),
                members: members.clone(),
                honest_threshold,
                opened_at: unix_now(),
                status: KeepStatus::Active,
                public_key: None,
                submitted_keys: BTreeMap::new(),
                awaiting: None,
                latest_digest: None,
                requested_at: HashMap::new(),
                signatures: Vec::new(),
                subscribers: Vec::new(),
            });
            let event = KeepCreatedEvent {
                keep: id.clone(),
                members,
                honest_threshold,
                owner,
                application: application.to_string(),
                block_number: state.block,
            };
            publish(&mut state.keep_created_subscribers, &event, "keep created");
            tracing::info!(keep = %id, "opened keep");
            Ok(id)
        })
    }

    /// Returns the block the request landed in.
    pub fn request_signature(&self, keep: &KeepId, digest: Digest) -> KeepResult<u64> {
        self.with_state(|state| {
            let block = state.block + 1;
            let keep_state = state.active_keep_mut(keep)?;
            if keep_state.public_key.is_none() {
                return Err(KeepError::ChainFatal("public key not published".to_string()));
            }
            if keep_state.awaiting.is_some() {
                return Err(KeepError::ChainFatal(
                    "keep is already awaiting a signature".to_string(),
                ));
            }
            keep_state.awaiting = Some(digest.clone());
            keep_state.latest_digest = Some(digest.clone());
            keep_state.requested_at.insert(digest.clone(), block);
            keep_state.emit(KeepEvent::SignatureRequested {
                digest,
                block_number: block,
            });
            state.block = block;
            Ok(block)
        })
    }

    /// Drops the pending signature request without any event, as a re-org would.
    pub fn revert_signature_request(&self, keep: &KeepId) -> KeepResult<()> {
        self.with_state(|state| {
            state.keep_mut(keep)?.awaiting = None;
            Ok(())
        })
    }

    pub fn close_keep(&self, keep: &KeepId) -> KeepResult<()> {
        self.finish_keep(keep, KeepStatus::Closed)
    }

    pub fn terminate_keep(&self, keep: &KeepId) -> KeepResult<()> {
        self.finish_keep(keep, KeepStatus::Terminated)
    }

    fn finish_keep(&self, keep: &KeepId, status: KeepStatus) -> KeepResult<()> {
        self.with_state(|state| {
            let block = state.block + 1;
            let keep_state = state.active_keep_mut(keep)?;
            keep_state.status = status;
            keep_state.awaiting = None;
            keep_state.emit(match status {
                KeepStatus::Closed => KeepEvent::KeepClosed {
                    block_number: block,
                },
                _ => KeepEvent::KeepTerminated {
                    block_number: block,
                },
            });
            state.block = block;
            Ok(())
        })
    }

    /// Delivers an arbitrary event to the keep's subscribers, e.g. to replay
    /// one that was already emitted.
    pub fn emit_keep_event(&self, keep: &KeepId, event: KeepEvent) -> KeepResult<()> {
        self.with_state(|state| {
            state.keep_mut(keep)?.emit(event);
            Ok(())
        })
    }

    pub fn set_stake(&self, operator: OperatorId, stake: u128) {
        self.with_state(|state| state.stakes.insert(operator, stake));
    }

    pub fn set_balance(&self, operator: OperatorId, balance: u128) {
        self.with_state(|state| state.balances.insert(operator, balance));
    }

    pub fn set_min_gas_price(&self, min_gas_price: u128) {
        self.with_state(|state| state.min_gas_price = min_gas_price);
    }

    /// Marks the operator's status for the application as outdated.
    pub fn mark_status_stale(&self, operator: OperatorId, application: &str) {
        self.with_state(|state| {
            if let Some(up_to_date) = state
                .registrations
                .get_mut(&(operator, application.to_string()))
            {
                *up_to_date = false;
            }
        });
    }

    pub fn mine_blocks(&self, count: u64) {
        self.with_state(|state| {
            for _ in 0..count {
                state.mine_block();
            }
        });
    }

    /// Mines a block every `interval` until the returned task is dropped.
    pub fn spawn_block_producer(self: &Arc<Self>, interval: Duration) -> AutoAbortTask<()> {
        let chain = self.clone();
        tracking::spawn("local chain block producer", async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                chain.mine_blocks(1);
            }
        })
    }

    pub fn current_block(&self) -> u64 {
        self.state.lock().unwrap().block
    }

    pub fn keep_status(&self, keep: &KeepId) -> KeepResult<KeepStatus> {
        Ok(self.state.lock().unwrap().keep(keep)?.status)
    }

    pub fn public_key(&self, keep: &KeepId) -> KeepResult<Option<PublicKeyBytes>> {
        Ok(self.state.lock().unwrap().keep(keep)?.public_key)
    }

    pub fn signatures(&self, keep: &KeepId) -> KeepResult<Vec<SignatureSubmittedEvent>> {
        Ok(self.state.lock().unwrap().keep(keep)?.signatures.clone())
    }

    /// Every executed transaction, in execution order.
    pub fn mined_calls(&self) -> Vec<MinedCall> {
        self.state.lock().unwrap().mined.clone()
    }

    pub fn mempool_len(&self) -> usize {
        self.state.lock().unwrap().mempool.len()
    }

    pub fn keep_subscriber_count(&self, keep: &KeepId) -> usize {
        self.state
            .lock()
            .unwrap()
            .keep(keep)
            .map(|state| {
                state
                    .subscribers
                    .iter()
                    .filter(|subscriber| !subscriber.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }
}

/// One operator's view of a [`LocalChain`].
pub struct LocalChainClient {
    chain: Arc<LocalChain>,
    operator: OperatorId,
}

impl LocalChainClient {
    fn read<R>(&self, f: impl FnOnce(&ChainState) -> KeepResult<R>) -> KeepResult<R> {
        f(&self.chain.state.lock().unwrap())
    }
}

#[async_trait]
impl ChainEventSource for LocalChainClient {
    async fn subscribe_keep_created(&self) -> KeepResult<EventStream<KeepCreatedEvent>> {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.chain
            .state
            .lock()
            .unwrap()
            .keep_created_subscribers
            .push(sender);
        Ok(receiver)
    }

    async fn subscribe_keep_events(&self, keep: &KeepId) -> KeepResult<EventStream<KeepEvent>> {
        let (sender, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.chain
            .state
            .lock()
            .unwrap()
            .keep_mut(keep)?
            .subscribers
            .push(sender);
        Ok(receiver)
    }

    async fn current_block(&self) -> KeepResult<u64> {
        Ok(self.chain.current_block())
    }

    async fn wait_for_block(&self, height: u64) -> KeepResult<()> {
        let mut receiver = self.chain.height.subscribe();
        receiver
            .wait_for(|current| *current >= height)
            .await
            .map(|_| ())
            .map_err(|_| KeepError::ChainTransient("chain stopped".to_string()))
    }
}

#[async_trait]
impl ChainQueries for LocalChainClient {
    async fn is_active(&self, keep: &KeepId) -> KeepResult<bool> {
        self.read(|state| Ok(state.keep(keep)?.status == KeepStatus::Active))
    }

    async fn is_awaiting_signature(&self, keep: &KeepId, digest: &Digest) -> KeepResult<bool> {
        self.read(|state| Ok(state.keep(keep)?.awaiting.as_ref() == Some(digest)))
    }

    async fn latest_digest(&self, keep: &KeepId) -> KeepResult<Option<Digest>> {
        self.read(|state| Ok(state.keep(keep)?.latest_digest.clone()))
    }

    async fn signature_requested_block(
        &self,
        keep: &KeepId,
        digest: &Digest,
    ) -> KeepResult<Option<u64>> {
        self.read(|state| Ok(state.keep(keep)?.requested_at.get(digest).copied()))
    }

    async fn get_public_key(&self, keep: &KeepId) -> KeepResult<Option<PublicKeyBytes>> {
        self.read(|state| Ok(state.keep(keep)?.public_key))
    }

    async fn get_members(&self, keep: &KeepId) -> KeepResult<Vec<OperatorId>> {
        self.read(|state| Ok(state.keep(keep)?.members.clone()))
    }

    async fn get_honest_threshold(&self, keep: &KeepId) -> KeepResult<usize> {
        self.read(|state| Ok(state.keep(keep)?.honest_threshold))
    }

    async fn get_opened_timestamp(&self, keep: &KeepId) -> KeepResult<u64> {
        self.read(|state| Ok(state.keep(keep)?.opened_at))
    }

    async fn past_signature_submitted_events(
        &self,
        keep: &KeepId,
        from_block: u64,
    ) -> KeepResult<Vec<SignatureSubmittedEvent>> {
        self.read(|state| {
            Ok(state
                .keep(keep)?
                .signatures
                .iter()
                .filter(|event| event.block_number >= from_block)
                .cloned()
                .collect())
        })
    }

    async fn get_keep_count(&self) -> KeepResult<u64> {
        self.read(|state| Ok(state.keeps.len() as u64))
    }

    async fn get_keep_at_index(&self, index: u64) -> KeepResult<KeepId> {
        self.read(|state| {
            usize::try_from(index)
                .ok()
                .and_then(|index| state.keeps.get(index))
                .map(|keep| keep.id.clone())
                .ok_or_else(|| KeepError::ChainFatal(format!("no keep at index {}", index)))
        })
    }

    async fn balance(&self, account: &OperatorId) -> KeepResult<u128> {
        self.read(|state| Ok(state.balances.get(account).copied().unwrap_or(0)))
    }

    async fn is_registered_for_application(&self, application: &str) -> KeepResult<bool> {
        self.read(|state| {
            Ok(state
                .registrations
                .contains_key(&(self.operator, application.to_string())))
        })
    }

    async fn is_status_up_to_date(&self, application: &str) -> KeepResult<bool> {
        self.read(|state| {
            Ok(state
                .registrations
                .get(&(self.operator, application.to_string()))
                .copied()
                .unwrap_or(false))
        })
    }
}

#[async_trait]
impl StakeMonitor for LocalChainClient {
    async fn has_minimum_stake(&self, operator: &OperatorId) -> KeepResult<bool> {
        let minimum = self.chain.minimum_stake;
        self.read(|state| Ok(state.stakes.get(operator).copied().unwrap_or(0) >= minimum))
    }
}

#[async_trait]
impl TransactionBackend for LocalChainClient {
    async fn pending_nonce(&self, account: &OperatorId) -> KeepResult<u64> {
        self.read(|state| Ok(state.pending_nonce(account)))
    }

    async fn gas_price(&self) -> KeepResult<u128> {
        self.read(|state| Ok(state.gas_price))
    }

    async fn broadcast(&self, tx: SignedTransaction) -> KeepResult<TxHash> {
        let sender = tx.recover_sender()?;
        if sender != tx.tx.from {
            return Err(KeepError::ChainFatal(
                "transaction signature does not match sender".to_string(),
            ));
        }
        let hash = tx.hash()?;
        self.chain.with_state(|state| {
            let next = state.nonces.get(&sender).copied().unwrap_or(0);
            if tx.tx.nonce < next {
                return Err(KeepError::ChainTransient(format!(
                    "nonce too low: {} < {}",
                    tx.tx.nonce, next
                )));
            }
            let cost = tx.tx.gas_price.saturating_mul(GAS_PER_TRANSACTION);
            if state.balances.get(&sender).copied().unwrap_or(0) < cost {
                return Err(KeepError::ChainFatal("insufficient funds for gas".to_string()));
            }
            if let Some((_, existing)) = state.mempool.get(&(sender, tx.tx.nonce)) {
                if existing.tx.gas_price >= tx.tx.gas_price {
                    return Err(KeepError::ChainTransient(
                        "replacement transaction underpriced".to_string(),
                    ));
                }
            }
            state
                .mempool
                .insert((sender, tx.tx.nonce), (hash.clone(), tx));
            if state.auto_mine {
                state.mine_block();
            }
            Ok(hash)
        })
    }

    async fn receipt(&self, hash: &TxHash) -> KeepResult<Option<TxReceipt>> {
        self.read(|state| Ok(state.receipts.get(hash).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{encode_public_key, ChainWriter};
    use assert_matches::assert_matches;

    const ETHER: u128 = 1_000_000_000_000_000_000;

    fn test_config() -> ChainConfig {
        ChainConfig {
            mining_check_interval: 1,
            ..ChainConfig::default()
        }
    }

    fn operator_key(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    fn operator_of(key: &SigningKey) -> OperatorId {
        operator_id_of(key.verifying_key().as_affine())
    }

    fn funded_chain(keys: &[&SigningKey]) -> Arc<LocalChain> {
        let chain = LocalChain::new(LocalChainConfig::default());
        for key in keys {
            chain.set_balance(operator_of(key), ETHER);
        }
        chain
    }

    /// Signs like a keep would: low S, recovery id of the keep key.
    fn keep_signature(keep_key: &SigningKey, digest: &Digest) -> Signature {
        let (signature, recovery_id): (EcdsaSignature, RecoveryId) =
            keep_key.sign_prehash_recoverable(digest.as_bytes()).unwrap();
        let bytes = signature.to_bytes();
        Signature {
            r: bytes[..32].try_into().unwrap(),
            s: bytes[32..].try_into().unwrap(),
            recovery_id: recovery_id.to_byte(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_public_key_published_once_all_members_agree() {
        let (a, b) = (operator_key(1), operator_key(2));
        let chain = funded_chain(&[&a, &b]);
        let keep = chain.open_keep(operator_of(&a), vec![operator_of(&a), operator_of(&b)], 2, "app").unwrap();
        let handles_a = chain.connect(a.clone(), &test_config(), CancellationToken::new());
        let handles_b = chain.connect(b.clone(), &test_config(), CancellationToken::new());
        let mut events = handles_a.events.subscribe_keep_events(&keep).await.unwrap();

        let keep_key = encode_public_key(operator_key(9).verifying_key().as_affine());
        handles_a.writer.submit_keep_public_key(&keep, keep_key).await.unwrap();
        assert_eq!(chain.public_key(&keep).unwrap(), None);
        handles_b.writer.submit_keep_public_key(&keep, keep_key).await.unwrap();
        assert_eq!(chain.public_key(&keep).unwrap(), Some(keep_key));
        assert_matches!(
            events.recv().await,
            Some(KeepEvent::PublicKeyPublished { public_key, .. }) if public_key == keep_key
        );
        // Second submission by the same member reverts.
        assert_matches!(
            handles_a.writer.submit_keep_public_key(&keep, keep_key).await,
            Err(KeepError::ChainFatal(_))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflicting_public_key_is_reported() {
        let (a, b) = (operator_key(1), operator_key(2));
        let chain = funded_chain(&[&a, &b]);
        let keep = chain.open_keep(operator_of(&a), vec![operator_of(&a), operator_of(&b)], 2, "app").unwrap();
        let handles_a = chain.connect(a.clone(), &test_config(), CancellationToken::new());
        let handles_b = chain.connect(b.clone(), &test_config(), CancellationToken::new());
        let mut events = handles_a.events.subscribe_keep_events(&keep).await.unwrap();
        handles_a.writer.submit_keep_public_key(&keep, [1; 64]).await.unwrap();
        handles_b.writer.submit_keep_public_key(&keep, [2; 64]).await.unwrap();
        assert_matches!(
            events.recv().await,
            Some(KeepEvent::ConflictingPublicKeySubmitted { submitter, .. }) if submitter == operator_of(&b)
        );
        assert_eq!(chain.public_key(&keep).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signature_accepted_only_when_valid_and_awaited() {
        let a = operator_key(1);
        let keep_key = operator_key(9);
        let chain = funded_chain(&[&a]);
        let keep = chain.open_keep(operator_of(&a), vec![operator_of(&a)], 1, "app").unwrap();
        let handles = chain.connect(a.clone(), &test_config(), CancellationToken::new());
        handles
            .writer
            .submit_keep_public_key(&keep, encode_public_key(keep_key.verifying_key().as_affine()))
            .await
            .unwrap();
        let digest = Digest::from([0x54; 32]);
        let block = chain.request_signature(&keep, digest.clone()).unwrap();
        assert!(handles.queries.is_awaiting_signature(&keep, &digest).await.unwrap());
        assert_eq!(
            handles.queries.signature_requested_block(&keep, &digest).await.unwrap(),
            Some(block)
        );

        let mut wrong = keep_signature(&keep_key, &digest);
        wrong.recovery_id ^= 1;
        assert_matches!(
            handles.writer.submit_signature(&keep, wrong).await,
            Err(KeepError::ChainFatal(msg)) if msg.contains("reverted")
        );

        let signature = keep_signature(&keep_key, &digest);
        handles.writer.submit_signature(&keep, signature).await.unwrap();
        assert!(!handles.queries.is_awaiting_signature(&keep, &digest).await.unwrap());
        let submitted = handles
            .queries
            .past_signature_submitted_events(&keep, block)
            .await
            .unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].signature, signature);
        assert_eq!(submitted[0].submitter, operator_of(&a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_underpriced_transaction_waits_for_resubmission() {
        let a = operator_key(1);
        let chain = funded_chain(&[&a]);
        chain.set_min_gas_price(25_000_000_000);
        let handles = chain.connect(a.clone(), &test_config(), CancellationToken::new());
        handles.writer.register_as_member_candidate("app").await.unwrap();
        let calls = chain.mined_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].nonce, 0);
        assert_eq!(chain.mempool_len(), 0);
        assert!(handles.queries.is_registered_for_application("app").await.unwrap());
        assert!(handles.queries.is_status_up_to_date("app").await.unwrap());
        chain.mark_status_stale(operator_of(&a), "app");
        assert!(!handles.queries.is_status_up_to_date("app").await.unwrap());
        assert!(handles.queries.balance(&operator_of(&a)).await.unwrap() < ETHER);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_dropped() {
        let chain = LocalChain::new(LocalChainConfig::default());
        let client = chain.client(OperatorId::from([1u8; 20]));
        let mut lagging = client.subscribe_keep_created().await.unwrap();
        for _ in 0..=EVENT_CHANNEL_CAPACITY {
            chain.open_keep(OperatorId::from([1u8; 20]), vec![], 1, "app").unwrap();
        }
        let mut received = 0;
        while lagging.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, EVENT_CHANNEL_CAPACITY);
    }

    #[tokio::test]
    async fn test_reverted_request_and_closing() {
        let chain = LocalChain::new(LocalChainConfig::default());
        let member = OperatorId::from([1u8; 20]);
        let client = chain.client(member);
        let keep = chain.open_keep(member, vec![member], 1, "app").unwrap();
        let events = client.subscribe_keep_events(&keep).await.unwrap();
        assert_eq!(chain.keep_subscriber_count(&keep), 1);

        let digest = Digest::from([0x54; 32]);
        chain.request_signature(&keep, digest.clone()).unwrap();
        chain.revert_signature_request(&keep).unwrap();
        assert!(!client.is_awaiting_signature(&keep, &digest).await.unwrap());

        chain.close_keep(&keep).unwrap();
        assert_eq!(chain.keep_status(&keep).unwrap(), KeepStatus::Closed);
        assert!(!client.is_active(&keep).await.unwrap());
        assert_matches!(chain.terminate_keep(&keep), Err(KeepError::ChainFatal(_)));

        drop(events);
        assert_eq!(chain.keep_subscriber_count(&keep), 0);
    }

    #[tokio::test]
    async fn test_foreign_keep_id_is_fatal() {
        let chain = LocalChain::new(LocalChainConfig::default());
        let client = chain.client(OperatorId::from([1u8; 20]));
        let keep = KeepId::new("ethereum", "0x01").unwrap();
        assert_matches!(client.is_active(&keep).await, Err(KeepError::ChainFatal(_)));
    }

    #[tokio::test]
    async fn test_wait_for_block() {
        let chain = LocalChain::new(LocalChainConfig::default());
        let client = chain.client(OperatorId::from([1u8; 20]));
        let waiter = tokio::spawn(async move { client.wait_for_block(3).await });
        chain.mine_blocks(3);
        waiter.await.unwrap().unwrap();
        assert_eq!(chain.current_block(), 3);
    }
}
