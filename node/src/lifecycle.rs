//! Per-keep state machine driven by chain events.
//!
//! Every keep this operator belongs to gets one long-lived task that owns the
//! keep's event subscription. Work triggered by an event (key generation,
//! signing, closing) is gated by the [`EventDeduplicator`], so a transition
//! runs at most once however often its event is delivered.

pub mod registration;
pub mod warm_start;

use crate::chain::{ChainHandles, KeepCreatedEvent, KeepEvent, PublicKeyBytes};
use crate::config::ConfigFile;
use crate::dedup::{ActionGuard, EventDeduplicator, TrackedAction};
use crate::error::{ErrorKind, KeepError, KeepResult};
use crate::keygen::pool::PreParamsPool;
use crate::keygen::{run_keygen, KeygenParams};
use crate::metrics;
use crate::network::MeshNetworkClient;
use crate::primitives::ParticipantId;
use crate::protocol::ProtocolTimeouts;
use crate::registry::{SignerRegistry, SignerShare};
use crate::retry::{confirm_with_timeout, do_with_retry, RetryPolicy};
use crate::signing::{run_signing, submit_signature, SigningOutcome};
use crate::tracking::AutoAbortTaskCollection;
use keep_primitives::{Digest, KeepId, OperatorId};
use serde::Serialize;
use serde_with::serde_as;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Bound on retrying a chain write or a resubscription.
pub const CHAIN_RETRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepState {
    Unseen,
    AwaitingKey,
    Active,
    ClosingRequested,
    TerminatingRequested,
    Closed,
    Terminated,
    Archived,
}

#[serde_as]
#[derive(Debug, Clone, Serialize)]
pub struct KeepRecord {
    pub keep: KeepId,
    pub members: Vec<OperatorId>,
    pub honest_threshold: usize,
    pub state: KeepState,
    /// Unix seconds, once known.
    pub opened_at: Option<u64>,
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub public_key: Option<PublicKeyBytes>,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub timeouts: ProtocolTimeouts,
    pub pre_params_timeout: Duration,
    pub block_confirmations: u64,
    pub submission_stagger: Duration,
    pub max_attempts: u32,
    pub chain_retry: RetryPolicy,
}

impl From<&ConfigFile> for LifecycleConfig {
    fn from(config: &ConfigFile) -> Self {
        Self {
            timeouts: ProtocolTimeouts::from(&config.tss),
            pre_params_timeout: config.tss.pre_params_timeout(),
            block_confirmations: config.chain.block_confirmations,
            submission_stagger: config.signing.submission_stagger(),
            max_attempts: config.signing.max_attempts,
            chain_retry: RetryPolicy::with_timeout(CHAIN_RETRY_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Close,
    Terminate,
}

pub struct KeepController {
    operator: OperatorId,
    chain: ChainHandles,
    registry: Arc<SignerRegistry>,
    dedup: Arc<EventDeduplicator>,
    pool: Arc<PreParamsPool>,
    network: Arc<MeshNetworkClient>,
    config: LifecycleConfig,
    cancel: CancellationToken,
    keeps: Mutex<BTreeMap<KeepId, KeepRecord>>,
    tasks: Mutex<AutoAbortTaskCollection<()>>,
}

impl KeepController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: ChainHandles,
        registry: Arc<SignerRegistry>,
        dedup: Arc<EventDeduplicator>,
        pool: Arc<PreParamsPool>,
        network: Arc<MeshNetworkClient>,
        config: LifecycleConfig,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            operator: chain.writer.operator(),
            chain,
            registry,
            dedup,
            pool,
            network,
            config,
            cancel,
            keeps: Mutex::new(BTreeMap::new()),
            tasks: Mutex::new(AutoAbortTaskCollection::new()),
        })
    }

    pub fn operator(&self) -> OperatorId {
        self.operator
    }

    pub fn dedup(&self) -> &Arc<EventDeduplicator> {
        &self.dedup
    }

    pub fn records(&self) -> Vec<KeepRecord> {
        self.keeps.lock().unwrap().values().cloned().collect()
    }

    pub fn record(&self, keep: &KeepId) -> Option<KeepRecord> {
        self.keeps.lock().unwrap().get(keep).cloned()
    }

    pub fn state(&self, keep: &KeepId) -> KeepState {
        self.record(keep)
            .map(|record| record.state)
            .unwrap_or(KeepState::Unseen)
    }

    fn upsert_record(
        &self,
        keep: &KeepId,
        members: &[OperatorId],
        honest_threshold: usize,
        state: KeepState,
    ) {
        let mut keeps = self.keeps.lock().unwrap();
        let record = keeps.entry(keep.clone()).or_insert_with(|| KeepRecord {
            keep: keep.clone(),
            members: members.to_vec(),
            honest_threshold,
            state,
            opened_at: None,
            public_key: None,
        });
        record.state = state;
        Self::publish_active_count(&keeps);
    }

    fn update_record(&self, keep: &KeepId, f: impl FnOnce(&mut KeepRecord)) {
        let mut keeps = self.keeps.lock().unwrap();
        if let Some(record) = keeps.get_mut(keep) {
            f(record);
        }
        Self::publish_active_count(&keeps);
    }

    fn set_state(&self, keep: &KeepId, state: KeepState) {
        tracing::debug!(%keep, ?state, "keep state changed");
        self.update_record(keep, |record| record.state = state);
    }

    fn publish_active_count(keeps: &BTreeMap<KeepId, KeepRecord>) {
        let active = keeps
            .values()
            .filter(|record| record.state == KeepState::Active)
            .count();
        metrics::KEEP_ACTIVE_KEEPS.set(active as i64);
    }

    fn spawn<F>(&self, description: &str, f: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.tasks.lock().unwrap().spawn_checked(description, f);
    }

    /// Starts `action`, or returns `None` when the deduplicator rejects it.
    async fn start_action(&self, action: TrackedAction) -> KeepResult<Option<ActionGuard>> {
        match self.dedup.start(&self.cancel, action).await {
            Ok(guard) => Ok(Some(guard)),
            Err(err) if err.kind() == ErrorKind::Stale => {
                tracing::debug!(%err, "event dropped");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    /// Warm-starts, then follows keep creation events until canceled.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let mut created = do_with_retry(&self.cancel, self.config.chain_retry, || {
            self.chain.events.subscribe_keep_created()
        })
        .await?;
        self.warm_start().await?;
        tracing::info!(operator = %self.operator, "following keep creation");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                event = created.recv() => event,
            };
            match event {
                Some(event) => self.on_keep_created(event),
                None => {
                    tracing::warn!("keep creation subscription dropped; resubscribing");
                    created = do_with_retry(&self.cancel, self.config.chain_retry, || {
                        self.chain.events.subscribe_keep_created()
                    })
                    .await?;
                    // Keeps opened while unsubscribed.
                    self.scan_factory().await?;
                }
            }
        }
    }

    fn on_keep_created(self: &Arc<Self>, event: KeepCreatedEvent) {
        if !event.members.contains(&self.operator) {
            tracing::debug!(keep = %event.keep, "not a member of the new keep");
            return;
        }
        tracing::info!(
            keep = %event.keep,
            members = event.members.len(),
            honest_threshold = event.honest_threshold,
            "member of a new keep"
        );
        self.start_key_generation(event.keep, event.members, event.honest_threshold);
    }

    fn start_key_generation(
        self: &Arc<Self>,
        keep: KeepId,
        members: Vec<OperatorId>,
        honest_threshold: usize,
    ) {
        let controller = self.clone();
        self.spawn(&format!("keep {}", keep), async move {
            controller
                .generate_key(keep, members, honest_threshold)
                .await
        });
    }

    /// Runs key generation, persists the share, publishes the public key and
    /// then follows the keep for the rest of its life.
    async fn generate_key(
        self: Arc<Self>,
        keep: KeepId,
        members: Vec<OperatorId>,
        honest_threshold: usize,
    ) -> anyhow::Result<()> {
        let Some(guard) = self
            .start_action(TrackedAction::KeyGeneration(keep.clone()))
            .await?
        else {
            return Ok(());
        };
        let me = members
            .iter()
            .position(|member| *member == self.operator)
            .map(|index| ParticipantId(index as u32))
            .ok_or_else(|| {
                KeepError::ChainFatal(format!("{} is not a member of {}", self.operator, keep))
            })?;
        self.upsert_record(&keep, &members, honest_threshold, KeepState::AwaitingKey);

        let share = async {
            let pre_params = self
                .pool
                .get_or_generate(honest_threshold, self.config.pre_params_timeout)
                .await?;
            run_keygen(
                &self.network,
                &self.cancel,
                self.config.timeouts,
                KeygenParams {
                    keep: keep.clone(),
                    members: members.clone(),
                    me,
                    honest_threshold,
                },
                pre_params,
            )
            .await
        }
        .await;
        let share = match share {
            Ok(share) => share,
            Err(err) => {
                metrics::KEEP_NUM_KEYGENS_FAILED.inc();
                return Err(err.context(format!("key generation for {}", keep)).into());
            }
        };
        self.persist_share(&share).await?;
        metrics::KEEP_NUM_KEYGENS_COMPLETED.inc();
        drop(guard);

        let public_key = share.public_key_bytes();
        self.update_record(&keep, |record| record.public_key = Some(public_key));
        tracing::info!(%keep, public_key = hex::encode(public_key), "generated keep key");
        let submitted = do_with_retry(&self.cancel, self.config.chain_retry, || {
            self.chain.writer.submit_keep_public_key(&keep, public_key)
        })
        .await;
        match submitted {
            Ok(()) => {}
            Err(KeepError::Canceled) => return Ok(()),
            // The share is stored; other members may still publish the key.
            Err(err) => tracing::error!(%keep, %err, "cannot submit keep public key"),
        }
        self.set_state(&keep, KeepState::Active);
        self.follow_keep(share).await
    }

    /// Registers the share, retrying a storage failure once. A second failure
    /// halts the keep's lifecycle.
    async fn persist_share(&self, share: &SignerShare) -> KeepResult<()> {
        match self.registry.register(share.clone()).await {
            Err(err) if err.kind() == ErrorKind::Storage => {
                tracing::warn!(keep = %share.keep, %err, "persisting share failed; retrying once");
                self.registry.register(share.clone()).await.map_err(|err| {
                    tracing::error!(
                        keep = %share.keep,
                        %err,
                        "cannot persist signer share; keep lifecycle halted"
                    );
                    err
                })
            }
            result => result,
        }
    }

    /// Follows the keep's events until it is archived or the controller is
    /// canceled. Resubscribes whenever the subscription is dropped.
    async fn follow_keep(self: Arc<Self>, share: SignerShare) -> anyhow::Result<()> {
        let keep = share.keep.clone();
        // Fired by a closing or terminating task once the share is archived.
        let archived = CancellationToken::new();
        loop {
            let mut events = do_with_retry(&self.cancel, self.config.chain_retry, || {
                self.chain.events.subscribe_keep_events(&keep)
            })
            .await?;
            if archived.is_cancelled() || self.catch_up(&share).await? {
                return Ok(());
            }
            loop {
                let event = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = archived.cancelled() => return Ok(()),
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    tracing::warn!(%keep, "keep event subscription dropped; resubscribing");
                    break;
                };
                match event {
                    KeepEvent::SignatureRequested {
                        digest,
                        block_number,
                    } => self.start_signing(share.clone(), digest, block_number),
                    KeepEvent::PublicKeyPublished { public_key, .. } => {
                        self.check_public_key(&share, &public_key);
                    }
                    KeepEvent::ConflictingPublicKeySubmitted {
                        submitter,
                        public_key,
                        ..
                    } => {
                        tracing::warn!(
                            %keep,
                            %submitter,
                            public_key = hex::encode(public_key),
                            "member submitted a conflicting public key"
                        );
                    }
                    KeepEvent::KeepClosed { block_number } => {
                        self.start_finish(&share, Finish::Close, block_number, &archived);
                    }
                    KeepEvent::KeepTerminated { block_number } => {
                        self.start_finish(&share, Finish::Terminate, block_number, &archived);
                    }
                }
            }
        }
    }

    /// Re-reads what may have changed while no subscription was open. Returns
    /// whether the keep got archived.
    async fn catch_up(self: &Arc<Self>, share: &SignerShare) -> anyhow::Result<bool> {
        let keep = &share.keep;
        let queries = &self.chain.queries;
        if !queries.is_active(keep).await? {
            tracing::info!(%keep, "keep is no longer active");
            return Ok(self.archive_inactive(keep).await?);
        }
        if let Ok(opened_at) = queries.get_opened_timestamp(keep).await {
            self.update_record(keep, |record| record.opened_at = Some(opened_at));
        }
        if let Some(public_key) = queries.get_public_key(keep).await? {
            self.check_public_key(share, &public_key);
        }
        if let Some(digest) = queries.latest_digest(keep).await? {
            if queries.is_awaiting_signature(keep, &digest).await? {
                let requested_at = queries
                    .signature_requested_block(keep, &digest)
                    .await?
                    .unwrap_or_default();
                tracing::info!(%keep, %digest, "resuming pending signature request");
                self.start_signing(share.clone(), digest, requested_at);
            }
        }
        Ok(false)
    }

    /// A mismatch is reported, not acted upon.
    fn check_public_key(&self, share: &SignerShare, published: &PublicKeyBytes) {
        let local = share.public_key_bytes();
        if *published == local {
            tracing::info!(keep = %share.keep, "published public key matches");
            self.update_record(&share.keep, |record| record.public_key = Some(local));
        } else {
            tracing::error!(
                keep = %share.keep,
                published = hex::encode(published),
                local = hex::encode(local),
                "published public key does not match the local key"
            );
        }
    }

    fn start_signing(self: &Arc<Self>, share: SignerShare, digest: Digest, requested_at: u64) {
        let controller = self.clone();
        self.spawn(
            &format!("signing {} for {}", digest, share.keep),
            async move { controller.sign(share, digest, requested_at).await },
        );
    }

    async fn sign(
        self: Arc<Self>,
        share: SignerShare,
        digest: Digest,
        requested_at: u64,
    ) -> anyhow::Result<()> {
        let keep = &share.keep;
        let Some(_guard) = self
            .start_action(TrackedAction::Signing(keep.clone(), digest.clone()))
            .await?
        else {
            return Ok(());
        };
        let queries = &self.chain.queries;
        for attempt in 0..self.config.max_attempts {
            if attempt > 0 && !queries.is_awaiting_signature(keep, &digest).await? {
                tracing::info!(%keep, %digest, "signature no longer awaited");
                return Ok(());
            }
            let result = run_signing(
                &self.network,
                &self.cancel,
                self.config.timeouts,
                &share,
                &digest,
                attempt,
            )
            .await;
            match result {
                Ok(SigningOutcome::Signed {
                    signature,
                    position,
                }) => {
                    let outcome = submit_signature(
                        &self.cancel,
                        queries.as_ref(),
                        self.chain.writer.as_ref(),
                        keep,
                        &digest,
                        signature,
                        position,
                        self.config.submission_stagger,
                        requested_at,
                    )
                    .await?;
                    tracing::info!(%keep, %digest, ?outcome, "signature published");
                    return Ok(());
                }
                Ok(SigningOutcome::NotSelected) => {
                    if self.await_peer_signature(&share, &digest, requested_at).await? {
                        tracing::info!(%keep, %digest, "signature published by selected signers");
                        return Ok(());
                    }
                    tracing::warn!(%keep, %digest, attempt, "selected signers did not deliver");
                }
                Err(err) if err.kind() == ErrorKind::Protocol => {
                    tracing::warn!(%keep, %digest, attempt, %err, "signing attempt failed");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(KeepError::Protocol(format!(
            "signing {} for {} failed after {} attempts",
            digest, keep, self.config.max_attempts
        ))
        .into())
    }

    /// Waits as long as the selected signers may take to run and submit.
    async fn await_peer_signature(
        &self,
        share: &SignerShare,
        digest: &Digest,
        requested_at: u64,
    ) -> KeepResult<bool> {
        let patience = self.config.timeouts.protocol
            + self.config.submission_stagger * share.honest_threshold as u32;
        let queries = self.chain.queries.as_ref();
        confirm_with_timeout(&self.cancel, RetryPolicy::with_timeout(patience), || async move {
            let submitted = queries
                .past_signature_submitted_events(&share.keep, requested_at)
                .await?;
            Ok::<_, KeepError>(submitted.iter().any(|event| event.digest == *digest))
        })
        .await
    }

    fn start_finish(
        self: &Arc<Self>,
        share: &SignerShare,
        finish: Finish,
        block_number: u64,
        archived: &CancellationToken,
    ) {
        let controller = self.clone();
        let share = share.clone();
        let archived = archived.clone();
        self.spawn(&format!("{:?} {}", finish, share.keep), async move {
            if controller.finish(&share, finish, block_number).await? {
                archived.cancel();
            }
            Ok(())
        });
    }

    /// Archives a keep found inactive outside of a closing or terminating
    /// event. Returns false if a closing is already underway.
    async fn archive_inactive(&self, keep: &KeepId) -> KeepResult<bool> {
        let Some(_guard) = self.start_action(TrackedAction::Closing(keep.clone())).await? else {
            return Ok(false);
        };
        self.set_state(keep, KeepState::Closed);
        self.archive(keep).await?;
        Ok(true)
    }

    /// Waits for the closing or terminating event to be confirmed, then
    /// archives the share. Returns whether the keep got archived.
    async fn finish(
        self: &Arc<Self>,
        share: &SignerShare,
        finish: Finish,
        block_number: u64,
    ) -> anyhow::Result<bool> {
        let keep = &share.keep;
        let (action, requested, done) = match finish {
            Finish::Close => (
                TrackedAction::Closing(keep.clone()),
                KeepState::ClosingRequested,
                KeepState::Closed,
            ),
            Finish::Terminate => (
                TrackedAction::Terminating(keep.clone()),
                KeepState::TerminatingRequested,
                KeepState::Terminated,
            ),
        };
        let Some(_guard) = self.start_action(action).await? else {
            return Ok(false);
        };
        self.set_state(keep, requested);
        let confirmed_at = block_number + self.config.block_confirmations;
        tracing::info!(%keep, ?finish, confirmed_at, "waiting for confirmations");
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(KeepError::Canceled.into()),
            result = self.chain.events.wait_for_block(confirmed_at) => result?,
        }
        let still_active = do_with_retry(&self.cancel, self.config.chain_retry, || {
            self.chain.queries.is_active(keep)
        })
        .await?;
        if still_active {
            tracing::warn!(%keep, ?finish, "keep still active after confirmations; ignoring");
            self.set_state(keep, KeepState::Active);
            return Ok(false);
        }
        self.set_state(keep, done);
        if self.registry.has(keep).await {
            self.archive(keep).await?;
        }
        Ok(true)
    }

    /// Archives the keep's share, retrying a storage failure once.
    async fn archive(&self, keep: &KeepId) -> KeepResult<()> {
        let result = match self.registry.unregister(keep).await {
            Err(err) if err.kind() == ErrorKind::Storage => {
                tracing::warn!(%keep, %err, "archiving share failed; retrying once");
                self.registry.unregister(keep).await
            }
            result => result,
        };
        if let Err(err) = &result {
            tracing::error!(%keep, %err, "cannot archive signer share; keep lifecycle halted");
            return result;
        }
        metrics::KEEP_KEEPS_ARCHIVED.inc();
        self.set_state(keep, KeepState::Archived);
        tracing::info!(%keep, "keep archived");
        Ok(())
    }
}
