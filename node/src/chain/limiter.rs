use super::tx_sender::{SignedTransaction, TransactionBackend, TxHash, TxReceipt};
use super::{
    ChainEventSource, ChainQueries, EventStream, KeepCreatedEvent, KeepEvent, PublicKeyBytes,
    SignatureSubmittedEvent, StakeMonitor,
};
use crate::error::{KeepError, KeepResult};
use async_trait::async_trait;
use keep_primitives::{Digest, KeepId, OperatorId};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Limits applied to every request a [`LimitedChain`] forwards.
#[derive(Debug, Clone, Copy)]
pub struct RequestLimits {
    /// 0 disables rate limiting.
    pub requests_per_second: u32,
    /// 0 disables the concurrency limit.
    pub concurrency: usize,
    pub timeout: Duration,
}

/// Wraps a chain client so that every request is subject to a timeout, a
/// concurrency limit and a requests-per-second limit. Timeouts surface as
/// `ChainTransient`.
///
/// Waiting for a block height is not a request and is forwarded unlimited.
pub struct LimitedChain<T> {
    inner: T,
    timeout: Duration,
    /// In-flight requests hold a permit.
    concurrency: Option<Arc<tokio::sync::Semaphore>>,
    /// A token arrives whenever the rate limit allows another request.
    rate: Option<flume::Receiver<()>>,
}

impl<T> LimitedChain<T> {
    pub fn new(inner: T, limits: RequestLimits) -> Self {
        let concurrency = (limits.concurrency > 0)
            .then(|| Arc::new(tokio::sync::Semaphore::new(limits.concurrency)));
        let rate = (limits.requests_per_second > 0).then(|| {
            let (sender, receiver) = flume::bounded(limits.requests_per_second as usize);
            let period = Duration::from_secs(1).div_f64(f64::from(limits.requests_per_second));
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    if sender.send_async(()).await.is_err() {
                        break;
                    }
                }
            });
            receiver
        });
        Self {
            inner,
            timeout: limits.timeout,
            concurrency,
            rate,
        }
    }

    async fn limited<R, F>(&self, request: &str, f: F) -> KeepResult<R>
    where
        F: Future<Output = KeepResult<R>>,
    {
        let _permit = match &self.concurrency {
            Some(semaphore) => Some(
                semaphore
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| KeepError::ChainTransient("client closed".to_string()))?,
            ),
            None => None,
        };
        if let Some(rate) = &self.rate {
            rate.recv_async()
                .await
                .map_err(|_| KeepError::ChainTransient("rate limiter stopped".to_string()))?;
        }
        match tokio::time::timeout(self.timeout, f).await {
            Ok(result) => result,
            Err(_) => Err(KeepError::ChainTransient(format!(
                "{} timed out after {:?}",
                request, self.timeout
            ))),
        }
    }
}

#[async_trait]
impl<T: ChainEventSource> ChainEventSource for LimitedChain<T> {
    async fn subscribe_keep_created(&self) -> KeepResult<EventStream<KeepCreatedEvent>> {
        self.limited("subscribe_keep_created", self.inner.subscribe_keep_created())
            .await
    }

    async fn subscribe_keep_events(&self, keep: &KeepId) -> KeepResult<EventStream<KeepEvent>> {
        self.limited("subscribe_keep_events", self.inner.subscribe_keep_events(keep))
            .await
    }

    async fn current_block(&self) -> KeepResult<u64> {
        self.limited("current_block", self.inner.current_block()).await
    }

    async fn wait_for_block(&self, height: u64) -> KeepResult<()> {
        self.inner.wait_for_block(height).await
    }
}

#[async_trait]
impl<T: ChainQueries> ChainQueries for LimitedChain<T> {
    async fn is_active(&self, keep: &KeepId) -> KeepResult<bool> {
        self.limited("is_active", self.inner.is_active(keep)).await
    }

    async fn is_awaiting_signature(&self, keep: &KeepId, digest: &Digest) -> KeepResult<bool> {
        self.limited(
            "is_awaiting_signature",
            self.inner.is_awaiting_signature(keep, digest),
        )
        .await
    }

    async fn latest_digest(&self, keep: &KeepId) -> KeepResult<Option<Digest>> {
        self.limited("latest_digest", self.inner.latest_digest(keep)).await
    }

    async fn signature_requested_block(
        &self,
        keep: &KeepId,
        digest: &Digest,
    ) -> KeepResult<Option<u64>> {
        self.limited(
            "signature_requested_block",
            self.inner.signature_requested_block(keep, digest),
        )
        .await
    }

    async fn get_public_key(&self, keep: &KeepId) -> KeepResult<Option<PublicKeyBytes>> {
        self.limited("get_public_key", self.inner.get_public_key(keep)).await
    }

    async fn get_members(&self, keep: &KeepId) -> KeepResult<Vec<OperatorId>> {
        self.limited("get_members", self.inner.get_members(keep)).await
    }

    async fn get_honest_threshold(&self, keep: &KeepId) -> KeepResult<usize> {
        self.limited("get_honest_threshold", self.inner.get_honest_threshold(keep))
            .await
    }

    async fn get_opened_timestamp(&self, keep: &KeepId) -> KeepResult<u64> {
        self.limited("get_opened_timestamp", self.inner.get_opened_timestamp(keep))
            .await
    }

    async fn past_signature_submitted_events(
        &self,
        keep: &KeepId,
        from_block: u64,
    ) -> KeepResult<Vec<SignatureSubmittedEvent>> {
        self.limited(
            "past_signature_submitted_events",
            self.inner.past_signature_submitted_events(keep, from_block),
        )
        .await
    }

    async fn get_keep_count(&self) -> KeepResult<u64> {
        self.limited("get_keep_count", self.inner.get_keep_count()).await
    }

    async fn get_keep_at_index(&self, index: u64) -> KeepResult<KeepId> {
        self.limited("get_keep_at_index", self.inner.get_keep_at_index(index))
            .await
    }

    async fn balance(&self, account: &OperatorId) -> KeepResult<u128> {
        self.limited("balance", self.inner.balance(account)).await
    }

    async fn is_registered_for_application(&self, application: &str) -> KeepResult<bool> {
        self.limited(
            "is_registered_for_application",
            self.inner.is_registered_for_application(application),
        )
        .await
    }

    async fn is_status_up_to_date(&self, application: &str) -> KeepResult<bool> {
        self.limited(
            "is_status_up_to_date",
            self.inner.is_status_up_to_date(application),
        )
        .await
    }
}

#[async_trait]
impl<T: StakeMonitor> StakeMonitor for LimitedChain<T> {
    async fn has_minimum_stake(&self, operator: &OperatorId) -> KeepResult<bool> {
        self.limited("has_minimum_stake", self.inner.has_minimum_stake(operator))
            .await
    }
}

#[async_trait]
impl<T: TransactionBackend> TransactionBackend for LimitedChain<T> {
    async fn pending_nonce(&self, account: &OperatorId) -> KeepResult<u64> {
        self.limited("pending_nonce", self.inner.pending_nonce(account)).await
    }

    async fn gas_price(&self) -> KeepResult<u128> {
        self.limited("gas_price", self.inner.gas_price()).await
    }

    async fn broadcast(&self, tx: SignedTransaction) -> KeepResult<TxHash> {
        self.limited("broadcast", self.inner.broadcast(tx)).await
    }

    async fn receipt(&self, hash: &TxHash) -> KeepResult<Option<TxReceipt>> {
        self.limited("receipt", self.inner.receipt(hash)).await
    }
}
