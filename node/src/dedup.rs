//! Gate for every piece of event-triggered work.
//!
//! Each of the four tracks remembers which actions are running. Starting an
//! action that is already running, or one the registry state shows to be
//! stale, is rejected with [`KeepError::Stale`].

use crate::chain::ChainQueries;
use crate::error::{KeepError, KeepResult};
use crate::metrics;
use crate::registry::SignerRegistry;
use crate::retry::{confirm_with_timeout, RetryPolicy};
use keep_primitives::{Digest, KeepId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default for how long a signing request is re-checked on chain before it
/// is considered reverted.
pub const SIGNING_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TrackedAction {
    KeyGeneration(KeepId),
    Signing(KeepId, Digest),
    Closing(KeepId),
    Terminating(KeepId),
}

impl TrackedAction {
    pub fn track(&self) -> &'static str {
        match self {
            TrackedAction::KeyGeneration(_) => "key_generation",
            TrackedAction::Signing(..) => "signing",
            TrackedAction::Closing(_) => "closing",
            TrackedAction::Terminating(_) => "terminating",
        }
    }
}

pub struct EventDeduplicator {
    registry: Arc<SignerRegistry>,
    queries: Arc<dyn ChainQueries>,
    confirmation: RetryPolicy,
    key_generation: Mutex<HashSet<KeepId>>,
    signing: Mutex<HashMap<KeepId, HashSet<Digest>>>,
    closing: Mutex<HashSet<KeepId>>,
    terminating: Mutex<HashSet<KeepId>>,
}

impl EventDeduplicator {
    pub fn with_confirmation(
        registry: Arc<SignerRegistry>,
        queries: Arc<dyn ChainQueries>,
        confirmation: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            queries,
            confirmation,
            key_generation: Mutex::new(HashSet::new()),
            signing: Mutex::new(HashMap::new()),
            closing: Mutex::new(HashSet::new()),
            terminating: Mutex::new(HashSet::new()),
        }
    }

    pub async fn notify_key_gen_started(&self, keep: &KeepId) -> bool {
        if self.registry.has(keep).await {
            return false;
        }
        self.key_generation.lock().unwrap().insert(keep.clone())
    }

    pub fn notify_key_gen_completed(&self, keep: &KeepId) {
        self.key_generation.lock().unwrap().remove(keep);
    }

    /// Accepts only if no signing of `digest` is running and the chain still
    /// awaits it. Chain errors during the confirmation are returned.
    pub async fn notify_signing_started(
        &self,
        cancel: &CancellationToken,
        keep: &KeepId,
        digest: &Digest,
    ) -> KeepResult<bool> {
        if !self
            .signing
            .lock()
            .unwrap()
            .entry(keep.clone())
            .or_default()
            .insert(digest.clone())
        {
            return Ok(false);
        }
        let confirmed = confirm_with_timeout(cancel, self.confirmation, || {
            self.queries.is_awaiting_signature(keep, digest)
        })
        .await;
        if !matches!(confirmed, Ok(true)) {
            self.notify_signing_completed(keep, digest);
        }
        confirmed
    }

    pub fn notify_signing_completed(&self, keep: &KeepId, digest: &Digest) {
        let mut signing = self.signing.lock().unwrap();
        if let Some(digests) = signing.get_mut(keep) {
            digests.remove(digest);
            if digests.is_empty() {
                signing.remove(keep);
            }
        }
    }

    pub async fn notify_closing_started(&self, keep: &KeepId) -> bool {
        if !self.registry.has(keep).await {
            return false;
        }
        self.closing.lock().unwrap().insert(keep.clone())
    }

    pub fn notify_closing_completed(&self, keep: &KeepId) {
        self.closing.lock().unwrap().remove(keep);
    }

    pub async fn notify_terminating_started(&self, keep: &KeepId) -> bool {
        if !self.registry.has(keep).await {
            return false;
        }
        self.terminating.lock().unwrap().insert(keep.clone())
    }

    pub fn notify_terminating_completed(&self, keep: &KeepId) {
        self.terminating.lock().unwrap().remove(keep);
    }

    /// Starts `action`, returning a guard that completes it when dropped.
    pub async fn start(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        action: TrackedAction,
    ) -> KeepResult<ActionGuard> {
        let accepted = match &action {
            TrackedAction::KeyGeneration(keep) => self.notify_key_gen_started(keep).await,
            TrackedAction::Signing(keep, digest) => {
                self.notify_signing_started(cancel, keep, digest).await?
            }
            TrackedAction::Closing(keep) => self.notify_closing_started(keep).await,
            TrackedAction::Terminating(keep) => self.notify_terminating_started(keep).await,
        };
        if !accepted {
            metrics::KEEP_EVENTS_REJECTED
                .with_label_values(&[action.track()])
                .inc();
            return Err(KeepError::Stale(format!("{:?} rejected", action)));
        }
        Ok(ActionGuard {
            dedup: self.clone(),
            action,
        })
    }

    fn complete(&self, action: &TrackedAction) {
        match action {
            TrackedAction::KeyGeneration(keep) => self.notify_key_gen_completed(keep),
            TrackedAction::Signing(keep, digest) => self.notify_signing_completed(keep, digest),
            TrackedAction::Closing(keep) => self.notify_closing_completed(keep),
            TrackedAction::Terminating(keep) => self.notify_terminating_completed(keep),
        }
    }

    /// Number of running actions per track, for the debug page.
    pub fn active_counts(&self) -> [(&'static str, usize); 4] {
        [
            ("key_generation", self.key_generation.lock().unwrap().len()),
            (
                "signing",
                self.signing.lock().unwrap().values().map(HashSet::len).sum(),
            ),
            ("closing", self.closing.lock().unwrap().len()),
            ("terminating", self.terminating.lock().unwrap().len()),
        ]
    }
}

/// Signals completion of a started action on every exit path.
#[must_use = "dropping the guard completes the action"]
pub struct ActionGuard {
    dedup: Arc<EventDeduplicator>,
    action: TrackedAction,
}

impl ActionGuard {
    pub fn action(&self) -> &TrackedAction {
        &self.action
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        self.dedup.complete(&self.action);
    }
}
