use super::{KeepController, KeepState};
use crate::error::KeepResult;
use crate::retry::do_with_retry;
use keep_primitives::KeepId;
use std::sync::Arc;

impl KeepController {
    /// Rebuilds the keep state from the data directory and the chain.
    ///
    /// Shares of keeps that are no longer active are archived. Active keeps
    /// are followed again, which re-checks the published public key and
    /// resumes a signature request that is still pending. Finally the factory
    /// is scanned for keeps that list this operator but have no local share.
    pub async fn warm_start(self: &Arc<Self>) -> anyhow::Result<()> {
        let (shares, errors) = self.registry.load_all().await?;
        for err in &errors {
            tracing::error!(%err, "cannot load signer share");
        }
        tracing::info!(shares = shares.len(), "loaded signer shares");
        for share in shares {
            let keep = share.keep.clone();
            let active = do_with_retry(&self.cancel, self.config.chain_retry, || {
                self.chain.queries.is_active(&keep)
            })
            .await;
            match active {
                Ok(true) => {
                    self.upsert_record(
                        &keep,
                        &share.members,
                        share.honest_threshold,
                        KeepState::Active,
                    );
                    let controller = self.clone();
                    self.spawn(&format!("keep {}", keep), async move {
                        controller.follow_keep(share).await
                    });
                }
                Ok(false) => {
                    tracing::info!(%keep, "keep is no longer active; archiving its share");
                    self.upsert_record(
                        &keep,
                        &share.members,
                        share.honest_threshold,
                        KeepState::Closed,
                    );
                    self.archive_inactive(&keep).await?;
                }
                Err(err) => {
                    tracing::error!(%keep, %err, "cannot check keep status; not following it");
                }
            }
        }
        self.scan_factory().await?;
        Ok(())
    }

    /// Looks for active keeps that list this operator and have no local
    /// share. Key generation starts for keeps without a published key; a
    /// published key means the share was lost.
    pub(super) async fn scan_factory(self: &Arc<Self>) -> anyhow::Result<()> {
        let queries = &self.chain.queries;
        let count = queries.get_keep_count().await?;
        for index in (0..count).rev() {
            let keep = match queries.get_keep_at_index(index).await {
                Ok(keep) => keep,
                Err(err) => {
                    tracing::warn!(index, %err, "cannot fetch keep during factory scan");
                    continue;
                }
            };
            if self.registry.has(&keep).await || self.state(&keep) != KeepState::Unseen {
                continue;
            }
            if let Err(err) = self.recover_keep(keep.clone()).await {
                tracing::warn!(%keep, %err, "cannot inspect keep during factory scan");
            }
        }
        Ok(())
    }

    async fn recover_keep(self: &Arc<Self>, keep: KeepId) -> KeepResult<()> {
        let queries = &self.chain.queries;
        if !queries.is_active(&keep).await? {
            return Ok(());
        }
        let members = queries.get_members(&keep).await?;
        if !members.contains(&self.operator) {
            return Ok(());
        }
        match queries.get_public_key(&keep).await? {
            None => {
                let honest_threshold = queries.get_honest_threshold(&keep).await?;
                tracing::info!(%keep, "keep awaits its key; starting key generation");
                self.start_key_generation(keep, members, honest_threshold);
            }
            Some(public_key) => {
                tracing::error!(
                    %keep,
                    public_key = hex::encode(public_key),
                    "keep lost: active keep lists this operator but no signer share is stored"
                );
            }
        }
        Ok(())
    }
}
