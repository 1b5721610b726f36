use crate::chain::{operator_id_of, ChainQueries, StakeMonitor};
use crate::error::{KeepError, KeepResult};
use crate::metrics;
use crate::time_cache::TimeCache;
use k256::AffinePoint;
use keep_primitives::OperatorId;
use std::sync::Arc;
use std::time::Duration;

pub const MEMBERSHIP_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Admits peers that either hold the minimum stake or are members of an
/// active keep.
pub struct Firewall {
    stake: Arc<dyn StakeMonitor>,
    queries: Arc<dyn ChainQueries>,
    membership: TimeCache,
}

impl Firewall {
    pub fn new(stake: Arc<dyn StakeMonitor>, queries: Arc<dyn ChainQueries>) -> Self {
        Self::with_ttl(stake, queries, MEMBERSHIP_CACHE_TTL)
    }

    pub fn with_ttl(
        stake: Arc<dyn StakeMonitor>,
        queries: Arc<dyn ChainQueries>,
        ttl: Duration,
    ) -> Self {
        Self {
            stake,
            queries,
            membership: TimeCache::new(ttl),
        }
    }

    pub async fn validate_remote_public_key(&self, public_key: &AffinePoint) -> KeepResult<()> {
        let operator = operator_id_of(public_key);
        if self.is_recognized(&operator).await? {
            Ok(())
        } else {
            Err(KeepError::Transport(format!(
                "peer {} has no minimum stake and is not a member of an active keep",
                operator
            )))
        }
    }

    pub async fn is_recognized(&self, operator: &OperatorId) -> KeepResult<bool> {
        let staked = match self.stake.has_minimum_stake(operator).await {
            Ok(staked) => staked,
            Err(err) => {
                tracing::warn!(%operator, %err, "cannot check stake; checking keep membership");
                false
            }
        };
        let decision = if staked {
            "stake"
        } else if self.membership.has(&operator.to_string()) {
            "cached_membership"
        } else if self.scan_active_keeps(operator).await? {
            "active_keep_member"
        } else {
            "rejected"
        };
        metrics::KEEP_FIREWALL_DECISIONS
            .with_label_values(&[decision])
            .inc();
        tracing::debug!(%operator, decision, "firewall decision");
        Ok(decision != "rejected")
    }

    /// Walks keeps from the newest down, caching the members of every active
    /// keep seen, until one lists `operator`.
    async fn scan_active_keeps(&self, operator: &OperatorId) -> KeepResult<bool> {
        let count = self.queries.get_keep_count().await?;
        for index in (0..count).rev() {
            let keep = match self.queries.get_keep_at_index(index).await {
                Ok(keep) => keep,
                Err(err) => {
                    tracing::warn!(index, %err, "failed to fetch keep during firewall scan");
                    continue;
                }
            };
            match self.queries.is_active(&keep).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::warn!(%keep, %err, "failed to check keep during firewall scan");
                    continue;
                }
            }
            let members = match self.queries.get_members(&keep).await {
                Ok(members) => members,
                Err(err) => {
                    tracing::warn!(%keep, %err, "failed to fetch members during firewall scan");
                    continue;
                }
            };
            for member in &members {
                self.membership.add(&member.to_string());
            }
            if members.contains(operator) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[cfg(test)]
    pub fn is_cached(&self, operator: &OperatorId) -> bool {
        self.membership.has(&operator.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainQueries, MockStakeMonitor};
    use assert_matches::assert_matches;
    use k256::ProjectivePoint;
    use keep_primitives::KeepId;
    use mockall::predicate::eq;

    fn peer_key() -> AffinePoint {
        (ProjectivePoint::GENERATOR * k256::Scalar::from(7u64)).to_affine()
    }

    fn no_stake() -> MockStakeMonitor {
        let mut stake = MockStakeMonitor::new();
        stake.expect_has_minimum_stake().returning(|_| Ok(false));
        stake
    }

    fn keep(index: u64) -> KeepId {
        KeepId::new("local", &format!("0x{:02x}", index)).unwrap()
    }

    #[tokio::test]
    async fn test_staked_peer_is_admitted_without_scan() {
        let mut stake = MockStakeMonitor::new();
        stake.expect_has_minimum_stake().returning(|_| Ok(true));
        let mut queries = MockChainQueries::new();
        queries.expect_get_keep_count().never();
        let firewall = Firewall::new(Arc::new(stake), Arc::new(queries));
        firewall.validate_remote_public_key(&peer_key()).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_keep_member_is_admitted_and_cached() {
        let peer = operator_id_of(&peer_key());
        let other = OperatorId::from([5; 20]);
        let mut queries = MockChainQueries::new();
        queries.expect_get_keep_count().times(1).returning(|| Ok(3));
        queries
            .expect_get_keep_at_index()
            .returning(|index| Ok(keep(index)));
        // The newest keep is inactive, the middle one lists the peer.
        queries
            .expect_is_active()
            .with(eq(keep(2)))
            .returning(|_| Ok(false));
        queries
            .expect_is_active()
            .with(eq(keep(1)))
            .returning(|_| Ok(true));
        queries
            .expect_get_members()
            .with(eq(keep(1)))
            .times(1)
            .returning(move |_| Ok(vec![other, peer]));
        let firewall = Firewall::new(Arc::new(no_stake()), Arc::new(queries));

        firewall.validate_remote_public_key(&peer_key()).await.unwrap();
        assert!(firewall.is_cached(&peer));
        assert!(firewall.is_cached(&other));
        // Served from the cache; the mock allows a single scan only.
        firewall.validate_remote_public_key(&peer_key()).await.unwrap();
        assert!(firewall.is_recognized(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_scan_skips_failing_keeps_and_rejects_strangers() {
        let mut queries = MockChainQueries::new();
        queries.expect_get_keep_count().returning(|| Ok(2));
        queries.expect_get_keep_at_index().returning(|index| {
            if index == 1 {
                Err(KeepError::ChainTransient("timeout".to_string()))
            } else {
                Ok(keep(index))
            }
        });
        queries.expect_is_active().returning(|_| Ok(true));
        queries
            .expect_get_members()
            .returning(|_| Ok(vec![OperatorId::from([5; 20])]));
        let firewall = Firewall::new(Arc::new(no_stake()), Arc::new(queries));
        assert_matches!(
            firewall.validate_remote_public_key(&peer_key()).await,
            Err(KeepError::Transport(_))
        );
        assert!(firewall.is_cached(&OperatorId::from([5; 20])));
    }

    #[tokio::test]
    async fn test_stake_error_falls_back_to_membership() {
        let peer = operator_id_of(&peer_key());
        let mut stake = MockStakeMonitor::new();
        stake
            .expect_has_minimum_stake()
            .returning(|_| Err(KeepError::ChainTransient("stake query timed out".to_string())));
        let mut queries = MockChainQueries::new();
        queries.expect_get_keep_count().times(1).returning(|| Ok(1));
        queries.expect_get_keep_at_index().returning(|index| Ok(keep(index)));
        queries.expect_is_active().returning(|_| Ok(true));
        queries
            .expect_get_members()
            .times(1)
            .returning(move |_| Ok(vec![peer]));
        let firewall = Firewall::new(Arc::new(stake), Arc::new(queries));

        // Found by the scan, then served from the cache.
        firewall.validate_remote_public_key(&peer_key()).await.unwrap();
        assert!(firewall.is_cached(&peer));
        firewall.validate_remote_public_key(&peer_key()).await.unwrap();
    }
}
