use crate::chain::{encode_public_key, PublicKeyBytes};
use crate::error::{KeepError, KeepResult};
use crate::primitives::ParticipantId;
use crate::storage::{self, KeepStorage};
use aes_gcm::Aes128Gcm;
use k256::{AffinePoint, ProjectivePoint, Scalar};
use keep_primitives::{KeepId, OperatorId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const SLOT_PREFIX: &str = "membership_";

/// This operator's share of a keep's key, as produced by key generation.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerShare {
    pub keep: KeepId,
    pub members: Vec<OperatorId>,
    pub index: ParticipantId,
    pub honest_threshold: usize,
    pub private_share: Scalar,
    pub public_key: AffinePoint,
    /// Feldman commitments to the coefficients of the group polynomial.
    pub commitments: Vec<AffinePoint>,
}

impl std::fmt::Debug for SignerShare {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerShare")
            .field("keep", &self.keep)
            .field("members", &self.members)
            .field("index", &self.index)
            .field("honest_threshold", &self.honest_threshold)
            .finish_non_exhaustive()
    }
}

impl SignerShare {
    pub fn public_key_bytes(&self) -> PublicKeyBytes {
        encode_public_key(&self.public_key)
    }

    pub fn member_index(&self, operator: &OperatorId) -> Option<ParticipantId> {
        self.members
            .iter()
            .position(|member| member == operator)
            .map(|index| ParticipantId(index as u32))
    }

    /// The public counterpart of `member`'s private share.
    pub fn public_share(&self, member: ParticipantId) -> ProjectivePoint {
        evaluate_commitments(&self.commitments, member)
    }

    /// Checks the share against the commitments it was generated with.
    pub fn verify(&self) -> KeepResult<()> {
        if self.commitments.len() != self.honest_threshold {
            return Err(KeepError::Crypto(format!(
                "expected {} commitments, found {}",
                self.honest_threshold,
                self.commitments.len()
            )));
        }
        if self.commitments.first() != Some(&self.public_key) {
            return Err(KeepError::Crypto(
                "public key does not match the commitments".to_string(),
            ));
        }
        if ProjectivePoint::GENERATOR * self.private_share != self.public_share(self.index) {
            return Err(KeepError::Crypto(
                "private share does not match the commitments".to_string(),
            ));
        }
        Ok(())
    }
}

/// Evaluates `sum(C_k * x^k)` at the evaluation point of `member`.
pub fn evaluate_commitments(commitments: &[AffinePoint], member: ParticipantId) -> ProjectivePoint {
    let x = evaluation_point(member);
    commitments
        .iter()
        .rev()
        .fold(ProjectivePoint::IDENTITY, |acc, commitment| {
            acc * x + ProjectivePoint::from(*commitment)
        })
}

/// Members are evaluated at `index + 1`, so that no member holds the secret itself.
pub fn evaluation_point(member: ParticipantId) -> Scalar {
    Scalar::from(u64::from(member.0) + 1)
}

/// Maps keep ids to this operator's shares and mediates their persistence.
/// All access goes through one mutex.
pub struct SignerRegistry {
    storage: Arc<KeepStorage>,
    cipher: Aes128Gcm,
    shares: tokio::sync::Mutex<BTreeMap<KeepId, Vec<SignerShare>>>,
}

impl SignerRegistry {
    pub fn new(storage: Arc<KeepStorage>, aes_key: &[u8; 16]) -> Self {
        Self {
            storage,
            cipher: storage::cipher(aes_key),
            shares: tokio::sync::Mutex::new(BTreeMap::new()),
        }
    }

    /// Persists the share, then makes it visible. A keep holds at most one share.
    pub async fn register(&self, share: SignerShare) -> KeepResult<()> {
        let mut shares = self.shares.lock().await;
        if shares.get(&share.keep).is_some_and(|existing| !existing.is_empty()) {
            return Err(KeepError::Stale(format!(
                "share for keep {} already registered",
                share.keep
            )));
        }
        let plaintext = serde_json::to_vec(&share)
            .map_err(|err| KeepError::storage("serialize share", err))?;
        let blob = storage::encrypt(&self.cipher, &plaintext)?;
        let slot = format!("{}{}", SLOT_PREFIX, 0);
        self.storage
            .save(&blob, share.keep.as_str(), &slot)
            .await?;
        tracing::info!(keep = %share.keep, "registered signer share");
        shares.entry(share.keep.clone()).or_default().push(share);
        Ok(())
    }

    pub async fn get(&self, keep: &KeepId) -> Option<SignerShare> {
        self.shares
            .lock()
            .await
            .get(keep)
            .and_then(|shares| shares.first().cloned())
    }

    pub async fn has(&self, keep: &KeepId) -> bool {
        self.shares
            .lock()
            .await
            .get(keep)
            .is_some_and(|shares| !shares.is_empty())
    }

    pub async fn keeps(&self) -> Vec<KeepId> {
        self.shares.lock().await.keys().cloned().collect()
    }

    /// Archives the keep's shares on disk and forgets them.
    pub async fn unregister(&self, keep: &KeepId) -> KeepResult<()> {
        let mut shares = self.shares.lock().await;
        self.storage.archive(keep.as_str()).await?;
        shares.remove(keep);
        tracing::info!(keep = %keep, "archived signer share");
        Ok(())
    }

    /// Loads every persisted share. Unreadable entries are returned as errors
    /// and do not stop the load.
    pub async fn load_all(&self) -> KeepResult<(Vec<SignerShare>, Vec<KeepError>)> {
        let storage = self.storage.clone();
        let (blobs, mut errors) =
            tokio::task::spawn_blocking(move || storage.read_all().partition())
                .await
                .map_err(|err| KeepError::storage("read shares", err))?;
        let mut loaded = Vec::new();
        let mut shares = self.shares.lock().await;
        for blob in blobs {
            let share = storage::decrypt(&self.cipher, &blob.content).and_then(|plaintext| {
                serde_json::from_slice::<SignerShare>(&plaintext)
                    .map_err(|err| KeepError::storage("deserialize share", err))
            });
            let share = match share {
                Ok(share) if share.keep.as_str() == blob.directory => share,
                Ok(share) => {
                    errors.push(KeepError::Storage(format!(
                        "share for keep {} found under {}",
                        share.keep, blob.directory
                    )));
                    continue;
                }
                Err(err) => {
                    errors.push(err.context(format!("{}/{}", blob.directory, blob.name)));
                    continue;
                }
            };
            let entry = shares.entry(share.keep.clone()).or_default();
            if !entry.contains(&share) {
                entry.push(share.clone());
                loaded.push(share);
            }
        }
        Ok((loaded, errors))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use k256::elliptic_curve::Field;

    /// Shares of a freshly dealt key, one per member.
    pub fn dealt_shares(keep: &KeepId, members: &[OperatorId], threshold: usize) -> Vec<SignerShare> {
        let mut rng = rand::thread_rng();
        let coefficients = (0..threshold)
            .map(|_| Scalar::random(&mut rng))
            .collect::<Vec<_>>();
        let commitments = coefficients
            .iter()
            .map(|coefficient| (ProjectivePoint::GENERATOR * coefficient).to_affine())
            .collect::<Vec<_>>();
        (0..members.len())
            .map(|index| {
                let x = evaluation_point(ParticipantId(index as u32));
                let private_share = coefficients
                    .iter()
                    .rev()
                    .fold(Scalar::ZERO, |acc, coefficient| acc * x + coefficient);
                SignerShare {
                    keep: keep.clone(),
                    members: members.to_vec(),
                    index: ParticipantId(index as u32),
                    honest_threshold: threshold,
                    private_share,
                    public_key: commitments[0],
                    commitments: commitments.clone(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::dealt_shares;
    use super::*;
    use assert_matches::assert_matches;

    fn members() -> Vec<OperatorId> {
        (1..=3u8).map(|i| OperatorId::from([i; 20])).collect()
    }

    async fn registry(dir: &std::path::Path) -> SignerRegistry {
        let storage = Arc::new(KeepStorage::new(dir.to_path_buf()).await.unwrap());
        SignerRegistry::new(storage, &[9; 16])
    }

    #[test]
    fn test_dealt_shares_verify() {
        let keep = KeepId::new("local", "0x01").unwrap();
        for share in dealt_shares(&keep, &members(), 2) {
            share.verify().unwrap();
        }
        let mut broken = dealt_shares(&keep, &members(), 2).remove(1);
        broken.private_share += Scalar::ONE;
        assert_matches!(broken.verify(), Err(KeepError::Crypto(_)));
    }

    #[test]
    fn test_share_json_round_trip_preserves_key_material() {
        let keep = KeepId::new("local", "0x01").unwrap();
        let share = dealt_shares(&keep, &members(), 2).remove(0);
        let bytes = serde_json::to_vec(&share).unwrap();
        let back: SignerShare = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, share);
        assert_eq!(back.public_share(ParticipantId(2)), share.public_share(ParticipantId(2)));
        assert!(!format!("{:?}", share).contains("private_share"));
    }

    #[tokio::test]
    async fn test_register_persists_encrypted_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let keep = KeepId::new("local", "0x01").unwrap();
        let share = dealt_shares(&keep, &members(), 2).remove(1);
        {
            let registry = registry(dir.path()).await;
            assert!(!registry.has(&keep).await);
            registry.register(share.clone()).await.unwrap();
            assert!(registry.has(&keep).await);
            assert_matches!(registry.register(share.clone()).await, Err(KeepError::Stale(_)));
        }
        let raw = std::fs::read(dir.path().join("local:0x01/membership_0")).unwrap();
        assert!(serde_json::from_slice::<SignerShare>(&raw).is_err());

        let reloaded = registry(dir.path()).await;
        let (loaded, errors) = reloaded.load_all().await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(loaded, vec![share.clone()]);
        assert_eq!(reloaded.get(&keep).await, Some(share));
        // A second load is a no-op.
        let (loaded, _) = reloaded.load_all().await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn test_interrupted_write_does_not_block_register() {
        let dir = tempfile::tempdir().unwrap();
        let keep = KeepId::new("local", "0x01").unwrap();
        let share = dealt_shares(&keep, &members(), 2).remove(0);
        let keep_dir = dir.path().join(keep.as_str());
        std::fs::create_dir_all(&keep_dir).unwrap();
        std::fs::write(keep_dir.join(".staging-membership_0.00000000"), [1, 2, 3]).unwrap();

        registry(dir.path()).await.register(share.clone()).await.unwrap();
        let (loaded, errors) = registry(dir.path()).await.load_all().await.unwrap();
        assert!(errors.is_empty());
        assert_eq!(loaded, vec![share]);
    }

    #[tokio::test]
    async fn test_unregister_archives() {
        let dir = tempfile::tempdir().unwrap();
        let keep = KeepId::new("local", "0x01").unwrap();
        let registry = registry(dir.path()).await;
        registry
            .register(dealt_shares(&keep, &members(), 2).remove(0))
            .await
            .unwrap();
        registry.unregister(&keep).await.unwrap();
        registry.unregister(&keep).await.unwrap();
        assert!(!registry.has(&keep).await);
        assert!(dir.path().join("archived/local:0x01/membership_0").exists());
        let (loaded, errors) = registry.load_all().await.unwrap();
        assert!(loaded.is_empty() && errors.is_empty());
    }

    #[tokio::test]
    async fn test_load_reports_undecryptable_share() {
        let dir = tempfile::tempdir().unwrap();
        let keep = KeepId::new("local", "0x01").unwrap();
        registry(dir.path())
            .await
            .register(dealt_shares(&keep, &members(), 2).remove(0))
            .await
            .unwrap();
        let storage = Arc::new(KeepStorage::new(dir.path().to_path_buf()).await.unwrap());
        let other_key = SignerRegistry::new(storage, &[1; 16]);
        let (loaded, errors) = other_key.load_all().await.unwrap();
        assert!(loaded.is_empty());
        assert_matches!(errors.as_slice(), [KeepError::Crypto(_)]);
    }
}
