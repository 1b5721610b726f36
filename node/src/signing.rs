pub mod recovery;
pub mod selection;

use crate::chain::{ChainQueries, ChainWriter, Signature};
use crate::error::{KeepError, KeepResult};
use crate::metrics;
use crate::network::local::LocalMeshHub;
use crate::network::MeshNetworkClient;
use crate::primitives::MpcTaskId;
use crate::protocol::{CaitSith, ProtocolSession, ProtocolTimeouts};
use crate::registry::SignerShare;
use crate::retry::{confirm_with_timeout, RetryPolicy};
use cait_sith::protocol::Participant;
use cait_sith::{KeygenOutput, PresignArguments};
use k256::ecdsa::SigningKey;
use k256::Secp256k1;
use keep_primitives::{Digest, KeepId};
use recovery::{digest_scalar, to_chain_signature, with_recovery_id};
use selection::{select_signers, Selection};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const FIRST_TRIPLE_STAGE: u32 = 1;
const SECOND_TRIPLE_STAGE: u32 = 2;
const PRESIGN_STAGE: u32 = 3;
const SIGN_STAGE: u32 = 4;

/// How long a signer polls for the signature to show up on chain after its
/// submission slot.
pub const SUBMISSION_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningOutcome {
    /// This member was one of the signers; `position` is its rank among
    /// them and orders the submissions.
    Signed { signature: Signature, position: usize },
    NotSelected,
}

fn initialization_error(stage: &str) -> impl Fn(cait_sith::protocol::InitializationError) -> KeepError + '_ {
    move |err| KeepError::Protocol(format!("cannot start {}: {}", stage, err))
}

/// Runs one signing attempt of `digest` among the members of the share's
/// keep. Members that are not picked as signers return early.
pub async fn run_signing(
    client: &MeshNetworkClient,
    cancel: &CancellationToken,
    timeouts: ProtocolTimeouts,
    share: &SignerShare,
    digest: &Digest,
    attempt: u32,
) -> KeepResult<SigningOutcome> {
    let me = share.index;
    if share.members.get(me.index()) != Some(&client.my_operator_id()) {
        return Err(KeepError::Protocol(format!(
            "{} is not member {} of {}",
            client.my_operator_id(),
            me,
            share.keep
        )));
    }
    let threshold = share.honest_threshold;
    let started = Instant::now();
    let channel = client.new_channel_for_task(MpcTaskId::Signing {
        keep: share.keep.clone(),
        digest: digest.clone(),
        attempt,
    })?;
    let mut session = ProtocolSession::new(
        channel,
        share.members.clone(),
        me,
        timeouts,
        cancel.clone(),
    );
    let (signers, position) =
        match select_signers(&mut session, share.members.len(), threshold).await? {
            Selection::Selected { signers, position } => (signers, position),
            Selection::NotSelected => return Ok(SigningOutcome::NotSelected),
        };

    let signature = if signers.len() == 1 {
        // A single signer holds the whole key.
        drop(session);
        let key = SigningKey::from_bytes(&share.private_share.to_bytes())
            .map_err(|err| KeepError::Crypto(format!("invalid private share: {}", err)))?;
        let (signature, _) = key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|err| KeepError::Crypto(format!("sign digest: {}", err)))?;
        with_recovery_id(signature, &share.public_key, digest)?
    } else {
        let participants = signers
            .iter()
            .copied()
            .map(Participant::from)
            .collect::<Vec<_>>();
        let triple0 = session
            .run(
                "triple generation 0",
                FIRST_TRIPLE_STAGE,
                &signers,
                CaitSith(
                    cait_sith::triples::generate_triple::<Secp256k1>(
                        &participants,
                        me.into(),
                        threshold,
                    )
                    .map_err(initialization_error("triple generation"))?,
                ),
            )
            .await?;
        let triple1 = session
            .run(
                "triple generation 1",
                SECOND_TRIPLE_STAGE,
                &signers,
                CaitSith(
                    cait_sith::triples::generate_triple::<Secp256k1>(
                        &participants,
                        me.into(),
                        threshold,
                    )
                    .map_err(initialization_error("triple generation"))?,
                ),
            )
            .await?;
        let presignature = session
            .run(
                "presign",
                PRESIGN_STAGE,
                &signers,
                CaitSith(
                    cait_sith::presign::<Secp256k1>(
                        &participants,
                        me.into(),
                        PresignArguments {
                            triple0,
                            triple1,
                            keygen_out: KeygenOutput {
                                private_share: share.private_share,
                                public_key: share.public_key,
                            },
                            threshold,
                        },
                    )
                    .map_err(initialization_error("presign"))?,
                ),
            )
            .await?;
        let full_signature = session
            .run(
                "sign",
                SIGN_STAGE,
                &signers,
                CaitSith(
                    cait_sith::sign::<Secp256k1>(
                        &participants,
                        me.into(),
                        share.public_key,
                        presignature,
                        digest_scalar(digest),
                    )
                    .map_err(initialization_error("sign"))?,
                ),
            )
            .await?;
        drop(session);
        to_chain_signature(
            &full_signature.big_r,
            &full_signature.s,
            &share.public_key,
            digest,
        )?
    };

    metrics::KEEP_NUM_SIGNATURES_GENERATED.inc();
    metrics::KEEP_SIGNATURE_TIME_MS.set(started.elapsed().as_millis() as i64);
    Ok(SigningOutcome::Signed {
        signature,
        position,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Submitted,
    /// Another signer got the signature on chain first.
    SubmittedByPeer,
}

/// Publishes a signature produced by the signer at `position`.
///
/// Signers take turns: each waits `position * stagger` and submits only if the
/// chain still awaits the digest. Either way the signature must then be
/// observed among the keep's submitted signatures since `from_block`.
#[allow(clippy::too_many_arguments)]
pub async fn submit_signature(
    cancel: &CancellationToken,
    queries: &dyn ChainQueries,
    writer: &dyn ChainWriter,
    keep: &KeepId,
    digest: &Digest,
    signature: Signature,
    position: usize,
    stagger: Duration,
    from_block: u64,
) -> KeepResult<SubmissionOutcome> {
    let delay = stagger * position as u32;
    if !delay.is_zero() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(KeepError::Canceled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    let mut outcome = SubmissionOutcome::SubmittedByPeer;
    if queries.is_awaiting_signature(keep, digest).await? {
        match writer.submit_signature(keep, signature).await {
            Ok(()) => {
                metrics::KEEP_NUM_SIGNATURES_SUBMITTED.inc();
                outcome = SubmissionOutcome::Submitted;
            }
            // Lost the race against a peer with the same signature.
            Err(err) if !queries.is_awaiting_signature(keep, digest).await? => {
                tracing::debug!(%keep, %digest, %err, "signature submitted by a peer meanwhile");
            }
            Err(err) => return Err(err),
        }
    }

    let observed = confirm_with_timeout(
        cancel,
        RetryPolicy::with_timeout(SUBMISSION_CONFIRMATION_TIMEOUT),
        || async move {
            let submitted = queries.past_signature_submitted_events(keep, from_block).await?;
            Ok::<_, KeepError>(submitted.iter().any(|event| event.digest == *digest))
        },
    )
    .await?;
    if !observed {
        return Err(KeepError::ChainTransient(format!(
            "signature for {} on {} not observed on chain",
            digest, keep
        )));
    }
    Ok(outcome)
}

/// Signs `digest` with shares of one keep held locally, e.g. recovered from
/// the data directories of several operators. The shares run the regular
/// protocol against each other over an in-process mesh.
pub async fn sign_offline(
    shares: &[SignerShare],
    digest: &Digest,
    timeouts: ProtocolTimeouts,
    cancel: &CancellationToken,
) -> KeepResult<Signature> {
    let Some(first) = shares.first() else {
        return Err(KeepError::Protocol("no signer shares given".to_string()));
    };
    let indices = shares.iter().map(|share| share.index).collect::<BTreeSet<_>>();
    if shares
        .iter()
        .any(|share| share.keep != first.keep || share.public_key != first.public_key)
    {
        return Err(KeepError::Crypto(format!(
            "shares do not belong to the same key of {}",
            first.keep
        )));
    }
    if indices.len() < first.honest_threshold {
        return Err(KeepError::Protocol(format!(
            "{} distinct shares given, {} required",
            indices.len(),
            first.honest_threshold
        )));
    }

    let hub = LocalMeshHub::new();
    let mut nodes = Vec::new();
    for index in &indices {
        if let Some(share) = shares.iter().find(|share| share.index == *index) {
            let (client, task) = hub.connect_client(share.members[index.index()]);
            nodes.push((share.clone(), client, task));
        }
    }
    let runs = nodes.iter().map(|(share, client, _)| {
        run_signing(client, cancel, timeouts, share, digest, 0)
    });
    let mut signature = None;
    for outcome in futures::future::join_all(runs).await {
        if let SigningOutcome::Signed { signature: produced, .. } = outcome? {
            signature.get_or_insert(produced);
        }
    }
    signature.ok_or_else(|| KeepError::Protocol("no share was selected to sign".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{MockChainQueries, MockChainWriter, SignatureSubmittedEvent};
    use crate::primitives::ParticipantId;
    use crate::registry::testing::dealt_shares;
    use crate::tracking::AutoAbortTask;
    use assert_matches::assert_matches;
    use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
    use keep_primitives::OperatorId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn timeouts() -> ProtocolTimeouts {
        ProtocolTimeouts {
            protocol: Duration::from_secs(30),
            round: Duration::from_millis(500),
        }
    }

    fn keep() -> KeepId {
        KeepId::new("local", "0x0c").unwrap()
    }

    fn digest() -> Digest {
        "54a6483b8aca55c9df2a35baf71d9965ddfd623468d81d51229bd5eb7d1e1c1b"
            .parse()
            .unwrap()
    }

    fn assert_recovers(signature: &Signature, share: &SignerShare) {
        let parsed = EcdsaSignature::from_scalars(signature.r, signature.s).unwrap();
        assert!(parsed.normalize_s().is_none());
        let recovery_id = RecoveryId::from_byte(signature.recovery_id).unwrap();
        let recovered =
            VerifyingKey::recover_from_prehash(digest().as_bytes(), &parsed, recovery_id).unwrap();
        assert_eq!(*recovered.as_affine(), share.public_key);
    }

    async fn sign_with(
        members: u8,
        threshold: usize,
        online: &[usize],
    ) -> (Vec<SignerShare>, Vec<KeepResult<SigningOutcome>>) {
        let hub = LocalMeshHub::new();
        let operators = (1..=members)
            .map(|i| OperatorId::from([i; 20]))
            .collect::<Vec<_>>();
        let shares = dealt_shares(&keep(), &operators, threshold);
        let nodes: Vec<(Arc<MeshNetworkClient>, AutoAbortTask<()>)> = online
            .iter()
            .map(|index| hub.connect_client(operators[*index]))
            .collect();
        let runs = online
            .iter()
            .zip(&nodes)
            .map(|(index, (client, _))| {
                let client = client.clone();
                let share = shares[*index].clone();
                tokio::spawn(async move {
                    run_signing(
                        &client,
                        &CancellationToken::new(),
                        timeouts(),
                        &share,
                        &digest(),
                        0,
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();
        let mut results = Vec::new();
        for run in runs {
            results.push(run.await.unwrap());
        }
        (shares, results)
    }

    #[tokio::test]
    async fn test_two_of_three_sign_the_same_signature() {
        let (shares, results) = sign_with(3, 2, &[0, 1, 2]).await;
        let signatures = results
            .iter()
            .filter_map(|result| match result {
                Ok(SigningOutcome::Signed {
                    signature,
                    position,
                }) => Some((*signature, *position)),
                Ok(SigningOutcome::NotSelected) => None,
                Err(err) => panic!("signing failed: {}", err),
            })
            .collect::<Vec<_>>();
        assert_eq!(signatures.len(), 2);
        assert_eq!(signatures[0].0, signatures[1].0);
        assert_eq!(signatures[0].1, 0);
        assert_eq!(signatures[1].1, 1);
        assert_recovers(&signatures[0].0, &shares[0]);
        assert_eq!(results[2], Ok(SigningOutcome::NotSelected));
    }

    #[tokio::test]
    async fn test_single_signer_keep_signs_locally() {
        let (shares, results) = sign_with(2, 1, &[0, 1]).await;
        assert_matches!(&results[0], Ok(SigningOutcome::Signed { position: 0, signature }) => {
            assert_recovers(signature, &shares[0]);
        });
        assert_eq!(results[1], Ok(SigningOutcome::NotSelected));
    }

    #[tokio::test]
    async fn test_offline_members_leave_too_few_signers() {
        let (_, results) = sign_with(3, 2, &[2]).await;
        assert_matches!(results[0], Err(KeepError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_canceled_signing_returns_canceled() {
        let hub = LocalMeshHub::new();
        let operators = vec![OperatorId::from([1; 20]), OperatorId::from([2; 20])];
        let shares = dealt_shares(&keep(), &operators, 2);
        let (client, _task) = hub.connect_client(operators[0]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = run_signing(&client, &cancel, timeouts(), &shares[0], &digest(), 0).await;
        assert_matches!(result, Err(KeepError::Canceled));
        assert_eq!(shares[0].index, ParticipantId(0));
    }

    #[tokio::test]
    async fn test_offline_signing_with_a_subset_of_shares() {
        let operators = (1..=4).map(|i| OperatorId::from([i; 20])).collect::<Vec<_>>();
        let shares = dealt_shares(&keep(), &operators, 2);
        let subset = vec![shares[3].clone(), shares[1].clone(), shares[3].clone()];
        let signature = sign_offline(&subset, &digest(), timeouts(), &CancellationToken::new())
            .await
            .unwrap();
        assert_recovers(&signature, &shares[0]);
    }

    #[tokio::test]
    async fn test_offline_signing_needs_threshold_distinct_shares() {
        let operators = (1..=3).map(|i| OperatorId::from([i; 20])).collect::<Vec<_>>();
        let shares = dealt_shares(&keep(), &operators, 2);
        let cancel = CancellationToken::new();
        let duplicated = vec![shares[0].clone(), shares[0].clone()];
        assert_matches!(
            sign_offline(&duplicated, &digest(), timeouts(), &cancel).await,
            Err(KeepError::Protocol(_))
        );
        let other_key = dealt_shares(&keep(), &operators, 2);
        let mixed = vec![shares[0].clone(), other_key[1].clone()];
        assert_matches!(
            sign_offline(&mixed, &digest(), timeouts(), &cancel).await,
            Err(KeepError::Crypto(_))
        );
        assert_matches!(
            sign_offline(&[], &digest(), timeouts(), &cancel).await,
            Err(KeepError::Protocol(_))
        );
    }

    fn signature() -> Signature {
        Signature {
            r: [1; 32],
            s: [2; 32],
            recovery_id: 0,
        }
    }

    fn submitted_event() -> SignatureSubmittedEvent {
        SignatureSubmittedEvent {
            keep: keep(),
            digest: digest(),
            signature: signature(),
            submitter: OperatorId::from([1; 20]),
            block_number: 7,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_signer_submits_immediately() {
        let mut queries = MockChainQueries::new();
        queries
            .expect_is_awaiting_signature()
            .times(1)
            .returning(|_, _| Ok(true));
        queries
            .expect_past_signature_submitted_events()
            .returning(|_, _| Ok(vec![submitted_event()]));
        let mut writer = MockChainWriter::new();
        writer
            .expect_submit_signature()
            .times(1)
            .returning(|_, _| Ok(()));
        let outcome = submit_signature(
            &CancellationToken::new(),
            &queries,
            &writer,
            &keep(),
            &digest(),
            signature(),
            0,
            Duration::from_secs(5),
            5,
        )
        .await;
        assert_eq!(outcome, Ok(SubmissionOutcome::Submitted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_signer_skips_when_already_submitted() {
        let mut queries = MockChainQueries::new();
        queries
            .expect_is_awaiting_signature()
            .times(1)
            .returning(|_, _| Ok(false));
        queries
            .expect_past_signature_submitted_events()
            .returning(|_, _| Ok(vec![submitted_event()]));
        let writer = MockChainWriter::new();
        let started = tokio::time::Instant::now();
        let outcome = submit_signature(
            &CancellationToken::new(),
            &queries,
            &writer,
            &keep(),
            &digest(),
            signature(),
            2,
            Duration::from_secs(5),
            5,
        )
        .await;
        assert_eq!(outcome, Ok(SubmissionOutcome::SubmittedByPeer));
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_signature_is_transient() {
        let polls = Arc::new(AtomicUsize::new(0));
        let mut queries = MockChainQueries::new();
        queries
            .expect_is_awaiting_signature()
            .returning(|_, _| Ok(false));
        let counter = polls.clone();
        queries
            .expect_past_signature_submitted_events()
            .returning(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(vec![])
            });
        let writer = MockChainWriter::new();
        let outcome = submit_signature(
            &CancellationToken::new(),
            &queries,
            &writer,
            &keep(),
            &digest(),
            signature(),
            0,
            Duration::from_secs(5),
            5,
        )
        .await;
        assert_matches!(outcome, Err(KeepError::ChainTransient(_)));
        assert!(polls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_wait_is_cancellable() {
        let queries = MockChainQueries::new();
        let writer = MockChainWriter::new();
        let cancel = CancellationToken::new();
        let canceler = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceler.cancel();
        });
        let outcome = submit_signature(
            &cancel,
            &queries,
            &writer,
            &keep(),
            &digest(),
            signature(),
            3,
            Duration::from_secs(5),
            5,
        )
        .await;
        assert_eq!(outcome, Err(KeepError::Canceled));
    }
}
