pub mod dkg;
pub mod pool;

use crate::error::{KeepError, KeepResult};
use crate::metrics;
use crate::network::MeshNetworkClient;
use crate::primitives::{MpcTaskId, ParticipantId};
use crate::protocol::{ProtocolSession, ProtocolTimeouts};
use crate::registry::SignerShare;
use dkg::FeldmanDkg;
use keep_primitives::{KeepId, OperatorId};
use pool::PreParams;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct KeygenParams {
    pub keep: KeepId,
    pub members: Vec<OperatorId>,
    pub me: ParticipantId,
    pub honest_threshold: usize,
}

/// Runs key generation for one keep among all of its members and returns
/// this operator's verified share. Nothing is persisted here.
pub async fn run_keygen(
    client: &MeshNetworkClient,
    cancel: &CancellationToken,
    timeouts: ProtocolTimeouts,
    params: KeygenParams,
    pre_params: PreParams,
) -> KeepResult<SignerShare> {
    let KeygenParams {
        keep,
        members,
        me,
        honest_threshold,
    } = params;
    if members.get(me.index()) != Some(&client.my_operator_id()) {
        return Err(KeepError::Protocol(format!(
            "{} is not member {} of {}",
            client.my_operator_id(),
            me,
            keep
        )));
    }
    let participants = (0..members.len() as u32)
        .map(ParticipantId)
        .collect::<Vec<_>>();
    let dkg = FeldmanDkg::new(me, participants.clone(), honest_threshold, pre_params)?;

    let started = Instant::now();
    let channel = client.new_channel_for_task(MpcTaskId::KeyGeneration { keep: keep.clone() })?;
    let mut session = ProtocolSession::new(channel, members.clone(), me, timeouts, cancel.clone());
    let output = session.run("key generation", 0, &participants, dkg).await?;
    drop(session);

    let share = SignerShare {
        keep,
        members,
        index: me,
        honest_threshold,
        private_share: output.private_share,
        public_key: output.public_key,
        commitments: output.commitments,
    };
    share.verify()?;
    metrics::KEEP_KEYGEN_TIME_MS.set(started.elapsed().as_millis() as i64);
    Ok(share)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::local::LocalMeshHub;
    use crate::tracking::AutoAbortTask;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use std::time::Duration;

    fn timeouts() -> ProtocolTimeouts {
        ProtocolTimeouts {
            protocol: Duration::from_secs(10),
            round: Duration::from_secs(1),
        }
    }

    fn keep() -> KeepId {
        KeepId::new("local", "0x0a").unwrap()
    }

    fn cluster(hub: &LocalMeshHub, n: u8) -> Vec<(Arc<MeshNetworkClient>, AutoAbortTask<()>)> {
        (1..=n)
            .map(|i| hub.connect_client(OperatorId::from([i; 20])))
            .collect()
    }

    #[tokio::test]
    async fn test_three_members_generate_the_same_key() {
        let hub = LocalMeshHub::new();
        let nodes = cluster(&hub, 3);
        let members = nodes
            .iter()
            .map(|(client, _)| client.my_operator_id())
            .collect::<Vec<_>>();
        let runs = nodes
            .iter()
            .enumerate()
            .map(|(index, (client, _))| {
                let client = client.clone();
                let params = KeygenParams {
                    keep: keep(),
                    members: members.clone(),
                    me: ParticipantId(index as u32),
                    honest_threshold: 2,
                };
                tokio::spawn(async move {
                    run_keygen(
                        &client,
                        &CancellationToken::new(),
                        timeouts(),
                        params,
                        PreParams::generate(2),
                    )
                    .await
                })
            })
            .collect::<Vec<_>>();
        let mut shares = Vec::new();
        for run in runs {
            shares.push(run.await.unwrap().unwrap());
        }
        for share in &shares {
            assert_eq!(share.public_key, shares[0].public_key);
            assert_eq!(share.commitments, shares[0].commitments);
            share.verify().unwrap();
        }
        assert_eq!(shares[2].index, ParticipantId(2));
    }

    #[tokio::test]
    async fn test_absent_member_fails_the_run() {
        let hub = LocalMeshHub::new();
        let nodes = cluster(&hub, 2);
        let members = vec![
            nodes[0].0.my_operator_id(),
            nodes[1].0.my_operator_id(),
            OperatorId::from([9; 20]),
        ];
        let result = run_keygen(
            &nodes[0].0,
            &CancellationToken::new(),
            ProtocolTimeouts {
                protocol: Duration::from_secs(2),
                round: Duration::from_millis(200),
            },
            KeygenParams {
                keep: keep(),
                members,
                me: ParticipantId(0),
                honest_threshold: 2,
            },
            PreParams::generate(2),
        )
        .await;
        assert_matches!(result, Err(KeepError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_wrong_index_is_rejected() {
        let hub = LocalMeshHub::new();
        let nodes = cluster(&hub, 2);
        let members = vec![nodes[0].0.my_operator_id(), nodes[1].0.my_operator_id()];
        let result = run_keygen(
            &nodes[0].0,
            &CancellationToken::new(),
            timeouts(),
            KeygenParams {
                keep: keep(),
                members,
                me: ParticipantId(1),
                honest_threshold: 2,
            },
            PreParams::generate(2),
        )
        .await;
        assert_matches!(result, Err(KeepError::Protocol(_)));
    }
}
