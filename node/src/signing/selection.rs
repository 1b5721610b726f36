//! Stage 0 of a signing run: agreeing on the members that sign.
//!
//! Every member announces `Ready`. After a short window the lowest ready member
//! leads: it picks the first `h` ready members by index (itself first) and
//! broadcasts the pick. Members that do not lead adopt the pick of the lowest
//! leader they hear from.

use crate::error::{KeepError, KeepResult};
use crate::primitives::ParticipantId;
use crate::protocol::ProtocolSession;
use borsh::{BorshDeserialize, BorshSerialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;

pub const SELECTION_STAGE: u32 = 0;
const READY_ROUND: u32 = 0;
const SELECTED_ROUND: u32 = 1;

/// Upper bound on how long the leader waits for stragglers to announce.
pub const READY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
enum SelectionMessage {
    Ready,
    Selected(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// `signers` is sorted and contains this member at `position`.
    Selected {
        signers: Vec<ParticipantId>,
        position: usize,
    },
    NotSelected,
}

fn encode(message: &SelectionMessage) -> KeepResult<Vec<u8>> {
    borsh::to_vec(message)
        .map_err(|err| KeepError::Protocol(format!("encode selection message: {}", err)))
}

/// A pick is valid when it has exactly `threshold` distinct members, is
/// sorted, and is led by its sender.
fn validate_pick(
    pick: &[u32],
    from: ParticipantId,
    members: usize,
    threshold: usize,
) -> Option<Vec<ParticipantId>> {
    let distinct = pick.iter().copied().collect::<BTreeSet<_>>();
    if pick.len() != threshold
        || distinct.len() != threshold
        || pick.first() != Some(&from.0)
        || pick.windows(2).any(|pair| pair[0] >= pair[1])
        || pick.iter().any(|index| *index as usize >= members)
    {
        return None;
    }
    Some(pick.iter().copied().map(ParticipantId).collect())
}

fn outcome(me: ParticipantId, signers: Vec<ParticipantId>) -> Selection {
    match signers.iter().position(|signer| *signer == me) {
        Some(position) => Selection::Selected { signers, position },
        None => Selection::NotSelected,
    }
}

/// Runs the selection stage among `members` members for a keep with honest
/// threshold `threshold`.
pub async fn select_signers(
    session: &mut ProtocolSession,
    members: usize,
    threshold: usize,
) -> KeepResult<Selection> {
    let me = session.me();
    let everyone = (0..members as u32).map(ParticipantId).collect::<Vec<_>>();
    let ready_message = encode(&SelectionMessage::Ready)?;
    let others = everyone
        .iter()
        .copied()
        .filter(|member| *member != me)
        .collect::<Vec<_>>();
    let sender: &ProtocolSession = session;
    let announcements = others.iter().map(|member| {
        sender.send_to(SELECTION_STAGE, READY_ROUND, *member, ready_message.clone())
    });
    let results = futures::future::join_all(announcements).await;
    for (member, result) in others.iter().zip(results) {
        if let Err(err) = result {
            tracing::debug!(%member, %err, "member unreachable during signer selection");
        }
    }

    let mut ready = BTreeSet::from([me]);
    let mut picks = Vec::new();
    let window_end = (Instant::now() + READY_WINDOW.min(session.round_timeout()))
        .min(session.deadline());
    while ready.len() < members {
        let Some((from, _, payload)) = session.next_message(SELECTION_STAGE, window_end).await?
        else {
            break;
        };
        match SelectionMessage::try_from_slice(&payload) {
            Ok(SelectionMessage::Ready) => {
                ready.insert(from);
            }
            Ok(SelectionMessage::Selected(pick)) => picks.push((from, pick)),
            Err(err) => tracing::warn!(%from, %err, "dropping malformed selection message"),
        }
    }

    // A pick from a member below us means we are not leading.
    picks.sort_by_key(|(from, _)| *from);
    for (from, pick) in &picks {
        if let Some(signers) = validate_pick(pick, *from, members, threshold) {
            if *from < me {
                return Ok(outcome(me, signers));
            }
        }
    }

    if ready.first() == Some(&me) {
        if ready.len() < threshold {
            return Err(KeepError::Protocol(format!(
                "only {} of {} required members are ready to sign",
                ready.len(),
                threshold
            )));
        }
        let signers = ready.into_iter().take(threshold).collect::<Vec<_>>();
        let pick = encode(&SelectionMessage::Selected(
            signers.iter().map(|signer| signer.0).collect(),
        ))?;
        for member in &others {
            let result = session
                .send_to(SELECTION_STAGE, SELECTED_ROUND, *member, pick.clone())
                .await;
            match result {
                Ok(()) => {}
                Err(err) if signers.contains(member) => return Err(err),
                Err(err) => tracing::debug!(%member, %err, "could not tell member about selection"),
            }
        }
        tracing::debug!(?signers, "selected signers");
        return Ok(outcome(me, signers));
    }

    loop {
        let Some((from, round, payload)) = session
            .next_message(SELECTION_STAGE, session.deadline())
            .await?
        else {
            return Err(KeepError::Protocol(
                "no signer selection received".to_string(),
            ));
        };
        if round != SELECTED_ROUND {
            continue;
        }
        match SelectionMessage::try_from_slice(&payload) {
            Ok(SelectionMessage::Selected(pick)) => {
                match validate_pick(&pick, from, members, threshold) {
                    Some(signers) => return Ok(outcome(me, signers)),
                    None => tracing::warn!(%from, ?pick, "ignoring invalid signer selection"),
                }
            }
            Ok(SelectionMessage::Ready) => {}
            Err(err) => tracing::warn!(%from, %err, "dropping malformed selection message"),
        }
    }
}
