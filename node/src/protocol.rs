//! Drives round-based MPC protocols over a task channel.
//!
//! A run is split into stages (selection, triple generation, presigning, ...),
//! each driven by one [`Protocol`] instance. Every message carries its stage and
//! round. Inbound messages are buffered and handed to the protocol in
//! `(round, sender)` order once the protocol has reached that round; messages
//! for a later stage wait until that stage starts.

use crate::config::TssConfig;
use crate::error::{KeepError, KeepResult};
use crate::network::NetworkTaskChannel;
use crate::primitives::ParticipantId;
use crate::retry::{do_with_retry, RetryPolicy};
use crate::tracking;
use borsh::{BorshDeserialize, BorshSerialize};
use keep_primitives::OperatorId;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SEND_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const SEND_MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Action<T> {
    Wait,
    /// Send to every other participant of the stage.
    SendMany(Vec<u8>),
    SendPrivate(ParticipantId, Vec<u8>),
    Return(T),
}

/// A local state machine of one MPC stage.
///
/// Outbound messages are tagged with `round()` as observed right after the
/// `poke` that produced them, so a protocol advances its round before emitting
/// that round's messages.
pub trait Protocol {
    type Output;
    fn round(&self) -> u32;
    fn poke(&mut self) -> KeepResult<Action<Self::Output>>;
    fn message(&mut self, from: ParticipantId, round: u32, data: Vec<u8>);
}

/// Adapts a cait-sith protocol. cait-sith orders its own messages, so
/// everything travels in round 0.
pub struct CaitSith<P>(pub P);

impl<T, P> Protocol for CaitSith<P>
where
    P: cait_sith::protocol::Protocol<Output = T>,
{
    type Output = T;

    fn round(&self) -> u32 {
        0
    }

    fn poke(&mut self) -> KeepResult<Action<T>> {
        use cait_sith::protocol::Action as CsAction;
        let action = self
            .0
            .poke()
            .map_err(|err| KeepError::Protocol(err.to_string()))?;
        Ok(match action {
            CsAction::Wait => Action::Wait,
            CsAction::SendMany(data) => Action::SendMany(data),
            CsAction::SendPrivate(to, data) => Action::SendPrivate(to.into(), data),
            CsAction::Return(output) => Action::Return(output),
        })
    }

    fn message(&mut self, from: ParticipantId, _round: u32, data: Vec<u8>) {
        self.0.message(from.into(), data);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub(crate) struct ProtocolEnvelope {
    pub stage: u32,
    pub round: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolTimeouts {
    /// Wall clock bound of the whole run.
    pub protocol: Duration,
    /// How long one outbound message is retried.
    pub round: Duration,
}

impl From<&TssConfig> for ProtocolTimeouts {
    fn from(config: &TssConfig) -> Self {
        Self {
            protocol: config.protocol_timeout(),
            round: config.round_timeout(),
        }
    }
}

/// One MPC run from the view of one member. Owns the task channel; dropping
/// the session unsubscribes the run from the transport.
pub struct ProtocolSession {
    channel: NetworkTaskChannel,
    members: Vec<OperatorId>,
    me: ParticipantId,
    deadline: Instant,
    round_timeout: Duration,
    cancel: CancellationToken,
    stage: u32,
    buffered: BTreeMap<(u32, u32, ParticipantId), VecDeque<Vec<u8>>>,
}

impl ProtocolSession {
    pub fn new(
        channel: NetworkTaskChannel,
        members: Vec<OperatorId>,
        me: ParticipantId,
        timeouts: ProtocolTimeouts,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            members,
            me,
            deadline: Instant::now() + timeouts.protocol,
            round_timeout: timeouts.round,
            cancel,
            stage: 0,
            buffered: BTreeMap::new(),
        }
    }

    pub fn me(&self) -> ParticipantId {
        self.me
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn round_timeout(&self) -> Duration {
        self.round_timeout
    }

    fn timed_out(&self) -> KeepError {
        KeepError::Protocol(format!("{} timed out", self.channel.task_id))
    }

    fn enter_stage(&mut self, stage: u32) {
        if stage > self.stage {
            self.stage = stage;
            self.buffered.retain(|(buffered_stage, _, _), _| *buffered_stage >= stage);
        }
    }

    /// Sends to one participant, retrying transient transport failures for up
    /// to the round timeout.
    pub async fn send_to(
        &self,
        stage: u32,
        round: u32,
        to: ParticipantId,
        payload: Vec<u8>,
    ) -> KeepResult<()> {
        let recipient = *self
            .members
            .get(to.index())
            .ok_or_else(|| KeepError::Protocol(format!("unknown participant {}", to)))?;
        let data = borsh::to_vec(&ProtocolEnvelope {
            stage,
            round,
            payload,
        })
        .map_err(|err| KeepError::Protocol(format!("encode message: {}", err)))?;
        let policy = RetryPolicy::new(SEND_INITIAL_BACKOFF, SEND_MAX_BACKOFF, self.round_timeout);
        let channel = &self.channel;
        let result = tokio::select! {
            _ = tokio::time::sleep_until(self.deadline) => return Err(self.timed_out()),
            result = do_with_retry(&self.cancel, policy, || channel.send(recipient, data.clone())) => result,
        };
        result.map_err(|err| err.context(format!("send to participant {}", to)).into_protocol())
    }

    pub async fn broadcast(
        &self,
        stage: u32,
        round: u32,
        participants: &[ParticipantId],
        payload: &[u8],
    ) -> KeepResult<()> {
        for participant in participants {
            if *participant != self.me {
                self.send_to(stage, round, *participant, payload.to_vec())
                    .await?;
            }
        }
        Ok(())
    }

    /// Receives the next well-formed message from a keep member.
    async fn receive(&mut self) -> KeepResult<(ParticipantId, ProtocolEnvelope)> {
        loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => return Err(KeepError::Canceled),
                _ = tokio::time::sleep_until(self.deadline) => return Err(self.timed_out()),
                message = self.channel.receive() => message.map_err(KeepError::into_protocol)?,
            };
            let Some(from) = self.members.iter().position(|member| *member == message.from)
            else {
                tracing::debug!(from = %message.from, "dropping message from a non-member");
                continue;
            };
            match ProtocolEnvelope::try_from_slice(&message.message.data) {
                Ok(envelope) => return Ok((ParticipantId(from as u32), envelope)),
                Err(err) => {
                    tracing::warn!(from = %message.from, %err, "dropping malformed message");
                }
            }
        }
    }

    fn buffer(&mut self, from: ParticipantId, envelope: ProtocolEnvelope) {
        if envelope.stage < self.stage {
            tracing::debug!(%from, stage = envelope.stage, "dropping message for a finished stage");
            return;
        }
        self.buffered
            .entry((envelope.stage, envelope.round, from))
            .or_default()
            .push_back(envelope.payload);
    }

    /// Waits for the next message of `stage`, lowest round and sender first.
    /// Returns `None` once `until` passes.
    pub async fn next_message(
        &mut self,
        stage: u32,
        until: Instant,
    ) -> KeepResult<Option<(ParticipantId, u32, Vec<u8>)>> {
        self.enter_stage(stage);
        loop {
            let next_key = self
                .buffered
                .range((stage, 0, ParticipantId(0))..=(stage, u32::MAX, ParticipantId(u32::MAX)))
                .next()
                .map(|(key, _)| *key);
            if let Some(key) = next_key {
                let (_, round, from) = key;
                let mut payload = None;
                if let Some(payloads) = self.buffered.get_mut(&key) {
                    payload = payloads.pop_front();
                    if payloads.is_empty() {
                        self.buffered.remove(&key);
                    }
                }
                if let Some(payload) = payload {
                    return Ok(Some((from, round, payload)));
                }
                continue;
            }
            let received = tokio::select! {
                _ = tokio::time::sleep_until(until) => return Ok(None),
                received = self.receive() => received?,
            };
            let (from, envelope) = received;
            self.buffer(from, envelope);
        }
    }

    /// Hands every buffered message of `stage` up to the protocol's current
    /// round to the protocol. Returns whether anything was delivered.
    fn deliver_buffered<P: Protocol>(
        &mut self,
        stage: u32,
        participants: &[ParticipantId],
        protocol: &mut P,
    ) -> bool {
        let current_round = protocol.round();
        let keys = self
            .buffered
            .range(
                (stage, 0, ParticipantId(0))..=(stage, current_round, ParticipantId(u32::MAX)),
            )
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();
        let mut delivered = false;
        for key in keys {
            let Some(payloads) = self.buffered.remove(&key) else {
                continue;
            };
            let (_, round, from) = key;
            if !participants.contains(&from) {
                tracing::debug!(%from, stage, "dropping message from a non-participant");
                continue;
            }
            for payload in payloads {
                protocol.message(from, round, payload);
                delivered = true;
            }
        }
        delivered
    }

    /// Runs `protocol` as `stage` among `participants` until it returns.
    pub async fn run<P: Protocol>(
        &mut self,
        name: &str,
        stage: u32,
        participants: &[ParticipantId],
        mut protocol: P,
    ) -> KeepResult<P::Output> {
        self.enter_stage(stage);
        let mut steps = 0usize;
        loop {
            loop {
                if self.cancel.is_cancelled() {
                    return Err(KeepError::Canceled);
                }
                steps += 1;
                let action = protocol.poke()?;
                let round = protocol.round();
                match action {
                    Action::Wait => break,
                    Action::SendMany(data) => {
                        self.broadcast(stage, round, participants, &data).await?;
                    }
                    Action::SendPrivate(to, data) => {
                        if !participants.contains(&to) {
                            return Err(KeepError::Protocol(format!(
                                "{} addressed non-participant {}",
                                name, to
                            )));
                        }
                        self.send_to(stage, round, to, data).await?;
                    }
                    Action::Return(output) => {
                        tracking::set_progress(&format!("{}: done after {} steps", name, steps));
                        return Ok(output);
                    }
                }
            }
            if self.deliver_buffered(stage, participants, &mut protocol) {
                continue;
            }
            tracking::set_progress(&format!(
                "{}: round {}, steps {}, buffered {}",
                name,
                protocol.round(),
                steps,
                self.buffered.len()
            ));
            let (from, envelope) = self.receive().await?;
            self.buffer(from, envelope);
        }
    }
}
