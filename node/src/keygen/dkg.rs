//! Feldman verifiable secret sharing based distributed key generation.
//!
//! Round 0: every member broadcasts commitments to its polynomial.
//! Round 1: every member sends each peer the polynomial evaluated at the peer's
//! evaluation point. Each received evaluation is checked against its sender's
//! commitments before it is summed into the share.

use super::pool::PreParams;
use crate::error::{KeepError, KeepResult};
use crate::primitives::ParticipantId;
use crate::protocol::{Action, Protocol};
use crate::registry::evaluate_commitments;
use borsh::{BorshDeserialize, BorshSerialize};
use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::PrimeField;
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use std::collections::{BTreeMap, VecDeque};

pub const COMMITMENTS_ROUND: u32 = 0;
pub const SHARES_ROUND: u32 = 1;

#[derive(BorshSerialize, BorshDeserialize)]
struct CommitmentsMessage {
    /// SEC1 compressed points, lowest coefficient first.
    commitments: Vec<Vec<u8>>,
}

#[derive(BorshSerialize, BorshDeserialize)]
struct ShareMessage {
    share: [u8; 32],
}

#[derive(Debug, Clone)]
pub struct DkgOutput {
    pub private_share: Scalar,
    pub public_key: AffinePoint,
    /// Sum of all members' commitments, coefficient by coefficient.
    pub commitments: Vec<AffinePoint>,
}

pub struct FeldmanDkg {
    me: ParticipantId,
    participants: Vec<ParticipantId>,
    threshold: usize,
    pre_params: PreParams,
    round: u32,
    commitments_sent: bool,
    commitments: BTreeMap<ParticipantId, Vec<AffinePoint>>,
    shares: BTreeMap<ParticipantId, Scalar>,
    outbox: VecDeque<(ParticipantId, Vec<u8>)>,
    fault: Option<KeepError>,
}

fn decode_point(bytes: &[u8]) -> Option<AffinePoint> {
    let encoded = EncodedPoint::from_bytes(bytes).ok()?;
    let point = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))?;
    if bool::from(ProjectivePoint::from(point).is_identity()) {
        return None;
    }
    Some(point)
}

fn decode_scalar(bytes: [u8; 32]) -> Option<Scalar> {
    Option::from(Scalar::from_repr(FieldBytes::from(bytes)))
}

impl FeldmanDkg {
    pub fn new(
        me: ParticipantId,
        participants: Vec<ParticipantId>,
        threshold: usize,
        pre_params: PreParams,
    ) -> KeepResult<Self> {
        if threshold == 0 || threshold > participants.len() {
            return Err(KeepError::Protocol(format!(
                "threshold {} is invalid for {} participants",
                threshold,
                participants.len()
            )));
        }
        if !participants.contains(&me) {
            return Err(KeepError::Protocol(format!(
                "participant {} is not a member",
                me
            )));
        }
        if pre_params.threshold() != threshold {
            return Err(KeepError::Crypto(format!(
                "pre-parameters are for threshold {}, need {}",
                pre_params.threshold(),
                threshold
            )));
        }
        Ok(Self {
            me,
            participants,
            threshold,
            pre_params,
            round: COMMITMENTS_ROUND,
            commitments_sent: false,
            commitments: BTreeMap::new(),
            shares: BTreeMap::new(),
            outbox: VecDeque::new(),
            fault: None,
        })
    }

    fn fail(&mut self, from: ParticipantId, reason: &str) {
        if self.fault.is_none() {
            self.fault = Some(KeepError::Protocol(format!(
                "participant {} {}",
                from, reason
            )));
        }
    }

    fn encode<T: BorshSerialize>(message: &T) -> KeepResult<Vec<u8>> {
        borsh::to_vec(message).map_err(|err| KeepError::Protocol(format!("encode: {}", err)))
    }

    fn finish(&self) -> KeepResult<DkgOutput> {
        for (from, share) in &self.shares {
            let commitments = self
                .commitments
                .get(from)
                .ok_or_else(|| KeepError::Protocol(format!("no commitments from participant {}", from)))?;
            if ProjectivePoint::GENERATOR * share != evaluate_commitments(commitments, self.me) {
                return Err(KeepError::Protocol(format!(
                    "participant {} sent a share that does not match its commitments",
                    from
                )));
            }
        }
        let private_share = self.shares.values().fold(Scalar::ZERO, |acc, share| acc + share);
        let commitments = (0..self.threshold)
            .map(|k| {
                self.commitments
                    .values()
                    .fold(ProjectivePoint::IDENTITY, |acc, member| acc + member[k])
                    .to_affine()
            })
            .collect::<Vec<_>>();
        let public_key = commitments[0];
        if bool::from(ProjectivePoint::from(public_key).is_identity()) {
            return Err(KeepError::Crypto("generated the identity as public key".to_string()));
        }
        Ok(DkgOutput {
            private_share,
            public_key,
            commitments,
        })
    }
}

impl Protocol for FeldmanDkg {
    type Output = DkgOutput;

    fn round(&self) -> u32 {
        self.round
    }

    fn poke(&mut self) -> KeepResult<Action<DkgOutput>> {
        if let Some(fault) = self.fault.take() {
            return Err(fault);
        }
        match self.round {
            COMMITMENTS_ROUND => {
                if !self.commitments_sent {
                    self.commitments_sent = true;
                    let own = self.pre_params.commitments().to_vec();
                    let message = CommitmentsMessage {
                        commitments: own
                            .iter()
                            .map(|point| point.to_encoded_point(true).as_bytes().to_vec())
                            .collect(),
                    };
                    self.commitments.insert(self.me, own);
                    return Ok(Action::SendMany(Self::encode(&message)?));
                }
                if self.commitments.len() < self.participants.len() {
                    return Ok(Action::Wait);
                }
                self.round = SHARES_ROUND;
                self.shares.insert(self.me, self.pre_params.evaluate(self.me));
                for participant in self.participants.clone() {
                    if participant != self.me {
                        let message = ShareMessage {
                            share: self.pre_params.evaluate(participant).to_bytes().into(),
                        };
                        self.outbox.push_back((participant, Self::encode(&message)?));
                    }
                }
                self.poke()
            }
            SHARES_ROUND => {
                if let Some((to, data)) = self.outbox.pop_front() {
                    return Ok(Action::SendPrivate(to, data));
                }
                if self.shares.len() < self.participants.len() {
                    return Ok(Action::Wait);
                }
                let output = self.finish()?;
                self.round += 1;
                Ok(Action::Return(output))
            }
            _ => Err(KeepError::Protocol("key generation already finished".to_string())),
        }
    }

    fn message(&mut self, from: ParticipantId, round: u32, data: Vec<u8>) {
        if from == self.me || !self.participants.contains(&from) {
            return;
        }
        match round {
            COMMITMENTS_ROUND => {
                let Ok(message) = CommitmentsMessage::try_from_slice(&data) else {
                    self.fail(from, "sent malformed commitments");
                    return;
                };
                if message.commitments.len() != self.threshold {
                    self.fail(from, "sent the wrong number of commitments");
                    return;
                }
                let Some(points) = message
                    .commitments
                    .iter()
                    .map(|bytes| decode_point(bytes))
                    .collect::<Option<Vec<_>>>()
                else {
                    self.fail(from, "sent an invalid commitment");
                    return;
                };
                if self.commitments.insert(from, points).is_some() {
                    self.fail(from, "sent commitments twice");
                }
            }
            SHARES_ROUND => {
                let Some(share) = ShareMessage::try_from_slice(&data)
                    .ok()
                    .and_then(|message| decode_scalar(message.share))
                else {
                    self.fail(from, "sent a malformed share");
                    return;
                };
                if self.shares.insert(from, share).is_some() {
                    self.fail(from, "sent its share twice");
                }
            }
            _ => self.fail(from, "sent a message for an unknown round"),
        }
    }
}
