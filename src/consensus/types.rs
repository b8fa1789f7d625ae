// Core consensus data types
//
// Phases index slots in the committed log; rounds iterate the randomized
// binary agreement inside one phase. Batches carry opaque commands and are
// identified by a fingerprint over their canonical encoding.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One slot in the ordered commit log. 64-bit and never wrapped; overflow is
/// a fatal engine fault.
pub type Phase = u64;

/// One iteration of the randomized binary agreement within a phase.
pub type Round = u32;

/// Opaque command bytes; apply semantics live in the state machine.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Command(pub Vec<u8>);

impl Command {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Deterministic hash over the canonical batch encoding. Used for the
/// proposal tiebreak (smallest wins) and for duplicate suppression.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(bincode::Encode, bincode::Decode)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// An ordered group of commands proposed together in one phase.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Batch {
    pub commands: Vec<Command>,
}

impl Batch {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// The batch committed by a zero decision.
    pub fn empty() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Fingerprint over the canonical encoding: each command as a 4-byte
    /// big-endian length followed by its bytes. Identical across replicas
    /// that hold the same batch.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for command in &self.commands {
            hasher.update((command.0.len() as u32).to_be_bytes());
            hasher.update(&command.0);
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Binary agreement input/decision value.
///
/// Zero encodes "no proposal". One pins the candidate batch by fingerprint:
/// a quorum agreeing on One therefore agrees on a unique batch, which is
/// what makes the attached batch identical across deciders.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode,
    bincode::Decode,
)]
pub enum VoteValue {
    Zero,
    One(Fingerprint),
}

/// Second-round vote value; Question means no quorum agreed in round one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, bincode::Encode,
    bincode::Decode,
)]
pub enum Phase2Value {
    Zero,
    One(Fingerprint),
    Question,
}

impl From<VoteValue> for Phase2Value {
    fn from(v: VoteValue) -> Self {
        match v {
            VoteValue::Zero => Phase2Value::Zero,
            VoteValue::One(fp) => Phase2Value::One(fp),
        }
    }
}

impl Phase2Value {
    /// The vote value carried by a non-question second-round vote.
    pub fn vote_value(&self) -> Option<VoteValue> {
        match self {
            Phase2Value::Zero => Some(VoteValue::Zero),
            Phase2Value::One(fp) => Some(VoteValue::One(*fp)),
            Phase2Value::Question => None,
        }
    }
}

/// Common pseudo-random coin; true selects "adopt a proposal". Every honest
/// replica computes the same bit for a given (phase, round), which is what
/// drives expected O(1) termination.
pub fn coin(phase: Phase, round: Round) -> bool {
    let mut hasher = Sha256::new();
    hasher.update(b"rabia-coin");
    hasher.update(phase.to_be_bytes());
    hasher.update(round.to_be_bytes());
    let digest = hasher.finalize();
    digest[0] & 1 == 1
}
