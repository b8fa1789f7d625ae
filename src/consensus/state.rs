// Per-phase consensus state
//
// One SlotState exists per in-flight phase: the proposals recorded so far,
// the binary input once rounds begin, and the vote tallies per round.
// Messages may arrive in any order; tallies accept votes for rounds this
// replica has not reached yet. The whole slot is discarded once the phase
// decides.

use crate::common::NodeId;
use crate::consensus::types::{Batch, Fingerprint, Phase2Value, Round, VoteValue};
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
pub(crate) struct RoundVotes {
    state1: HashMap<NodeId, VoteValue>,
    state2: HashMap<NodeId, Phase2Value>,
    pub sent_state1: bool,
    pub sent_state2: bool,
}

pub(crate) struct SlotState {
    /// Distinct non-empty proposals, keyed by fingerprint. The BTreeMap
    /// order gives the deterministic smallest-fingerprint candidate.
    proposals: BTreeMap<Fingerprint, Batch>,

    /// Senders whose Propose was recorded; duplicates are coalesced.
    proposers: HashSet<NodeId>,

    rounds: HashMap<Round, RoundVotes>,

    /// Round this replica is currently voting in.
    pub current_round: Round,

    /// Value this replica carries into `current_round`.
    pub current_value: VoteValue,

    /// Binary input, fixed when the rounds start.
    pub input: Option<VoteValue>,

    /// A Decide that arrived before local rounds finished.
    pub predecided: Option<(VoteValue, Batch)>,

    /// Whether this replica broadcast a Propose for the phase.
    pub proposed: bool,

    /// The batch this replica proposed, kept for retransmission.
    pub own_proposal: Option<Batch>,
}

impl Default for SlotState {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotState {
    pub fn new() -> Self {
        Self {
            proposals: BTreeMap::new(),
            proposers: HashSet::new(),
            rounds: HashMap::new(),
            current_round: 1,
            current_value: VoteValue::Zero,
            input: None,
            predecided: None,
            proposed: false,
            own_proposal: None,
        }
    }

    /// Record a proposal. Empty batches count toward the proposal quorum
    /// but are never candidates. Returns false for a duplicate sender.
    pub fn record_proposal(&mut self, sender: &NodeId, batch: Batch) -> bool {
        if !self.proposers.insert(sender.clone()) {
            return false;
        }
        if !batch.is_empty() {
            self.proposals.insert(batch.fingerprint(), batch);
        }
        true
    }

    pub fn proposer_count(&self) -> usize {
        self.proposers.len()
    }

    /// Deterministic tiebreak: the recorded proposal with the smallest
    /// fingerprint.
    pub fn candidate(&self) -> Option<(&Fingerprint, &Batch)> {
        self.proposals.iter().next()
    }

    pub fn candidate_batch(&self) -> Option<Batch> {
        self.candidate().map(|(_, b)| b.clone())
    }

    pub fn batch_for(&self, fingerprint: &Fingerprint) -> Option<&Batch> {
        self.proposals.get(fingerprint)
    }

    /// True once any vote from another replica has been recorded. Before
    /// this replica fixes its input, every recorded vote is a peer's.
    pub fn has_peer_votes(&self) -> bool {
        self.rounds
            .values()
            .any(|r| !r.state1.is_empty() || !r.state2.is_empty())
    }

    pub fn round_mut(&mut self, round: Round) -> &mut RoundVotes {
        self.rounds.entry(round).or_default()
    }

    /// First state1 vote per sender counts; repeats are ignored.
    pub fn record_state1(&mut self, round: Round, sender: &NodeId, value: VoteValue) {
        self.round_mut(round)
            .state1
            .entry(sender.clone())
            .or_insert(value);
    }

    pub fn record_state2(&mut self, round: Round, sender: &NodeId, value: Phase2Value) {
        self.round_mut(round)
            .state2
            .entry(sender.clone())
            .or_insert(value);
    }

    pub fn state1_total(&self, round: Round) -> usize {
        self.rounds.get(&round).map_or(0, |r| r.state1.len())
    }

    pub fn own_state1(&self, round: Round, id: &NodeId) -> Option<VoteValue> {
        self.rounds.get(&round)?.state1.get(id).copied()
    }

    pub fn own_state2(&self, round: Round, id: &NodeId) -> Option<Phase2Value> {
        self.rounds.get(&round)?.state2.get(id).copied()
    }

    pub fn state1_count(&self, round: Round, value: &VoteValue) -> usize {
        self.rounds.get(&round).map_or(0, |r| {
            r.state1.values().filter(|v| *v == value).count()
        })
    }

    /// The value at least `quorum` first-round votes agree on, if any. At
    /// most one value can reach a quorum in a round.
    pub fn state1_agreed(&self, round: Round, quorum: usize) -> Option<VoteValue> {
        let votes = self.rounds.get(&round)?;
        let mut counts: HashMap<VoteValue, usize> = HashMap::new();
        for value in votes.state1.values() {
            *counts.entry(*value).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= quorum)
            .map(|(value, _)| value)
    }

    pub fn state2_total(&self, round: Round) -> usize {
        self.rounds.get(&round).map_or(0, |r| r.state2.len())
    }

    /// The value decided this round if at least `threshold` second-round
    /// votes carry the same non-question value.
    pub fn state2_decision(&self, round: Round, threshold: usize) -> Option<VoteValue> {
        let votes = self.rounds.get(&round)?;
        let mut counts: HashMap<VoteValue, usize> = HashMap::new();
        for value in votes.state2.values().filter_map(|v| v.vote_value()) {
            *counts.entry(value).or_insert(0) += 1;
        }
        counts
            .into_iter()
            .find(|(_, count)| *count >= threshold)
            .map(|(value, _)| value)
    }

    /// Any non-question value seen in second-round votes. Two distinct
    /// non-question values cannot coexist in one round: each requires a
    /// quorum of agreeing first-round votes, and quorums intersect.
    pub fn state2_any_value(&self, round: Round) -> Option<VoteValue> {
        self.rounds
            .get(&round)?
            .state2
            .values()
            .find_map(|v| v.vote_value())
    }
}
