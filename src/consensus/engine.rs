// Rabia consensus engine
//
// A single actor task owns all consensus state: the proposal queue, the
// per-phase slots, and the committed log. Every message for a phase is
// handled in arrival order on that task, and phases commit strictly in
// order, which keeps the log contiguous and the state machine application
// deterministic.
//
// Protocol per phase: replicas broadcast proposals; once a quorum of
// proposals is recorded the replica fixes its binary input (one when a
// candidate batch exists, zero otherwise) and runs randomized binary
// agreement rounds. A round that cannot decide carries any non-question
// value forward, or flips the common coin. Decisions are disseminated with
// Decide so laggards catch up without replaying rounds; replicas that fall
// beyond the pipeline window recover by state transfer.

use crate::common::{ClusterEvent, NodeId};
use crate::config::ClusterConfig;
use crate::consensus::log::CommittedLog;
use crate::consensus::machine::StateMachine;
use crate::consensus::recovery::{self, RecoveryTracker};
use crate::consensus::state::SlotState;
use crate::consensus::types::{coin, Batch, Command, Fingerprint, Phase, Phase2Value, Round, VoteValue};
use crate::error::{ClusterError, Result};
use crate::router::{Envelope, RouteKey, Router};
use crate::runtime::{Promise, Scheduler};
use crate::topology::TopologyManager;
use crate::wire::{MessageKind, WireMessage};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Routing keys owned by the engine inbox.
pub const ENGINE_ROUTES: [RouteKey; 6] = [
    RouteKey::Wire(MessageKind::Propose),
    RouteKey::Wire(MessageKind::State1),
    RouteKey::Wire(MessageKind::State2),
    RouteKey::Wire(MessageKind::Decide),
    RouteKey::Wire(MessageKind::StateRequest),
    RouteKey::Wire(MessageKind::StateResponse),
];

/// Outbound message sink the engine drives. The cluster network implements
/// this; tests substitute a recording mock.
pub trait Outbound: Send + Sync + 'static {
    fn send_to(&self, to: &NodeId, message: WireMessage);
    fn send_all(&self, message: WireMessage);
    fn peers(&self) -> Vec<NodeId>;
}

enum EngineEvent {
    Wire(WireMessage),
    Submit {
        commands: Vec<Command>,
        done: Promise<Phase>,
    },
    Tick,
    Stop,
}

#[derive(Default)]
struct EngineStatsShared {
    phases_decided: AtomicU64,
    rounds_run: AtomicU64,
    proposals_sent: AtomicU64,
    decides_sent: AtomicU64,
    state_transfers: AtomicU64,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone)]
pub struct EngineStatsSnapshot {
    pub phases_decided: u64,
    pub rounds_run: u64,
    pub proposals_sent: u64,
    pub decides_sent: u64,
    pub state_transfers: u64,
}

/// Cheap handle to the engine actor.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
    stats: Arc<EngineStatsShared>,
}

impl EngineHandle {
    /// Queue commands for proposal. The promise resolves with the phase at
    /// which the last of them committed.
    pub fn submit(&self, commands: Vec<Command>) -> Promise<Phase> {
        let done = Promise::new();
        let event = EngineEvent::Submit {
            commands,
            done: done.clone(),
        };
        if self.tx.send(event).is_err() {
            done.fail(ClusterError::Shutdown);
        }
        done
    }

    pub fn stop(&self) {
        let _ = self.tx.send(EngineEvent::Stop);
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            phases_decided: self.stats.phases_decided.load(Ordering::Relaxed),
            rounds_run: self.stats.rounds_run.load(Ordering::Relaxed),
            proposals_sent: self.stats.proposals_sent.load(Ordering::Relaxed),
            decides_sent: self.stats.decides_sent.load(Ordering::Relaxed),
            state_transfers: self.stats.state_transfers.load(Ordering::Relaxed),
        }
    }

    /// Feed a wire message directly, bypassing the router. Test hook.
    #[cfg(test)]
    pub(crate) fn inject(&self, message: WireMessage) {
        let _ = self.tx.send(EngineEvent::Wire(message));
    }
}

/// Spawn the engine actor and wire its inbox into the router.
pub fn spawn_engine(
    config: &ClusterConfig,
    topology: Arc<TopologyManager>,
    outbound: Arc<dyn Outbound>,
    machine: Arc<dyn StateMachine>,
    router: &Arc<Router>,
    scheduler: &Scheduler,
    events: broadcast::Sender<ClusterEvent>,
) -> Result<EngineHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let stats = Arc::new(EngineStatsShared::default());

    let mut inbox = router.subscribe(&ENGINE_ROUTES)?;
    let bridge_tx = tx.clone();
    tokio::spawn(async move {
        while let Some(envelope) = inbox.recv().await {
            if let Envelope::Wired(message) = envelope {
                if bridge_tx.send(EngineEvent::Wire(message)).is_err() {
                    break;
                }
            }
        }
    });

    // Periodic retransmission of the current phase's proposal and votes,
    // which covers peers that connected after the originals went out.
    let tick_tx = tx.clone();
    scheduler.schedule_repeating(config.ping_interval, 0.0, move || {
        let tick_tx = tick_tx.clone();
        async move {
            let _ = tick_tx.send(EngineEvent::Tick);
        }
    });

    let core = EngineCore {
        self_id: config.self_id.clone(),
        batch_size: config.batch_size,
        pipeline_depth: config.pipeline_depth,
        topology,
        outbound,
        machine,
        router: Arc::clone(router),
        events,
        stats: Arc::clone(&stats),
        log: CommittedLog::new(),
        slots: BTreeMap::new(),
        pending: VecDeque::new(),
        in_flight: VecDeque::new(),
        committed_fps: HashMap::new(),
        decides_seen: HashMap::new(),
        excluded: HashSet::new(),
        recovery: RecoveryTracker::new(Duration::from_secs(5)),
        gap_target: None,
        rebuilding: false,
        halted: false,
    };
    tokio::spawn(core.run(rx));

    Ok(EngineHandle { tx, stats })
}

struct SubmitWaiter {
    done: Promise<Phase>,
    remaining: AtomicUsize,
}

impl SubmitWaiter {
    fn command_applied(&self, phase: Phase) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.done.succeed(phase);
        }
    }
}

struct PendingCommand {
    command: Command,
    waiter: Option<Arc<SubmitWaiter>>,
}

/// A batch this replica built and is driving to commitment.
struct InFlight {
    batch: Batch,
    fingerprint: Fingerprint,
    commands: Vec<PendingCommand>,
}

enum PhaseClass {
    BelowFloor,
    Decided,
    InWindow,
    FarFuture,
}

struct EngineCore {
    self_id: NodeId,
    batch_size: usize,
    pipeline_depth: u64,
    topology: Arc<TopologyManager>,
    outbound: Arc<dyn Outbound>,
    machine: Arc<dyn StateMachine>,
    router: Arc<Router>,
    events: broadcast::Sender<ClusterEvent>,
    stats: Arc<EngineStatsShared>,
    log: CommittedLog,
    slots: BTreeMap<Phase, SlotState>,
    pending: VecDeque<PendingCommand>,
    in_flight: VecDeque<InFlight>,
    /// Fingerprints of committed batches, for duplicate suppression.
    committed_fps: HashMap<Fingerprint, Phase>,
    /// Decide fingerprints per (phase, sender), for equivocation and
    /// divergence detection. Pruned to the pipeline window.
    decides_seen: HashMap<Phase, HashMap<NodeId, Fingerprint>>,
    excluded: HashSet<NodeId>,
    recovery: RecoveryTracker,
    /// Highest phase known decided elsewhere while we have a gap. Ticks
    /// keep re-requesting state transfer until the gap closes.
    gap_target: Option<Phase>,
    rebuilding: bool,
    halted: bool,
}

impl EngineCore {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::Stop => break,
                EngineEvent::Submit { commands, done } => {
                    if self.halted {
                        done.fail(ClusterError::Consensus("engine halted".to_string()));
                        continue;
                    }
                    self.handle_submit(commands, done).await;
                }
                EngineEvent::Wire(message) => {
                    if !self.halted {
                        self.handle_message(message).await;
                    }
                }
                EngineEvent::Tick => {
                    if !self.halted {
                        self.on_tick().await;
                    }
                }
            }
        }
        tracing::debug!("consensus engine stopped");
    }

    async fn handle_submit(&mut self, commands: Vec<Command>, done: Promise<Phase>) {
        if commands.is_empty() {
            done.succeed(self.log.next_phase());
            return;
        }
        let waiter = Arc::new(SubmitWaiter {
            done,
            remaining: AtomicUsize::new(commands.len()),
        });
        for command in commands {
            self.pending.push_back(PendingCommand {
                command,
                waiter: Some(Arc::clone(&waiter)),
            });
        }
        self.try_propose();
        self.advance_current().await;
    }

    async fn handle_message(&mut self, message: WireMessage) {
        if let Some(sender) = message.sender() {
            if self.excluded.contains(sender) {
                tracing::debug!(peer = %sender, "dropping message from excluded sender");
                return;
            }
        }
        match message {
            WireMessage::Propose {
                sender,
                phase,
                batch,
            } => self.on_propose(sender, phase, batch).await,
            WireMessage::State1 {
                sender,
                phase,
                round,
                value,
                ..
            } => self.on_state1(sender, phase, round, value).await,
            WireMessage::State2 {
                sender,
                phase,
                round,
                value,
                ..
            } => self.on_state2(sender, phase, round, value).await,
            WireMessage::Decide {
                sender,
                phase,
                value,
                batch,
                ..
            } => self.on_decide(sender, phase, value, batch).await,
            WireMessage::StateRequest { sender, from_phase } => {
                self.on_state_request(sender, from_phase).await;
            }
            WireMessage::StateResponse {
                first_phase,
                snapshot,
                entries,
                ..
            } => self.on_state_response(first_phase, snapshot, entries).await,
            other => {
                tracing::warn!(kind = ?other.kind(), "engine got unexpected message");
            }
        }
    }

    fn classify(&self, phase: Phase) -> PhaseClass {
        let next = self.log.next_phase();
        if phase < self.log.floor() {
            PhaseClass::BelowFloor
        } else if phase < next {
            PhaseClass::Decided
        } else if phase < next + self.pipeline_depth {
            PhaseClass::InWindow
        } else {
            PhaseClass::FarFuture
        }
    }

    /// Answer a message about an already decided phase with the decision.
    fn answer_decided(&self, phase: Phase, requester: &NodeId) {
        if let Some(batch) = self.log.get(phase) {
            let value = if batch.is_empty() {
                VoteValue::Zero
            } else {
                VoteValue::One(batch.fingerprint())
            };
            self.outbound.send_to(
                requester,
                WireMessage::Decide {
                    sender: self.self_id.clone(),
                    phase,
                    value,
                    batch: batch.clone(),
                    signature: None,
                },
            );
        }
    }

    async fn on_propose(&mut self, sender: NodeId, phase: Phase, batch: Batch) {
        match self.classify(phase) {
            PhaseClass::BelowFloor => {}
            PhaseClass::Decided => self.answer_decided(phase, &sender),
            PhaseClass::FarFuture => {
                tracing::debug!(phase, "dropping Propose beyond pipeline window");
            }
            PhaseClass::InWindow => {
                let slot = self.slots.entry(phase).or_default();
                if !slot.record_proposal(&sender, batch) {
                    tracing::debug!(peer = %sender, phase, "coalesced duplicate Propose");
                }
                if phase == self.log.next_phase() {
                    // Answer with our own proposal so the phase can gather
                    // a proposal quorum even on idle replicas.
                    self.try_propose();
                    self.advance_current().await;
                }
            }
        }
    }

    async fn on_state1(&mut self, sender: NodeId, phase: Phase, round: Round, value: VoteValue) {
        match self.classify(phase) {
            PhaseClass::BelowFloor => {}
            PhaseClass::Decided => self.answer_decided(phase, &sender),
            PhaseClass::FarFuture => {
                tracing::debug!(phase, "dropping State1 beyond pipeline window");
            }
            PhaseClass::InWindow => {
                self.slots
                    .entry(phase)
                    .or_default()
                    .record_state1(round, &sender, value);
                if phase == self.log.next_phase() {
                    self.advance_current().await;
                }
            }
        }
    }

    async fn on_state2(&mut self, sender: NodeId, phase: Phase, round: Round, value: Phase2Value) {
        match self.classify(phase) {
            PhaseClass::BelowFloor => {}
            PhaseClass::Decided => self.answer_decided(phase, &sender),
            PhaseClass::FarFuture => {
                tracing::debug!(phase, "dropping State2 beyond pipeline window");
            }
            PhaseClass::InWindow => {
                self.slots
                    .entry(phase)
                    .or_default()
                    .record_state2(round, &sender, value);
                if phase == self.log.next_phase() {
                    self.advance_current().await;
                }
            }
        }
    }

    async fn on_decide(&mut self, sender: NodeId, phase: Phase, value: VoteValue, batch: Batch) {
        let fp = batch.fingerprint();
        // The carried value must match the attached batch.
        let consistent = match value {
            VoteValue::Zero => batch.is_empty(),
            VoteValue::One(claimed) => claimed == fp && !batch.is_empty(),
        };
        if !consistent {
            tracing::warn!(peer = %sender, phase, "dropping malformed Decide");
            return;
        }

        // Two conflicting Decides for one phase from one sender.
        let conflicting = {
            let seen = self.decides_seen.entry(phase).or_default();
            match seen.get(&sender) {
                Some(previous) if *previous != fp => true,
                Some(_) => false,
                None => {
                    seen.insert(sender.clone(), fp);
                    false
                }
            }
        };
        if conflicting {
            self.exclude(&sender);
            return;
        }

        match self.classify(phase) {
            PhaseClass::BelowFloor => {}
            PhaseClass::Decided => {
                let Some(local) = self.log.fingerprint_at(phase) else {
                    return;
                };
                if local != fp {
                    let support = self
                        .decides_seen
                        .get(&phase)
                        .map_or(0, |m| m.values().filter(|f| **f == fp).count());
                    if support >= self.topology.f_plus_one() {
                        tracing::error!(
                            phase,
                            local = %local,
                            cluster = %fp,
                            "committed value diverges from cluster majority, rebuilding"
                        );
                        self.request_rebuild();
                    } else {
                        tracing::warn!(phase, peer = %sender, "conflicting Decide for committed phase");
                    }
                }
            }
            PhaseClass::InWindow => {
                self.slots.entry(phase).or_default().predecided = Some((value, batch));
                self.advance_current().await;
            }
            PhaseClass::FarFuture => {
                tracing::info!(
                    phase,
                    next = self.log.next_phase(),
                    "Decide beyond pipeline window, requesting state transfer"
                );
                self.gap_target = Some(self.gap_target.map_or(phase, |t| t.max(phase)));
                self.request_state_transfer();
            }
        }
    }

    async fn on_state_request(&mut self, sender: NodeId, from_phase: Phase) {
        if from_phase >= self.log.floor() {
            let entries = self.log.slice_from(from_phase);
            tracing::info!(peer = %sender, from_phase, count = entries.len(), "serving log slice");
            self.outbound.send_to(
                &sender,
                WireMessage::StateResponse {
                    sender: self.self_id.clone(),
                    first_phase: from_phase.max(self.log.floor()),
                    snapshot: Vec::new(),
                    entries,
                },
            );
        } else {
            // The requested range starts below our floor; ship the full
            // application snapshot as of everything we have applied.
            let snapshot = match self.machine.snapshot().await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(error = %e, "snapshot for state transfer failed");
                    return;
                }
            };
            tracing::info!(peer = %sender, first_phase = self.log.next_phase(), "serving snapshot");
            self.outbound.send_to(
                &sender,
                WireMessage::StateResponse {
                    sender: self.self_id.clone(),
                    first_phase: self.log.next_phase(),
                    snapshot,
                    entries: Vec::new(),
                },
            );
        }
    }

    async fn on_state_response(&mut self, first_phase: Phase, snapshot: Vec<u8>, entries: Vec<Batch>) {
        let replace = !snapshot.is_empty() || self.rebuilding;
        if replace {
            if let Err(e) = self.machine.restore(&snapshot).await {
                tracing::error!(error = %e, "snapshot restore failed");
                self.recovery.clear();
                return;
            }
            self.requeue_in_flight();
            self.log.install(first_phase, Vec::new());
            self.committed_fps.clear();
            self.slots.retain(|p, _| *p >= first_phase);
            self.decides_seen.clear();
            self.rebuilding = false;
            tracing::info!(first_phase, "installed application snapshot");
        }

        for (offset, batch) in entries.into_iter().enumerate() {
            let phase = first_phase + offset as u64;
            if phase == self.log.next_phase() {
                let value = if batch.is_empty() {
                    VoteValue::Zero
                } else {
                    VoteValue::One(batch.fingerprint())
                };
                self.commit(phase, value, batch, false).await;
            }
        }

        self.recovery.clear();
        self.try_propose();
        self.advance_current().await;
    }

    async fn on_tick(&mut self) {
        let phase = self.log.next_phase();
        let retransmit = match self.slots.get(&phase) {
            Some(slot) => {
                let proposal = if slot.proposed {
                    slot.own_proposal.clone()
                } else {
                    None
                };
                // Every vote this replica cast for the phase so far, so a
                // peer that connected mid-phase can still reach quorum.
                let mut votes = Vec::new();
                if slot.input.is_some() {
                    for round in 1..=slot.current_round {
                        votes.push((
                            round,
                            slot.own_state1(round, &self.self_id),
                            slot.own_state2(round, &self.self_id),
                        ));
                    }
                }
                Some((proposal, votes))
            }
            None => None,
        };

        if let Some((proposal, votes)) = retransmit {
            if let Some(batch) = proposal {
                self.outbound.send_all(WireMessage::Propose {
                    sender: self.self_id.clone(),
                    phase,
                    batch,
                });
            }
            for (round, state1, state2) in votes {
                if let Some(value) = state1 {
                    self.outbound.send_all(WireMessage::State1 {
                        sender: self.self_id.clone(),
                        phase,
                        round,
                        value,
                        signature: None,
                    });
                }
                if let Some(value) = state2 {
                    self.outbound.send_all(WireMessage::State2 {
                        sender: self.self_id.clone(),
                        phase,
                        round,
                        value,
                        signature: None,
                    });
                }
            }
        }

        // A known gap keeps asking for state transfer until it closes.
        if let Some(target) = self.gap_target {
            if self.log.next_phase() > target {
                self.gap_target = None;
            } else {
                self.request_state_transfer();
            }
        }

        self.advance_current().await;
    }

    /// Broadcast a proposal for the current phase if one is due. Re-proposes
    /// the oldest in-flight batch first; otherwise packs pending commands;
    /// otherwise answers a peer's proposal with the empty batch.
    fn try_propose(&mut self) {
        let phase = self.log.next_phase();
        let slot = self.slots.entry(phase).or_default();
        if slot.proposed {
            return;
        }

        let batch = if let Some(front) = self.in_flight.front() {
            front.batch.clone()
        } else {
            let mut packed = None;
            while !self.pending.is_empty() {
                let take = self.pending.len().min(self.batch_size);
                let commands: Vec<PendingCommand> = self.pending.drain(..take).collect();
                let batch = Batch::new(commands.iter().map(|p| p.command.clone()).collect());
                let fingerprint = batch.fingerprint();
                if let Some(&committed_phase) = self.committed_fps.get(&fingerprint) {
                    // Identical batch already committed; suppress it.
                    for command in commands {
                        if let Some(waiter) = command.waiter {
                            waiter.command_applied(committed_phase);
                        }
                    }
                    continue;
                }
                self.in_flight.push_back(InFlight {
                    batch: batch.clone(),
                    fingerprint,
                    commands,
                });
                packed = Some(batch);
                break;
            }
            match packed {
                Some(batch) => batch,
                None if slot.proposer_count() > 0 => Batch::empty(),
                None => return,
            }
        };

        slot.proposed = true;
        slot.own_proposal = Some(batch.clone());
        slot.record_proposal(&self.self_id.clone(), batch.clone());
        self.stats.proposals_sent.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(phase, commands = batch.len(), "proposing batch");
        self.outbound.send_all(WireMessage::Propose {
            sender: self.self_id.clone(),
            phase,
            batch,
        });
    }

    /// Drive the current phase as far as buffered votes allow, committing
    /// decisions and cascading into buffered future phases.
    async fn advance_current(&mut self) {
        loop {
            if self.halted {
                return;
            }
            let phase = self.log.next_phase();
            let predecided = self
                .slots
                .get_mut(&phase)
                .and_then(|slot| slot.predecided.take());
            if let Some((value, batch)) = predecided {
                self.commit(phase, value, batch, false).await;
                continue;
            }
            match self.step_phase(phase) {
                Some((value, batch)) => {
                    self.commit(phase, value, batch, true).await;
                }
                None => break,
            }
        }
    }

    /// Run the binary agreement state machine for one phase against the
    /// currently buffered votes. Returns a decision when one is reached.
    fn step_phase(&mut self, phase: Phase) -> Option<(VoteValue, Batch)> {
        let quorum = self.topology.quorum_size();
        let f_plus_one = self.topology.f_plus_one();
        let self_id = self.self_id.clone();
        let slot = self.slots.get_mut(&phase)?;

        if slot.input.is_none() {
            if slot.proposer_count() >= quorum {
                let input = match slot.candidate() {
                    Some((fp, _)) => VoteValue::One(*fp),
                    None => VoteValue::Zero,
                };
                slot.input = Some(input);
                slot.current_value = input;
            } else if slot.has_peer_votes() {
                // Rounds are underway elsewhere without a local proposal
                // quorum; join with the absent-proposal input.
                slot.input = Some(VoteValue::Zero);
                slot.current_value = VoteValue::Zero;
            } else {
                return None;
            }
        }

        loop {
            let round = slot.current_round;
            let value = slot.current_value;

            if !slot.round_mut(round).sent_state1 {
                slot.round_mut(round).sent_state1 = true;
                slot.record_state1(round, &self_id, value);
                self.outbound.send_all(WireMessage::State1 {
                    sender: self_id.clone(),
                    phase,
                    round,
                    value,
                    signature: None,
                });
            }

            if !slot.round_mut(round).sent_state2 && slot.state1_total(round) >= quorum {
                let vote = match slot.state1_agreed(round, quorum) {
                    Some(agreed) => Phase2Value::from(agreed),
                    None => Phase2Value::Question,
                };
                slot.round_mut(round).sent_state2 = true;
                slot.record_state2(round, &self_id, vote);
                self.outbound.send_all(WireMessage::State2 {
                    sender: self_id.clone(),
                    phase,
                    round,
                    value: vote,
                    signature: None,
                });
            }

            if slot.state2_total(round) < quorum {
                return None;
            }

            if let Some(decided) = slot.state2_decision(round, f_plus_one) {
                match decided {
                    VoteValue::Zero => return Some((VoteValue::Zero, Batch::empty())),
                    VoteValue::One(fp) => match slot.batch_for(&fp) {
                        Some(batch) => return Some((decided, batch.clone())),
                        None => {
                            // Decided one without holding the winning batch;
                            // a peer's Decide will supply it.
                            return None;
                        }
                    },
                }
            } else if let Some(seen) = slot.state2_any_value(round) {
                slot.current_value = seen;
                slot.current_round = round + 1;
            } else {
                // Common coin: adopt the local candidate or fall back to
                // no-proposal. All replicas flip the same side.
                slot.current_value = if coin(phase, round) {
                    match slot.candidate() {
                        Some((fp, _)) => VoteValue::One(*fp),
                        None => VoteValue::Zero,
                    }
                } else {
                    VoteValue::Zero
                };
                slot.current_round = round + 1;
            }
            self.stats.rounds_run.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn commit(&mut self, phase: Phase, value: VoteValue, batch: Batch, broadcast: bool) {
        debug_assert_eq!(phase, self.log.next_phase());
        if phase == Phase::MAX {
            self.fatal("phase overflow").await;
            return;
        }

        let fingerprint = batch.fingerprint();
        if broadcast {
            self.stats.decides_sent.fetch_add(1, Ordering::Relaxed);
            self.outbound.send_all(WireMessage::Decide {
                sender: self.self_id.clone(),
                phase,
                value,
                batch: batch.clone(),
                signature: None,
            });
        }

        self.log.append(batch.clone());
        self.committed_fps.insert(fingerprint, phase);
        self.slots.remove(&phase);
        let keep_from = self.log.next_phase().saturating_sub(self.pipeline_depth);
        self.decides_seen.retain(|p, _| *p >= keep_from);

        // Resolve waiters when the committed batch is one of ours.
        if let Some(position) = self
            .in_flight
            .iter()
            .position(|f| f.fingerprint == fingerprint)
        {
            if let Some(in_flight) = self.in_flight.remove(position) {
                for command in in_flight.commands {
                    if let Some(waiter) = command.waiter {
                        waiter.command_applied(phase);
                    }
                }
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.machine.apply(&batch).await {
                tracing::error!(phase, error = %e, "state machine apply failed");
            }
        }

        self.stats.phases_decided.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(phase, fingerprint = %fingerprint, commands = batch.len(), "batch committed");
        let _ = self.events.send(ClusterEvent::Committed {
            phase,
            fingerprint: fingerprint.0,
        });

        self.try_propose();
    }

    /// Put every in-flight batch's commands back on the pending queue,
    /// resolving those whose batch is known committed.
    fn requeue_in_flight(&mut self) {
        let in_flight: Vec<InFlight> = self.in_flight.drain(..).collect();
        for entry in in_flight {
            if let Some(&phase) = self.committed_fps.get(&entry.fingerprint) {
                for command in entry.commands {
                    if let Some(waiter) = command.waiter {
                        waiter.command_applied(phase);
                    }
                }
            } else {
                for command in entry.commands {
                    self.pending.push_back(command);
                }
            }
        }
    }

    fn request_state_transfer(&mut self) {
        if !self.recovery.should_request() {
            return;
        }
        let peers = self.outbound.peers();
        let Some(peer) = recovery::choose_peer(&peers) else {
            return;
        };
        self.recovery.begin();
        self.stats.state_transfers.fetch_add(1, Ordering::Relaxed);
        tracing::info!(from_phase = self.log.next_phase(), peer = %peer, "requesting state transfer");
        self.outbound.send_to(
            peer,
            WireMessage::StateRequest {
                sender: self.self_id.clone(),
                from_phase: self.log.next_phase(),
            },
        );
    }

    /// Full rebuild after divergence: discard the local committed range and
    /// fetch everything from a peer.
    fn request_rebuild(&mut self) {
        if !self.recovery.should_request() {
            return;
        }
        let peers = self.outbound.peers();
        let Some(peer) = recovery::choose_peer(&peers) else {
            return;
        };
        self.rebuilding = true;
        self.recovery.begin();
        self.stats.state_transfers.fetch_add(1, Ordering::Relaxed);
        self.outbound.send_to(
            peer,
            WireMessage::StateRequest {
                sender: self.self_id.clone(),
                from_phase: 0,
            },
        );
    }

    fn exclude(&mut self, sender: &NodeId) {
        tracing::error!(peer = %sender, "equivocation detected, excluding sender from the view");
        self.excluded.insert(sender.clone());
        // Topology applies the removal and the network drops the link.
        self.router.route_wire(WireMessage::RemoveNode {
            node_id: sender.clone(),
        });
    }

    async fn fatal(&mut self, reason: &str) {
        tracing::error!(reason, "consensus engine halted");
        self.halted = true;
        let cause = ClusterError::Consensus(reason.to_string());
        for command in self.pending.drain(..) {
            if let Some(waiter) = command.waiter {
                waiter.done.fail(cause.clone());
            }
        }
        for entry in self.in_flight.drain(..) {
            for command in entry.commands {
                if let Some(waiter) = command.waiter {
                    waiter.done.fail(cause.clone());
                }
            }
        }
        let _ = self.events.send(ClusterEvent::Fatal {
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeInfo;
    use crate::consensus::machine::{KvCommand, KvStore};
    use parking_lot::Mutex;

    struct MockOutbound {
        sent: Mutex<Vec<(Option<NodeId>, WireMessage)>>,
        peer_ids: Vec<NodeId>,
    }

    impl MockOutbound {
        fn new(peer_ids: Vec<NodeId>) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                peer_ids,
            })
        }

        fn broadcasts_of(&self, kind: MessageKind) -> Vec<WireMessage> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, m)| to.is_none() && m.kind() == kind)
                .map(|(_, m)| m.clone())
                .collect()
        }

        fn unicasts_of(&self, kind: MessageKind) -> Vec<(NodeId, WireMessage)> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, m)| to.is_some() && m.kind() == kind)
                .map(|(to, m)| (to.clone().unwrap(), m.clone()))
                .collect()
        }
    }

    impl Outbound for MockOutbound {
        fn send_to(&self, to: &NodeId, message: WireMessage) {
            self.sent.lock().push((Some(to.clone()), message));
        }

        fn send_all(&self, message: WireMessage) {
            self.sent.lock().push((None, message));
        }

        fn peers(&self) -> Vec<NodeId> {
            self.peer_ids.clone()
        }
    }

    struct Harness {
        handle: EngineHandle,
        outbound: Arc<MockOutbound>,
        store: Arc<KvStore>,
        events: broadcast::Receiver<ClusterEvent>,
        topology: Arc<TopologyManager>,
    }

    fn harness(n: usize) -> Harness {
        harness_with(n, ClusterConfig::default())
    }

    fn harness_with(n: usize, base: ClusterConfig) -> Harness {
        let router = Arc::new(Router::new());
        let config = ClusterConfig {
            self_id: "node-0".to_string(),
            core_nodes: (0..n)
                .map(|i| NodeInfo::new(format!("node-{}", i), "127.0.0.1", 7400 + i as u16))
                .collect(),
            // Keep retransmission ticks out of short test windows.
            ping_interval: Duration::from_secs(30),
            ..base
        };
        let topology = TopologyManager::new(&config, Arc::clone(&router)).unwrap();
        let peers: Vec<NodeId> = (1..n).map(|i| format!("node-{}", i)).collect();
        let outbound = MockOutbound::new(peers);
        let store = Arc::new(KvStore::new());
        let (events_tx, events) = broadcast::channel(256);
        let scheduler = Scheduler::new();
        let handle = spawn_engine(
            &config,
            Arc::clone(&topology),
            Arc::clone(&outbound) as Arc<dyn Outbound>,
            Arc::clone(&store) as Arc<dyn StateMachine>,
            &router,
            &scheduler,
            events_tx,
        )
        .unwrap();
        Harness {
            handle,
            outbound,
            store,
            events,
            topology,
        }
    }

    fn put_batch(key: &str, value: &str) -> Batch {
        Batch::new(vec![KvCommand::put(key, value).encode().unwrap()])
    }

    fn state1(sender: &str, phase: Phase, round: Round, value: VoteValue) -> WireMessage {
        WireMessage::State1 {
            sender: sender.to_string(),
            phase,
            round,
            value,
            signature: None,
        }
    }

    fn state2(sender: &str, phase: Phase, round: Round, value: Phase2Value) -> WireMessage {
        WireMessage::State2 {
            sender: sender.to_string(),
            phase,
            round,
            value,
            signature: None,
        }
    }

    fn propose(sender: &str, phase: Phase, batch: Batch) -> WireMessage {
        WireMessage::Propose {
            sender: sender.to_string(),
            phase,
            batch,
        }
    }

    fn decide(sender: &str, phase: Phase, batch: Batch) -> WireMessage {
        let value = if batch.is_empty() {
            VoteValue::Zero
        } else {
            VoteValue::One(batch.fingerprint())
        };
        WireMessage::Decide {
            sender: sender.to_string(),
            phase,
            value,
            batch,
            signature: None,
        }
    }

    async fn wait_committed(events: &mut broadcast::Receiver<ClusterEvent>, phase: Phase) {
        let deadline = Duration::from_secs(2);
        loop {
            let event = tokio::time::timeout(deadline, events.recv())
                .await
                .expect("no commit before timeout")
                .expect("event channel closed");
            if let ClusterEvent::Committed { phase: p, .. } = event {
                if p >= phase {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_single_node_commits_alone() {
        let mut h = harness(1);
        let done = h
            .handle
            .submit(vec![KvCommand::put("key-0", "value-0").encode().unwrap()]);
        let phase = done.await_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(phase, 0);
        wait_committed(&mut h.events, 0).await;
        assert_eq!(h.store.get("key-0").await, Some("value-0".to_string()));
        assert_eq!(h.handle.stats().phases_decided, 1);
    }

    #[tokio::test]
    async fn test_three_node_happy_path() {
        let mut h = harness(3);
        let done = h
            .handle
            .submit(vec![KvCommand::put("key-0", "value-0").encode().unwrap()]);
        let fp = put_batch("key-0", "value-0").fingerprint();

        // node-1 answers the proposal with an empty batch, then votes along.
        h.handle.inject(propose("node-1", 0, Batch::empty()));
        h.handle.inject(state1("node-1", 0, 1, VoteValue::One(fp)));
        h.handle.inject(state2("node-1", 0, 1, Phase2Value::One(fp)));

        let phase = done.await_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(phase, 0);
        assert_eq!(h.store.get("key-0").await, Some("value-0".to_string()));

        // The decision was disseminated.
        assert_eq!(h.outbound.broadcasts_of(MessageKind::Decide).len(), 1);
        wait_committed(&mut h.events, 0).await;
    }

    #[tokio::test]
    async fn test_idle_replica_answers_proposals_and_decides_peer_batch() {
        let mut h = harness(3);
        let batch = put_batch("key-7", "value-7");
        let fp = batch.fingerprint();

        h.handle.inject(propose("node-1", 0, batch.clone()));
        h.handle.inject(state1("node-1", 0, 1, VoteValue::One(fp)));
        h.handle.inject(state2("node-1", 0, 1, Phase2Value::One(fp)));

        wait_committed(&mut h.events, 0).await;
        assert_eq!(h.store.get("key-7").await, Some("value-7".to_string()));

        // The idle replica answered with its own (empty) proposal.
        let proposals = h.outbound.broadcasts_of(MessageKind::Propose);
        assert_eq!(proposals.len(), 1);
        match &proposals[0] {
            WireMessage::Propose { batch, .. } => assert!(batch.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_propose_single_decision() {
        let mut h = harness(3);
        let batch = put_batch("key-5", "value-5");
        let fp = batch.fingerprint();

        // The same sender proposes twice for phase 0.
        h.handle.inject(propose("node-1", 0, batch.clone()));
        h.handle.inject(propose("node-1", 0, batch.clone()));
        h.handle.inject(state1("node-1", 0, 1, VoteValue::One(fp)));
        h.handle.inject(state2("node-1", 0, 1, Phase2Value::One(fp)));

        wait_committed(&mut h.events, 0).await;
        assert_eq!(h.handle.stats().phases_decided, 1);
        assert_eq!(h.outbound.broadcasts_of(MessageKind::Decide).len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_state2_before_state1() {
        let mut h = harness(3);
        let batch = put_batch("key-6", "value-6");
        let fp = batch.fingerprint();

        // Votes arrive before the proposal, and state2 before state1.
        h.handle.inject(state2("node-1", 0, 1, Phase2Value::One(fp)));
        h.handle.inject(state1("node-1", 0, 1, VoteValue::One(fp)));
        h.handle.inject(propose("node-1", 0, batch));

        wait_committed(&mut h.events, 0).await;
        assert_eq!(h.store.get("key-6").await, Some("value-6".to_string()));
    }

    #[tokio::test]
    async fn test_question_round_falls_through_to_coin() {
        let h = harness(3);
        let batch = put_batch("key-9", "value-9");
        let fp = batch.fingerprint();

        // Proposal quorum forms with a candidate, so our input is one, but
        // node-1 votes zero: split round, both sides send question.
        h.handle.inject(propose("node-1", 0, batch));
        h.handle.inject(state1("node-1", 0, 1, VoteValue::Zero));
        h.handle.inject(state2("node-1", 0, 1, Phase2Value::Question));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // Round 2 opened with the common coin value.
        let expected = if coin(0, 1) {
            VoteValue::One(fp)
        } else {
            VoteValue::Zero
        };
        let state1s = h.outbound.broadcasts_of(MessageKind::State1);
        let round2: Vec<_> = state1s
            .iter()
            .filter(|m| matches!(m, WireMessage::State1 { round: 2, .. }))
            .collect();
        assert_eq!(round2.len(), 1);
        match round2[0] {
            WireMessage::State1 { value, .. } => assert_eq!(*value, expected),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_decide_fast_path_for_laggard() {
        let mut h = harness(3);
        let batch = put_batch("key-3", "value-3");

        h.handle
            .inject(decide("node-1", 0, batch.clone()));

        wait_committed(&mut h.events, 0).await;
        assert_eq!(h.store.get("key-3").await, Some("value-3".to_string()));
        // Adopted decisions are not re-broadcast.
        assert!(h.outbound.broadcasts_of(MessageKind::Decide).is_empty());
    }

    #[tokio::test]
    async fn test_stale_phase_answered_with_decide() {
        let mut h = harness(3);
        let batch = put_batch("key-1", "value-1");
        h.handle
            .inject(decide("node-1", 0, batch.clone()));
        wait_committed(&mut h.events, 0).await;

        // A peer still working on phase 0 is answered with the decision.
        h.handle.inject(propose("node-2", 0, put_batch("x", "y")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let answers = h.outbound.unicasts_of(MessageKind::Decide);
        assert!(answers
            .iter()
            .any(|(to, m)| to == "node-2"
                && matches!(m, WireMessage::Decide { phase: 0, batch: b, .. } if *b == batch)));
    }

    #[tokio::test]
    async fn test_minority_cannot_decide() {
        let h = harness(5);
        let done = h
            .handle
            .submit(vec![KvCommand::put("key-0", "value-0").encode().unwrap()]);

        // Only one other proposal: 2 of 5 is below the quorum of 3.
        h.handle.inject(propose("node-1", 0, Batch::empty()));

        let result = done.await_timeout(Duration::from_millis(300)).await;
        assert!(matches!(result, Err(ClusterError::Timeout(_))));
        assert_eq!(h.handle.stats().phases_decided, 0);
        // No votes were cast without an input.
        assert!(h.outbound.broadcasts_of(MessageKind::State1).is_empty());
    }

    #[tokio::test]
    async fn test_far_future_decide_triggers_state_transfer() {
        let h = harness_with(
            3,
            ClusterConfig {
                pipeline_depth: 4,
                ..ClusterConfig::default()
            },
        );

        h.handle
            .inject(decide("node-1", 10, put_batch("k", "v")));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let requests = h.outbound.unicasts_of(MessageKind::StateRequest);
        assert_eq!(requests.len(), 1);
        match &requests[0].1 {
            WireMessage::StateRequest { from_phase, .. } => assert_eq!(*from_phase, 0),
            _ => unreachable!(),
        }
        assert_eq!(h.handle.stats().state_transfers, 1);
    }

    #[tokio::test]
    async fn test_state_response_replays_entries() {
        let mut h = harness(3);
        let entries = vec![
            put_batch("key-0", "value-0"),
            Batch::empty(),
            put_batch("key-2", "value-2"),
        ];
        h.handle.inject(WireMessage::StateResponse {
            sender: "node-1".to_string(),
            first_phase: 0,
            snapshot: Vec::new(),
            entries,
        });

        wait_committed(&mut h.events, 2).await;
        assert_eq!(h.store.get("key-0").await, Some("value-0".to_string()));
        assert_eq!(h.store.get("key-2").await, Some("value-2".to_string()));
        assert_eq!(h.handle.stats().phases_decided, 3);
    }

    #[tokio::test]
    async fn test_state_request_served_with_log_slice() {
        let mut h = harness(3);
        h.handle
            .inject(decide("node-1", 0, put_batch("a", "1")));
        h.handle
            .inject(decide("node-1", 1, put_batch("b", "2")));
        wait_committed(&mut h.events, 1).await;

        h.handle.inject(WireMessage::StateRequest {
            sender: "node-2".to_string(),
            from_phase: 1,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let responses = h.outbound.unicasts_of(MessageKind::StateResponse);
        assert_eq!(responses.len(), 1);
        match &responses[0].1 {
            WireMessage::StateResponse {
                first_phase,
                snapshot,
                entries,
                ..
            } => {
                assert_eq!(*first_phase, 1);
                assert!(snapshot.is_empty());
                assert_eq!(entries.len(), 1);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_equivocation_excludes_sender() {
        let mut h = harness(5);
        assert!(h.topology.contains(&"node-3".to_string()));

        // node-3 sends two conflicting decides for phase 0.
        h.handle
            .inject(decide("node-3", 0, put_batch("a", "1")));
        wait_committed(&mut h.events, 0).await;
        h.handle
            .inject(decide("node-3", 0, put_batch("b", "2")));

        // The routed RemoveNode reaches topology and evicts the sender.
        for _ in 0..50 {
            if !h.topology.contains(&"node-3".to_string()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!h.topology.contains(&"node-3".to_string()));

        // Further messages from the excluded sender are dropped.
        h.handle
            .inject(decide("node-3", 5, put_batch("c", "3")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.stats().phases_decided, 1);
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let h = harness(1);
        h.handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let done = h
            .handle
            .submit(vec![KvCommand::put("k", "v").encode().unwrap()]);
        assert!(matches!(
            done.await_timeout(Duration::from_secs(1)).await,
            Err(ClusterError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_large_submit_spans_multiple_batches() {
        let mut h = harness_with(
            1,
            ClusterConfig {
                batch_size: 2,
                ..ClusterConfig::default()
            },
        );
        let commands: Vec<_> = (0..5)
            .map(|i| {
                KvCommand::put(format!("key-{}", i), format!("value-{}", i))
                    .encode()
                    .unwrap()
            })
            .collect();

        let done = h.handle.submit(commands);
        // Five commands at two per batch commit across three phases.
        let phase = done.await_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(phase, 2);
        wait_committed(&mut h.events, 2).await;
        assert_eq!(h.store.len().await, 5);
        assert_eq!(h.handle.stats().phases_decided, 3);
    }

    #[tokio::test]
    async fn test_state_request_below_floor_served_with_snapshot() {
        let mut h = harness(3);

        // A snapshot response moves our floor to 5.
        let source = KvStore::new();
        source
            .apply(&put_batch("snap-key", "snap-value"))
            .await
            .unwrap();
        let snapshot = source.snapshot().await.unwrap();
        h.handle.inject(WireMessage::StateResponse {
            sender: "node-1".to_string(),
            first_phase: 5,
            snapshot,
            entries: Vec::new(),
        });

        // Wait for the install to land.
        for _ in 0..50 {
            if h.store.contains("snap-key").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.store.get("snap-key").await, Some("snap-value".to_string()));

        // A peer asking from below the floor gets a snapshot back.
        h.handle.inject(WireMessage::StateRequest {
            sender: "node-2".to_string(),
            from_phase: 0,
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let responses = h.outbound.unicasts_of(MessageKind::StateResponse);
        assert_eq!(responses.len(), 1);
        match &responses[0].1 {
            WireMessage::StateResponse {
                first_phase,
                snapshot,
                entries,
                ..
            } => {
                assert_eq!(*first_phase, 5);
                assert!(!snapshot.is_empty());
                assert!(entries.is_empty());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_majority_divergence_triggers_rebuild() {
        let mut h = harness(5);
        let ours = put_batch("ours", "1");
        let theirs = put_batch("theirs", "2");

        // We commit one value for phase 0...
        h.handle.inject(decide("node-1", 0, ours.clone()));
        wait_committed(&mut h.events, 0).await;
        assert!(h.store.contains("ours").await);

        // ...then f+1 distinct peers claim a different decision.
        h.handle.inject(decide("node-2", 0, theirs.clone()));
        h.handle.inject(decide("node-3", 0, theirs.clone()));
        h.handle.inject(decide("node-4", 0, theirs.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let requests = h.outbound.unicasts_of(MessageKind::StateRequest);
        assert_eq!(requests.len(), 1);
        match &requests[0].1 {
            WireMessage::StateRequest { from_phase, .. } => assert_eq!(*from_phase, 0),
            _ => unreachable!(),
        }

        // The rebuild response replaces the diverged range wholesale.
        h.handle.inject(WireMessage::StateResponse {
            sender: "node-2".to_string(),
            first_phase: 0,
            snapshot: Vec::new(),
            entries: vec![theirs],
        });
        for _ in 0..50 {
            if h.store.contains("theirs").await && !h.store.contains("ours").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.store.contains("theirs").await);
        assert!(!h.store.contains("ours").await);
    }

    #[tokio::test]
    async fn test_lost_batch_is_reproposed_next_phase() {
        let mut h = harness(3);
        let done = h
            .handle
            .submit(vec![KvCommand::put("mine", "1").encode().unwrap()]);

        // Phase 0 decides a competing batch from node-1 before our rounds
        // finish: ours must carry over to phase 1.
        h.handle
            .inject(decide("node-1", 0, put_batch("theirs", "2")));
        wait_committed(&mut h.events, 0).await;

        // Drive phase 1 to decide our batch.
        let fp = put_batch("mine", "1").fingerprint();
        h.handle.inject(propose("node-1", 1, Batch::empty()));
        h.handle.inject(state1("node-1", 1, 1, VoteValue::One(fp)));
        h.handle.inject(state2("node-1", 1, 1, Phase2Value::One(fp)));

        let phase = done.await_timeout(Duration::from_secs(2)).await.unwrap();
        assert_eq!(phase, 1);
        assert_eq!(h.store.get("mine").await, Some("1".to_string()));
        assert_eq!(h.store.get("theirs").await, Some("2".to_string()));
    }
}
