// Committed log
//
// Append-only, phase-indexed sequence of decided batches. Zero decisions
// append the empty batch so index arithmetic stays aligned with phases.
// The floor moves only when a state transfer installs a snapshot; entries
// below it are gone and messages referring to them are dropped.

use crate::consensus::types::{Batch, Fingerprint, Phase};

pub struct CommittedLog {
    /// Phase of the first retained entry.
    floor: Phase,
    entries: Vec<Batch>,
}

impl Default for CommittedLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CommittedLog {
    pub fn new() -> Self {
        Self {
            floor: 0,
            entries: Vec::new(),
        }
    }

    pub fn floor(&self) -> Phase {
        self.floor
    }

    /// The next undecided phase.
    pub fn next_phase(&self) -> Phase {
        self.floor + self.entries.len() as u64
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the decided batch for the next phase; returns that phase.
    pub fn append(&mut self, batch: Batch) -> Phase {
        let phase = self.next_phase();
        self.entries.push(batch);
        phase
    }

    pub fn get(&self, phase: Phase) -> Option<&Batch> {
        if phase < self.floor {
            return None;
        }
        self.entries.get((phase - self.floor) as usize)
    }

    pub fn fingerprint_at(&self, phase: Phase) -> Option<Fingerprint> {
        self.get(phase).map(|b| b.fingerprint())
    }

    /// Clone out everything from `phase` on (clamped to the floor).
    pub fn slice_from(&self, phase: Phase) -> Vec<Batch> {
        let start = phase.max(self.floor);
        self.entries[(start - self.floor) as usize..].to_vec()
    }

    /// Replace the whole log, as after a state transfer.
    pub fn install(&mut self, first_phase: Phase, entries: Vec<Batch>) {
        self.floor = first_phase;
        self.entries = entries;
    }
}
