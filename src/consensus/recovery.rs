// State transfer bookkeeping
//
// A replica that falls behind asks one random active peer for the committed
// range it is missing. The tracker deduplicates requests: while one is
// outstanding, further gap signals are ignored until the retry window
// passes, so a burst of Decides from the future produces a single request.

use crate::common::NodeId;
use rand::Rng;
use std::time::{Duration, Instant};

pub(crate) struct RecoveryTracker {
    requested_at: Option<Instant>,
    retry_after: Duration,
}

impl RecoveryTracker {
    pub fn new(retry_after: Duration) -> Self {
        Self {
            requested_at: None,
            retry_after,
        }
    }

    pub fn in_progress(&self) -> bool {
        matches!(self.requested_at, Some(at) if at.elapsed() < self.retry_after)
    }

    /// True when a new request should go out: none outstanding, or the
    /// outstanding one has aged past the retry window.
    pub fn should_request(&self) -> bool {
        !self.in_progress()
    }

    pub fn begin(&mut self) {
        self.requested_at = Some(Instant::now());
    }

    pub fn clear(&mut self) {
        self.requested_at = None;
    }
}

/// Uniform random choice among active peers.
pub(crate) fn choose_peer(peers: &[NodeId]) -> Option<&NodeId> {
    if peers.is_empty() {
        return None;
    }
    Some(&peers[rand::rng().random_range(0..peers.len())])
}
