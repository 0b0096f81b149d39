//! Per-tier admission queue.

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tierload_core::{Tier, TierConfig};

/// Queued and loading regions of one tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierLoad {
    pub queued: usize,
    pub loading: usize,
}

/// Outcome of asking a tier whether it may admit now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Nothing to do: no waiters, no free slot, or a wake is already pending
    Idle,
    /// Admit from the front while slots are free
    Open,
    /// Too soon after the previous batch; wake the tier after this delay
    WaitFor(Duration),
}

/// FIFO of regions waiting for a slot, plus the tier's slot count.
///
/// A slot is held by every region in `Loading`, including regions attached to
/// a load started by another region.
#[derive(Debug)]
pub(crate) struct TierQueue {
    tier: Tier,
    config: TierConfig,
    pending: VecDeque<String>,
    loading: usize,
    last_admission: Option<Instant>,
    wake_scheduled: bool,
}

impl TierQueue {
    pub fn new(tier: Tier, config: TierConfig) -> Self {
        Self {
            tier,
            config,
            pending: VecDeque::new(),
            loading: 0,
            last_admission: None,
            wake_scheduled: false,
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn free_slots(&self) -> usize {
        self.config.batch_size.saturating_sub(self.loading)
    }

    /// An arrival may skip the queue when nobody waits and a slot is free
    pub fn accepts_immediately(&self) -> bool {
        self.pending.is_empty() && !self.wake_scheduled && self.free_slots() > 0
    }

    pub fn push_back(&mut self, region_id: &str) {
        self.pending.push_back(region_id.to_string());
    }

    /// Next waiting region, only while a slot is free
    pub fn pop_admissible(&mut self) -> Option<String> {
        if self.free_slots() == 0 {
            return None;
        }
        self.pending.pop_front()
    }

    pub fn remove(&mut self, region_id: &str) -> bool {
        let before = self.pending.len();
        self.pending.retain(|id| id != region_id);
        before != self.pending.len()
    }

    pub fn acquire_slot(&mut self) {
        self.loading += 1;
    }

    pub fn release_slot(&mut self) {
        self.loading = self.loading.saturating_sub(1);
    }

    /// Record that a batch (or a lone arrival) was admitted at `now`
    pub fn mark_admission(&mut self, now: Instant) {
        self.last_admission = Some(now);
    }

    /// Decide whether waiting regions may be admitted at `now`.
    ///
    /// Batches are spaced by at least `inter_batch_delay`. When it is too
    /// early the queue arms a single wake and reports the remaining delay.
    pub fn poll_admission(&mut self, now: Instant) -> Admission {
        if self.pending.is_empty() || self.wake_scheduled || self.free_slots() == 0 {
            return Admission::Idle;
        }

        if let Some(last) = self.last_admission {
            let ready_at = last + self.config.inter_batch_delay;
            if now < ready_at {
                self.wake_scheduled = true;
                return Admission::WaitFor(ready_at - now);
            }
        }

        self.last_admission = Some(now);
        Admission::Open
    }

    /// Clear the pending wake, called when its timer fires
    pub fn wake(&mut self) {
        self.wake_scheduled = false;
    }

    pub fn load(&self) -> TierLoad {
        TierLoad { queued: self.pending.len(), loading: self.loading }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal() -> TierQueue {
        TierQueue::new(Tier::Normal, TierConfig::new(2, Duration::from_millis(100), 500.0))
    }

    #[test]
    fn test_fifo_within_slots() {
        let mut queue = normal();
        queue.push_back("a");
        queue.push_back("b");
        queue.push_back("c");

        assert_eq!(queue.pop_admissible().as_deref(), Some("a"));
        queue.acquire_slot();
        assert_eq!(queue.pop_admissible().as_deref(), Some("b"));
        queue.acquire_slot();

        // Both slots taken
        assert_eq!(queue.pop_admissible(), None);
        assert_eq!(queue.load(), TierLoad { queued: 1, loading: 2 });
    }

    #[test]
    fn test_accepts_immediately() {
        let mut queue = normal();
        assert!(queue.accepts_immediately());

        queue.acquire_slot();
        queue.acquire_slot();
        assert!(!queue.accepts_immediately());

        queue.release_slot();
        queue.push_back("waiting");
        assert!(!queue.accepts_immediately());
    }

    #[test]
    fn test_admission_respects_delay() {
        let mut queue = normal();
        let start = Instant::now();
        queue.mark_admission(start);
        queue.push_back("a");

        let at_50ms = start + Duration::from_millis(50);
        assert_eq!(queue.poll_admission(at_50ms), Admission::WaitFor(Duration::from_millis(50)));

        // One wake per tier
        assert_eq!(queue.poll_admission(at_50ms), Admission::Idle);

        queue.wake();
        assert_eq!(queue.poll_admission(start + Duration::from_millis(100)), Admission::Open);
    }

    #[test]
    fn test_admission_idle_without_slots() {
        let mut queue = normal();
        queue.acquire_slot();
        queue.acquire_slot();
        queue.push_back("a");
        assert_eq!(queue.poll_admission(Instant::now()), Admission::Idle);
    }

    #[test]
    fn test_first_admission_is_open() {
        let mut queue = normal();
        queue.push_back("a");
        assert_eq!(queue.poll_admission(Instant::now()), Admission::Open);
    }

    #[test]
    fn test_remove_and_release() {
        let mut queue = normal();
        queue.push_back("a");
        assert!(queue.remove("a"));
        assert!(!queue.remove("a"));

        queue.release_slot();
        assert_eq!(queue.load(), TierLoad::default());
        assert_eq!(queue.tier(), Tier::Normal);
    }
}
