//! Per-stream sequence continuity
//!
//! Each subscription id (sid) carries its own sequence numbering. The tracker
//! measures gaps but never rejects a message: the last-seen value is always
//! overwritten, so a stream that jumps backwards (server restart) simply
//! reseeds from the new value.
//!
//! ```text
//! observe(7, 1)  → 0   first message seeds tracking
//! observe(7, 2)  → 0
//! observe(7, 5)  → 2   missing 3-4, gap_count = 2
//! observe(7, 3)  → 0   backwards, last_seq = 3
//! ```

use std::collections::HashMap;

/// Bookkeeping for one sid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackingState {
    /// Last accepted sequence number
    pub last_seq: u64,
    /// Cumulative gap count, never decreases except via reset
    pub gap_count: u64,
}

/// Sequence bookkeeping keyed by sid
///
/// Single writer (the read loop); share it as `Arc<parking_lot::Mutex<_>>`
/// when the health loop needs to read it.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    states: HashMap<u64, TrackingState>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed tracking for `sid` at `seq` (replaces any prior state)
    pub fn initialize_sid(&mut self, sid: u64, seq: u64) {
        self.states.insert(
            sid,
            TrackingState {
                last_seq: seq,
                gap_count: 0,
            },
        );
    }

    /// Overwrite the last-seen value
    ///
    /// Creates the entry if `sid` is unknown.
    pub fn update_sequence(&mut self, sid: u64, seq: u64) {
        self.states.entry(sid).or_default().last_seq = seq;
    }

    /// Add `gap` to the cumulative counter
    pub fn increment_gap_count(&mut self, sid: u64, gap: u64) {
        let state = self.states.entry(sid).or_default();
        state.gap_count = state.gap_count.saturating_add(gap);
    }

    pub fn reset_gap_count(&mut self, sid: u64) {
        if let Some(state) = self.states.get_mut(&sid) {
            state.gap_count = 0;
        }
    }

    pub fn has_sid(&self, sid: u64) -> bool {
        self.states.contains_key(&sid)
    }

    pub fn get_last_seq(&self, sid: u64) -> Option<u64> {
        self.states.get(&sid).map(|s| s.last_seq)
    }

    /// 0 for unknown sids
    pub fn get_gap_count(&self, sid: u64) -> u64 {
        self.states.get(&sid).map_or(0, |s| s.gap_count)
    }

    /// Drop tracking for `sid`; unknown sids are ignored
    pub fn reset_sid(&mut self, sid: u64) {
        self.states.remove(&sid);
    }

    pub fn reset_all(&mut self) {
        self.states.clear();
    }

    /// Gap between the last-seen value and `seq`, if positive
    pub fn gap_for(&self, sid: u64, seq: u64) -> u64 {
        match self.states.get(&sid) {
            Some(state) if seq > state.last_seq => seq - state.last_seq - 1,
            _ => 0,
        }
    }

    /// Full per-message flow; returns the gap detected for this message
    pub fn observe(&mut self, sid: u64, seq: u64) -> u64 {
        if !self.has_sid(sid) {
            self.initialize_sid(sid, seq);
            return 0;
        }

        let gap = self.gap_for(sid, seq);
        if gap > 0 {
            self.increment_gap_count(sid, gap);
        }
        self.update_sequence(sid, seq);
        gap
    }

    /// Sids currently tracked, sorted
    pub fn tracked_sids(&self) -> Vec<u64> {
        let mut sids: Vec<u64> = self.states.keys().copied().collect();
        sids.sort_unstable();
        sids
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Sum of gap counts across every sid
    pub fn total_gap_count(&self) -> u64 {
        self.states
            .values()
            .fold(0u64, |acc, s| acc.saturating_add(s.gap_count))
    }
}
