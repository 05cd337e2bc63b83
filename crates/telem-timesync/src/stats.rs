//! Time-sync statistics.

use serde::Serialize;

/// Counters and extremes gathered by the role state machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    /// Responses processed by a client.
    pub exchanges: u64,
    /// Candidate offsets that produced a step.
    pub offsets_applied: u64,
    /// Candidate offsets discarded for exceeding the maximum step.
    pub offsets_rejected: u64,
    /// Requests answered by a master.
    pub requests_answered: u64,
    /// Announcements learned by a client.
    pub announces_learned: u64,
    /// Payloads shorter than their fixed layout.
    pub malformed: u64,
    /// Messages not applicable to this node's role.
    pub ignored: u64,
    /// Smallest candidate offset seen.
    pub min_offset_ms: Option<i64>,
    /// Largest candidate offset seen.
    pub max_offset_ms: Option<i64>,
    /// Most recent candidate offset.
    pub last_offset_ms: Option<i64>,
    /// Largest delay seen.
    pub max_delay_ms: u64,
    /// Sequence number of the most recent response.
    pub last_sequence: Option<u64>,
}

impl SyncStats {
    /// Create empty statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one processed exchange.
    pub fn record_exchange(&mut self, sequence: u64, offset_ms: i64, delay_ms: u64) {
        self.exchanges += 1;
        self.min_offset_ms = Some(self.min_offset_ms.map_or(offset_ms, |m| m.min(offset_ms)));
        self.max_offset_ms = Some(self.max_offset_ms.map_or(offset_ms, |m| m.max(offset_ms)));
        self.last_offset_ms = Some(offset_ms);
        self.max_delay_ms = self.max_delay_ms.max(delay_ms);
        self.last_sequence = Some(sequence);
    }

    /// Peak-to-peak spread of candidate offsets.
    #[must_use]
    pub fn offset_spread_ms(&self) -> Option<i64> {
        match (self.min_offset_ms, self.max_offset_ms) {
            (Some(min), Some(max)) => Some(max.saturating_sub(min)),
            _ => None,
        }
    }

    /// Reset all counters.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
