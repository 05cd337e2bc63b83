//! Time-sync state and the offset application policy.
//!
//! ```text
//! adjusted_now = raw_now + offset           (clamped at 0)
//! unix_now     = adjusted_now + unix_base   (0 until the base is valid)
//! ```
//!
//! The offset only ever moves by bounded steps. The unix base validity flag
//! is monotone: once set it is never cleared.

use crate::clock::{ExtendedClock, TickSource};
use telem_common::config::TimeSyncConfig;
use tracing::{debug, trace, warn};

/// Bounds applied to each candidate offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Candidates larger than this (in magnitude) are discarded.
    pub max_step_ms: u64,
    /// Divisor applied to accepted candidates.
    pub smooth_div: u32,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_step_ms: 30_000,
            smooth_div: 4,
        }
    }
}

impl SyncPolicy {
    /// Build the policy from node configuration.
    #[must_use]
    pub fn from_config(config: &TimeSyncConfig) -> Self {
        Self {
            max_step_ms: config.max_step_ms,
            smooth_div: config.smooth_div.max(1),
        }
    }

    /// Step to apply for `candidate_ms`, or `None` if it must be discarded.
    ///
    /// The step is `candidate / smooth_div` truncated toward zero, with a
    /// unit step in the candidate's sign whenever that truncates to zero.
    #[must_use]
    pub fn step_for(&self, candidate_ms: i64) -> Option<i64> {
        if candidate_ms.unsigned_abs() > self.max_step_ms {
            return None;
        }

        let step = candidate_ms / i64::from(self.smooth_div.max(1));
        if step == 0 {
            return Some(candidate_ms.signum());
        }
        Some(step)
    }
}

/// Outcome of [`TimeSyncState::apply_offset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetDecision {
    /// The step was added to the offset.
    Applied {
        /// Step that was added.
        step_ms: i64,
        /// Offset after the step.
        offset_ms: i64,
    },
    /// The candidate exceeded the maximum step and was ignored.
    Rejected {
        /// Discarded candidate.
        candidate_ms: i64,
    },
}

/// Mutable synchronization state of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeSyncState {
    offset_ms: i64,
    last_delay_ms: u64,
    unix_base_ms: i64,
    unix_valid: bool,
}

impl TimeSyncState {
    /// Create a state with zero offset and no unix base.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset added to the extended clock.
    #[must_use]
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }

    /// Most recently estimated delay.
    #[must_use]
    pub fn last_delay_ms(&self) -> u64 {
        self.last_delay_ms
    }

    /// Unix base, if one has been established.
    #[must_use]
    pub fn unix_base_ms(&self) -> Option<i64> {
        self.unix_valid.then_some(self.unix_base_ms)
    }

    /// Whether a unix base has been established.
    #[must_use]
    pub fn unix_is_valid(&self) -> bool {
        self.unix_valid
    }

    /// Move the offset toward `candidate_ms` by one bounded step.
    pub fn apply_offset(&mut self, candidate_ms: i64, policy: &SyncPolicy) -> OffsetDecision {
        let Some(step_ms) = policy.step_for(candidate_ms) else {
            warn!(
                candidate_ms,
                max_step_ms = policy.max_step_ms,
                "Discarding time-sync offset beyond maximum step"
            );
            return OffsetDecision::Rejected { candidate_ms };
        };

        self.offset_ms = self.offset_ms.saturating_add(step_ms);
        trace!(candidate_ms, step_ms, offset_ms = self.offset_ms, "Applied offset step");
        OffsetDecision::Applied {
            step_ms,
            offset_ms: self.offset_ms,
        }
    }

    /// Record the delay from the latest exchange.
    pub fn record_delay(&mut self, delay_ms: u64) {
        self.last_delay_ms = delay_ms;
    }

    /// Force the offset back to zero (the master owns ground truth).
    pub fn reset_offset(&mut self) {
        self.offset_ms = 0;
    }

    fn set_unix_base(&mut self, base_ms: i64) {
        self.unix_base_ms = base_ms;
        self.unix_valid = true;
    }
}

/// Extended clock paired with the node's sync state.
///
/// This is the single owner of "now" for a node: every timestamp the node
/// emits comes from here.
#[derive(Debug, Clone)]
pub struct NodeClock<S> {
    clock: ExtendedClock<S>,
    state: TimeSyncState,
}

impl<S: TickSource> NodeClock<S> {
    /// Create a clock with fresh sync state.
    pub fn new(source: S) -> Self {
        Self {
            clock: ExtendedClock::new(source),
            state: TimeSyncState::new(),
        }
    }

    /// Local extended clock, without any correction.
    pub fn raw_now_ms(&mut self) -> u64 {
        self.clock.raw_now_ms()
    }

    /// Extended clock plus the applied offset, clamped at zero.
    pub fn adjusted_now_ms(&mut self) -> u64 {
        let raw = i64::try_from(self.clock.raw_now_ms()).unwrap_or(i64::MAX);
        clamp_non_negative(raw.saturating_add(self.state.offset_ms))
    }

    /// Absolute time in milliseconds, or 0 while no unix base is known.
    pub fn unix_now_ms(&mut self) -> u64 {
        let Some(base) = self.state.unix_base_ms() else {
            return 0;
        };
        let adjusted = i64::try_from(self.adjusted_now_ms()).unwrap_or(i64::MAX);
        clamp_non_negative(adjusted.saturating_add(base))
    }

    /// Absolute time in whole seconds.
    pub fn unix_now_s(&mut self) -> u64 {
        self.unix_now_ms() / 1000
    }

    /// Learn the unix base from a master announcement.
    ///
    /// Half of the last measured delay is added to the announced time to
    /// account for transit. `priority` is carried for master election and
    /// currently has no effect.
    pub fn learn_unix_base(&mut self, unix_ms: u64, priority: u64) {
        let half_delay = self.state.last_delay_ms / 2;
        let announced = i64::try_from(unix_ms.saturating_add(half_delay)).unwrap_or(i64::MAX);
        let now = i64::try_from(self.adjusted_now_ms()).unwrap_or(i64::MAX);
        let base = announced - now;
        self.state.set_unix_base(base);
        debug!(unix_ms, half_delay, priority, base_ms = base, "Learned unix base");
    }

    /// Establish the unix base from an absolute time source.
    pub fn set_unix_base_from_absolute(&mut self, unix_ms: u64) {
        let absolute = i64::try_from(unix_ms).unwrap_or(i64::MAX);
        let now = i64::try_from(self.adjusted_now_ms()).unwrap_or(i64::MAX);
        let base = absolute - now;
        self.state.set_unix_base(base);
        debug!(unix_ms, base_ms = base, "Unix base set from absolute time");
    }

    /// Read access to the sync state.
    pub fn state(&self) -> &TimeSyncState {
        &self.state
    }

    /// Write access to the sync state.
    pub fn state_mut(&mut self) -> &mut TimeSyncState {
        &mut self.state
    }

    /// Access the underlying extended clock.
    pub fn extended(&self) -> &ExtendedClock<S> {
        &self.clock
    }
}

fn clamp_non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
