//! Master/client role state machine.
//!
//! | Message  | Master                          | Client                        |
//! |----------|---------------------------------|-------------------------------|
//! | REQUEST  | reply with RESPONSE at t3       | ignored                       |
//! | RESPONSE | ignored                         | estimate, apply, record delay |
//! | ANNOUNCE | ignored                         | learn unix base               |
//!
//! The engine never touches the router. Messages it wants sent are returned
//! as [`Outgoing`] values for the dispatch layer to enqueue. Malformed and
//! role-inapplicable input is dropped without side effects on the clock.

use crate::clock::TickSource;
use crate::estimator::{estimate, Estimate};
use crate::protocol::{
    MessageKind, SyncAnnounce, SyncRequest, SyncResponse, TimeSyncMessage,
};
use crate::state::{NodeClock, OffsetDecision, SyncPolicy};
use crate::stats::SyncStats;
use telem_common::config::Role;
use tracing::{debug, trace};

/// A message the engine wants transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outgoing {
    /// Message to send.
    pub message: TimeSyncMessage,
    /// Timestamp to attach to the packet (sender's clock).
    pub timestamp_ms: u64,
}

/// Per-node time-sync engine.
#[derive(Debug)]
pub struct TimeSyncEngine<S> {
    role: Role,
    clock: NodeClock<S>,
    policy: SyncPolicy,
    next_sequence: u64,
    stats: SyncStats,
}

impl<S: TickSource> TimeSyncEngine<S> {
    /// Create an engine for a fixed role.
    pub fn new(role: Role, source: S, policy: SyncPolicy) -> Self {
        Self {
            role,
            clock: NodeClock::new(source),
            policy,
            next_sequence: 1,
            stats: SyncStats::new(),
        }
    }

    /// Role of this node.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Offset application policy.
    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Synchronization statistics.
    pub fn stats(&self) -> &SyncStats {
        &self.stats
    }

    /// The node clock.
    pub fn clock(&self) -> &NodeClock<S> {
        &self.clock
    }

    /// Mutable access to the node clock.
    pub fn clock_mut(&mut self) -> &mut NodeClock<S> {
        &mut self.clock
    }

    /// Sequence number the next request will carry.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Handle an inbound time-sync payload.
    ///
    /// Returns a reply when the node must answer (master receiving a request).
    pub fn handle(&mut self, kind: MessageKind, payload: &[u8]) -> Option<Outgoing> {
        if !self.accepts(kind) {
            self.stats.ignored += 1;
            trace!(role = %self.role, %kind, "Ignoring time-sync message for other role");
            return None;
        }

        let message = match TimeSyncMessage::decode(kind, payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed += 1;
                debug!(error = %e, "Dropping malformed time-sync message");
                return None;
            }
        };

        match message {
            TimeSyncMessage::Request(request) => Some(self.answer(request)),
            TimeSyncMessage::Response(response) => {
                self.learn_offset(response);
                None
            }
            TimeSyncMessage::Announce(announce) => {
                self.clock.learn_unix_base(announce.unix_ms, announce.priority);
                self.stats.announces_learned += 1;
                None
            }
        }
    }

    /// Build a REQUEST (client only).
    ///
    /// The sequence counter wraps at `u64::MAX`.
    pub fn request_sync(&mut self) -> Option<Outgoing> {
        if self.role != Role::Client {
            return None;
        }

        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let t1 = self.client_now_ms();

        trace!(sequence, t1, "Time-sync request");
        Some(Outgoing {
            message: TimeSyncMessage::Request(SyncRequest { sequence, t1 }),
            timestamp_ms: t1,
        })
    }

    /// Build an ANNOUNCE (master only).
    pub fn announce(&mut self, priority: u64, unix_ms: u64) -> Option<Outgoing> {
        if self.role != Role::Master {
            return None;
        }

        let timestamp_ms = self.clock.raw_now_ms();
        Some(Outgoing {
            message: TimeSyncMessage::Announce(SyncAnnounce { priority, unix_ms }),
            timestamp_ms,
        })
    }

    /// Feed absolute time from an external source (master only).
    ///
    /// Returns whether the unix base was updated.
    pub fn set_absolute_time(&mut self, unix_ms: u64) -> bool {
        if self.role != Role::Master {
            debug!(unix_ms, "Ignoring absolute time on client");
            return false;
        }
        self.clock.set_unix_base_from_absolute(unix_ms);
        true
    }

    /// Hook run when the dispatch link comes up.
    pub fn on_link_created(&mut self) {
        if self.role == Role::Master {
            self.clock.state_mut().reset_offset();
        }
    }

    fn accepts(&self, kind: MessageKind) -> bool {
        matches!(
            (self.role, kind),
            (Role::Master, MessageKind::Request)
                | (Role::Client, MessageKind::Response | MessageKind::Announce)
        )
    }

    fn answer(&mut self, request: SyncRequest) -> Outgoing {
        let t2 = self.clock.raw_now_ms();
        let t3 = self.clock.raw_now_ms();
        self.stats.requests_answered += 1;

        trace!(sequence = request.sequence, t1 = request.t1, t2, t3, "Answering time-sync request");
        Outgoing {
            message: TimeSyncMessage::Response(SyncResponse {
                sequence: request.sequence,
                t1: request.t1,
                t2,
                t3,
            }),
            timestamp_ms: t3,
        }
    }

    fn learn_offset(&mut self, response: SyncResponse) {
        let t4 = self.client_now_ms();
        let Estimate {
            offset_ms,
            delay_ms,
        } = estimate(response.t1, response.t2, response.t3, t4);

        let decision = self.clock.state_mut().apply_offset(offset_ms, &self.policy);
        match decision {
            OffsetDecision::Applied { .. } => self.stats.offsets_applied += 1,
            OffsetDecision::Rejected { .. } => self.stats.offsets_rejected += 1,
        }
        self.clock.state_mut().record_delay(delay_ms);
        self.stats.record_exchange(response.sequence, offset_ms, delay_ms);

        debug!(
            sequence = response.sequence,
            offset_ms,
            delay_ms,
            applied_offset_ms = self.clock.state().offset_ms(),
            "Processed time-sync response"
        );
    }

    // Client exchange timestamps use corrected time so each exchange measures
    // the remaining error rather than the raw clock difference.
    fn client_now_ms(&mut self) -> u64 {
        self.clock.adjusted_now_ms()
    }
}
