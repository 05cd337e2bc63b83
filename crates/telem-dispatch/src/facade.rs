//! Dispatch facade: the node's single telemetry integration point.
//!
//! The [`Dispatcher`] owns the router link, the time-sync engine, and the
//! bus receive inbox. Every entry point brings the link up on first use;
//! a failed bring-up leaves the link absent so the next call retries.
//!
//! With telemetry disabled every entry point succeeds without touching the
//! router or the bus.

use crate::bus::{BusDriver, BusSide, RxInbox};
use crate::router::{
    DataType, Delivery, ElemKind, Endpoint, Packet, Router, RouterFactory, SideId, TypedRecord,
};
use std::fmt::{self, Write as _};
use telem_common::config::{DispatchConfig, NodeConfig, Role};
use telem_common::error::{TelemetryError, TelemetryResult};
use telem_common::state::{LinkState, LinkStateMachine};
use telem_timesync::{Outgoing, SyncPolicy, SyncStats, TickSource, TimeSyncEngine};
use tracing::{debug, info, trace, warn};

/// Word size of time-sync payload fields.
const SYNC_WORD_LEN: usize = 8;

struct Link<R> {
    router: R,
    side: SideId,
    start_time_ms: u64,
}

/// Telemetry dispatch facade.
pub struct Dispatcher<F: RouterFactory, B, S> {
    enabled: bool,
    config: DispatchConfig,
    factory: F,
    bus: B,
    engine: TimeSyncEngine<S>,
    lifecycle: LinkStateMachine,
    link: Option<Link<F::Router>>,
    inbox: RxInbox,
    rx_subscribed: bool,
    sink_records: u64,
    inbox_overflows: u64,
}

impl<F, B, S> Dispatcher<F, B, S>
where
    F: RouterFactory,
    B: BusDriver + Clone + 'static,
    S: TickSource,
{
    /// Create a facade. No router is created until first use.
    pub fn new(config: &NodeConfig, factory: F, bus: B, ticks: S) -> Self {
        Self {
            enabled: config.telemetry_enabled,
            config: config.dispatch.clone(),
            factory,
            bus,
            engine: TimeSyncEngine::new(
                config.role,
                ticks,
                SyncPolicy::from_config(&config.timesync),
            ),
            lifecycle: LinkStateMachine::new(),
            link: None,
            inbox: RxInbox::new(config.dispatch.queue_capacity),
            rx_subscribed: false,
            sink_records: 0,
            inbox_overflows: 0,
        }
    }

    /// Whether telemetry is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Time-sync role of this node.
    pub fn role(&self) -> Role {
        self.engine.role()
    }

    /// Dispatch configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Current link lifecycle state.
    pub fn link_state(&self) -> LinkState {
        self.lifecycle.state()
    }

    /// Link lifecycle history.
    pub fn lifecycle(&self) -> &LinkStateMachine {
        &self.lifecycle
    }

    /// The router, once the link is up.
    pub fn router(&self) -> Option<&F::Router> {
        self.link.as_ref().map(|link| &link.router)
    }

    /// The router factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// The time-sync engine.
    pub fn engine(&self) -> &TimeSyncEngine<S> {
        &self.engine
    }

    /// Mutable access to the time-sync engine.
    pub fn engine_mut(&mut self) -> &mut TimeSyncEngine<S> {
        &mut self.engine
    }

    /// Time-sync statistics.
    pub fn sync_stats(&self) -> &SyncStats {
        self.engine.stats()
    }

    /// Records delivered to the local storage sink.
    pub fn sink_records(&self) -> u64 {
        self.sink_records
    }

    /// Datagrams that could not be queued because the router was full.
    pub fn inbox_overflows(&self) -> u64 {
        self.inbox_overflows
    }

    /// Inbox fed by the bus receive callback.
    pub fn inbox(&self) -> &RxInbox {
        &self.inbox
    }

    // ------------------------------------------------------------------
    // Link bring-up
    // ------------------------------------------------------------------

    /// Bring the link up if it is not already.
    ///
    /// Idempotent: a ready link is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::InitializationFailure`] if router creation,
    /// endpoint registration, or side attachment fails. The link stays absent
    /// and a later call retries.
    pub fn ensure_link(&mut self) -> TelemetryResult<()> {
        if !self.enabled || !self.lifecycle.state().can_attempt() {
            return Ok(());
        }

        self.lifecycle.transition(LinkState::Initializing)?;
        self.subscribe_rx();

        match self.build_link() {
            Ok(link) => {
                info!(
                    side = %self.config.bus_side_name,
                    side_id = self.config.bus_side_id,
                    start_time_ms = link.start_time_ms,
                    role = %self.engine.role(),
                    "Telemetry link ready"
                );
                self.link = Some(link);
                self.lifecycle.transition(LinkState::Ready)?;
                self.engine.on_link_created();
                Ok(())
            }
            Err(e) => {
                self.lifecycle.transition(LinkState::Failed)?;
                warn!(
                    error = %e,
                    attempts = self.lifecycle.failed_attempts(),
                    "Telemetry link bring-up failed"
                );
                Err(e)
            }
        }
    }

    fn build_link(&mut self) -> TelemetryResult<Link<F::Router>> {
        let mut router = self.factory.create().map_err(as_init_failure)?;
        for endpoint in [Endpoint::TimeSync, Endpoint::SdCard] {
            router
                .register_local_endpoint(endpoint)
                .map_err(as_init_failure)?;
        }
        let side = router
            .add_serialized_side(
                &self.config.bus_side_name,
                self.config.bus_side_id,
                Box::new(BusSide::new(self.bus.clone())),
            )
            .map_err(as_init_failure)?;

        Ok(Link {
            router,
            side,
            start_time_ms: self.engine.clock_mut().adjusted_now_ms(),
        })
    }

    // Subscription failure is not fatal; it is retried on the next attempt.
    fn subscribe_rx(&mut self) {
        if self.rx_subscribed {
            return;
        }
        match self.bus.subscribe_rx(self.inbox.clone()) {
            Ok(()) => {
                self.rx_subscribed = true;
                debug!("Bus receive callback registered");
            }
            Err(e) => warn!(error = %e, "Bus receive subscription failed"),
        }
    }

    fn ready_link(&mut self) -> TelemetryResult<&mut Link<F::Router>> {
        self.ensure_link()?;
        self.link.as_mut().ok_or_else(link_missing)
    }

    // ------------------------------------------------------------------
    // Logging
    // ------------------------------------------------------------------

    /// Log a typed sample, inferring the element kind from `elem_size`.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::BadArgument`] for empty data, zero count or
    /// element size, or a data length other than `count * elem_size`. Link
    /// and transport errors are propagated.
    pub fn log_sample(
        &mut self,
        ty: DataType,
        data: &[u8],
        count: usize,
        elem_size: usize,
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        self.log_sample_as(ty, data, count, elem_size, ElemKind::infer(elem_size), delivery)
    }

    /// Log a typed sample with an explicit element kind.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::log_sample`].
    pub fn log_sample_as(
        &mut self,
        ty: DataType,
        data: &[u8],
        count: usize,
        elem_size: usize,
        kind: ElemKind,
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        validate_sample(data, count, elem_size)?;

        let timestamp_ms = self.router_elapsed_ms();
        let link = self.ready_link()?;
        link.router.enqueue_typed(
            TypedRecord {
                ty,
                timestamp_ms,
                data,
                count,
                elem_size,
                kind,
            },
            delivery,
        )
    }

    /// Log a formatted error message as a generic-error record.
    ///
    /// The text is capped at the configured length on a character boundary.
    /// A `Display` implementation that fails still produces a record with
    /// whatever text was written.
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn log_error(&mut self, message: impl fmt::Display, delivery: Delivery) -> TelemetryResult<()> {
        self.log_text(DataType::GENERIC_ERROR, message, delivery)
    }

    /// Log a plain text message record, capped like [`Dispatcher::log_error`].
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn log_message(&mut self, message: impl fmt::Display, delivery: Delivery) -> TelemetryResult<()> {
        self.log_text(DataType::MESSAGE_DATA, message, delivery)
    }

    fn log_text(
        &mut self,
        ty: DataType,
        message: impl fmt::Display,
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }

        let mut text = CappedText::new(self.config.error_message_cap);
        if write!(text, "{message}").is_err() && !text.full {
            debug!("Error message formatting failed, sending partial text");
        }

        let timestamp_ms = self.router_elapsed_ms();
        let link = self.ready_link()?;
        link.router
            .enqueue_raw_string(ty, timestamp_ms, text.text.as_bytes(), delivery)
    }

    /// Log a telemetry error with its numeric code.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::log_error`].
    pub fn report_error(&mut self, error: &TelemetryError) -> TelemetryResult<()> {
        self.log_error(format_args!("[{}] {error}", error.code()), Delivery::Queued)
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Transmit queued packets for at most `timeout_ms` (0 drains fully).
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn drain_tx(&mut self, timeout_ms: u32) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.ready_link()?.router.process_tx_queue(timeout_ms)
    }

    /// Process received packets for at most `timeout_ms` (0 drains fully).
    ///
    /// Time-sync replies produced while processing are transmitted before
    /// returning.
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn drain_rx(&mut self, timeout_ms: u32) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.ensure_link()?;
        let link = self.link.as_mut().ok_or_else(link_missing)?;

        let engine = &mut self.engine;
        let sink_records = &mut self.sink_records;
        let mut replies = Vec::new();
        let processed = link.router.process_rx_queue(timeout_ms, &mut |endpoint: Endpoint, packet: &Packet| {
            handle_packet(engine, sink_records, &mut replies, endpoint, packet);
        });

        let sent = send_replies(&mut link.router, &replies);
        processed.and(sent)
    }

    /// Drain both queues within a shared `timeout_ms` budget (0 drains fully).
    ///
    /// Transmit runs first; receive gets whatever budget remains. A transmit
    /// failure does not prevent the receive drain.
    ///
    /// # Errors
    ///
    /// Returns the first error from either drain.
    pub fn drain_all(&mut self, timeout_ms: u32) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if timeout_ms == 0 {
            let tx = self.drain_tx(0);
            let rx = self.drain_rx(0);
            return tx.and(rx);
        }

        let start = self.engine.clock_mut().raw_now_ms();
        let tx = self.drain_tx(timeout_ms);
        let elapsed = self.engine.clock_mut().raw_now_ms().saturating_sub(start);
        let rx = match u64::from(timeout_ms).checked_sub(elapsed) {
            Some(remaining) if remaining > 0 => {
                self.drain_rx(u32::try_from(remaining).unwrap_or(timeout_ms))
            }
            _ => {
                trace!(elapsed, "Drain budget spent on transmit");
                Ok(())
            }
        };
        tx.and(rx)
    }

    /// Transmit every queued packet.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::drain_tx`].
    pub fn drain_tx_all(&mut self) -> TelemetryResult<()> {
        self.drain_tx(0)
    }

    /// Process every received packet.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::drain_rx`].
    pub fn drain_rx_all(&mut self) -> TelemetryResult<()> {
        self.drain_rx(0)
    }

    // ------------------------------------------------------------------
    // Receive ingestion
    // ------------------------------------------------------------------

    /// Queue bytes received from the bus for the next receive drain.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::BadArgument`] for empty input and
    /// [`TelemetryError::QueueFull`] when the receive queue is full.
    pub fn rx_async(&mut self, bytes: &[u8]) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if bytes.is_empty() {
            return Err(TelemetryError::BadArgument("empty receive buffer".into()));
        }
        let link = self.ready_link()?;
        link.router.rx_bytes_from_side(link.side, bytes)
    }

    /// Decode and handle bytes received from the bus before returning.
    ///
    /// # Errors
    ///
    /// Returns [`TelemetryError::BadArgument`] for empty input; decode,
    /// link, and transport errors are propagated.
    pub fn rx_sync(&mut self, bytes: &[u8]) -> TelemetryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if bytes.is_empty() {
            return Err(TelemetryError::BadArgument("empty receive buffer".into()));
        }
        self.ensure_link()?;
        let link = self.link.as_mut().ok_or_else(link_missing)?;

        let engine = &mut self.engine;
        let sink_records = &mut self.sink_records;
        let mut replies = Vec::new();
        let received = link.router.receive_from_side(link.side, bytes, &mut |endpoint: Endpoint, packet: &Packet| {
            handle_packet(engine, sink_records, &mut replies, endpoint, packet);
        });

        let sent = send_replies(&mut link.router, &replies);
        received.and(sent)
    }

    /// Move datagrams from the bus inbox into the router's receive queue.
    ///
    /// Retries the bus subscription if it has not succeeded yet. Returns the
    /// number of datagrams queued; datagrams that do not fit are dropped and
    /// counted.
    ///
    /// # Errors
    ///
    /// Link errors are propagated; pending datagrams stay in the inbox.
    pub fn pump_bus_rx(&mut self) -> TelemetryResult<usize> {
        if !self.enabled {
            return Ok(0);
        }
        self.subscribe_rx();
        self.ensure_link()?;
        let link = self.link.as_mut().ok_or_else(link_missing)?;

        let mut queued = 0;
        let mut overflows = 0;
        for datagram in self.inbox.drain() {
            match link.router.rx_bytes_from_side(link.side, &datagram) {
                Ok(()) => queued += 1,
                Err(e) => {
                    overflows += 1;
                    debug!(error = %e, "Dropping received datagram");
                }
            }
        }
        self.inbox_overflows += overflows;
        Ok(queued)
    }

    // ------------------------------------------------------------------
    // Time sync
    // ------------------------------------------------------------------

    /// Send a time-sync REQUEST (client only).
    ///
    /// Returns whether a request was sent.
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn request_sync(&mut self) -> TelemetryResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        self.ensure_link()?;
        match self.engine.request_sync() {
            Some(out) => {
                let router = &mut self.link.as_mut().ok_or_else(link_missing)?.router;
                send_outgoing(router, &out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Send a time-sync ANNOUNCE (master only).
    ///
    /// Returns whether an announcement was sent.
    ///
    /// # Errors
    ///
    /// Link and transport errors are propagated.
    pub fn announce(&mut self, priority: u64, unix_ms: u64) -> TelemetryResult<bool> {
        if !self.enabled {
            return Ok(false);
        }
        self.ensure_link()?;
        match self.engine.announce(priority, unix_ms) {
            Some(out) => {
                let router = &mut self.link.as_mut().ok_or_else(link_missing)?.router;
                send_outgoing(router, &out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Announce the master's current unix time, if it has one.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::announce`].
    pub fn announce_now(&mut self, priority: u64) -> TelemetryResult<bool> {
        if !self.unix_is_valid() {
            return Ok(false);
        }
        let unix_ms = self.unix_now_ms();
        self.announce(priority, unix_ms)
    }

    /// Feed absolute time from an external source (master only).
    pub fn set_absolute_time(&mut self, unix_ms: u64) -> bool {
        self.engine.set_absolute_time(unix_ms)
    }

    // ------------------------------------------------------------------
    // Time queries
    // ------------------------------------------------------------------

    /// Local extended clock in milliseconds.
    pub fn raw_now_ms(&mut self) -> u64 {
        self.engine.clock_mut().raw_now_ms()
    }

    /// Local clock corrected by the applied offset.
    pub fn adjusted_now_ms(&mut self) -> u64 {
        self.engine.clock_mut().adjusted_now_ms()
    }

    /// Unix time in milliseconds, or 0 before a unix base is known.
    pub fn unix_now_ms(&mut self) -> u64 {
        self.engine.clock_mut().unix_now_ms()
    }

    /// Unix time in seconds, or 0 before a unix base is known.
    pub fn unix_now_s(&mut self) -> u64 {
        self.engine.clock_mut().unix_now_s()
    }

    /// Whether a unix base is known.
    pub fn unix_is_valid(&self) -> bool {
        self.engine.clock().state().unix_is_valid()
    }

    /// Adjusted milliseconds since the link came up, or 0 before that.
    pub fn router_elapsed_ms(&mut self) -> u64 {
        let Some(start) = self.link.as_ref().map(|link| link.start_time_ms) else {
            return 0;
        };
        self.adjusted_now_ms().saturating_sub(start)
    }
}

impl<F: RouterFactory, B, S> fmt::Debug for Dispatcher<F, B, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("enabled", &self.enabled)
            .field("link_state", &self.lifecycle.state())
            .field("rx_subscribed", &self.rx_subscribed)
            .field("sink_records", &self.sink_records)
            .finish_non_exhaustive()
    }
}

fn validate_sample(data: &[u8], count: usize, elem_size: usize) -> TelemetryResult<()> {
    if data.is_empty() {
        return Err(TelemetryError::BadArgument("sample data is empty".into()));
    }
    if count == 0 || elem_size == 0 {
        return Err(TelemetryError::BadArgument(format!(
            "invalid sample shape: count {count}, element size {elem_size}"
        )));
    }
    match count.checked_mul(elem_size) {
        Some(expected) if expected == data.len() => Ok(()),
        _ => Err(TelemetryError::BadArgument(format!(
            "sample data is {} bytes, expected {count} x {elem_size}",
            data.len()
        ))),
    }
}

/// Formatting sink holding at most `cap` bytes, cut on a character
/// boundary. Once full it fails the write so formatting stops early.
struct CappedText {
    text: String,
    cap: usize,
    full: bool,
}

impl CappedText {
    fn new(cap: usize) -> Self {
        Self {
            text: String::new(),
            cap,
            full: false,
        }
    }
}

impl fmt::Write for CappedText {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.cap.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return Ok(());
        }

        let mut end = room;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        self.text.push_str(&s[..end]);
        self.full = true;
        Err(fmt::Error)
    }
}

fn handle_packet<S: TickSource>(
    engine: &mut TimeSyncEngine<S>,
    sink_records: &mut u64,
    replies: &mut Vec<Outgoing>,
    endpoint: Endpoint,
    packet: &Packet,
) {
    match endpoint {
        Endpoint::TimeSync => {
            if let Some(kind) = packet.ty.time_sync_kind() {
                if let Some(reply) = engine.handle(kind, &packet.payload) {
                    replies.push(reply);
                }
            }
        }
        Endpoint::SdCard => {
            *sink_records += 1;
            trace!(ty = %packet.ty, bytes = packet.payload.len(), "Record stored");
        }
    }
}

fn send_outgoing<R: Router>(router: &mut R, out: &Outgoing) -> TelemetryResult<()> {
    let payload = out.message.encode();
    router.enqueue_typed(
        TypedRecord {
            ty: DataType::for_time_sync(out.message.kind()),
            timestamp_ms: out.timestamp_ms,
            data: &payload,
            count: payload.len() / SYNC_WORD_LEN,
            elem_size: SYNC_WORD_LEN,
            kind: ElemKind::Unsigned,
        },
        Delivery::Immediate,
    )
}

fn send_replies<R: Router>(router: &mut R, replies: &[Outgoing]) -> TelemetryResult<()> {
    let mut result = Ok(());
    for reply in replies {
        if let Err(e) = send_outgoing(router, reply) {
            warn!(error = %e, "Failed to send time-sync reply");
            result = result.and(Err(e));
        }
    }
    result
}

fn as_init_failure(error: TelemetryError) -> TelemetryError {
    match error {
        TelemetryError::InitializationFailure(_) => error,
        other => TelemetryError::InitializationFailure(other.to_string()),
    }
}

fn link_missing() -> TelemetryError {
    TelemetryError::InitializationFailure("telemetry link not ready".into())
}
