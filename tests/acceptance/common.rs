//! Common helpers for acceptance tests.
//!
//! Provides helpers for:
//! - Building nodes on a shared simulated bus
//! - Encoding time-sync frames as a peer would send them
//! - Observing traffic on the bus

#![allow(dead_code)]

use telem_common::config::{NodeConfig, Role};
use telem_dispatch::{
    decode_frame, encode_frame, BusDriver, DataType, Dispatcher, ElemKind, Packet,
    QueueRouterFactory, RxInbox, SimBus, SimBusPort,
};
use telem_timesync::{SimulatedTicks, TickSource, TimeSyncMessage};

pub type SimDispatcher = Dispatcher<QueueRouterFactory, SimBusPort, SimulatedTicks>;

/// A node plus a handle on its tick counter.
pub struct Node {
    pub dispatcher: SimDispatcher,
    pub ticks: SimulatedTicks,
}

pub fn config(role: Role) -> NodeConfig {
    NodeConfig {
        role,
        ..NodeConfig::default()
    }
}

/// Build a node whose clock reads `start_ms` (1 kHz ticks).
pub fn node_with_config(bus: &SimBus, config: &NodeConfig, start_ms: u32) -> Node {
    let ticks = SimulatedTicks::new(1000);
    ticks.set(start_ms);
    let clock = ticks.clone();
    let factory = QueueRouterFactory::with_clock(config.dispatch.queue_capacity, move || {
        u64::from(clock.ticks())
    });
    Node {
        dispatcher: Dispatcher::new(config, factory, bus.port(), ticks.clone()),
        ticks,
    }
}

pub fn node(bus: &SimBus, role: Role, start_ms: u32) -> Node {
    node_with_config(bus, &config(role), start_ms)
}

/// Encode a time-sync message as a full bus frame.
pub fn sync_frame(message: &TimeSyncMessage, timestamp_ms: u64) -> Vec<u8> {
    let ty = DataType::for_time_sync(message.kind());
    encode_frame(ty, ElemKind::Unsigned, 8, timestamp_ms, &message.encode())
        .expect("time-sync payload fits in a frame")
}

/// A bare bus port that records everything other nodes send.
pub struct Observer {
    inbox: RxInbox,
    _port: SimBusPort,
}

impl Observer {
    pub fn attach(bus: &SimBus) -> Self {
        let inbox = RxInbox::default();
        let mut port = bus.port();
        port.subscribe_rx(inbox.clone())
            .expect("simulated bus accepts subscriptions");
        Self { inbox, _port: port }
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.inbox
            .drain()
            .iter()
            .map(|frame| decode_frame(frame).expect("nodes send well-formed frames"))
            .collect()
    }
}

/// Split a time-sync payload into its little-endian words.
pub fn words(payload: &[u8]) -> Vec<u64> {
    payload
        .chunks_exact(8)
        .map(|chunk| u64::from_le_bytes(chunk.try_into().expect("8-byte chunk")))
        .collect()
}
