//! Packet router abstraction.
//!
//! The router owns two queues (transmit and receive), a set of local
//! endpoints, and a set of serialized sides that carry framed packets over
//! a byte stream. The dispatch facade is the only caller.

use serde::Serialize;
use std::fmt;
use telem_common::error::TelemetryResult;
use telem_timesync::MessageKind;

/// Packet data type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DataType(pub u16);

impl DataType {
    /// Generic sensor or status data.
    pub const MESSAGE_DATA: Self = Self(1);
    /// Formatted error text.
    pub const GENERIC_ERROR: Self = Self(2);
    /// Time-sync REQUEST.
    pub const TIME_SYNC_REQUEST: Self = Self(10);
    /// Time-sync RESPONSE.
    pub const TIME_SYNC_RESPONSE: Self = Self(11);
    /// Time-sync ANNOUNCE.
    pub const TIME_SYNC_ANNOUNCE: Self = Self(12);

    /// Time-sync message kind carried by this type, if any.
    #[must_use]
    pub fn time_sync_kind(self) -> Option<MessageKind> {
        match self {
            Self::TIME_SYNC_REQUEST => Some(MessageKind::Request),
            Self::TIME_SYNC_RESPONSE => Some(MessageKind::Response),
            Self::TIME_SYNC_ANNOUNCE => Some(MessageKind::Announce),
            _ => None,
        }
    }

    /// Data type used to carry a time-sync message kind.
    #[must_use]
    pub fn for_time_sync(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Request => Self::TIME_SYNC_REQUEST,
            MessageKind::Response => Self::TIME_SYNC_RESPONSE,
            MessageKind::Announce => Self::TIME_SYNC_ANNOUNCE,
        }
    }

    /// Local endpoint that consumes packets of this type.
    #[must_use]
    pub fn endpoint(self) -> Endpoint {
        if self.time_sync_kind().is_some() {
            Endpoint::TimeSync
        } else {
            Endpoint::SdCard
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MESSAGE_DATA => f.write_str("MESSAGE_DATA"),
            Self::GENERIC_ERROR => f.write_str("GENERIC_ERROR"),
            Self::TIME_SYNC_REQUEST => f.write_str("TIME_SYNC_REQUEST"),
            Self::TIME_SYNC_RESPONSE => f.write_str("TIME_SYNC_RESPONSE"),
            Self::TIME_SYNC_ANNOUNCE => f.write_str("TIME_SYNC_ANNOUNCE"),
            Self(other) => write!(f, "TYPE_{other}"),
        }
    }
}

/// Local endpoints a node can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Endpoint {
    /// Time-sync protocol handler.
    TimeSync,
    /// Local storage sink (SD card).
    SdCard,
}

impl Endpoint {
    /// Whether a node's own packets are also delivered to this endpoint.
    #[must_use]
    pub fn is_sink(self) -> bool {
        matches!(self, Self::SdCard)
    }
}

/// Element interpretation of a typed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ElemKind {
    /// IEEE-754 floats.
    Float,
    /// Unsigned integers.
    Unsigned,
}

impl ElemKind {
    /// Infer the element kind from its size.
    ///
    /// 4- and 8-byte elements are treated as floats, anything else as
    /// unsigned. Use an explicit kind when logging 4- or 8-byte integers.
    #[must_use]
    pub fn infer(elem_size: usize) -> Self {
        match elem_size {
            4 | 8 => Self::Float,
            _ => Self::Unsigned,
        }
    }

    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Self::Float => 1,
            Self::Unsigned => 0,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Self {
        if byte == 1 {
            Self::Float
        } else {
            Self::Unsigned
        }
    }
}

/// How an enqueued packet is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    /// Transmit before returning.
    Immediate,
    /// Append to the transmit queue for a later drain.
    #[default]
    Queued,
}

impl Delivery {
    /// Map the C-style `synchronous` flag.
    #[must_use]
    pub fn from_synchronous(synchronous: bool) -> Self {
        if synchronous {
            Self::Immediate
        } else {
            Self::Queued
        }
    }
}

/// Handle to a serialized side registered with a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SideId(pub usize);

/// A typed record handed to the router.
#[derive(Debug, Clone, Copy)]
pub struct TypedRecord<'a> {
    /// Data type.
    pub ty: DataType,
    /// Packet timestamp (router elapsed milliseconds).
    pub timestamp_ms: u64,
    /// Raw element bytes, `count * elem_size` long.
    pub data: &'a [u8],
    /// Number of elements.
    pub count: usize,
    /// Size of one element in bytes.
    pub elem_size: usize,
    /// Element interpretation.
    pub kind: ElemKind,
}

/// A packet as delivered to a local endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Data type.
    pub ty: DataType,
    /// Sender timestamp.
    pub timestamp_ms: u64,
    /// Element interpretation.
    pub kind: ElemKind,
    /// Element size (1 for raw strings).
    pub elem_size: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// Byte-stream transport behind a serialized side.
pub trait SideLink: Send {
    /// Transmit one encoded frame.
    fn send(&mut self, frame: &[u8]) -> TelemetryResult<()>;
}

/// Packet router interface.
///
/// Timeouts are in milliseconds; a timeout of zero drains the queue fully.
pub trait Router {
    /// Register a local endpoint that receives matching packets.
    fn register_local_endpoint(&mut self, endpoint: Endpoint) -> TelemetryResult<()>;

    /// Attach a serialized byte-stream side.
    fn add_serialized_side(
        &mut self,
        name: &str,
        id: u32,
        link: Box<dyn SideLink>,
    ) -> TelemetryResult<SideId>;

    /// Enqueue (or immediately transmit) a typed record.
    fn enqueue_typed(&mut self, record: TypedRecord<'_>, delivery: Delivery)
        -> TelemetryResult<()>;

    /// Enqueue (or immediately transmit) a raw string record.
    fn enqueue_raw_string(
        &mut self,
        ty: DataType,
        timestamp_ms: u64,
        bytes: &[u8],
        delivery: Delivery,
    ) -> TelemetryResult<()>;

    /// Transmit queued packets until the queue is empty or the timeout elapses.
    fn process_tx_queue(&mut self, timeout_ms: u32) -> TelemetryResult<()>;

    /// Deliver received packets to local endpoints until the queue is empty
    /// or the timeout elapses.
    fn process_rx_queue(
        &mut self,
        timeout_ms: u32,
        handler: &mut dyn FnMut(Endpoint, &Packet),
    ) -> TelemetryResult<()>;

    /// Queue bytes received on a side for later processing.
    fn rx_bytes_from_side(&mut self, side: SideId, bytes: &[u8]) -> TelemetryResult<()>;

    /// Decode and deliver bytes received on a side before returning.
    fn receive_from_side(
        &mut self,
        side: SideId,
        bytes: &[u8],
        handler: &mut dyn FnMut(Endpoint, &Packet),
    ) -> TelemetryResult<()>;
}

/// Creates routers on demand.
///
/// Called by the facade each time link bring-up is attempted.
pub trait RouterFactory {
    /// Router type produced.
    type Router: Router;

    /// Create a fresh router.
    fn create(&mut self) -> TelemetryResult<Self::Router>;
}
