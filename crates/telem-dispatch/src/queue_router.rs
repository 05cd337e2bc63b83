//! In-memory queue router.
//!
//! Packets are framed as:
//!
//! ```text
//! [type u16][kind u8][elem_size u8][timestamp u64][len u16][payload; len]
//! ```
//!
//! with all integers little-endian. Both queues are bounded; an enqueue on
//! a full queue fails with [`TelemetryError::QueueFull`].

use crate::router::{
    DataType, Delivery, ElemKind, Endpoint, Packet, Router, RouterFactory, SideId, SideLink,
    TypedRecord,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use telem_common::error::{TelemetryError, TelemetryResult};
use tracing::{debug, trace, warn};

/// Frame header length in bytes.
pub const FRAME_HEADER_LEN: usize = 14;

/// Millisecond clock used to bound queue processing.
pub type RouterClock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Encode a packet into a frame.
///
/// # Errors
///
/// Returns [`TelemetryError::BadArgument`] if the payload exceeds `u16::MAX`
/// bytes or the element size exceeds `u8::MAX`.
pub fn encode_frame(
    ty: DataType,
    kind: ElemKind,
    elem_size: usize,
    timestamp_ms: u64,
    payload: &[u8],
) -> TelemetryResult<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        TelemetryError::BadArgument(format!("payload of {} bytes too large", payload.len()))
    })?;
    let elem_size = u8::try_from(elem_size)
        .map_err(|_| TelemetryError::BadArgument(format!("element size {elem_size} too large")))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&ty.0.to_le_bytes());
    frame.push(kind.to_wire());
    frame.push(elem_size);
    frame.extend_from_slice(&timestamp_ms.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Decode a frame into a packet.
///
/// # Errors
///
/// Returns [`TelemetryError::MalformedMessage`] if the frame is shorter than
/// its header or declared payload length.
pub fn decode_frame(frame: &[u8]) -> TelemetryResult<Packet> {
    let malformed = |expected| TelemetryError::MalformedMessage {
        kind: "frame",
        expected,
        actual: frame.len(),
    };

    if frame.len() < FRAME_HEADER_LEN {
        return Err(malformed(FRAME_HEADER_LEN));
    }

    let ty = DataType(u16::from_le_bytes([frame[0], frame[1]]));
    let kind = ElemKind::from_wire(frame[2]);
    let elem_size = frame[3];
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&frame[4..12]);
    let len = usize::from(u16::from_le_bytes([frame[12], frame[13]]));

    let end = FRAME_HEADER_LEN + len;
    if frame.len() < end {
        return Err(malformed(end));
    }

    Ok(Packet {
        ty,
        timestamp_ms: u64::from_le_bytes(ts),
        kind,
        elem_size,
        payload: frame[FRAME_HEADER_LEN..end].to_vec(),
    })
}

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    /// Frames handed to a side.
    pub frames_sent: u64,
    /// Side sends that failed.
    pub send_failures: u64,
    /// Frames received from a side.
    pub frames_received: u64,
    /// Received frames that failed to decode.
    pub decode_failures: u64,
    /// Packets delivered to a local endpoint.
    pub local_deliveries: u64,
    /// Packets with no registered endpoint.
    pub unrouted: u64,
}

struct Side {
    name: String,
    id: u32,
    link: Box<dyn SideLink>,
}

enum RxItem {
    Frame(Vec<u8>),
    Local(Packet),
}

/// Bounded in-memory router.
pub struct QueueRouter {
    capacity: usize,
    clock: RouterClock,
    endpoints: Vec<Endpoint>,
    sides: Vec<Side>,
    tx: VecDeque<Vec<u8>>,
    rx: VecDeque<RxItem>,
    stats: RouterStats,
}

impl std::fmt::Debug for QueueRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRouter")
            .field("capacity", &self.capacity)
            .field("endpoints", &self.endpoints)
            .field("sides", &self.side_names())
            .field("tx_len", &self.tx.len())
            .field("rx_len", &self.rx.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl QueueRouter {
    /// Create a router with `capacity` slots per queue.
    pub fn new(capacity: usize, clock: RouterClock) -> Self {
        Self {
            capacity: capacity.max(1),
            clock,
            endpoints: Vec::new(),
            sides: Vec::new(),
            tx: VecDeque::new(),
            rx: VecDeque::new(),
            stats: RouterStats::default(),
        }
    }

    /// Router counters.
    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Packets waiting to be transmitted.
    pub fn tx_pending(&self) -> usize {
        self.tx.len()
    }

    /// Packets waiting to be delivered locally.
    pub fn rx_pending(&self) -> usize {
        self.rx.len()
    }

    /// Registered local endpoints.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Names and ids of attached sides.
    pub fn side_names(&self) -> Vec<(String, u32)> {
        self.sides.iter().map(|s| (s.name.clone(), s.id)).collect()
    }

    fn enqueue_frame(
        &mut self,
        ty: DataType,
        kind: ElemKind,
        elem_size: usize,
        timestamp_ms: u64,
        payload: &[u8],
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        let frame = encode_frame(ty, kind, elem_size, timestamp_ms, payload)?;
        let elem_size = frame[3];

        match delivery {
            Delivery::Immediate => self.transmit(&frame)?,
            Delivery::Queued => {
                if self.tx.len() >= self.capacity {
                    return Err(TelemetryError::QueueFull {
                        capacity: self.capacity,
                    });
                }
                self.tx.push_back(frame);
            }
        }

        // Local copy only once the record has been accepted
        let endpoint = ty.endpoint();
        if endpoint.is_sink() && self.endpoints.contains(&endpoint) {
            if self.rx.len() < self.capacity {
                self.rx.push_back(RxItem::Local(Packet {
                    ty,
                    timestamp_ms,
                    kind,
                    elem_size,
                    payload: payload.to_vec(),
                }));
            } else {
                debug!(%ty, "Receive queue full, local copy dropped");
            }
        }
        Ok(())
    }

    fn transmit(&mut self, frame: &[u8]) -> TelemetryResult<()> {
        let mut first_error = None;
        for side in &mut self.sides {
            match side.link.send(frame) {
                Ok(()) => self.stats.frames_sent += 1,
                Err(e) => {
                    self.stats.send_failures += 1;
                    warn!(side = %side.name, error = %e, "Side send failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn deliver(&mut self, packet: &Packet, handler: &mut dyn FnMut(Endpoint, &Packet)) {
        let endpoint = packet.ty.endpoint();
        if self.endpoints.contains(&endpoint) {
            self.stats.local_deliveries += 1;
            handler(endpoint, packet);
        } else {
            self.stats.unrouted += 1;
            trace!(ty = %packet.ty, "No local endpoint for packet");
        }
    }

    fn check_side(&self, side: SideId, bytes: &[u8]) -> TelemetryResult<()> {
        if side.0 >= self.sides.len() {
            return Err(TelemetryError::BadArgument(format!("unknown side {}", side.0)));
        }
        if bytes.is_empty() {
            return Err(TelemetryError::BadArgument("empty receive buffer".into()));
        }
        Ok(())
    }

    fn expired(&self, start_ms: u64, timeout_ms: u32) -> bool {
        timeout_ms != 0 && (self.clock)().saturating_sub(start_ms) >= u64::from(timeout_ms)
    }
}

impl Router for QueueRouter {
    fn register_local_endpoint(&mut self, endpoint: Endpoint) -> TelemetryResult<()> {
        if !self.endpoints.contains(&endpoint) {
            self.endpoints.push(endpoint);
        }
        Ok(())
    }

    fn add_serialized_side(
        &mut self,
        name: &str,
        id: u32,
        link: Box<dyn SideLink>,
    ) -> TelemetryResult<SideId> {
        if name.is_empty() {
            return Err(TelemetryError::InitializationFailure(
                "side name must not be empty".into(),
            ));
        }
        self.sides.push(Side {
            name: name.to_string(),
            id,
            link,
        });
        Ok(SideId(self.sides.len() - 1))
    }

    fn enqueue_typed(
        &mut self,
        record: TypedRecord<'_>,
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        self.enqueue_frame(
            record.ty,
            record.kind,
            record.elem_size,
            record.timestamp_ms,
            record.data,
            delivery,
        )
    }

    fn enqueue_raw_string(
        &mut self,
        ty: DataType,
        timestamp_ms: u64,
        bytes: &[u8],
        delivery: Delivery,
    ) -> TelemetryResult<()> {
        self.enqueue_frame(ty, ElemKind::Unsigned, 1, timestamp_ms, bytes, delivery)
    }

    fn process_tx_queue(&mut self, timeout_ms: u32) -> TelemetryResult<()> {
        let start = (self.clock)();
        while let Some(frame) = self.tx.pop_front() {
            // A failed frame goes back to the head and is retried on every side
            if let Err(e) = self.transmit(&frame) {
                self.tx.push_front(frame);
                return Err(e);
            }
            if self.expired(start, timeout_ms) {
                break;
            }
        }
        Ok(())
    }

    fn process_rx_queue(
        &mut self,
        timeout_ms: u32,
        handler: &mut dyn FnMut(Endpoint, &Packet),
    ) -> TelemetryResult<()> {
        let start = (self.clock)();
        while let Some(item) = self.rx.pop_front() {
            match item {
                RxItem::Frame(bytes) => match decode_frame(&bytes) {
                    Ok(packet) => self.deliver(&packet, handler),
                    Err(e) => {
                        self.stats.decode_failures += 1;
                        debug!(error = %e, "Dropping undecodable frame");
                    }
                },
                RxItem::Local(packet) => self.deliver(&packet, handler),
            }
            if self.expired(start, timeout_ms) {
                break;
            }
        }
        Ok(())
    }

    fn rx_bytes_from_side(&mut self, side: SideId, bytes: &[u8]) -> TelemetryResult<()> {
        self.check_side(side, bytes)?;
        if self.rx.len() >= self.capacity {
            return Err(TelemetryError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.stats.frames_received += 1;
        self.rx.push_back(RxItem::Frame(bytes.to_vec()));
        Ok(())
    }

    fn receive_from_side(
        &mut self,
        side: SideId,
        bytes: &[u8],
        handler: &mut dyn FnMut(Endpoint, &Packet),
    ) -> TelemetryResult<()> {
        self.check_side(side, bytes)?;
        self.stats.frames_received += 1;
        let packet = decode_frame(bytes).inspect_err(|_| self.stats.decode_failures += 1)?;
        self.deliver(&packet, handler);
        Ok(())
    }
}

/// Factory producing [`QueueRouter`]s.
#[derive(Clone)]
pub struct QueueRouterFactory {
    capacity: usize,
    clock: RouterClock,
}

impl std::fmt::Debug for QueueRouterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueRouterFactory")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl QueueRouterFactory {
    /// Factory using a custom millisecond clock.
    pub fn with_clock(capacity: usize, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            capacity,
            clock: Arc::new(clock),
        }
    }

    /// Factory using the monotonic system clock.
    pub fn with_system_clock(capacity: usize) -> Self {
        let origin = Instant::now();
        Self::with_clock(capacity, move || {
            u64::try_from(origin.elapsed().as_millis()).unwrap_or(u64::MAX)
        })
    }
}

impl RouterFactory for QueueRouterFactory {
    type Router = QueueRouter;

    fn create(&mut self) -> TelemetryResult<QueueRouter> {
        Ok(QueueRouter::new(self.capacity, Arc::clone(&self.clock)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Mutex;

    // ========================================================================
    // Test Helpers
    // ========================================================================

    #[derive(Clone, Default)]
    struct RecordingLink {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: Arc<AtomicBool>,
    }

    impl SideLink for RecordingLink {
        fn send(&mut self, frame: &[u8]) -> TelemetryResult<()> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(TelemetryError::IoFailure("link down".into()));
            }
            self.frames.lock().unwrap().push(frame.to_vec());
            Ok(())
        }
    }

    fn frozen_clock() -> RouterClock {
        Arc::new(|| 0)
    }

    /// Clock that advances one millisecond per read.
    fn ticking_clock() -> RouterClock {
        let now = Arc::new(AtomicU64::new(0));
        Arc::new(move || now.fetch_add(1, Ordering::Relaxed))
    }

    fn router_with_link(capacity: usize, clock: RouterClock) -> (QueueRouter, RecordingLink) {
        let mut router = QueueRouter::new(capacity, clock);
        let link = RecordingLink::default();
        router
            .add_serialized_side("can", 3, Box::new(link.clone()))
            .unwrap();
        (router, link)
    }

    fn record(data: &[u8]) -> TypedRecord<'_> {
        TypedRecord {
            ty: DataType::MESSAGE_DATA,
            timestamp_ms: 42,
            data,
            count: data.len(),
            elem_size: 1,
            kind: ElemKind::Unsigned,
        }
    }

    // ========================================================================
    // Frames
    // ========================================================================

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(DataType(0x0102), ElemKind::Float, 4, 7, &[1, 2, 3, 4]).unwrap();
        assert_eq!(frame.len(), FRAME_HEADER_LEN + 4);
        assert_eq!(&frame[0..2], &[0x02, 0x01]);
        assert_eq!(frame[2], 1);
        assert_eq!(frame[3], 4);
        assert_eq!(&frame[12..14], &[4, 0]);

        let packet = decode_frame(&frame).unwrap();
        assert_eq!(packet.ty, DataType(0x0102));
        assert_eq!(packet.kind, ElemKind::Float);
        assert_eq!(packet.timestamp_ms, 7);
        assert_eq!(packet.payload, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(DataType::MESSAGE_DATA, ElemKind::Unsigned, 1, 0, &[1, 2, 3]).unwrap();
        assert!(decode_frame(&frame[..5]).is_err());
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(TelemetryError::MalformedMessage { kind: "frame", .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let big = vec![0u8; usize::from(u16::MAX) + 1];
        assert!(matches!(
            encode_frame(DataType::MESSAGE_DATA, ElemKind::Unsigned, 1, 0, &big),
            Err(TelemetryError::BadArgument(_))
        ));
    }

    // ========================================================================
    // Queues
    // ========================================================================

    #[test]
    fn test_queued_then_drained() {
        let (mut router, link) = router_with_link(8, frozen_clock());
        router.enqueue_typed(record(&[1, 2]), Delivery::Queued).unwrap();
        router.enqueue_typed(record(&[3]), Delivery::Queued).unwrap();
        assert_eq!(router.tx_pending(), 2);
        assert!(link.frames.lock().unwrap().is_empty());

        router.process_tx_queue(0).unwrap();
        assert_eq!(router.tx_pending(), 0);
        assert_eq!(link.frames.lock().unwrap().len(), 2);
        assert_eq!(router.stats().frames_sent, 2);
    }

    #[test]
    fn test_immediate_bypasses_queue() {
        let (mut router, link) = router_with_link(8, frozen_clock());
        router
            .enqueue_raw_string(DataType::GENERIC_ERROR, 1, b"boom", Delivery::Immediate)
            .unwrap();
        assert_eq!(router.tx_pending(), 0);

        let frames = link.frames.lock().unwrap();
        let packet = decode_frame(&frames[0]).unwrap();
        assert_eq!(packet.ty, DataType::GENERIC_ERROR);
        assert_eq!(packet.payload, b"boom");
    }

    #[test]
    fn test_full_queue_rejects() {
        let (mut router, _link) = router_with_link(2, frozen_clock());
        router.enqueue_typed(record(&[1]), Delivery::Queued).unwrap();
        router.enqueue_typed(record(&[2]), Delivery::Queued).unwrap();
        assert_eq!(
            router.enqueue_typed(record(&[3]), Delivery::Queued),
            Err(TelemetryError::QueueFull { capacity: 2 })
        );
    }

    #[test]
    fn test_drain_respects_timeout() {
        let (mut router, link) = router_with_link(64, ticking_clock());
        for i in 0..20u8 {
            router.enqueue_typed(record(&[i]), Delivery::Queued).unwrap();
        }

        router.process_tx_queue(5).unwrap();
        let sent = link.frames.lock().unwrap().len();
        assert!(sent >= 1 && sent < 20, "sent {sent}");
        assert_eq!(router.tx_pending(), 20 - sent);

        router.process_tx_queue(0).unwrap();
        assert_eq!(router.tx_pending(), 0);
    }

    #[test]
    fn test_send_failure_surfaces_io() {
        let mut router = QueueRouter::new(4, frozen_clock());
        router
            .add_serialized_side(
                "can",
                3,
                Box::new(RecordingLink {
                    fail: Arc::new(AtomicBool::new(true)),
                    ..RecordingLink::default()
                }),
            )
            .unwrap();
        assert!(matches!(
            router.enqueue_typed(record(&[1]), Delivery::Immediate),
            Err(TelemetryError::IoFailure(_))
        ));
        assert_eq!(router.stats().send_failures, 1);
    }

    #[test]
    fn test_failed_frame_kept_for_retry() {
        let (mut router, link) = router_with_link(4, frozen_clock());
        router.enqueue_typed(record(&[1]), Delivery::Queued).unwrap();
        router.enqueue_typed(record(&[2]), Delivery::Queued).unwrap();

        link.fail.store(true, Ordering::Relaxed);
        assert!(matches!(
            router.process_tx_queue(0),
            Err(TelemetryError::IoFailure(_))
        ));
        assert_eq!(router.tx_pending(), 2);

        link.fail.store(false, Ordering::Relaxed);
        router.process_tx_queue(0).unwrap();
        let frames = link.frames.lock().unwrap();
        let payloads: Vec<Vec<u8>> = frames
            .iter()
            .map(|f| decode_frame(f).unwrap().payload)
            .collect();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
    }

    #[test]
    fn test_rejected_record_not_stored_locally() {
        let (mut router, _link) = router_with_link(2, frozen_clock());
        router.register_local_endpoint(Endpoint::SdCard).unwrap();
        router.enqueue_typed(record(&[1]), Delivery::Queued).unwrap();
        router.enqueue_typed(record(&[2]), Delivery::Queued).unwrap();
        router.process_rx_queue(0, &mut |_: Endpoint, _: &Packet| {}).unwrap();

        assert!(router.enqueue_typed(record(&[3]), Delivery::Queued).is_err());
        assert_eq!(router.rx_pending(), 0);
    }

    #[test]
    fn test_failed_immediate_not_stored_locally() {
        let (mut router, link) = router_with_link(4, frozen_clock());
        router.register_local_endpoint(Endpoint::SdCard).unwrap();
        link.fail.store(true, Ordering::Relaxed);

        assert!(router.enqueue_typed(record(&[1]), Delivery::Immediate).is_err());
        assert_eq!(router.rx_pending(), 0);
    }

    // ========================================================================
    // Receive path
    // ========================================================================

    #[test]
    fn test_rx_delivers_to_registered_endpoint() {
        let (mut router, _link) = router_with_link(8, frozen_clock());
        router.register_local_endpoint(Endpoint::TimeSync).unwrap();

        let sync = encode_frame(DataType::TIME_SYNC_REQUEST, ElemKind::Unsigned, 8, 0, &[0; 16]).unwrap();
        let data = encode_frame(DataType::MESSAGE_DATA, ElemKind::Unsigned, 1, 0, &[1]).unwrap();
        router.rx_bytes_from_side(SideId(0), &sync).unwrap();
        router.rx_bytes_from_side(SideId(0), &data).unwrap();
        router.rx_bytes_from_side(SideId(0), &[0xFF, 0x00]).unwrap();

        let mut seen = Vec::new();
        router
            .process_rx_queue(0, &mut |endpoint: Endpoint, packet: &Packet| seen.push((endpoint, packet.ty)))
            .unwrap();

        assert_eq!(seen, vec![(Endpoint::TimeSync, DataType::TIME_SYNC_REQUEST)]);
        assert_eq!(router.stats().unrouted, 1);
        assert_eq!(router.stats().decode_failures, 1);
    }

    #[test]
    fn test_rx_rejects_unknown_side_and_empty_buffer() {
        let (mut router, _link) = router_with_link(8, frozen_clock());
        assert!(matches!(
            router.rx_bytes_from_side(SideId(5), &[1]),
            Err(TelemetryError::BadArgument(_))
        ));
        assert!(matches!(
            router.rx_bytes_from_side(SideId(0), &[]),
            Err(TelemetryError::BadArgument(_))
        ));
    }

    #[test]
    fn test_receive_from_side_is_immediate() {
        let (mut router, _link) = router_with_link(8, frozen_clock());
        router.register_local_endpoint(Endpoint::SdCard).unwrap();
        let frame = encode_frame(DataType::MESSAGE_DATA, ElemKind::Unsigned, 1, 3, &[5]).unwrap();

        let mut count = 0;
        router
            .receive_from_side(SideId(0), &frame, &mut |_: Endpoint, _: &Packet| count += 1)
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(router.rx_pending(), 0);
    }

    #[test]
    fn test_own_records_reach_local_sink() {
        let (mut router, _link) = router_with_link(8, frozen_clock());
        router.register_local_endpoint(Endpoint::SdCard).unwrap();
        router.enqueue_typed(record(&[1]), Delivery::Queued).unwrap();
        assert_eq!(router.rx_pending(), 1);

        let mut sunk = Vec::new();
        router
            .process_rx_queue(0, &mut |endpoint: Endpoint, packet: &Packet| sunk.push((endpoint, packet.payload.clone())))
            .unwrap();
        assert_eq!(sunk, vec![(Endpoint::SdCard, vec![1])]);
    }

    #[test]
    fn test_factory_creates_independent_routers() {
        let mut factory = QueueRouterFactory::with_system_clock(4);
        let mut a = factory.create().unwrap();
        let b = factory.create().unwrap();
        a.register_local_endpoint(Endpoint::TimeSync).unwrap();
        assert_eq!(a.endpoints(), &[Endpoint::TimeSync]);
        assert!(b.endpoints().is_empty());
    }
}
