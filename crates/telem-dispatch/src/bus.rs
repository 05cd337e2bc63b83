//! Bus transport abstractions.
//!
//! A [`BusDriver`] moves opaque datagrams between nodes. Received datagrams
//! land in an [`RxInbox`] from the driver's callback context; the telemetry
//! loop pumps the inbox into the router from task context.

use crate::router::SideLink;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use telem_common::error::{TelemetryError, TelemetryResult};
use tracing::trace;

/// Default inbox bound in datagrams.
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Bus transport driver.
pub trait BusDriver: Send {
    /// Transmit one datagram to every other node on the bus.
    fn send_datagram(&mut self, bytes: &[u8]) -> TelemetryResult<()>;

    /// Route datagrams received by this node into `inbox`.
    fn subscribe_rx(&mut self, inbox: RxInbox) -> TelemetryResult<()>;
}

/// Bounded queue of received datagrams shared with the bus callback.
///
/// Pushing never blocks on a full inbox; the datagram is dropped and counted.
#[derive(Debug, Clone)]
pub struct RxInbox {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl RxInbox {
    /// Create an inbox holding at most `capacity` datagrams.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push a received datagram.
    ///
    /// Empty datagrams are ignored. Returns whether the datagram was kept.
    pub fn push(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let mut queue = self.lock();
        if queue.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        queue.push_back(bytes.to_vec());
        true
    }

    /// Take every pending datagram.
    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.lock().drain(..).collect()
    }

    /// Number of pending datagrams.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no datagrams are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Datagrams dropped because the inbox was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        // A panicking pusher cannot leave the deque inconsistent
        self.queue.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Default for RxInbox {
    fn default() -> Self {
        Self::new(DEFAULT_INBOX_CAPACITY)
    }
}

/// Serialized side that transmits router frames over a bus driver.
#[derive(Debug)]
pub struct BusSide<B> {
    driver: B,
}

impl<B: BusDriver> BusSide<B> {
    /// Wrap a driver.
    pub fn new(driver: B) -> Self {
        Self { driver }
    }
}

impl<B: BusDriver> SideLink for BusSide<B> {
    fn send(&mut self, frame: &[u8]) -> TelemetryResult<()> {
        if frame.is_empty() {
            return Err(TelemetryError::BadArgument("empty frame".into()));
        }
        self.driver.send_datagram(frame).map_err(|e| match e {
            TelemetryError::IoFailure(_) => e,
            other => TelemetryError::IoFailure(other.to_string()),
        })
    }
}

// ============================================================================
// Simulated bus
// ============================================================================

#[derive(Debug, Default)]
struct SimBusInner {
    subscribers: Mutex<Vec<(usize, RxInbox)>>,
    next_port: AtomicU64,
    offline: AtomicBool,
    refuse_subscriptions: AtomicBool,
    datagrams: AtomicU64,
}

/// In-memory broadcast bus shared by simulated nodes.
///
/// Every datagram sent by one port is delivered to the inbox of every other
/// subscribed port.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    inner: Arc<SimBusInner>,
}

impl SimBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new node port.
    pub fn port(&self) -> SimBusPort {
        let id = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        SimBusPort {
            id: usize::try_from(id).unwrap_or(usize::MAX),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Make every send fail (for testing).
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Relaxed);
    }

    /// Make rx subscriptions fail (for testing).
    pub fn set_refuse_subscriptions(&self, refuse: bool) {
        self.inner.refuse_subscriptions.store(refuse, Ordering::Relaxed);
    }

    /// Datagrams carried so far.
    pub fn datagrams(&self) -> u64 {
        self.inner.datagrams.load(Ordering::Relaxed)
    }

    /// Number of subscribed ports.
    pub fn subscriber_count(&self) -> usize {
        lock_subscribers(&self.inner).len()
    }
}

fn lock_subscribers(inner: &SimBusInner) -> MutexGuard<'_, Vec<(usize, RxInbox)>> {
    inner
        .subscribers
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// One node's attachment to a [`SimBus`].
#[derive(Debug, Clone)]
pub struct SimBusPort {
    id: usize,
    inner: Arc<SimBusInner>,
}

impl SimBusPort {
    /// Port identifier on the bus.
    pub fn id(&self) -> usize {
        self.id
    }
}

impl BusDriver for SimBusPort {
    fn send_datagram(&mut self, bytes: &[u8]) -> TelemetryResult<()> {
        if bytes.is_empty() {
            return Err(TelemetryError::BadArgument("empty datagram".into()));
        }
        if self.inner.offline.load(Ordering::Relaxed) {
            return Err(TelemetryError::IoFailure("bus offline".into()));
        }

        let subscribers = lock_subscribers(&self.inner);
        for (port, inbox) in subscribers.iter().filter(|(port, _)| *port != self.id) {
            if !inbox.push(bytes) {
                trace!(port, "Inbox full, datagram dropped");
            }
        }
        self.inner.datagrams.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn subscribe_rx(&mut self, inbox: RxInbox) -> TelemetryResult<()> {
        if self.inner.refuse_subscriptions.load(Ordering::Relaxed) {
            return Err(TelemetryError::InitializationFailure(
                "bus refused rx subscription".into(),
            ));
        }
        let mut subscribers = lock_subscribers(&self.inner);
        subscribers.retain(|(port, _)| *port != self.id);
        subscribers.push((self.id, inbox));
        Ok(())
    }
}
