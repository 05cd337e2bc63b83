//! Time-sync scenarios driven through complete nodes.
//!
//! # Acceptance Criteria
//!
//! - A client applies the worked exchange (offset -1, delay 23)
//! - A master answers a request with its own receive and reply stamps
//! - Short payloads change nothing
//! - Unix time, once known, stays known
//! - A client converges on a master over the bus and learns its unix time

use super::common::{node, sync_frame, words, Observer};
use telem_common::config::Role;
use telem_dispatch::{encode_frame, DataType, ElemKind, SimBus};
use telem_timesync::{SyncAnnounce, SyncRequest, SyncResponse, TimeSyncMessage};

const GPS_UNIX_MS: u64 = 1_700_000_000_000;

fn response(sequence: u64, t1: u64, t2: u64, t3: u64) -> Vec<u8> {
    sync_frame(
        &TimeSyncMessage::Response(SyncResponse {
            sequence,
            t1,
            t2,
            t3,
        }),
        t3,
    )
}

fn announce(priority: u64, unix_ms: u64) -> Vec<u8> {
    sync_frame(
        &TimeSyncMessage::Announce(SyncAnnounce { priority, unix_ms }),
        0,
    )
}

fn short_frame(ty: DataType, payload: &[u8]) -> Vec<u8> {
    encode_frame(ty, ElemKind::Unsigned, 8, 0, payload).unwrap()
}

// ============================================================================
// Worked exchanges
// ============================================================================

#[test]
fn test_client_applies_worked_exchange() {
    let bus = SimBus::new();
    let mut client = node(&bus, Role::Client, 1025);

    client
        .dispatcher
        .rx_sync(&response(1, 1000, 1010, 1012))
        .unwrap();

    let state = client.dispatcher.engine().clock().state();
    assert_eq!(state.offset_ms(), -1);
    assert_eq!(state.last_delay_ms(), 23);

    let stats = client.dispatcher.sync_stats();
    assert_eq!(stats.exchanges, 1);
    assert_eq!(stats.offsets_applied, 1);
    assert_eq!(stats.last_sequence, Some(1));
}

#[test]
fn test_master_answers_request_with_its_stamps() {
    let bus = SimBus::new();
    let observer = Observer::attach(&bus);
    let mut master = node(&bus, Role::Master, 505);

    let request = sync_frame(
        &TimeSyncMessage::Request(SyncRequest {
            sequence: 7,
            t1: 500,
        }),
        500,
    );
    master.dispatcher.rx_sync(&request).unwrap();

    let packets = observer.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].ty, DataType::TIME_SYNC_RESPONSE);

    let reply = words(&packets[0].payload);
    assert_eq!(reply[..3], [7, 500, 505]);
    assert!(reply[3] >= reply[2]);
    assert_eq!(packets[0].timestamp_ms, reply[3]);
}

#[test]
fn test_short_response_changes_nothing() {
    let bus = SimBus::new();
    let mut client = node(&bus, Role::Client, 1025);

    let mut payload = TimeSyncMessage::Response(SyncResponse {
        sequence: 1,
        t1: 1000,
        t2: 1010,
        t3: 1012,
    })
    .encode();
    payload.pop();
    let frame = short_frame(DataType::TIME_SYNC_RESPONSE, &payload);

    client.dispatcher.rx_sync(&frame).unwrap();

    let state = client.dispatcher.engine().clock().state();
    assert_eq!(state.offset_ms(), 0);
    assert_eq!(state.last_delay_ms(), 0);
    assert_eq!(client.dispatcher.sync_stats().malformed, 1);
    assert_eq!(client.dispatcher.sync_stats().exchanges, 0);
}

#[test]
fn test_oversized_offset_discarded_but_delay_recorded() {
    let bus = SimBus::new();
    let mut client = node(&bus, Role::Client, 1000);

    // Master appears 59 s ahead, beyond the 30 s step limit
    client
        .dispatcher
        .rx_sync(&response(3, 1000, 60_000, 60_000))
        .unwrap();

    let state = client.dispatcher.engine().clock().state();
    assert_eq!(state.offset_ms(), 0);
    assert_eq!(state.last_delay_ms(), 0);
    assert_eq!(client.dispatcher.sync_stats().offsets_rejected, 1);
}

#[test]
fn test_master_ignores_client_traffic() {
    let bus = SimBus::new();
    let mut master = node(&bus, Role::Master, 2000);

    master
        .dispatcher
        .rx_sync(&response(1, 1000, 1010, 1012))
        .unwrap();
    master
        .dispatcher
        .rx_sync(&announce(0, GPS_UNIX_MS))
        .unwrap();

    assert_eq!(master.dispatcher.engine().clock().state().offset_ms(), 0);
    assert!(!master.dispatcher.unix_is_valid());
    assert_eq!(master.dispatcher.sync_stats().ignored, 2);
}

// ============================================================================
// Unix time
// ============================================================================

#[test]
fn test_unix_validity_is_monotone() {
    let bus = SimBus::new();
    let mut client = node(&bus, Role::Client, 4000);
    assert_eq!(client.dispatcher.unix_now_ms(), 0);

    client
        .dispatcher
        .rx_sync(&announce(2, GPS_UNIX_MS))
        .unwrap();
    assert!(client.dispatcher.unix_is_valid());
    assert_eq!(client.dispatcher.unix_now_ms(), GPS_UNIX_MS);

    // Rejected, malformed, and role-inapplicable traffic afterwards
    client
        .dispatcher
        .rx_sync(&response(9, 4000, 90_000, 90_000))
        .unwrap();
    let short = short_frame(DataType::TIME_SYNC_ANNOUNCE, &[0; 15]);
    client.dispatcher.rx_sync(&short).unwrap();
    client.dispatcher.request_sync().unwrap();
    client.dispatcher.drain_all(0).unwrap();

    assert!(client.dispatcher.unix_is_valid());
    client.ticks.advance_ms(1500);
    assert_eq!(client.dispatcher.unix_now_ms(), GPS_UNIX_MS + 1500);
    assert_eq!(client.dispatcher.unix_now_s(), (GPS_UNIX_MS + 1500) / 1000);
}

#[test]
fn test_client_converges_and_learns_unix_time_over_bus() {
    let bus = SimBus::new();
    let mut master = node(&bus, Role::Master, 1040);
    let mut client = node(&bus, Role::Client, 1000);

    master.dispatcher.ensure_link().unwrap();
    client.dispatcher.ensure_link().unwrap();
    assert!(master.dispatcher.set_absolute_time(GPS_UNIX_MS));
    assert!(!client.dispatcher.set_absolute_time(GPS_UNIX_MS));

    for _ in 0..30 {
        assert!(client.dispatcher.request_sync().unwrap());
        client.dispatcher.drain_all(0).unwrap();

        assert_eq!(master.dispatcher.pump_bus_rx().unwrap(), 1);
        master.dispatcher.drain_all(0).unwrap();

        assert_eq!(client.dispatcher.pump_bus_rx().unwrap(), 1);
        client.dispatcher.drain_all(0).unwrap();
    }

    assert_eq!(client.dispatcher.engine().clock().state().offset_ms(), 40);
    assert_eq!(
        client.dispatcher.adjusted_now_ms(),
        master.dispatcher.adjusted_now_ms()
    );
    assert_eq!(master.dispatcher.sync_stats().requests_answered, 30);

    assert!(master.dispatcher.announce_now(5).unwrap());
    client.dispatcher.pump_bus_rx().unwrap();
    client.dispatcher.drain_all(0).unwrap();

    assert!(client.dispatcher.unix_is_valid());
    assert_eq!(
        client.dispatcher.unix_now_ms(),
        master.dispatcher.unix_now_ms()
    );
    assert_eq!(client.dispatcher.sync_stats().announces_learned, 1);
}
