//! Dispatch facade scenarios.
//!
//! # Acceptance Criteria
//!
//! - Bad samples are rejected before anything reaches the router
//! - The link comes up once, on first use
//! - Element kinds and delivery modes are visible on the wire
//! - Error records are capped and always produced
//! - A node whose link cannot come up keeps running without telemetry

use super::common::{config, node, node_with_config, Observer};
use telem_common::config::{NodeConfig, Role};
use telem_common::error::TelemetryError;
use telem_common::state::LinkState;
use telem_dispatch::{DataType, Delivery, ElemKind, SimBus};

const TEMPERATURE: DataType = DataType(30);

// ============================================================================
// Samples
// ============================================================================

#[test]
fn test_bad_samples_never_reach_router() {
    let bus = SimBus::new();
    let mut sensor = node(&bus, Role::Client, 0);

    let cases: [(&[u8], usize, usize); 4] = [
        (&[], 1, 4),
        (&[1, 2, 3, 4], 0, 4),
        (&[1, 2, 3, 4], 1, 0),
        (&[1, 2, 3], 1, 4),
    ];
    for (data, count, elem_size) in cases {
        let result = sensor
            .dispatcher
            .log_sample(TEMPERATURE, data, count, elem_size, Delivery::Immediate);
        assert!(matches!(result, Err(TelemetryError::BadArgument(_))));
    }

    assert!(sensor.dispatcher.router().is_none());
    assert_eq!(sensor.dispatcher.link_state(), LinkState::Uninitialized);
    assert_eq!(bus.datagrams(), 0);
}

#[test]
fn test_link_created_once_on_first_use() {
    let bus = SimBus::new();
    let mut sensor = node(&bus, Role::Client, 250);

    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &[1, 2], 1, 2, Delivery::Queued)
        .unwrap();
    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &[3, 4], 1, 2, Delivery::Queued)
        .unwrap();
    sensor.dispatcher.drain_all(0).unwrap();

    assert_eq!(sensor.dispatcher.link_state(), LinkState::Ready);
    let router = sensor.dispatcher.router().unwrap();
    assert_eq!(router.side_names(), vec![(String::from("can"), 3)]);
    assert_eq!(router.endpoints().len(), 2);
    assert_eq!(bus.subscriber_count(), 1);

    // Router time restarts at link creation
    sensor.ticks.advance_ms(40);
    assert_eq!(sensor.dispatcher.router_elapsed_ms(), 40);
}

#[test]
fn test_kind_and_delivery_visible_on_wire() {
    let bus = SimBus::new();
    let observer = Observer::attach(&bus);
    let mut sensor = node(&bus, Role::Client, 0);

    let pressure = 1013.25f64.to_le_bytes();
    let raw_counter = 42u32.to_le_bytes();
    let flags = [0x0Fu8, 0xF0];

    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &pressure, 1, 8, Delivery::Queued)
        .unwrap();
    sensor
        .dispatcher
        .log_sample_as(
            TEMPERATURE,
            &raw_counter,
            1,
            4,
            ElemKind::Unsigned,
            Delivery::Queued,
        )
        .unwrap();
    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &flags, 2, 1, Delivery::Immediate)
        .unwrap();

    // Only the immediate record is on the bus before draining
    let before = observer.packets();
    assert_eq!(before.len(), 1);
    assert_eq!(before[0].kind, ElemKind::Unsigned);
    assert_eq!(before[0].payload, flags);

    sensor.dispatcher.drain_tx_all().unwrap();
    let after = observer.packets();
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].kind, ElemKind::Float);
    assert_eq!(after[0].elem_size, 8);
    assert_eq!(after[1].kind, ElemKind::Unsigned);
    assert_eq!(after[1].elem_size, 4);
}

#[test]
fn test_queue_full_reported_with_code() {
    let bus = SimBus::new();
    let small = NodeConfig {
        dispatch: telem_common::config::DispatchConfig {
            queue_capacity: 2,
            ..Default::default()
        },
        ..config(Role::Client)
    };
    let mut sensor = node_with_config(&bus, &small, 0);

    for _ in 0..2 {
        sensor
            .dispatcher
            .log_sample(TEMPERATURE, &[1], 1, 1, Delivery::Queued)
            .unwrap();
    }
    let err = sensor
        .dispatcher
        .log_sample(TEMPERATURE, &[1], 1, 1, Delivery::Queued)
        .unwrap_err();
    assert!(matches!(err, TelemetryError::QueueFull { capacity: 2 }));
    assert_eq!(err.code(), -6);

    sensor.dispatcher.drain_tx_all().unwrap();
    sensor.dispatcher.report_error(&err).unwrap();
    sensor.dispatcher.drain_tx_all().unwrap();
    assert_eq!(bus.datagrams(), 3);
}

// ============================================================================
// Error records
// ============================================================================

#[test]
fn test_error_record_capped_on_char_boundary() {
    let bus = SimBus::new();
    let observer = Observer::attach(&bus);
    let mut sensor = node(&bus, Role::Client, 0);

    let message = "é".repeat(300);
    sensor
        .dispatcher
        .log_error(&message, Delivery::Immediate)
        .unwrap();

    let packets = observer.packets();
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].ty, DataType::GENERIC_ERROR);
    assert_eq!(packets[0].payload.len(), 512);
    let text = String::from_utf8(packets[0].payload.clone()).unwrap();
    assert_eq!(text.chars().count(), 256);
}

#[test]
fn test_error_records_reach_local_sink() {
    let bus = SimBus::new();
    let mut sensor = node(&bus, Role::Client, 0);

    sensor
        .dispatcher
        .log_error(format_args!("sensor {} timeout", 4), Delivery::Queued)
        .unwrap();
    sensor.dispatcher.drain_all(0).unwrap();

    assert_eq!(sensor.dispatcher.sink_records(), 1);
    assert_eq!(bus.datagrams(), 1);
}

// ============================================================================
// Degraded operation
// ============================================================================

#[test]
fn test_node_without_link_keeps_running() {
    let bus = SimBus::new();
    let broken = NodeConfig {
        dispatch: telem_common::config::DispatchConfig {
            bus_side_name: String::new(),
            ..Default::default()
        },
        ..config(Role::Master)
    };
    let mut master = node_with_config(&bus, &broken, 100);

    for attempt in 1..=3 {
        let err = master
            .dispatcher
            .log_sample(TEMPERATURE, &[1], 1, 1, Delivery::Queued)
            .unwrap_err();
        assert!(matches!(err, TelemetryError::InitializationFailure(_)));
        assert_eq!(master.dispatcher.link_state(), LinkState::Failed);
        assert_eq!(master.dispatcher.lifecycle().failed_attempts(), attempt);
    }
    assert!(master.dispatcher.drain_all(0).is_err());

    // Time keeping does not depend on the link
    assert!(master.dispatcher.set_absolute_time(1_000_000));
    master.ticks.advance_ms(25);
    assert_eq!(master.dispatcher.unix_now_ms(), 1_000_025);
}

#[test]
fn test_refused_subscription_is_retried() {
    let bus = SimBus::new();
    let mut logger = node(&bus, Role::Client, 0);
    let mut sensor = node(&bus, Role::Client, 0);

    bus.set_refuse_subscriptions(true);
    logger.dispatcher.ensure_link().unwrap();
    assert_eq!(logger.dispatcher.link_state(), LinkState::Ready);
    assert_eq!(bus.subscriber_count(), 0);

    bus.set_refuse_subscriptions(false);
    assert_eq!(logger.dispatcher.pump_bus_rx().unwrap(), 0);
    assert_eq!(bus.subscriber_count(), 1);

    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &[7], 1, 1, Delivery::Immediate)
        .unwrap();
    assert_eq!(logger.dispatcher.pump_bus_rx().unwrap(), 1);
    logger.dispatcher.drain_rx_all().unwrap();
    assert_eq!(logger.dispatcher.sink_records(), 1);
}

#[test]
fn test_disabled_node_is_silent() {
    let bus = SimBus::new();
    let quiet = NodeConfig {
        telemetry_enabled: false,
        ..config(Role::Client)
    };
    let mut sensor = node_with_config(&bus, &quiet, 0);

    sensor
        .dispatcher
        .log_sample(TEMPERATURE, &[], 0, 0, Delivery::Immediate)
        .unwrap();
    sensor.dispatcher.log_error("ignored", Delivery::Immediate).unwrap();
    assert!(!sensor.dispatcher.request_sync().unwrap());
    sensor.dispatcher.drain_all(0).unwrap();

    assert!(!sensor.dispatcher.is_enabled());
    assert_eq!(sensor.dispatcher.link_state(), LinkState::Uninitialized);
    assert_eq!(bus.datagrams(), 0);
}
