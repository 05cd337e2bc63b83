//! Configuration files driving node behavior.
//!
//! # Acceptance Criteria
//!
//! - The shipped sample configuration loads and matches the defaults
//! - A tighter step limit loaded from disk changes which offsets apply
//! - Invalid files are rejected with the offending field named

use super::common::{node_with_config, sync_frame};
use std::io::Write;
use std::path::Path;
use telem_common::config::{ConfigError, NodeConfig, Role};
use telem_dispatch::SimBus;
use telem_timesync::{SyncResponse, TimeSyncMessage};

// ============================================================================
// Test Helpers
// ============================================================================

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

// ============================================================================
// Loading
// ============================================================================

#[test]
fn test_sample_config_matches_defaults() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/node.toml");
    let config = NodeConfig::from_file(&path).unwrap();

    let expected = NodeConfig {
        node_name: String::from("bus"),
        ..NodeConfig::default()
    };
    assert_eq!(config, expected);
}

#[test]
fn test_step_limit_from_file_applies_to_exchanges() {
    let file = write_config(
        r#"
node_name = "tight"
role = "client"

[timesync]
max_step_ms = 100
smooth_div = 2
"#,
    );
    let config = NodeConfig::from_file(file.path()).unwrap();
    assert_eq!(config.role, Role::Client);

    let bus = SimBus::new();
    let mut client = node_with_config(&bus, &config, 1000);

    // 150 ms ahead: beyond the limit
    let far = sync_frame(
        &TimeSyncMessage::Response(SyncResponse {
            sequence: 1,
            t1: 1000,
            t2: 1150,
            t3: 1150,
        }),
        1150,
    );
    client.dispatcher.rx_sync(&far).unwrap();
    assert_eq!(client.dispatcher.engine().clock().state().offset_ms(), 0);

    // 80 ms ahead: half of it applies
    let near = sync_frame(
        &TimeSyncMessage::Response(SyncResponse {
            sequence: 2,
            t1: 1000,
            t2: 1080,
            t3: 1080,
        }),
        1080,
    );
    client.dispatcher.rx_sync(&near).unwrap();
    assert_eq!(client.dispatcher.engine().clock().state().offset_ms(), 40);
}

#[test]
fn test_invalid_config_names_field() {
    let file = write_config(
        r"
[timesync]
smooth_div = 0
",
    );

    let err = NodeConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::Invalid {
            field: "timesync.smooth_div",
            ..
        }
    ));
}
