//! End-to-end node scenarios.
//!
//! These tests verify:
//! - Master and client handling of wire frames
//! - Facade argument checking and link bring-up
//! - Configuration loaded from disk

mod common;
mod config_scenarios;
mod dispatch_scenarios;
mod sync_scenarios;
