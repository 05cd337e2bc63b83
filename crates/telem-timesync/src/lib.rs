//! Software time synchronization for nodes sharing a bus.
//!
//! This crate provides:
//! - [`clock`] module turning a wrapping 32-bit tick counter into milliseconds
//! - [`estimator`] module with the four-timestamp offset/delay computation
//! - [`state`] module holding the applied offset, delay, and unix base
//! - [`protocol`] module with the fixed little-endian payload layouts
//! - [`role`] module deciding what a master or client does with each message
//! - [`stats`] module with synchronization statistics
//!
//! Time sync only adjusts *software* time. The hardware tick counter and the
//! host scheduler are never touched.

pub mod clock;
pub mod estimator;
pub mod protocol;
pub mod role;
pub mod state;
pub mod stats;

pub use clock::*;
pub use estimator::*;
pub use protocol::*;
pub use role::*;
pub use state::*;
pub use stats::*;
