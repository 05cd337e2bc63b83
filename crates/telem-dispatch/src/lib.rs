//! Telemetry dispatch plane for nodes on a shared bus.
//!
//! This crate provides:
//! - [`Router`] and [`SideLink`] traits abstracting the packet router
//! - [`bus`] module with the [`BusDriver`] trait and the receive inbox
//! - [`queue_router`] module with an in-memory router (feature `simulated`)
//! - [`facade`] module with the node's single integration point
//! - [`scheduler`] module with the cooperative telemetry loop

pub mod bus;
pub mod facade;
#[cfg(feature = "simulated")]
pub mod queue_router;
pub mod router;
pub mod scheduler;

pub use bus::*;
pub use facade::*;
#[cfg(feature = "simulated")]
pub use queue_router::*;
pub use router::*;
pub use scheduler::*;
