//! Four-timestamp offset and delay estimation.
//!
//! ```text
//! Client                          Master
//!   |--- REQUEST (t1) ------------->|  (master stamps t2)
//!   |<-- RESPONSE (t1, t2, t3) -----|  (master stamps t3)
//!   |  (client stamps t4)           |
//!   |                               |
//!   |  offset = ((t2-t1)+(t3-t4))/2 |
//!   |  delay  = (t4-t1) - (t3-t2)   |
//! ```
//!
//! Each side stamps with its own clock; nothing assumes the two agree.

use serde::Serialize;

/// Result of one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Estimate {
    /// Amount to add to the client clock to reach the master clock.
    pub offset_ms: i64,
    /// Round-trip time minus master processing time, never negative.
    pub delay_ms: u64,
}

/// Compute offset and delay from the four exchange timestamps.
///
/// - `t1`: client send time
/// - `t2`: master receive time
/// - `t3`: master reply time
/// - `t4`: client receive time
///
/// Differences are taken with wrapping arithmetic and reinterpreted as
/// signed, so reordered or skewed timestamps yield negative intermediate
/// values instead of panicking. The offset truncates toward zero. A negative
/// delay is reported as zero.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub fn estimate(t1: u64, t2: u64, t3: u64, t4: u64) -> Estimate {
    let outbound = t2.wrapping_sub(t1) as i64;
    let inbound = t3.wrapping_sub(t4) as i64;
    let offset_ms = outbound.wrapping_add(inbound) / 2;

    let round_trip = t4.wrapping_sub(t1) as i64;
    let processing = t3.wrapping_sub(t2) as i64;
    let delay = round_trip.wrapping_sub(processing);

    Estimate {
        offset_ms,
        delay_ms: u64::try_from(delay).unwrap_or(0),
    }
}
