//! Socket transports for Rogue stream graphs.
//!
//! - [`udp`]: one frame per datagram, client or server
//! - [`tcp`]: two-channel frame bridge carrying frame metadata
//!
//! Every endpoint is a stream [`Slave`](rogue_core::stream::Slave) for
//! outbound frames and exposes received frames through its
//! [`Master`](rogue_core::stream::Master). Each runs its receive side on a
//! dedicated thread that polls a stop flag, so `stop` (or drop) returns
//! within one poll interval.

pub mod tcp;
pub mod udp;

use std::time::Duration;

/// Receive timeout used to notice shutdown.
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);
