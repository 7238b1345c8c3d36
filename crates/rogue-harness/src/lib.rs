//! Deterministic test harness for Rogue stream and memory graphs.
//!
//! Fault injection is seeded, so a failing scenario replays exactly:
//!
//! - [`LossyLink`] drops frames with a fixed probability from a ChaCha RNG
//! - [`Corrupter`] flips bytes of one chosen frame
//! - [`RssiSim`] runs two RSSI controllers against each other on a virtual
//!   clock, so thousands of retransmit timeouts cost no wall time
//!
//! [`Collector`] and [`TransactionLog`] record what reaches the end of a
//! stream or memory graph, and [`SrpLoopback`] wires a register master to an
//! emulated SRP v3 device.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod collector;
mod fault;
mod loopback;
mod sim;

use std::sync::Once;

pub use collector::{Collector, Received, TransactionLog, TransactionRecord};
pub use fault::{Corrupter, LossModel, LossyLink};
pub use loopback::{SrpLoopback, heap_frame, lossy_pair};
pub use sim::RssiSim;

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        use tracing_subscriber::{EnvFilter, fmt};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt().with_env_filter(filter).with_test_writer().with_thread_names(true).try_init();
    });
}
