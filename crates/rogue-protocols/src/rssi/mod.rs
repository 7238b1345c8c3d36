//! Reliable sequenced segment delivery.
//!
//! [`Controller`] is the protocol, written as a pure state machine so it can
//! be driven by simulated time in tests. [`Link`] runs one on real threads
//! and plugs it into a stream graph between a datagram transport and an
//! application.

mod controller;
mod link;

pub use controller::{Action, Controller, Role, RssiConfig, RssiState};
pub use link::{Application, Link, Transport};
