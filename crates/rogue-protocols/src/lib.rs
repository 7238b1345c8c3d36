//! Protocol engines for the Rogue stream fabric.
//!
//! Each engine sits between two stream edges. Its transport side speaks a
//! wire format from `rogue-proto`; its application side exchanges plain
//! frames (or, for SRP, memory transactions).
//!
//! - [`packetizer`]: fragmentation and reassembly over a transport with a
//!   bounded buffer size, multiplexing up to 256 destinations
//! - [`rssi`]: reliable in-order delivery over an unreliable transport
//! - [`srp`]: memory transactions carried as stream frames
//! - [`batcher`]: splitting and building batched frames

pub mod batcher;
pub mod error;
pub mod packetizer;
pub mod rssi;
pub mod srp;

pub use error::RssiError;
