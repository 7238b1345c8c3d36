//! Wire formats for the Rogue streaming and memory fabric.
//!
//! Every protocol engine in the workspace speaks one of the fixed layouts in
//! this crate. Nothing here performs I/O or owns buffers: each format is a
//! plain value type with an `encode` into a caller-provided slice and a
//! `decode` from a received slice, so the engines can write headers straight
//! into frame buffers and parse them in place.
//!
//! # Formats
//!
//! - [`packetizer`]: segment header (v1, v2) and tail (v2) with running CRC
//! - [`rssi`]: reliable segment header, SYN parameter block, checksum
//! - [`srp`]: register protocol request/response headers (v0, v3) and tail
//! - [`batcher`]: batch super-header and per-record tail (v1)
//! - [`record`]: file recorder record header
//! - [`tcp`]: TCP bridge frame envelope
//!
//! Fixed layouts are declared with `zerocopy` so the compiler verifies size
//! and alignment. Multi-byte fields are little-endian except inside the RSSI
//! header, which keeps the protocol's network byte order.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod batcher;
pub mod crc;
pub mod errors;
pub mod packetizer;
pub mod record;
pub mod rssi;
pub mod srp;
pub mod tcp;

pub use crc::RunningCrc;
pub use errors::{ProtocolError, Result};
