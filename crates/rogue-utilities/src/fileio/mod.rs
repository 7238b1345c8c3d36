//! Data file recording and replay.
//!
//! A data file is a flat sequence of records, each a 32-bit header (size and
//! channel) followed by the frame payload; see [`rogue_proto::record`].

mod reader;
mod writer;

pub use reader::StreamReader;
pub use writer::{StreamWriter, StreamWriterChannel, WriterConfig};
