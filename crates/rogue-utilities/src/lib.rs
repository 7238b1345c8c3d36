//! Utilities built on the Rogue stream fabric.
//!
//! [`fileio`] records frames from any number of channels into a single data
//! file (or a size-limited series of them) and replays them later through a
//! stream master.

pub mod fileio;
