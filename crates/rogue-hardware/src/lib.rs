//! Kernel DMA driver adapters.
//!
//! A DMA card exposes a fixed set of equally sized buffers that the kernel
//! driver maps into user space. Received data lands directly in those
//! buffers and outbound data is written into them before the driver is told
//! to send, so frames built on them never copy their payload.
//!
//! [`DmaDriver`] is the capability surface an adapter needs from a driver.
//! [`DevDriver`] implements it over a `/dev` node and [`LoopbackDriver`]
//! implements it in memory. The adapters sit on top:
//!
//! - [`AxiStream`]: stream endpoint for one DMA destination
//! - [`PgpCard`]: stream endpoint addressed by PGP lane and virtual channel
//! - [`MemMap`]: memory slave turning transactions into register accesses

mod axi_stream;
mod dev;
mod driver;
mod loopback;
mod mem_map;
mod pgp_card;

pub use axi_stream::{AxiStream, AxiStreamConfig};
pub use dev::{DevDriver, DriverOps};
pub use driver::{DestMask, DmaDriver, RegionTable, RxDescriptor, TxDescriptor};
pub use loopback::LoopbackDriver;
pub use mem_map::MemMap;
pub use pgp_card::PgpCard;
