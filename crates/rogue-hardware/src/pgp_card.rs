//! PGP card endpoint.

use std::sync::Arc;

use rogue_core::{
    Error, Result,
    stream::{AsMaster, FramePtr, Master, Slave},
};

use super::{
    axi_stream::{AxiStream, AxiStreamConfig},
    dev::{DevDriver, DriverOps},
    driver::DmaDriver,
};

/// Lanes per card.
pub const LANES: u8 = 8;
/// Virtual channels per lane.
pub const VCS: u8 = 4;

/// Stream endpoint for one PGP lane and virtual channel.
///
/// A PGP card is a DMA card whose destinations are `lane * 4 + vc`; this
/// wraps an [`AxiStream`] on that destination.
#[derive(Debug)]
pub struct PgpCard {
    stream: Arc<AxiStream>,
    lane: u8,
    vc: u8,
}

impl PgpCard {
    /// Destination of `lane`/`vc`.
    pub fn dest(lane: u8, vc: u8) -> Result<u32> {
        if lane >= LANES {
            return Err(Error::boundary("pgp lane", usize::from(lane), usize::from(LANES)));
        }
        if vc >= VCS {
            return Err(Error::boundary("pgp vc", usize::from(vc), usize::from(VCS)));
        }
        Ok(u32::from(lane) * u32::from(VCS) + u32::from(vc))
    }

    /// Endpoint over an open driver.
    pub fn new(driver: Arc<dyn DmaDriver>, lane: u8, vc: u8) -> Result<Arc<Self>> {
        let dest = Self::dest(lane, vc)?;
        let stream = AxiStream::new(driver, AxiStreamConfig { dest, ..AxiStreamConfig::default() })?;
        Ok(Arc::new(Self { stream, lane, vc }))
    }

    /// Endpoint over the card at `path`.
    pub fn open(path: &str, lane: u8, vc: u8) -> Result<Arc<Self>> {
        let driver = DevDriver::open(path, DriverOps::default())?;
        Self::new(Arc::new(driver), lane, vc)
    }

    /// Lane served.
    pub fn lane(&self) -> u8 {
        self.lane
    }

    /// Virtual channel served.
    pub fn vc(&self) -> u8 {
        self.vc
    }

    /// The underlying DMA endpoint.
    pub fn stream(&self) -> &Arc<AxiStream> {
        &self.stream
    }
}

impl AsMaster for PgpCard {
    fn master(&self) -> &Master {
        self.stream.master()
    }
}

impl Slave for PgpCard {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        self.stream.accept_frame(frame)
    }

    fn accept_req(&self, size: usize, zero_copy_ok: bool) -> Result<FramePtr> {
        self.stream.accept_req(size, zero_copy_ok)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;
    use rogue_core::stream::connect;

    use super::*;
    use crate::LoopbackDriver;

    #[derive(Default)]
    struct Channels {
        seen: Mutex<Vec<u8>>,
    }

    impl Slave for Channels {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            self.seen.lock().push(frame.lock().channel());
            Ok(())
        }
    }

    #[test]
    fn lane_and_vc_select_destination() {
        assert_eq!(PgpCard::dest(0, 0).unwrap(), 0);
        assert_eq!(PgpCard::dest(2, 3).unwrap(), 11);
        assert!(PgpCard::dest(LANES, 0).is_err());
        assert!(PgpCard::dest(0, VCS).is_err());
    }

    #[test]
    fn receives_only_its_channel() {
        let driver = Arc::new(LoopbackDriver::new(4, 2, 64));
        let card = PgpCard::new(driver.clone(), 1, 2).unwrap();
        let sink = Arc::new(Channels::default());
        connect(card.as_ref(), sink.clone());

        driver.inject(3, 0, 0, b"other").unwrap();
        driver.inject(6, 0, 0, b"mine").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.seen.lock().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(*sink.seen.lock(), vec![6]);
        assert_eq!(driver.drop_count(), 1);
        assert_eq!((card.lane(), card.vc()), (1, 2));
    }
}
