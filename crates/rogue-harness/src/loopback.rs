//! Ready-made graphs for scenario tests.

use std::sync::Arc;

use rogue_core::{
    Result, memory,
    stream::{AsMaster, FramePtr, Pool, Slave, connect},
};
use rogue_protocols::srp::{SrpV3, SrpV3Emulation};

use crate::fault::LossyLink;

/// Heap frame holding `bytes`.
pub fn heap_frame(bytes: &[u8]) -> Result<FramePtr> {
    let frame = Pool::new().accept_req(bytes.len(), false, 0)?;
    frame.lock().write(0, bytes)?;
    Ok(frame)
}

/// Connect `a` and `b` in both directions through seeded lossy links.
///
/// Returns the `a -> b` and `b -> a` links.
pub fn lossy_pair<A, B>(a: &Arc<A>, b: &Arc<B>, seed: u64, rate: f64) -> (Arc<LossyLink>, Arc<LossyLink>)
where
    A: AsMaster + Slave + 'static,
    B: AsMaster + Slave + 'static,
{
    let forward = Arc::new(LossyLink::new(seed, rate));
    let backward = Arc::new(LossyLink::new(seed.wrapping_add(1), rate));
    connect(a.as_ref(), forward.clone());
    connect(forward.as_ref(), b.clone());
    connect(b.as_ref(), backward.clone());
    connect(backward.as_ref(), a.clone());
    (forward, backward)
}

/// Register master talking SRP v3 to an emulated device.
#[derive(Debug)]
pub struct SrpLoopback {
    /// Issues transactions into the bridge
    pub master: memory::Master,
    /// Memory-to-stream bridge
    pub srp: Arc<SrpV3>,
    /// Device end backed by sparse RAM
    pub device: Arc<SrpV3Emulation>,
}

impl SrpLoopback {
    /// Bridge and device connected back to back.
    pub fn v3() -> Self {
        let srp = Arc::new(SrpV3::new());
        let device = Arc::new(SrpV3Emulation::new());
        connect(srp.as_ref(), device.clone());
        connect(device.as_ref(), srp.clone());
        let master = memory::Master::new();
        master.set_slave(srp.clone());
        Self { master, srp, device }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_frame_holds_bytes() {
        let frame = heap_frame(b"rogue").unwrap();
        assert_eq!(frame.lock().to_vec(), b"rogue");
        assert_eq!(heap_frame(&[]).unwrap().lock().payload(), 0);
    }

    #[test]
    fn srp_loopback_round_trips() {
        let lo = SrpLoopback::v3();
        lo.master.write(0x100, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(lo.master.read(0x100, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(lo.device.memory().peek(0x100, 4), vec![1, 2, 3, 4]);
    }
}
