//! End-to-end scenarios for the stream and memory fabrics.
//!
//! ```text
//!   Pool ──accept_req──> Frame ──write/read──> bytes
//!
//!   Master ──> S1
//!          └─> S2                      (insertion order)
//!
//!   memory::Master ──> Hub(o1) ──> ... ──> Hub(on) ──> TransactionLog
//!
//!   memory::Master ──> SrpV3 ──frames──> SrpV3Emulation (4 KiB RAM)
//!                         <──frames──
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use rogue_core::{
    Result,
    memory::{self, Hub, MemoryError, TransactionType},
    stream::{FramePtr, Master, Pool, Slave},
};
use rogue_harness::{Collector, SrpLoopback, TransactionLog, heap_frame, init_tracing};

/// Appends its name to a shared log for every frame.
struct Named {
    name: &'static str,
    log: Arc<Mutex<Vec<(&'static str, usize)>>>,
}

impl Slave for Named {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        self.log.lock().push((self.name, Arc::as_ptr(&frame) as usize));
        Ok(())
    }
}

#[test]
fn chained_pool_frame_round_trips_and_releases() {
    init_tracing();
    let pool = Pool::new();
    let frame = pool.accept_req(1024, true, 256).unwrap();
    {
        let lock = frame.lock();
        assert_eq!(lock.buffer_count(), 4);
        assert!(lock.buffers().iter().all(|b| b.raw_size() == 256));
    }
    assert_eq!(pool.alloc_bytes(), 1024);

    let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
    frame.lock().write(0, &data).unwrap();
    let mut back = vec![0u8; 1024];
    frame.lock().read(0, &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(frame.lock().to_vec(), data);

    drop(frame);
    assert_eq!(pool.alloc_bytes(), 0);
    assert_eq!(pool.alloc_count(), 0);
}

#[test]
fn master_delivers_to_every_slave_in_order() {
    init_tracing();
    let log = Arc::new(Mutex::new(Vec::new()));
    let master = Master::new();
    master.set_slave(Arc::new(Named { name: "s1", log: log.clone() }));
    master.add_slave(Arc::new(Named { name: "s2", log: log.clone() }));

    let frame = heap_frame(b"fan out").unwrap();
    let id = Arc::as_ptr(&frame) as usize;
    master.send_frame(frame);

    assert_eq!(*log.lock(), vec![("s1", id), ("s2", id)]);
    assert_eq!(master.frame_count(), 1);
    assert_eq!(master.byte_count(), 7);
}

#[test]
fn primary_slave_serves_allocation() {
    let master = Master::new();
    let sink = Collector::new();
    master.add_slave(sink.clone());
    let frame = master.req_frame(100, false).unwrap();
    assert!(frame.lock().size() >= 100);
    frame.lock().write(0, &[1u8; 100]).unwrap();
    master.send_frame(frame);
    assert_eq!(sink.payloads(), vec![vec![1u8; 100]]);
}

#[test]
fn hub_offsets_the_leaf_address() {
    init_tracing();
    let leaf = TransactionLog::new();
    let hub = Arc::new(Hub::new(0x1000));
    hub.set_slave(leaf.clone()).unwrap();
    let master = memory::Master::new();
    master.set_slave(hub);

    let payload = vec![0xEF, 0xBE, 0xAD, 0xDE];
    master.write(0x40, payload.clone()).unwrap();

    let records = leaf.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].address, 0x1040);
    assert_eq!(records[0].kind, TransactionType::Write);
    assert_eq!(records[0].data, payload);
    assert_eq!(leaf.ram().peek(0x1040, 4), payload);
}

#[test]
fn hub_chain_rejects_cycles() {
    let outer = Arc::new(Hub::new(0x100));
    let inner = Arc::new(Hub::new(0x10));
    inner.set_slave(outer.clone()).unwrap();
    assert!(outer.set_slave(inner).is_err());
}

#[test]
fn srp_v3_write_then_read_over_loopback() {
    init_tracing();
    let lo = SrpLoopback::v3();

    lo.master.write(0x20, 0xDEAD_BEEF_u32.to_le_bytes().to_vec()).unwrap();
    let data = lo.master.read(0x20, 4).unwrap();

    assert_eq!(u32::from_le_bytes([data[0], data[1], data[2], data[3]]), 0xDEAD_BEEF);
    assert_eq!(lo.master.get_error(), 0);
    assert_eq!(lo.srp.drop_count(), 0);
}

#[test]
fn srp_v3_device_error_reaches_the_master() {
    let lo = SrpLoopback::v3();
    lo.device.set_status(0x0000_0100);
    let err = lo.master.read(0x20, 4).unwrap_err();
    assert!(matches!(err, MemoryError::BusFail | MemoryError::BusTimeout));
    assert_ne!(lo.master.get_error(), 0);
}

#[test]
fn srp_v3_verify_reads_back() {
    let lo = SrpLoopback::v3();
    lo.master.write_verify(0x400, vec![9; 64]).unwrap();
    assert_eq!(lo.device.memory().peek(0x400, 64), vec![9; 64]);
}

proptest! {
    #[test]
    fn frame_write_then_read_is_identity(
        data in proptest::collection::vec(any::<u8>(), 0..4096),
        chunk in 1usize..512,
    ) {
        let frame = Pool::new().accept_req(data.len(), false, chunk).unwrap();
        prop_assume!(data.len() <= frame.lock().available());
        frame.lock().write(0, &data).unwrap();
        prop_assert_eq!(frame.lock().to_vec(), data);
    }

    #[test]
    fn pool_bytes_track_live_buffers(sizes in proptest::collection::vec(1usize..2048, 1..32), keep in any::<u32>()) {
        let pool = Pool::new();
        let mut live = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let buffer = pool.alloc_buffer(*size).unwrap();
            if keep & (1 << (i % 32)) != 0 {
                live.push(buffer);
            }
        }
        let expected: usize = live.iter().map(|b| b.raw_size()).sum();
        prop_assert_eq!(pool.alloc_bytes(), expected);
        live.clear();
        prop_assert_eq!(pool.alloc_bytes(), 0);
    }

    #[test]
    fn hub_chain_is_address_transparent(
        offsets in proptest::collection::vec(0u64..1 << 48, 1..6),
        word in 0u64..0x4000,
    ) {
        let leaf = TransactionLog::new();
        let mut next: Arc<dyn memory::Slave> = leaf.clone();
        for offset in offsets.iter().rev() {
            let hub = Arc::new(Hub::new(*offset & !3));
            hub.set_slave(next).unwrap();
            next = hub;
        }
        let master = memory::Master::new();
        master.set_slave(next);

        let address = word << 2;
        master.write(address, vec![1, 2, 3, 4]).unwrap();
        let expected = offsets.iter().fold(address, |a, o| a | (o & !3));
        prop_assert_eq!(leaf.records()[0].address, expected);
    }
}
