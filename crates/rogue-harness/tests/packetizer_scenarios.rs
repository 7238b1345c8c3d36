//! Packetizer fragmentation over an intercepted transport.
//!
//! ```text
//!   app(dest) ──> Packetizer(tx) ──segments──> Corrupter ──> Packetizer(rx) ──> app(dest) ──> Collector
//! ```
//!
//! Segments of 128 payload bytes (144-byte transport buffers with the v2
//! header and tail) make a 1000-byte frame span eight segments.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use rogue_core::stream::{Slave, connect};
use rogue_harness::{Collector, Corrupter, LossyLink, heap_frame, init_tracing};
use rogue_proto::packetizer::Version;
use rogue_protocols::packetizer::{Packetizer, PacketizerConfig};

fn config(version: u8) -> PacketizerConfig {
    PacketizerConfig { version, max_buffer: 144, ..PacketizerConfig::default() }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn corrupted_segment_drops_the_whole_frame() {
    init_tracing();
    let tx = Packetizer::new(config(2)).unwrap();
    let rx = Packetizer::new(config(2)).unwrap();
    assert_eq!(tx.segment_size(), 128);

    let corrupter = Arc::new(Corrupter::new(3, Version::V2.header_size() + 10));
    connect(tx.as_ref(), corrupter.clone());
    connect(corrupter.as_ref(), rx.clone());
    let sink = Collector::new();
    connect(rx.application(0).as_ref(), sink.clone());

    tx.application(0).accept_frame(heap_frame(&pattern(1000, 1)).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || rx.drop_count() == 1));
    assert_eq!(corrupter.seen(), 8);
    assert!(sink.is_empty());

    let clean = pattern(1000, 2);
    tx.application(0).accept_frame(heap_frame(&clean).unwrap()).unwrap();
    assert!(sink.wait_for(1, Duration::from_secs(5)));
    assert_eq!(sink.payloads(), vec![clean]);
    assert_eq!(rx.drop_count(), 1);
    assert_eq!(rx.frame_count(), 1);
}

#[test]
fn frames_survive_fragmentation_on_both_versions() {
    init_tracing();
    for version in [1u8, 2] {
        let tx = Packetizer::new(config(version)).unwrap();
        let rx = Packetizer::new(config(version)).unwrap();
        connect(tx.as_ref(), rx.clone());
        let sinks: Vec<Arc<Collector>> = (0..3u8)
            .map(|dest| {
                let sink = Collector::new();
                connect(rx.application(dest).as_ref(), sink.clone());
                sink
            })
            .collect();

        let sizes = [1usize, 127, 128, 129, 1000, 4096];
        for (i, size) in sizes.iter().enumerate() {
            let dest = (i % 3) as u8;
            let frame = heap_frame(&pattern(*size, i as u8)).unwrap();
            {
                let mut lock = frame.lock();
                lock.set_channel(dest + 4);
                lock.set_first_user(0x02);
                lock.set_last_user(0x01);
            }
            tx.application(dest).accept_frame(frame).unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || rx.frame_count() == sizes.len() as u64));
        assert_eq!(rx.drop_count(), 0);
        for (dest, sink) in sinks.iter().enumerate() {
            let expected: Vec<Vec<u8>> = sizes
                .iter()
                .enumerate()
                .filter(|(i, _)| i % 3 == dest)
                .map(|(i, size)| pattern(*size, i as u8))
                .collect();
            assert_eq!(sink.payloads(), expected, "version {version} dest {dest}");
            for frame in sink.frames() {
                assert_eq!(frame.channel, dest as u8 + 4);
                if version == 2 {
                    assert_eq!((frame.first_user, frame.last_user), (0x02, 0x01));
                }
            }
        }
    }
}

#[test]
fn wholly_lost_frame_leaves_receiver_clean() {
    init_tracing();
    let tx = Packetizer::new(config(2)).unwrap();
    let rx = Packetizer::new(config(2)).unwrap();
    let link = Arc::new(LossyLink::new(3, 1.0));
    connect(tx.as_ref(), link.clone());
    connect(link.as_ref(), rx.clone());
    let sink = Collector::new();
    connect(rx.application(0).as_ref(), sink.clone());

    tx.application(0).accept_frame(heap_frame(&pattern(300, 0)).unwrap()).unwrap();
    assert!(wait_until(Duration::from_secs(5), || link.lost() == 3));

    link.set_rate(0.0);
    let frame = pattern(300, 9);
    tx.application(0).accept_frame(heap_frame(&frame).unwrap()).unwrap();
    assert!(sink.wait_for(1, Duration::from_secs(5)));
    assert_eq!(sink.payloads(), vec![frame]);
    assert_eq!(rx.drop_count(), 0);
}
