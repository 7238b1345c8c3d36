//! Register access over a stream link.
//!
//! An SRP bridge is a memory slave on one side and a stream node on the
//! other. Each transaction becomes one request frame tagged with the
//! transaction id; the response frame is matched back through the slave's
//! weak transaction map, so a transaction the master has already given up
//! on is dropped quietly.
//!
//! Connect the bridge's master to the link toward the device and the link's
//! return path to the bridge.

use std::{
    marker::PhantomData,
    ops::Range,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
};

use rogue_core::{
    memory::{self, Emulator, MemoryError, SlaveCore, TransactionPtr, TransactionType},
    stream::{self, AsMaster, FramePtr, Master},
};
use rogue_proto::{
    ProtocolError,
    srp::{Opcode, SrpV0Header, SrpV3Header, TAIL_SIZE, TailStatus, decode_tail},
};
use tracing::{debug, error, trace, warn};

/// Parsed response frame.
#[derive(Debug)]
pub struct Response {
    /// Transaction id
    pub tid: u32,
    /// Echoed opcode
    pub opcode: Opcode,
    /// Echoed address
    pub address: u64,
    /// Size claimed by the header, when the format carries one
    pub size: Option<u32>,
    /// Byte range of the data within the frame
    pub data: Range<usize>,
    /// Raw status tail
    pub status: u32,
}

/// One SRP wire version.
pub trait SrpVersion: Send + Sync + 'static {
    /// Name used in log events.
    const NAME: &'static str;
    /// Smallest access in bytes.
    const MIN_ACCESS: u32;
    /// Largest access in bytes.
    const MAX_ACCESS: u32;

    /// Build a request frame body.
    fn request(opcode: Opcode, tid: u32, address: u64, data: &[u8], size: u32) -> Result<Vec<u8>, MemoryError>;

    /// Parse a response frame body.
    fn response(bytes: &[u8]) -> Result<Response, ProtocolError>;
}

/// SRP version 0: word addressed, no posted writes.
#[derive(Debug)]
pub enum V0 {}

impl SrpVersion for V0 {
    const NAME: &'static str = "srp-v0";
    const MIN_ACCESS: u32 = 4;
    const MAX_ACCESS: u32 = 2048;

    fn request(opcode: Opcode, tid: u32, address: u64, data: &[u8], size: u32) -> Result<Vec<u8>, MemoryError> {
        if address % 4 != 0 || address >= SrpV0Header::ADDRESS_LIMIT {
            return Err(MemoryError::Address);
        }
        if size % 4 != 0 {
            return Err(MemoryError::Size);
        }
        let header = SrpV0Header { opcode, tid, address, size };
        let head = header.header_size();
        let body = if opcode == Opcode::Read { 0 } else { data.len() };
        let mut out = vec![0u8; head + body];
        header.encode(&mut out).map_err(|_| MemoryError::Size)?;
        out[head..].copy_from_slice(&data[..body]);
        Ok(out)
    }

    fn response(bytes: &[u8]) -> Result<Response, ProtocolError> {
        let min = SrpV0Header::WRITE_SIZE + TAIL_SIZE;
        if bytes.len() < min {
            return Err(ProtocolError::Truncated { need: min, have: bytes.len() });
        }
        let (tid, opcode, address) = SrpV0Header::decode_response(bytes)?;
        Ok(Response {
            tid,
            opcode,
            address,
            size: None,
            data: SrpV0Header::WRITE_SIZE..bytes.len() - TAIL_SIZE,
            status: decode_tail(bytes)?,
        })
    }
}

/// SRP version 3: byte addressed, 64-bit addresses, posted writes.
#[derive(Debug)]
pub enum V3 {}

impl SrpVersion for V3 {
    const NAME: &'static str = "srp-v3";
    const MIN_ACCESS: u32 = 4;
    const MAX_ACCESS: u32 = 4096;

    fn request(opcode: Opcode, tid: u32, address: u64, data: &[u8], size: u32) -> Result<Vec<u8>, MemoryError> {
        let header = SrpV3Header { opcode, tid, address, size, timeout: 0 };
        let bytes = header.encode().map_err(|_| MemoryError::Size)?;
        let mut out = Vec::with_capacity(header.request_size());
        out.extend_from_slice(&bytes);
        if opcode != Opcode::Read {
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    fn response(bytes: &[u8]) -> Result<Response, ProtocolError> {
        let min = SrpV3Header::SIZE + TAIL_SIZE;
        if bytes.len() < min {
            return Err(ProtocolError::Truncated { need: min, have: bytes.len() });
        }
        let header = SrpV3Header::decode(bytes)?;
        Ok(Response {
            tid: header.tid,
            opcode: header.opcode,
            address: header.address,
            size: Some(header.size),
            data: SrpV3Header::SIZE..bytes.len() - TAIL_SIZE,
            status: decode_tail(bytes)?,
        })
    }
}

/// Memory-to-stream bridge for one SRP version.
#[derive(Debug)]
pub struct Srp<V> {
    core: SlaveCore,
    master: Master,
    dropped: AtomicU64,
    version: PhantomData<fn() -> V>,
}

/// SRP version 0 bridge.
pub type SrpV0 = Srp<V0>;
/// SRP version 3 bridge.
pub type SrpV3 = Srp<V3>;

impl<V: SrpVersion> Default for Srp<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SrpVersion> Srp<V> {
    /// Unconnected bridge.
    pub fn new() -> Self {
        Self {
            core: SlaveCore::new(V::MIN_ACCESS, V::MAX_ACCESS),
            master: Master::new(),
            dropped: AtomicU64::new(0),
            version: PhantomData,
        }
    }

    /// Response frames discarded.
    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count_drop(&self, reason: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(version = V::NAME, reason, "srp response dropped");
    }

    fn complete(&self, bytes: &[u8], response: &Response) {
        let Some(tran) = self.core.get_transaction(response.tid) else {
            self.count_drop("unknown transaction id");
            return;
        };
        self.core.del_transaction(response.tid);
        let mut lock = tran.lock();
        if lock.is_done() {
            trace!(tid = response.tid, "response for completed transaction");
            return;
        }

        let expected = match tran.kind() {
            TransactionType::Read | TransactionType::Verify => Opcode::Read,
            TransactionType::Write | TransactionType::Post => Opcode::Write,
        };
        let opcode_ok = response.opcode == expected || response.opcode == Opcode::Posted;
        if !opcode_ok || response.address != lock.address() {
            debug!(
                tid = response.tid,
                address = response.address,
                expected = lock.address(),
                "srp response header mismatch"
            );
            lock.done(Err(MemoryError::Protocol));
            return;
        }

        match TailStatus::from_word(response.status) {
            TailStatus::Ok => {},
            TailStatus::Timeout => {
                lock.done(Err(MemoryError::BusTimeout));
                return;
            },
            TailStatus::Fail(status) => {
                debug!(tid = response.tid, status, "srp bus failure");
                lock.done(Err(MemoryError::BusFail));
                return;
            },
        }

        let size = tran.size();
        let data = &bytes[response.data.clone()];
        if response.size.is_some_and(|s| s != size) || data.len() != size as usize {
            debug!(tid = response.tid, got = data.len(), size, "srp response size mismatch");
            lock.done(Err(MemoryError::Protocol));
            return;
        }
        if expected == Opcode::Read {
            lock.data_mut().copy_from_slice(data);
        }
        lock.done(Ok(()));
    }
}

impl<V: SrpVersion> memory::Slave for Srp<V> {
    fn core(&self) -> &SlaveCore {
        &self.core
    }

    fn do_transaction(&self, tran: TransactionPtr) {
        let opcode = match tran.kind() {
            TransactionType::Read | TransactionType::Verify => Opcode::Read,
            TransactionType::Write => Opcode::Write,
            TransactionType::Post => Opcode::Posted,
        };
        let request = {
            let lock = tran.lock();
            V::request(opcode, tran.id(), lock.address(), lock.data(), tran.size())
        };
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                self.core.del_transaction(tran.id());
                tran.error(e);
                return;
            },
        };

        let frame = match self.master.req_frame(request.len(), false) {
            Ok(frame) => frame,
            Err(e) => {
                error!(version = V::NAME, error = %e, "srp request allocation failed");
                self.core.del_transaction(tran.id());
                tran.error(MemoryError::Unsupported);
                return;
            },
        };
        if let Err(e) = frame.lock().write(0, &request) {
            error!(version = V::NAME, error = %e, "srp request write failed");
            self.core.del_transaction(tran.id());
            tran.error(MemoryError::Unsupported);
            return;
        }
        trace!(version = V::NAME, tid = tran.id(), ?opcode, len = request.len(), "srp request");
        // The transaction lock is released here; a synchronous peer may answer
        // before send_frame returns.
        self.master.send_frame(frame);
    }
}

impl<V: SrpVersion> AsMaster for Srp<V> {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl<V: SrpVersion> stream::Slave for Srp<V> {
    fn accept_frame(&self, frame: FramePtr) -> rogue_core::Result<()> {
        let bytes = {
            let lock = frame.lock();
            if lock.error() != 0 {
                drop(lock);
                self.count_drop("frame error set");
                return Ok(());
            }
            lock.to_vec()
        };
        match V::response(&bytes) {
            Ok(response) => self.complete(&bytes, &response),
            Err(e) => {
                debug!(version = V::NAME, error = %e, "malformed srp response");
                self.count_drop("malformed response");
            },
        }
        Ok(())
    }
}

/// SRP v3 responder backed by an [`Emulator`].
///
/// Stands in for the device end of a link: requests arrive on its slave
/// side and responses leave through its master.
#[derive(Debug)]
pub struct SrpV3Emulation {
    memory: Emulator,
    master: Master,
    status: AtomicU32,
}

impl Default for SrpV3Emulation {
    fn default() -> Self {
        Self::new()
    }
}

impl SrpV3Emulation {
    /// Responder with empty memory.
    pub fn new() -> Self {
        Self { memory: Emulator::new(4, V3::MAX_ACCESS), master: Master::new(), status: AtomicU32::new(0) }
    }

    /// Backing memory.
    pub fn memory(&self) -> &Emulator {
        &self.memory
    }

    /// Force the status tail of every later response (zero for success).
    pub fn set_status(&self, status: u32) {
        self.status.store(status, Ordering::Relaxed);
    }

    fn respond(&self, request: &[u8]) -> Result<Option<Vec<u8>>, ProtocolError> {
        let header = SrpV3Header::decode(request)?;
        let size = header.size as usize;
        let status = self.status.load(Ordering::Relaxed);

        match header.opcode {
            Opcode::Read => {},
            Opcode::Write | Opcode::Posted => {
                let data = request
                    .get(SrpV3Header::SIZE..SrpV3Header::SIZE + size)
                    .ok_or(ProtocolError::Truncated { need: SrpV3Header::SIZE + size, have: request.len() })?;
                if status == 0 {
                    self.memory.poke(header.address, data);
                }
            },
        }
        if header.opcode == Opcode::Posted {
            return Ok(None);
        }

        let mut out = Vec::with_capacity(SrpV3Header::SIZE + size + TAIL_SIZE);
        out.extend_from_slice(&request[..SrpV3Header::SIZE]);
        if status == 0 {
            out.extend_from_slice(&self.memory.peek(header.address, size));
        }
        out.extend_from_slice(&status.to_le_bytes());
        Ok(Some(out))
    }
}

impl AsMaster for SrpV3Emulation {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl stream::Slave for SrpV3Emulation {
    fn accept_frame(&self, frame: FramePtr) -> rogue_core::Result<()> {
        let request = frame.lock().to_vec();
        let Some(response) = self.respond(&request)? else {
            return Ok(());
        };
        let out = self.master.req_frame(response.len(), false)?;
        out.lock().write(0, &response)?;
        self.master.send_frame(out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rogue_core::{
        Result,
        memory::{Master as MemMaster, Slave as _},
        stream::{NullSlave, Pool, Slave as _, connect},
    };

    use super::*;

    fn v3_loop() -> (MemMaster, Arc<SrpV3>, Arc<SrpV3Emulation>) {
        let srp = Arc::new(SrpV3::new());
        let peer = Arc::new(SrpV3Emulation::new());
        connect(srp.as_ref(), peer.clone());
        connect(peer.as_ref(), srp.clone());
        let master = MemMaster::new();
        master.set_slave(srp.clone());
        (master, srp, peer)
    }

    #[test]
    fn v3_write_then_read() {
        let (master, srp, peer) = v3_loop();

        master.write(0x20, vec![0xEF, 0xBE, 0xAD, 0xDE]).unwrap();
        let data = master.read(0x20, 4).unwrap();

        assert_eq!(u32::from_le_bytes(data.try_into().unwrap()), 0xDEAD_BEEF);
        assert_eq!(master.get_error(), 0);
        assert_eq!(peer.memory().peek(0x20, 4), [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(srp.core().pending(), 0);
    }

    #[test]
    fn v3_posted_write_lands() {
        let (master, _srp, peer) = v3_loop();
        master.post(0x100, vec![1, 2, 3, 4]).unwrap();
        assert_eq!(peer.memory().peek(0x100, 4), [1, 2, 3, 4]);
    }

    #[test]
    fn v3_verify_passes_through_read_back() {
        let (master, _srp, _peer) = v3_loop();
        master.write_verify(0x40, vec![9; 8]).unwrap();
    }

    #[test]
    fn bus_status_maps_to_errors() {
        let (master, _srp, peer) = v3_loop();

        peer.set_status(rogue_proto::srp::TAIL_TIMEOUT);
        assert_eq!(master.read(0, 4), Err(MemoryError::BusTimeout));

        peer.set_status(0x2);
        assert_eq!(master.read(0, 4), Err(MemoryError::BusFail));
        assert_eq!(master.get_error(), MemoryError::BusTimeout.code() | MemoryError::BusFail.code());
    }

    #[test]
    fn lost_response_times_out() {
        let srp = Arc::new(SrpV3::new());
        let sink = Arc::new(NullSlave::new());
        connect(srp.as_ref(), sink.clone());
        let master = MemMaster::new();
        master.set_slave(srp.clone());
        master.set_timeout(5_000);

        assert_eq!(master.read(0, 4), Err(MemoryError::Timeout));
        assert_eq!(sink.frame_count(), 1);
    }

    #[test]
    fn unknown_tid_is_dropped() {
        let srp = SrpV3::new();
        let header = SrpV3Header { opcode: Opcode::Read, tid: 0xFFFF_0000, address: 0, size: 4, timeout: 0 };
        let mut bytes = header.encode().unwrap().to_vec();
        bytes.extend_from_slice(&[0; 8]);

        let frame = Pool::new().accept_req(bytes.len(), false, 0).unwrap();
        frame.lock().write(0, &bytes).unwrap();
        srp.accept_frame(frame).unwrap();
        assert_eq!(srp.drop_count(), 1);
    }

    /// Answers v0 requests with a fixed read word.
    struct V0Device {
        out: Master,
        word: u32,
        short: bool,
    }

    impl stream::Slave for V0Device {
        fn accept_frame(&self, frame: FramePtr) -> rogue_core::Result<()> {
            let request = frame.lock().to_vec();
            let op = u32::from_le_bytes([request[4], request[5], request[6], request[7]]) >> 30;
            let mut response = request[..8].to_vec();
            if op == 0 {
                let words = u32::from_le_bytes([request[8], request[9], request[10], request[11]]) + 1;
                let count = if self.short { words - 1 } else { words };
                for _ in 0..count {
                    response.extend_from_slice(&self.word.to_le_bytes());
                }
            } else {
                response.extend_from_slice(&request[8..]);
            }
            response.extend_from_slice(&0u32.to_le_bytes());
            let out = self.out.req_frame(response.len(), false)?;
            out.lock().write(0, &response)?;
            self.out.send_frame(out);
            Ok(())
        }
    }

    fn v0_loop(short: bool) -> MemMaster {
        let srp = Arc::new(SrpV0::new());
        let device = Arc::new(V0Device { out: Master::new(), word: 0x1234_5678, short });
        connect(srp.as_ref(), device.clone());
        device.out.add_slave(srp.clone());
        let master = MemMaster::new();
        master.set_slave(srp);
        master.set_timeout(50_000);
        master
    }

    #[test]
    fn v0_read_and_write() {
        let master = v0_loop(false);
        assert_eq!(master.read(0x10, 8).unwrap(), [0x78, 0x56, 0x34, 0x12, 0x78, 0x56, 0x34, 0x12]);
        master.write(0x10, vec![0; 4]).unwrap();
    }

    #[test]
    fn v0_short_response_is_a_protocol_error() {
        let master = v0_loop(true);
        assert_eq!(master.read(0x10, 8), Err(MemoryError::Protocol));
    }

    #[test]
    fn v0_rejects_unaligned_addresses() {
        let master = v0_loop(false);
        assert_eq!(master.read(0x11, 4), Err(MemoryError::Address));
    }

    #[test]
    fn v3_request_bytes() {
        let request = V3::request(Opcode::Write, 7, 0x20, &[0xAA; 4], 4).unwrap();
        assert_eq!(request.len(), 24);
        assert_eq!(&request[20..], &[0xAA; 4]);
        let read = V3::request(Opcode::Read, 7, 0x20, &[0; 4], 4).unwrap();
        assert_eq!(read.len(), 20);
    }
}
