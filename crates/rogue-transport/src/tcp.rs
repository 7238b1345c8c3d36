//! Two-channel TCP frame bridge.
//!
//! A bridge pair uses two ports. The server listens for inbound frames on
//! `port` and publishes outbound frames on `port + 1`; the client connects
//! crosswise. Each frame is sent as a length-prefixed envelope that keeps
//! its flags, error and channel, so a stream graph can be split across
//! hosts without losing metadata.
//!
//! Connections are one peer per channel. The server serves the most recent
//! inbound connection and sends to the most recent outbound subscriber; a
//! client redials whenever a channel drops. Frames sent while no outbound
//! connection exists are dropped and counted.

use std::{
    io::{self, ErrorKind, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use rogue_core::{
    Error, Result,
    stream::{AsMaster, Frame, FramePtr, Master, Pool, Slave},
};
use rogue_proto::tcp::{Envelope, PREFIX_SIZE, decode_prefix};
use tracing::{debug, info, trace, warn};

use crate::POLL_INTERVAL;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Shared {
    master: Master,
    pool: Pool,
    outbound: Mutex<Option<TcpStream>>,
    dial: Option<SocketAddr>,
    stop: AtomicBool,
    rx_frames: AtomicU64,
    tx_frames: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn new(dial: Option<SocketAddr>) -> Self {
        Self {
            master: Master::new(),
            pool: Pool::new(),
            outbound: Mutex::new(None),
            dial,
            stop: AtomicBool::new(false),
            rx_frames: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Fill `buf`, riding out read timeouts. `Ok(false)` on a clean EOF
    /// before the first byte or on shutdown.
    fn read_full(&self, stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.stopped() {
                return Ok(false);
            }
            match stream.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(ErrorKind::UnexpectedEof.into()),
                Ok(n) => filled += n,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn read_frame(&self, stream: &mut TcpStream) -> Result<Option<FramePtr>> {
        let mut prefix = [0u8; PREFIX_SIZE];
        if !self.read_full(stream, &mut prefix)? {
            return Ok(None);
        }
        let len = decode_prefix(prefix)?;
        let mut head = [0u8; Envelope::SIZE];
        if !self.read_full(stream, &mut head)? {
            return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
        }
        let envelope = Envelope::decode(&head)?;

        let size = len - Envelope::SIZE;
        let frame = Frame::new();
        {
            let mut lock = frame.lock();
            if size > 0 {
                let mut buffer = self.pool.alloc_buffer(size)?;
                if !self.read_full(stream, &mut buffer.window_mut()[..size])? {
                    return Err(Error::Io(ErrorKind::UnexpectedEof.into()));
                }
                buffer.set_payload(size)?;
                lock.append_buffer(buffer);
            }
            lock.set_flags(envelope.flags);
            lock.set_error(envelope.error);
            lock.set_channel(envelope.channel);
        }
        Ok(Some(frame))
    }

    /// Forward frames from one connection until it closes.
    fn pump(&self, mut stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL)) {
            warn!(%peer, error = %e, "inbound connection unusable");
            return;
        }
        loop {
            match self.read_frame(&mut stream) {
                Ok(Some(frame)) => {
                    self.rx_frames.fetch_add(1, Ordering::Relaxed);
                    trace!(%peer, "bridged frame received");
                    self.master.send_frame(frame);
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(%peer, error = %e, "inbound connection dropped");
                    break;
                },
            }
        }
        debug!(%peer, "inbound connection closed");
    }

    /// Server side: serve one inbound connection at a time.
    fn serve_inbound(&self, listener: &TcpListener) {
        while let Some((stream, peer)) = self.accept(listener) {
            info!(%peer, "bridge inbound connected");
            self.pump(stream, peer);
        }
    }

    /// Server side: the newest subscriber replaces the previous one.
    fn serve_outbound(&self, listener: &TcpListener) {
        while let Some((stream, peer)) = self.accept(listener) {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "nodelay not set");
            }
            info!(%peer, "bridge outbound connected");
            *self.outbound.lock() = Some(stream);
        }
    }

    /// Client side: keep the inbound channel dialed.
    fn dial_inbound(&self, addr: SocketAddr) {
        while !self.stopped() {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    info!(%addr, "bridge inbound connected");
                    self.pump(stream, addr);
                },
                Err(e) => {
                    trace!(%addr, error = %e, "bridge dial failed");
                    thread::sleep(POLL_INTERVAL);
                },
            }
        }
    }

    fn accept(&self, listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
        while !self.stopped() {
            match listener.accept() {
                Ok((stream, peer)) => match stream.set_nonblocking(false) {
                    Ok(()) => return Some((stream, peer)),
                    Err(e) => warn!(%peer, error = %e, "connection rejected"),
                },
                Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(POLL_INTERVAL);
                },
            }
        }
        None
    }

    fn encode(frame: &FramePtr) -> Result<Vec<u8>> {
        let lock = frame.lock();
        let envelope =
            Envelope { flags: lock.flags(), error: lock.error(), channel: lock.channel() };
        let payload = lock.payload();
        let prefix = envelope.encode_with_prefix(payload)?;
        let mut wire = Vec::with_capacity(prefix.len() + payload);
        wire.extend_from_slice(&prefix);
        for chunk in lock.begin_read().chunks() {
            wire.extend_from_slice(chunk);
        }
        Ok(wire)
    }

    fn send(&self, frame: &FramePtr) -> Result<()> {
        let wire = Self::encode(frame)?;
        let mut outbound = self.outbound.lock();
        if outbound.is_none() {
            if let Some(addr) = self.dial {
                match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                    Ok(stream) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%addr, error = %e, "nodelay not set");
                        }
                        info!(%addr, "bridge outbound connected");
                        *outbound = Some(stream);
                    },
                    Err(e) => debug!(%addr, error = %e, "bridge dial failed"),
                }
            }
        }
        let Some(stream) = outbound.as_mut() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("no outbound connection, frame dropped");
            return Ok(());
        };
        if let Err(e) = stream.write_all(&wire) {
            warn!(error = %e, "outbound connection dropped");
            *outbound = None;
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.tx_frames.fetch_add(1, Ordering::Relaxed);
        trace!(len = wire.len(), "bridged frame sent");
        Ok(())
    }
}

#[derive(Debug)]
struct Bridge {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    fn spawn(
        shared: &Arc<Shared>,
        workers: &mut Vec<JoinHandle<()>>,
        name: &str,
        f: impl FnOnce(&Shared) + Send + 'static,
    ) -> Result<()> {
        let worker = {
            let shared = Arc::clone(shared);
            thread::Builder::new().name(name.into()).spawn(move || f(&shared))
        };
        match worker {
            Ok(worker) => {
                workers.push(worker);
                Ok(())
            },
            Err(e) => {
                shared.stop.store(true, Ordering::Release);
                for worker in workers.drain(..) {
                    let _ = worker.join();
                }
                Err(Error::Io(e))
            },
        }
    }

    fn stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(stream) = self.shared.outbound.lock().take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

fn resolve(addr: &str, port: u16) -> Result<SocketAddr> {
    let host = if addr == "*" { "0.0.0.0" } else { addr };
    (host, port).to_socket_addrs()?.find(SocketAddr::is_ipv4).ok_or_else(|| {
        Error::Io(io::Error::new(ErrorKind::NotFound, format!("no IPv4 address for {addr}")))
    })
}

fn next_port(port: u16) -> Result<u16> {
    port.checked_add(1).ok_or(Error::Size(usize::from(port)))
}

macro_rules! bridge_common {
    ($ty:ty) => {
        impl $ty {
            /// Frames received from the peer.
            pub fn rx_count(&self) -> u64 {
                self.bridge.shared.rx_frames.load(Ordering::Relaxed)
            }

            /// Frames sent to the peer.
            pub fn tx_count(&self) -> u64 {
                self.bridge.shared.tx_frames.load(Ordering::Relaxed)
            }

            /// Outbound frames dropped for lack of a connection.
            pub fn drop_count(&self) -> u64 {
                self.bridge.shared.dropped.load(Ordering::Relaxed)
            }

            /// Whether an outbound connection is up.
            pub fn is_connected(&self) -> bool {
                self.bridge.shared.outbound.lock().is_some()
            }

            /// Close connections and join worker threads.
            pub fn stop(&self) {
                self.bridge.stop();
            }
        }

        impl AsMaster for $ty {
            fn master(&self) -> &Master {
                &self.bridge.shared.master
            }
        }

        impl Slave for $ty {
            fn accept_frame(&self, frame: FramePtr) -> Result<()> {
                if self.bridge.shared.stopped() {
                    return Err(Error::Stopped);
                }
                self.bridge.shared.send(&frame)
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                self.bridge.stop();
            }
        }
    };
}

/// Listening side of a bridge.
#[derive(Debug)]
pub struct Server {
    bridge: Bridge,
    port: u16,
}

impl Server {
    /// Listen on `addr:port` (inbound) and `addr:port+1` (outbound).
    /// `addr` of `"*"` listens on every interface.
    pub fn new(addr: &str, port: u16) -> Result<Arc<Self>> {
        let inbound = TcpListener::bind(resolve(addr, port)?)?;
        let outbound = TcpListener::bind(resolve(addr, next_port(port)?)?)?;
        inbound.set_nonblocking(true)?;
        outbound.set_nonblocking(true)?;

        let shared = Arc::new(Shared::new(None));
        let mut workers = Vec::new();
        Bridge::spawn(&shared, &mut workers, "rogue-tcp-in", move |s| s.serve_inbound(&inbound))?;
        Bridge::spawn(&shared, &mut workers, "rogue-tcp-out", move |s| {
            s.serve_outbound(&outbound);
        })?;
        info!(addr, port, "tcp bridge server listening");
        Ok(Arc::new(Self { bridge: Bridge { shared, workers: Mutex::new(workers) }, port }))
    }

    /// Inbound port; outbound frames leave on the next port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

bridge_common!(Server);

/// Dialing side of a bridge.
#[derive(Debug)]
pub struct Client {
    bridge: Bridge,
}

impl Client {
    /// Bridge to a server at `addr` whose inbound port is `port`.
    pub fn new(addr: &str, port: u16) -> Result<Arc<Self>> {
        let to_server = resolve(addr, port)?;
        let from_server = resolve(addr, next_port(port)?)?;

        let shared = Arc::new(Shared::new(Some(to_server)));
        let mut workers = Vec::new();
        Bridge::spawn(&shared, &mut workers, "rogue-tcp-in", move |s| s.dial_inbound(from_server))?;
        info!(%to_server, "tcp bridge client started");
        Ok(Arc::new(Self { bridge: Bridge { shared, workers: Mutex::new(workers) } }))
    }
}

bridge_common!(Client);
