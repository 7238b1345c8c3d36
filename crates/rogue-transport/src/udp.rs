//! UDP datagram transport.
//!
//! One frame maps to one datagram. Received datagrams land directly in
//! buffers from the endpoint's pool; outbound frames must fit in a single
//! datagram and are truncated (with [`ERROR_TRUNCATED`] set on the frame)
//! when they do not.

use std::{
    io::{self, ErrorKind},
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket},
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
};

use parking_lot::Mutex;
use rogue_core::{
    Error, Result,
    stream::{AsMaster, Frame, FramePtr, Master, Pool, Slave},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::POLL_INTERVAL;

/// Jumbo frame MTU.
pub const JUMBO_MTU: usize = 9000;
/// Largest frame sent on a jumbo link.
pub const JUMBO_PAYLOAD: usize = 8900;
/// Standard Ethernet MTU.
pub const STD_MTU: usize = 1500;
/// Largest frame sent on a standard link.
pub const STD_PAYLOAD: usize = 1400;
/// Error byte set on a frame that was cut to fit one datagram.
pub const ERROR_TRUNCATED: u8 = 0x80;

/// Socket sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Use jumbo frame sizes
    pub jumbo: bool,
    /// Datagrams the kernel receive buffer should hold
    pub rx_buffer_count: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { jumbo: false, rx_buffer_count: 256 }
    }
}

impl UdpConfig {
    /// Config with default sizing for the given MTU class.
    pub fn new(jumbo: bool) -> Self {
        Self { jumbo, ..Self::default() }
    }

    /// Link MTU.
    pub fn mtu(&self) -> usize {
        if self.jumbo { JUMBO_MTU } else { STD_MTU }
    }

    /// Largest outbound frame.
    pub fn max_payload(&self) -> usize {
        if self.jumbo { JUMBO_PAYLOAD } else { STD_PAYLOAD }
    }
}

/// Request a kernel receive buffer of `bytes`.
fn set_rx_buffer(socket: &UdpSocket, bytes: usize) -> io::Result<()> {
    let value = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    // SAFETY: the descriptor belongs to `socket`, which outlives the call;
    // the option pointer and length describe `value`, a live c_int.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            (&raw const value).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[derive(Debug)]
struct Core {
    socket: UdpSocket,
    peer: Mutex<Option<SocketAddr>>,
    follow_sender: bool,
    config: UdpConfig,
    master: Master,
    pool: Pool,
    stop: AtomicBool,
    rx_frames: AtomicU64,
    tx_frames: AtomicU64,
    dropped: AtomicU64,
}

impl Core {
    fn new(
        socket: UdpSocket,
        peer: Option<SocketAddr>,
        follow_sender: bool,
        config: UdpConfig,
    ) -> Result<Self> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let want = config.rx_buffer_count * config.mtu();
        if let Err(e) = set_rx_buffer(&socket, want) {
            warn!(bytes = want, error = %e, "receive buffer not resized");
        }
        let pool = Pool::new();
        pool.set_fixed_size(config.mtu());
        pool.set_pool_size(config.rx_buffer_count);
        Ok(Self {
            socket,
            peer: Mutex::new(peer),
            follow_sender,
            config,
            master: Master::new(),
            pool,
            stop: AtomicBool::new(false),
            rx_frames: AtomicU64::new(0),
            tx_frames: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    fn run(&self) {
        while !self.stop.load(Ordering::Acquire) {
            let mut buffer = match self.pool.alloc_buffer(self.config.mtu()) {
                Ok(buffer) => buffer,
                Err(e) => {
                    error!(error = %e, "no receive buffer");
                    thread::sleep(POLL_INTERVAL);
                    continue;
                },
            };
            let (len, from) = match self.socket.recv_from(buffer.window_mut()) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                },
                Err(e) => {
                    error!(error = %e, "udp receive failed");
                    thread::sleep(POLL_INTERVAL);
                    continue;
                },
            };
            if self.follow_sender {
                *self.peer.lock() = Some(from);
            }
            if let Err(e) = buffer.set_payload(len) {
                warn!(len, error = %e, "datagram dropped");
                continue;
            }
            let frame = Frame::new();
            frame.lock().append_buffer(buffer);
            self.rx_frames.fetch_add(1, Ordering::Relaxed);
            trace!(len, %from, "datagram received");
            self.master.send_frame(frame);
        }
        debug!("udp receive thread exiting");
    }

    fn send(&self, frame: &FramePtr) -> Result<()> {
        let Some(peer) = *self.peer.lock() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("no peer address yet, frame dropped");
            return Ok(());
        };

        let mut lock = frame.lock();
        let max = self.config.max_payload();
        let payload = lock.payload();
        if payload > max {
            warn!(len = payload, max, "frame truncated to one datagram");
            lock.set_error(ERROR_TRUNCATED);
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        let len = payload.min(max);
        let sent = if let [buffer] = lock.buffers() {
            self.socket.send_to(&buffer.data()[..len], peer)
        } else {
            let data = lock.to_vec();
            self.socket.send_to(&data[..len], peer)
        };
        drop(lock);

        match sent {
            Ok(_) => {
                self.tx_frames.fetch_add(1, Ordering::Relaxed);
                trace!(len, %peer, "datagram sent");
                Ok(())
            },
            Err(e) => {
                error!(%peer, error = %e, "udp send failed");
                Err(e.into())
            },
        }
    }
}

/// Receive thread plus the shared endpoint core.
#[derive(Debug)]
struct Endpoint {
    core: Arc<Core>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    fn start(core: Core) -> Result<Self> {
        let core = Arc::new(core);
        let worker = {
            let core = Arc::clone(&core);
            thread::Builder::new().name("rogue-udp".into()).spawn(move || core.run())?
        };
        Ok(Self { core, worker: Mutex::new(Some(worker)) })
    }

    fn stop(&self) {
        self.core.stop.store(true, Ordering::Release);
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

macro_rules! endpoint_common {
    ($ty:ty) => {
        impl $ty {
            /// Local port.
            pub fn port(&self) -> u16 {
                self.endpoint.core.socket.local_addr().map_or(0, |a| a.port())
            }

            /// Current destination of outbound frames.
            pub fn peer(&self) -> Option<SocketAddr> {
                *self.endpoint.core.peer.lock()
            }

            /// Largest outbound frame.
            pub fn max_payload(&self) -> usize {
                self.endpoint.core.config.max_payload()
            }

            /// Datagrams received.
            pub fn rx_count(&self) -> u64 {
                self.endpoint.core.rx_frames.load(Ordering::Relaxed)
            }

            /// Datagrams sent.
            pub fn tx_count(&self) -> u64 {
                self.endpoint.core.tx_frames.load(Ordering::Relaxed)
            }

            /// Outbound frames dropped or truncated.
            pub fn drop_count(&self) -> u64 {
                self.endpoint.core.dropped.load(Ordering::Relaxed)
            }

            /// Stop the receive thread. Outbound frames are still sent.
            pub fn stop(&self) {
                self.endpoint.stop();
            }
        }

        impl AsMaster for $ty {
            fn master(&self) -> &Master {
                &self.endpoint.core.master
            }
        }

        impl Slave for $ty {
            fn accept_frame(&self, frame: FramePtr) -> Result<()> {
                self.endpoint.core.send(&frame)
            }
        }

        impl Drop for $ty {
            fn drop(&mut self) {
                self.endpoint.stop();
            }
        }
    };
}

/// Bound socket that answers whoever sent to it last.
#[derive(Debug)]
pub struct Server {
    endpoint: Endpoint,
}

impl Server {
    /// Bind `0.0.0.0:port`; port 0 picks an ephemeral port.
    pub fn new(port: u16, jumbo: bool) -> Result<Arc<Self>> {
        Self::with_config(port, UdpConfig::new(jumbo))
    }

    /// Bind with explicit sizing.
    pub fn with_config(port: u16, config: UdpConfig) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        let core = Core::new(socket, None, true, config)?;
        let server = Self { endpoint: Endpoint::start(core)? };
        info!(port = server.port(), jumbo = config.jumbo, "udp server bound");
        Ok(Arc::new(server))
    }
}

endpoint_common!(Server);

/// Socket sending to a fixed remote endpoint.
#[derive(Debug)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    /// Send to `host:port` from an ephemeral local port.
    pub fn new(host: &str, port: u16, jumbo: bool) -> Result<Arc<Self>> {
        Self::with_config(host, port, UdpConfig::new(jumbo))
    }

    /// Connect with explicit sizing.
    pub fn with_config(host: &str, port: u16, config: UdpConfig) -> Result<Arc<Self>> {
        let peer = (host, port).to_socket_addrs()?.find(SocketAddr::is_ipv4).ok_or_else(|| {
            Error::Io(io::Error::new(ErrorKind::NotFound, format!("no IPv4 address for {host}")))
        })?;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let core = Core::new(socket, Some(peer), false, config)?;
        let client = Self { endpoint: Endpoint::start(core)? };
        info!(%peer, local = client.port(), "udp client ready");
        Ok(Arc::new(client))
    }
}

endpoint_common!(Client);

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rogue_core::stream::connect;

    use super::*;

    #[derive(Default)]
    struct Collector {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl Collector {
        fn wait_for(&self, count: usize) -> Vec<Vec<u8>> {
            let deadline = Instant::now() + Duration::from_secs(5);
            while self.frames.lock().len() < count && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            self.frames.lock().clone()
        }
    }

    impl Slave for Collector {
        fn accept_frame(&self, frame: FramePtr) -> Result<()> {
            self.frames.lock().push(frame.lock().to_vec());
            Ok(())
        }
    }

    fn frame(data: &[u8]) -> FramePtr {
        let frame = Pool::new().accept_req(data.len(), false, 0).unwrap();
        frame.lock().write(0, data).unwrap();
        frame
    }

    #[test]
    fn sizing_follows_mtu_class() {
        assert_eq!((UdpConfig::new(true).mtu(), UdpConfig::new(true).max_payload()), (9000, 8900));
        assert_eq!((UdpConfig::new(false).mtu(), UdpConfig::new(false).max_payload()), (1500, 1400));
    }

    #[test]
    fn config_round_trips_through_cbor() {
        let config = UdpConfig { jumbo: true, rx_buffer_count: 64 };
        let mut bytes = Vec::new();
        ciborium::into_writer(&config, &mut bytes).unwrap();
        let back: UdpConfig = ciborium::from_reader(bytes.as_slice()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn client_and_server_exchange_frames() {
        let server = Server::new(0, false).unwrap();
        let client = Client::new("127.0.0.1", server.port(), false).unwrap();
        let at_server = Arc::new(Collector::default());
        let at_client = Arc::new(Collector::default());
        connect(server.as_ref(), at_server.clone());
        connect(client.as_ref(), at_client.clone());

        client.accept_frame(frame(b"request")).unwrap();
        assert_eq!(at_server.wait_for(1), vec![b"request".to_vec()]);
        assert_eq!(server.peer().map(|p| p.port()), Some(client.port()));

        server.accept_frame(frame(b"reply")).unwrap();
        assert_eq!(at_client.wait_for(1), vec![b"reply".to_vec()]);
        assert_eq!((client.tx_count(), server.rx_count()), (1, 1));
    }

    #[test]
    fn oversized_frame_is_truncated_and_flagged() {
        let server = Server::new(0, false).unwrap();
        let client = Client::new("127.0.0.1", server.port(), false).unwrap();
        let sink = Arc::new(Collector::default());
        connect(server.as_ref(), sink.clone());

        let big = frame(&[0x5A; STD_PAYLOAD + 100]);
        client.accept_frame(big.clone()).unwrap();
        assert_eq!(big.lock().error(), ERROR_TRUNCATED);
        assert_eq!(client.drop_count(), 1);
        let received = sink.wait_for(1);
        assert_eq!(received[0].len(), STD_PAYLOAD);
    }

    #[test]
    fn server_without_peer_drops() {
        let server = Server::new(0, true).unwrap();
        server.accept_frame(frame(b"nowhere")).unwrap();
        assert_eq!(server.drop_count(), 1);
        assert_eq!(server.tx_count(), 0);
        server.stop();
        server.stop();
    }
}
