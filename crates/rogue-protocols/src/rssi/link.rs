//! Threaded driver running a [`Controller`] between two stream graphs.
//!
//! A [`Link`] exposes two endpoints. The [`Transport`] side exchanges
//! segments with a datagram transport; the [`Application`] side carries
//! whole frames. One worker thread owns the controller: it feeds it inbound
//! segments, polls its timers and pulls application frames while the window
//! allows. A second thread hands received frames to the application so a
//! slow consumer never stalls acknowledgements; when its queue passes the
//! busy threshold the link advertises BUSY to the peer.

use std::{
    sync::{Arc, Weak},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use rogue_core::{
    BoundedQueue, Error, Result,
    stream::{AsMaster, FramePtr, Master, Slave},
};
use tracing::{debug, info, warn};

use super::controller::{Action, Controller, RssiConfig, RssiState, Role};

/// Upper bound on how long the worker sleeps between timer checks.
const MAX_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Event {
    Segment(Vec<u8>),
    Wake,
}

#[derive(Debug)]
struct Shared {
    controller: Mutex<Controller>,
    state: Mutex<RssiState>,
    state_cv: Condvar,
    events: BoundedQueue<Event>,
    app_tx: BoundedQueue<Vec<u8>>,
    app_rx: BoundedQueue<Vec<u8>>,
    transport: Arc<Transport>,
    application: Arc<Application>,
}

impl Shared {
    fn run(&self) {
        loop {
            let wait = {
                let controller = self.controller.lock();
                controller
                    .next_deadline()
                    .map_or(MAX_TICK, |at| at.saturating_duration_since(Instant::now()))
                    .min(MAX_TICK)
            };
            let event = match self.events.try_pop_for(wait) {
                Ok(event) => event,
                Err(_) => break,
            };

            let now = Instant::now();
            let mut controller = self.controller.lock();
            let mut actions = match event {
                Some(Event::Segment(bytes)) => controller.receive(now, &bytes),
                Some(Event::Wake) | None => Vec::new(),
            };
            actions.extend(controller.poll(now));
            actions.extend(controller.set_local_busy(now, self.app_rx.busy()));
            while controller.ready() {
                match self.app_tx.try_pop() {
                    Ok(Some(data)) => match controller.send(now, &data) {
                        Ok(sent) => actions.extend(sent),
                        Err(e) => warn!(error = %e, "rssi application frame dropped"),
                    },
                    Ok(None) | Err(_) => break,
                }
            }
            drop(controller);

            self.execute(actions);
        }
        debug!("rssi worker exiting");
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(bytes) => {
                    if let Err(e) = send_bytes(&self.transport.master, &bytes) {
                        warn!(error = %e, "rssi segment not sent");
                    }
                },
                Action::Deliver(data) => {
                    if self.app_rx.push(data).is_err() {
                        break;
                    }
                },
                Action::StateChanged(state) => {
                    *self.state.lock() = state;
                    self.state_cv.notify_all();
                },
            }
        }
    }

    fn deliver(&self) {
        while let Ok(data) = self.app_rx.pop() {
            if let Err(e) = send_bytes(&self.application.master, &data) {
                warn!(error = %e, "rssi frame not delivered");
            }
            // Re-evaluate BUSY now that the queue shrank
            if self.events.push(Event::Wake).is_err() {
                break;
            }
        }
        debug!("rssi delivery thread exiting");
    }
}

fn send_bytes(master: &Master, bytes: &[u8]) -> Result<()> {
    let frame = master.req_frame(bytes.len(), false)?;
    frame.lock().write(0, bytes)?;
    master.send_frame(frame);
    Ok(())
}

/// Reliable connection over a datagram transport.
#[derive(Debug)]
pub struct Link {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Link {
    /// Start a link that opens the connection.
    pub fn client(config: RssiConfig) -> Result<Arc<Self>> {
        Self::start(Role::Client, config)
    }

    /// Start a link that waits for a peer to connect.
    pub fn server(config: RssiConfig) -> Result<Arc<Self>> {
        Self::start(Role::Server, config)
    }

    fn start(role: Role, config: RssiConfig) -> Result<Arc<Self>> {
        let controller = Controller::new(role, Instant::now(), &config);
        let shared = Arc::new_cyclic(|core: &Weak<Shared>| Shared {
            controller: Mutex::new(controller),
            state: Mutex::new(RssiState::Closed),
            state_cv: Condvar::new(),
            events: BoundedQueue::new(0, 0),
            app_tx: BoundedQueue::new(config.app_queue_depth, 0),
            app_rx: BoundedQueue::new(0, config.busy_threshold),
            transport: Arc::new(Transport { master: Master::new(), core: core.clone() }),
            application: Arc::new(Application { master: Master::new(), core: core.clone() }),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("rogue-rssi".into()).spawn(move || shared.run())?
        };
        let delivery = {
            let shared = Arc::clone(&shared);
            thread::Builder::new().name("rogue-rssi-app".into()).spawn(move || shared.deliver())
        };
        let delivery = match delivery {
            Ok(handle) => handle,
            Err(e) => {
                shared.events.stop();
                let _ = worker.join();
                return Err(Error::Io(e));
            },
        };

        info!(?role, max_segment = config.max_segment, "rssi link started");
        Ok(Arc::new(Self { shared, workers: Mutex::new(vec![worker, delivery]) }))
    }

    /// Segment side; connect it to a datagram transport in both directions.
    pub fn transport(&self) -> Arc<Transport> {
        Arc::clone(&self.shared.transport)
    }

    /// Frame side; connect it to the application in both directions.
    pub fn application(&self) -> Arc<Application> {
        Arc::clone(&self.shared.application)
    }

    /// Connection state.
    pub fn state(&self) -> RssiState {
        *self.shared.state.lock()
    }

    /// Block until the connection is open. Returns false on timeout.
    pub fn wait_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while *state != RssiState::Open {
            if self.shared.state_cv.wait_until(&mut state, deadline).timed_out() {
                return *state == RssiState::Open;
            }
        }
        true
    }

    /// Segments retransmitted.
    pub fn retran_count(&self) -> u64 {
        self.shared.controller.lock().retran_count()
    }

    /// Times the open connection went down.
    pub fn down_count(&self) -> u64 {
        self.shared.controller.lock().down_count()
    }

    /// Malformed segments discarded.
    pub fn drop_count(&self) -> u64 {
        self.shared.controller.lock().drop_count()
    }

    /// Times BUSY was advertised.
    pub fn busy_count(&self) -> u64 {
        self.shared.controller.lock().busy_count()
    }

    /// Reset the peer and stop both threads.
    pub fn stop(&self) {
        if self.shared.events.is_stopped() {
            return;
        }
        let actions = self.shared.controller.lock().close(Instant::now());
        self.shared.execute(actions);

        self.shared.events.stop();
        self.shared.app_tx.stop();
        self.shared.app_rx.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Segment endpoint of a [`Link`].
#[derive(Debug)]
pub struct Transport {
    master: Master,
    core: Weak<Shared>,
}

impl AsMaster for Transport {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for Transport {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Stopped)?;
        let bytes = frame.lock().to_vec();
        core.events.push(Event::Segment(bytes))
    }
}

/// Frame endpoint of a [`Link`].
///
/// Sending blocks while the transmit queue is full.
#[derive(Debug)]
pub struct Application {
    master: Master,
    core: Weak<Shared>,
}

impl AsMaster for Application {
    fn master(&self) -> &Master {
        &self.master
    }
}

impl Slave for Application {
    fn accept_frame(&self, frame: FramePtr) -> Result<()> {
        let core = self.core.upgrade().ok_or(Error::Stopped)?;
        let bytes = frame.lock().to_vec();
        core.app_tx.push(bytes)?;
        core.events.push(Event::Wake)
    }
}
