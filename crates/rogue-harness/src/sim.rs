//! Two RSSI controllers on a virtual clock.
//!
//! # Model
//!
//! ```text
//!   client ──Transmit──> [loss] ──> to_server ──receive──> server
//!   client <──receive── to_client <── [loss] <──Transmit── server
//! ```
//!
//! Segments in flight arrive with zero latency, in order, unless the loss
//! model eats them. When nothing is in flight the clock jumps straight to
//! the earlier of the two controllers' next deadlines, so retransmit and
//! keepalive timers cost no wall time. Each direction draws from its own
//! seeded RNG, so a run is a pure function of `(config, rate, seed)` and the
//! order in which the test sends.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use rogue_protocols::{
    RssiError,
    rssi::{Action, Controller, Role, RssiConfig, RssiState},
};
use tracing::trace;

use crate::fault::LossModel;

/// Smallest clock advance, so a deadline that is already due cannot stall
/// the simulation.
const TICK: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// Deterministic client/server RSSI pair.
#[derive(Debug)]
pub struct RssiSim {
    start: Instant,
    now: Instant,
    client: Controller,
    server: Controller,
    to_server: VecDeque<Vec<u8>>,
    to_client: VecDeque<Vec<u8>>,
    client_loss: LossModel,
    server_loss: LossModel,
    at_server: VecDeque<Vec<u8>>,
    at_client: VecDeque<Vec<u8>>,
    segments: u64,
    lost: u64,
}

impl RssiSim {
    /// Closed pair; the client starts its handshake on the first step.
    pub fn new(config: &RssiConfig, rate: f64, seed: u64) -> Self {
        let start = Instant::now();
        Self {
            start,
            now: start,
            client: Controller::new(Role::Client, start, config),
            server: Controller::new(Role::Server, start, config),
            to_server: VecDeque::new(),
            to_client: VecDeque::new(),
            client_loss: LossModel::new(seed, rate),
            server_loss: LossModel::new(seed ^ 0x5EED_0000_0000_0001, rate),
            at_server: VecDeque::new(),
            at_client: VecDeque::new(),
            segments: 0,
            lost: 0,
        }
    }

    /// Simulated time since creation.
    pub fn elapsed(&self) -> Duration {
        self.now - self.start
    }

    /// Client controller.
    pub fn client(&self) -> &Controller {
        &self.client
    }

    /// Server controller.
    pub fn server(&self) -> &Controller {
        &self.server
    }

    /// Segments put on the wire, lost ones included.
    pub fn segments(&self) -> u64 {
        self.segments
    }

    /// Segments the loss model ate.
    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// Change the loss rate of both directions.
    pub fn set_rate(&mut self, rate: f64) {
        self.client_loss.set_rate(rate);
        self.server_loss.set_rate(rate);
    }

    /// Both ends open.
    pub fn is_open(&self) -> bool {
        self.client.state() == RssiState::Open && self.server.state() == RssiState::Open
    }

    /// Send an application frame from the client.
    pub fn client_send(&mut self, payload: &[u8]) -> Result<(), RssiError> {
        let actions = self.client.send(self.now, payload)?;
        self.apply(Side::Client, actions);
        Ok(())
    }

    /// Send an application frame from the server.
    pub fn server_send(&mut self, payload: &[u8]) -> Result<(), RssiError> {
        let actions = self.server.send(self.now, payload)?;
        self.apply(Side::Server, actions);
        Ok(())
    }

    /// Frames the server has delivered since the last call.
    pub fn take_at_server(&mut self) -> Vec<Vec<u8>> {
        self.at_server.drain(..).collect()
    }

    /// Frames the client has delivered since the last call.
    pub fn take_at_client(&mut self) -> Vec<Vec<u8>> {
        self.at_client.drain(..).collect()
    }

    /// Advance the simulation.
    ///
    /// Delivers everything in flight if anything is; otherwise moves the
    /// clock to the next deadline and runs both controllers' timers.
    /// Returns false when neither side has anything left to do.
    pub fn step(&mut self) -> bool {
        if !self.to_server.is_empty() || !self.to_client.is_empty() {
            self.flush();
            return true;
        }
        let deadline = match (self.client.next_deadline(), self.server.next_deadline()) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => return false,
        };
        self.now = deadline.max(self.now + TICK);
        let actions = self.client.poll(self.now);
        self.apply(Side::Client, actions);
        let actions = self.server.poll(self.now);
        self.apply(Side::Server, actions);
        true
    }

    /// Step until `done` holds or `limit` of simulated time has passed.
    /// Returns whether `done` held.
    pub fn run_until(&mut self, limit: Duration, mut done: impl FnMut(&Self) -> bool) -> bool {
        let end = self.now + limit;
        while !done(self) {
            if self.now > end || !self.step() {
                return done(self);
            }
        }
        true
    }

    fn flush(&mut self) {
        loop {
            if let Some(segment) = self.to_server.pop_front() {
                let actions = self.server.receive(self.now, &segment);
                self.apply(Side::Server, actions);
            } else if let Some(segment) = self.to_client.pop_front() {
                let actions = self.client.receive(self.now, &segment);
                self.apply(Side::Client, actions);
            } else {
                break;
            }
        }
    }

    fn apply(&mut self, from: Side, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Transmit(bytes) => {
                    self.segments += 1;
                    let (loss, queue) = match from {
                        Side::Client => (&mut self.client_loss, &mut self.to_server),
                        Side::Server => (&mut self.server_loss, &mut self.to_client),
                    };
                    if loss.lose() {
                        self.lost += 1;
                        trace!(?from, len = bytes.len(), "segment lost");
                    } else {
                        queue.push_back(bytes);
                    }
                },
                Action::Deliver(data) => match from {
                    Side::Client => self.at_client.push_back(data),
                    Side::Server => self.at_server.push_back(data),
                },
                Action::StateChanged(state) => {
                    trace!(?from, ?state, elapsed = ?self.elapsed(), "state changed");
                },
            }
        }
    }
}
