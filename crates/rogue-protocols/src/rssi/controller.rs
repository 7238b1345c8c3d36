//! RSSI connection state machine.
//!
//! # Architecture: Action-Based State Machine
//!
//! The controller never touches a socket, a thread or a clock:
//! - Methods take the current time as a parameter
//! - Methods return the [`Action`]s the driver must perform
//! - The driver executes them (transmit bytes, deliver a frame to the
//!   application) and calls [`Controller::poll`] again by
//!   [`Controller::next_deadline`]
//!
//! # State Machine
//!
//! ```text
//!  client:  Closed ──SYN──> SynSent ──SYN+ACK / ACK──> Open
//!  server:  Closed <──SYN── (listen) ──SYN+ACK──> SynReceived ──ACK──> Open
//!
//!  Open ── RST / retransmit limit / peer silent ──> Closed
//! ```
//!
//! A client that drops back to `Closed` starts a new handshake after one
//! retransmit timeout. A server goes back to listening.
//!
//! # Reliability
//!
//! SYN, NUL and data segments consume a sequence number and stay in the
//! retransmit buffer until cumulatively acknowledged. The receiver accepts
//! only the next expected sequence number; anything ahead is dropped and
//! recovered by the sender's retransmit timer, anything behind is
//! re-acknowledged. Each segment is sent at most `max_retran + 1` times
//! before the connection is declared down.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use rogue_proto::rssi::{RssiFlags, RssiHeader, SynParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::RssiError;

/// Largest window that keeps 8-bit sequence comparisons unambiguous.
const MAX_WINDOW: u8 = 127;

/// Smallest segment that still carries a payload byte.
const MIN_SEGMENT: u16 = 16;

/// Connection configuration.
///
/// The protocol parameters are advertised in SYN; each side uses the
/// pairwise minimum. Timeouts are counted in `timeout_unit`s, a power of ten
/// of seconds (3 means milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RssiConfig {
    /// Maximum segments in flight
    pub max_outstanding: u8,
    /// Maximum segment size, header included
    pub max_segment: u16,
    /// Retransmit timeout
    pub retran_tout: u16,
    /// Delay before a cumulative ACK is forced
    pub cum_ack_tout: u16,
    /// Keepalive interval; three of them without traffic drop the link
    pub null_tout: u16,
    /// Retransmissions of one segment before giving up
    pub max_retran: u8,
    /// Segments received before an ACK is forced
    pub max_cum_ack: u8,
    /// Timeout unit exponent
    pub timeout_unit: u8,
    /// Connection identifier
    pub conn_id: u32,
    /// Application frames queued for transmission before senders block
    pub app_queue_depth: usize,
    /// Received frames queued for the application before BUSY is advertised
    pub busy_threshold: usize,
}

impl Default for RssiConfig {
    fn default() -> Self {
        Self {
            max_outstanding: 32,
            max_segment: 1400,
            retran_tout: 20,
            cum_ack_tout: 5,
            null_tout: 1000,
            max_retran: 15,
            max_cum_ack: 2,
            timeout_unit: 3,
            conn_id: 0x5253_5349,
            app_queue_depth: 32,
            busy_threshold: 64,
        }
    }
}

impl RssiConfig {
    fn syn_params(&self) -> SynParams {
        floored(SynParams {
            max_outstanding: self.max_outstanding,
            max_segment: self.max_segment,
            retran_tout: self.retran_tout,
            cum_ack_tout: self.cum_ack_tout,
            null_tout: self.null_tout,
            max_retran: self.max_retran,
            max_cum_ack: self.max_cum_ack,
            timeout_unit: self.timeout_unit,
            conn_id: self.conn_id,
        })
    }
}

/// Raise parameters to the smallest values the state machine can run with.
fn floored(params: SynParams) -> SynParams {
    SynParams {
        max_outstanding: params.max_outstanding.clamp(1, MAX_WINDOW),
        max_segment: params.max_segment.max(MIN_SEGMENT),
        retran_tout: params.retran_tout.max(1),
        cum_ack_tout: params.cum_ack_tout.max(1),
        null_tout: params.null_tout.max(1),
        max_cum_ack: params.max_cum_ack.max(1),
        timeout_unit: params.timeout_unit.min(9),
        ..params
    }
}

/// Which side opens the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends SYN
    Client,
    /// Waits for SYN
    Server,
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RssiState {
    /// No connection; a server is listening, a client will retry
    Closed,
    /// Client sent SYN
    SynSent,
    /// Server answered SYN
    SynReceived,
    /// Data may flow
    Open,
}

/// Work the driver must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Send these segment bytes on the transport
    Transmit(Vec<u8>),
    /// Hand this reassembled frame to the application
    Deliver(Vec<u8>),
    /// Connection state changed
    StateChanged(RssiState),
}

#[derive(Debug, Clone)]
struct Outstanding {
    seq: u8,
    bytes: Vec<u8>,
    sent_at: Instant,
    retries: u8,
}

/// RSSI state machine for one end of a connection.
#[derive(Debug, Clone)]
pub struct Controller {
    role: Role,
    state: RssiState,
    local: SynParams,
    params: SynParams,
    next_seq: u8,
    syn_seq: u8,
    rx_next: u8,
    has_rx: bool,
    retran: VecDeque<Outstanding>,
    tx_queue: VecDeque<(Vec<u8>, bool)>,
    partial: Vec<u8>,
    ack_pending: u8,
    ack_deadline: Option<Instant>,
    last_tx: Instant,
    last_rx: Instant,
    reopen_at: Option<Instant>,
    local_busy: bool,
    peer_busy: bool,
    retran_count: u64,
    down_count: u64,
    drop_count: u64,
    busy_count: u64,
}

impl Controller {
    /// Controller in `Closed`. A client starts its handshake on the first
    /// [`poll`](Self::poll).
    pub fn new(role: Role, now: Instant, config: &RssiConfig) -> Self {
        let local = config.syn_params();
        Self {
            role,
            state: RssiState::Closed,
            local,
            params: local,
            next_seq: 0,
            syn_seq: 0,
            rx_next: 0,
            has_rx: false,
            retran: VecDeque::new(),
            tx_queue: VecDeque::new(),
            partial: Vec::new(),
            ack_pending: 0,
            ack_deadline: None,
            last_tx: now,
            last_rx: now,
            reopen_at: (role == Role::Client).then_some(now),
            local_busy: false,
            peer_busy: false,
            retran_count: 0,
            down_count: 0,
            drop_count: 0,
            busy_count: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> RssiState {
        self.state
    }

    /// Role of this end.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Parameters in force: negotiated while open, local otherwise.
    pub fn params(&self) -> SynParams {
        self.params
    }

    /// Largest application payload carried by one segment.
    pub fn max_payload(&self) -> usize {
        self.params.max_segment as usize - RssiHeader::SIZE
    }

    /// Open and able to take another application frame.
    pub fn ready(&self) -> bool {
        self.state == RssiState::Open && self.tx_queue.len() < usize::from(self.params.max_outstanding)
    }

    /// Segments sent but not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.retran.len()
    }

    /// Segments retransmitted.
    pub fn retran_count(&self) -> u64 {
        self.retran_count
    }

    /// Times an open connection went down.
    pub fn down_count(&self) -> u64 {
        self.down_count
    }

    /// Malformed segments discarded.
    pub fn drop_count(&self) -> u64 {
        self.drop_count
    }

    /// Times local busy was asserted.
    pub fn busy_count(&self) -> u64 {
        self.busy_count
    }

    /// Whether the peer advertised busy in its last segment.
    pub fn peer_busy(&self) -> bool {
        self.peer_busy
    }

    fn unit(&self, count: u16) -> Duration {
        let exponent = 9 - u32::from(self.params.timeout_unit.min(9));
        Duration::from_nanos(u64::from(count) * 10u64.pow(exponent))
    }

    fn retran_timeout(&self) -> Duration {
        self.unit(self.params.retran_tout)
    }

    fn null_timeout(&self) -> Duration {
        self.unit(self.params.null_tout)
    }

    fn flags(&self) -> RssiFlags {
        let mut flags = RssiFlags::empty();
        if self.has_rx {
            flags |= RssiFlags::ACK;
        }
        if self.local_busy {
            flags |= RssiFlags::BUSY;
        }
        flags
    }

    fn encode(header: &RssiHeader, payload: &[u8]) -> Result<Vec<u8>, RssiError> {
        let size = header.size();
        let mut out = vec![0u8; size + payload.len()];
        header.encode(&mut out)?;
        out[size..].copy_from_slice(payload);
        Ok(out)
    }

    /// Send a sequence-consuming segment and keep it for retransmission.
    fn send_reliable(
        &mut self,
        now: Instant,
        mut header: RssiHeader,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) -> Result<(), RssiError> {
        let seq = self.next_seq;
        header.seq = seq;
        let bytes = Self::encode(&header, payload)?;
        self.next_seq = seq.wrapping_add(1);
        self.retran.push_back(Outstanding { seq, bytes: bytes.clone(), sent_at: now, retries: 0 });
        self.acked_now();
        self.last_tx = now;
        actions.push(Action::Transmit(bytes));
        Ok(())
    }

    fn send_ack(&mut self, now: Instant, actions: &mut Vec<Action>) -> Result<(), RssiError> {
        let header = RssiHeader::new(self.flags(), self.next_seq, self.rx_next.wrapping_sub(1));
        actions.push(Action::Transmit(Self::encode(&header, &[])?));
        self.acked_now();
        self.last_tx = now;
        Ok(())
    }

    fn acked_now(&mut self) {
        self.ack_pending = 0;
        self.ack_deadline = None;
    }

    fn set_state(&mut self, state: RssiState, actions: &mut Vec<Action>) {
        if self.state != state {
            self.state = state;
            actions.push(Action::StateChanged(state));
        }
    }

    fn start_handshake(&mut self, now: Instant, actions: &mut Vec<Action>) -> Result<(), RssiError> {
        self.reopen_at = None;
        self.has_rx = false;
        self.params = self.local;
        self.syn_seq = self.next_seq;
        let header = RssiHeader::syn(RssiFlags::empty(), 0, 0, self.local);
        self.send_reliable(now, header, &[], actions)?;
        debug!(conn_id = self.local.conn_id, seq = self.syn_seq, "rssi SYN sent");
        self.set_state(RssiState::SynSent, actions);
        Ok(())
    }

    fn accept_syn(
        &mut self,
        now: Instant,
        header: &RssiHeader,
        peer: &SynParams,
        actions: &mut Vec<Action>,
    ) -> Result<(), RssiError> {
        self.params = floored(self.local.negotiate(peer));
        self.rx_next = header.seq.wrapping_add(1);
        self.has_rx = true;
        self.last_rx = now;
        self.syn_seq = self.next_seq;
        let reply = RssiHeader::syn(self.flags(), 0, header.seq, self.params);
        self.send_reliable(now, reply, &[], actions)?;
        debug!(peer_conn = peer.conn_id, "rssi SYN received");
        self.set_state(RssiState::SynReceived, actions);
        Ok(())
    }

    fn open(&mut self, actions: &mut Vec<Action>) {
        self.retran.retain(|o| o.seq != self.syn_seq);
        info!(
            role = ?self.role,
            max_segment = self.params.max_segment,
            max_outstanding = self.params.max_outstanding,
            "rssi connection open"
        );
        self.set_state(RssiState::Open, actions);
    }

    fn go_down(&mut self, now: Instant, reason: &'static str, notify: bool, actions: &mut Vec<Action>) {
        let was_open = self.state == RssiState::Open;
        if notify && self.has_rx {
            let header = RssiHeader::new(RssiFlags::RST | RssiFlags::ACK, self.next_seq, self.rx_next.wrapping_sub(1));
            if let Ok(bytes) = Self::encode(&header, &[]) {
                actions.push(Action::Transmit(bytes));
            }
        }

        self.retran.clear();
        self.tx_queue.clear();
        self.partial.clear();
        self.acked_now();
        self.has_rx = false;
        self.peer_busy = false;
        self.params = self.local;
        self.reopen_at = (self.role == Role::Client).then(|| now + self.unit(self.local.retran_tout));

        if was_open {
            self.down_count += 1;
            warn!(role = ?self.role, reason, "rssi connection down");
        } else {
            debug!(role = ?self.role, reason, "rssi handshake abandoned");
        }
        self.set_state(RssiState::Closed, actions);
    }

    /// Queue an application frame, fragmenting it to the segment size.
    ///
    /// Empty frames cannot be told apart from a bare ACK on the wire and are
    /// discarded.
    pub fn send(&mut self, now: Instant, payload: &[u8]) -> Result<Vec<Action>, RssiError> {
        if self.state != RssiState::Open {
            return Err(RssiError::NotOpen);
        }
        if payload.is_empty() {
            trace!("empty frame discarded");
            return Ok(Vec::new());
        }
        let max = self.max_payload();
        let count = payload.len().div_ceil(max);
        for (index, chunk) in payload.chunks(max).enumerate() {
            self.tx_queue.push_back((chunk.to_vec(), index + 1 < count));
        }
        let mut actions = Vec::new();
        self.pump(now, &mut actions)?;
        Ok(actions)
    }

    fn pump(&mut self, now: Instant, actions: &mut Vec<Action>) -> Result<(), RssiError> {
        while !self.peer_busy && self.retran.len() < usize::from(self.params.max_outstanding) {
            let Some((data, more)) = self.tx_queue.pop_front() else { break };
            let mut header = RssiHeader::new(self.flags(), 0, self.rx_next.wrapping_sub(1));
            header.more = more;
            self.send_reliable(now, header, &data, actions)?;
        }
        Ok(())
    }

    /// Advertise (or stop advertising) that the local application is busy.
    pub fn set_local_busy(&mut self, now: Instant, busy: bool) -> Vec<Action> {
        let mut actions = Vec::new();
        if busy == self.local_busy {
            return actions;
        }
        self.local_busy = busy;
        if busy {
            self.busy_count += 1;
        }
        if self.state == RssiState::Open && self.send_ack(now, &mut actions).is_err() {
            actions.clear();
        }
        actions
    }

    /// Shut the connection down locally, sending RST if the peer is known.
    /// The controller stays closed; a client does not reconnect.
    pub fn close(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.state != RssiState::Closed {
            self.go_down(now, "closed locally", true, &mut actions);
        }
        self.reopen_at = None;
        actions
    }

    /// Process one received segment.
    pub fn receive(&mut self, now: Instant, bytes: &[u8]) -> Vec<Action> {
        let mut actions = Vec::new();
        let (header, size) = match RssiHeader::decode(bytes) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.drop_count += 1;
                debug!(error = %e, "malformed rssi segment");
                return actions;
            },
        };
        if let Err(e) = self.handle(now, &header, &bytes[size..], &mut actions) {
            warn!(error = %e, "rssi segment handling failed");
        }
        actions
    }

    fn handle(
        &mut self,
        now: Instant,
        header: &RssiHeader,
        payload: &[u8],
        actions: &mut Vec<Action>,
    ) -> Result<(), RssiError> {
        let is_ack = header.flags.contains(RssiFlags::ACK);

        if header.flags.contains(RssiFlags::RST) {
            if self.state != RssiState::Closed {
                self.go_down(now, "reset by peer", false, actions);
            }
            return Ok(());
        }

        match (self.state, header.syn) {
            (RssiState::Closed, Some(peer)) if self.role == Role::Server && !is_ack => {
                return self.accept_syn(now, header, &peer, actions);
            },
            (RssiState::Closed, _) => {
                trace!("segment while closed ignored");
                return Ok(());
            },
            (RssiState::SynSent, Some(peer)) if is_ack && header.ack == self.syn_seq => {
                self.params = floored(self.local.negotiate(&peer));
                self.rx_next = header.seq.wrapping_add(1);
                self.has_rx = true;
                self.last_rx = now;
                self.open(actions);
                return self.send_ack(now, actions);
            },
            (RssiState::SynSent, _) => return Ok(()),
            (RssiState::Open, Some(peer)) => {
                if self.role == Role::Server && !is_ack {
                    self.go_down(now, "peer restarted", false, actions);
                    return self.accept_syn(now, header, &peer, actions);
                }
                // Our ACK of the SYN+ACK was lost
                self.last_rx = now;
                return self.send_ack(now, actions);
            },
            (RssiState::SynReceived, Some(_)) => return Ok(()),
            (RssiState::SynReceived, None) => {
                if !(is_ack && header.ack.wrapping_sub(self.syn_seq) < 128) {
                    return Ok(());
                }
                self.open(actions);
            },
            (RssiState::Open, None) => {},
        }

        self.last_rx = now;
        self.peer_busy = header.flags.contains(RssiFlags::BUSY);
        if is_ack {
            self.process_ack(header.ack);
        }

        let consumes = !payload.is_empty() || header.flags.contains(RssiFlags::NUL);
        if consumes {
            let ahead = header.seq.wrapping_sub(self.rx_next);
            if ahead == 0 {
                self.rx_next = self.rx_next.wrapping_add(1);
                if !payload.is_empty() {
                    self.partial.extend_from_slice(payload);
                    if !header.more {
                        actions.push(Action::Deliver(std::mem::take(&mut self.partial)));
                    }
                }
                self.ack_pending = self.ack_pending.saturating_add(1);
                if header.flags.contains(RssiFlags::NUL) || self.ack_pending >= self.params.max_cum_ack {
                    self.send_ack(now, actions)?;
                } else if self.ack_deadline.is_none() {
                    self.ack_deadline = Some(now + self.unit(self.params.cum_ack_tout));
                }
            } else if ahead >= 128 {
                trace!(seq = header.seq, expected = self.rx_next, "duplicate segment");
                self.send_ack(now, actions)?;
            } else {
                trace!(seq = header.seq, expected = self.rx_next, "segment ahead of sequence dropped");
            }
        }

        self.pump(now, actions)
    }

    fn process_ack(&mut self, ack: u8) {
        while let Some(front) = self.retran.front() {
            if ack.wrapping_sub(front.seq) < 128 {
                self.retran.pop_front();
            } else {
                break;
            }
        }
    }

    /// Run timers: handshake retries, retransmission, delayed ACK,
    /// keepalive and liveness.
    pub fn poll(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Err(e) = self.run_timers(now, &mut actions) {
            warn!(error = %e, "rssi timer handling failed");
        }
        actions
    }

    fn run_timers(&mut self, now: Instant, actions: &mut Vec<Action>) -> Result<(), RssiError> {
        match self.state {
            RssiState::Closed => {
                if self.reopen_at.is_some_and(|at| now >= at) {
                    self.start_handshake(now, actions)?;
                }
                Ok(())
            },
            RssiState::SynSent | RssiState::SynReceived => {
                self.retransmit(now, actions);
                Ok(())
            },
            RssiState::Open => {
                if now.saturating_duration_since(self.last_rx) >= self.null_timeout() * 3 {
                    self.go_down(now, "peer silent", true, actions);
                    return Ok(());
                }
                if !self.retransmit(now, actions) {
                    return Ok(());
                }
                self.pump(now, actions)?;
                if self.ack_deadline.is_some_and(|at| now >= at) {
                    self.send_ack(now, actions)?;
                }
                // Frames held back by a busy peer do not suppress the
                // keepalive; its ACK carries the peer's current busy flag.
                if self.role == Role::Client
                    && self.retran.is_empty()
                    && now.saturating_duration_since(self.last_tx) >= self.null_timeout()
                {
                    let header = RssiHeader::new(self.flags() | RssiFlags::NUL, 0, self.rx_next.wrapping_sub(1));
                    self.send_reliable(now, header, &[], actions)?;
                    trace!("rssi keepalive sent");
                }
                Ok(())
            },
        }
    }

    /// Resend expired segments. Returns false when the retry limit was hit
    /// and the connection went down.
    fn retransmit(&mut self, now: Instant, actions: &mut Vec<Action>) -> bool {
        let timeout = self.retran_timeout();
        let limit = self.params.max_retran;
        let mut exhausted = false;
        for entry in &mut self.retran {
            if now.saturating_duration_since(entry.sent_at) < timeout {
                continue;
            }
            if entry.retries >= limit {
                exhausted = true;
                break;
            }
            entry.retries += 1;
            entry.sent_at = now;
            self.retran_count += 1;
            actions.push(Action::Transmit(entry.bytes.clone()));
        }
        if exhausted {
            self.go_down(now, "retransmit limit reached", true, actions);
            return false;
        }
        true
    }

    /// Earliest time at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = Vec::with_capacity(5);
        match self.state {
            RssiState::Closed => deadlines.extend(self.reopen_at),
            RssiState::SynSent | RssiState::SynReceived => {},
            RssiState::Open => {
                deadlines.push(self.last_rx + self.null_timeout() * 3);
                deadlines.extend(self.ack_deadline);
                if self.role == Role::Client && self.retran.is_empty() {
                    deadlines.push(self.last_tx + self.null_timeout());
                }
            },
        }
        let timeout = self.retran_timeout();
        deadlines.extend(self.retran.iter().map(|o| o.sent_at + timeout).min());
        deadlines.into_iter().min()
    }
}
