//! Per-peer TCPCL state machine.
//!
//! Every machine runs on its own thread and consumes a bounded event queue. Blocking work lives
//! in helper tasks that feed the same queue: a connect task while connecting and a receiver task
//! per connection. Timers are deadlines checked between events, so the machine itself never
//! blocks on anything but its queue.

mod event;
mod initiator;
mod session;
mod timer;

use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::block::{Block, Fragmenter, Reassembler};
use crate::config::PeerConfig;
use crate::context::Context;
use crate::error::{BlockError, Error, ProtocolError};
use crate::link::LinkId;
use crate::peer::PeerId;
use crate::segment::{self, ContactHeader, DataSegment, Segment, Shutdown, ShutdownReason};
use crate::stats;
use crate::task::{self, Task};

pub(crate) use event::Event;
use session::Session;
use timer::{TimerKind, Timers};

/// State of a connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stopped,
    Idle,
    ConnInitiator,
    WaitHeader,
    WaitBlockToSend,
    WaitAck,
    DelayBeforeReconnect,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Stopped => "STOPPED",
            State::Idle => "IDLE",
            State::ConnInitiator => "CONN_INITIATOR",
            State::WaitHeader => "WAIT_HEADER",
            State::WaitBlockToSend => "WAIT_BLOCK_TO_SEND",
            State::WaitAck => "WAIT_ACK",
            State::DelayBeforeReconnect => "DELAY_BEFORE_RECONNECT",
        }
    }

    /// Whether a connection is open in this state.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            State::WaitHeader | State::WaitBlockToSend | State::WaitAck
        )
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Initiator => f.write_str("initiator"),
            Role::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Effective settings of one connection, derived from both Contact Headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedParameters {
    pub ack_data_segments: bool,
    /// Never negotiated on.
    pub reactive_fragmentation: bool,
    pub nack_supported: bool,
    /// Zero disables keepalives.
    pub keepalive_secs: u16,
    /// Zero disables the idle timeout.
    pub idle_timeout_secs: u32,
}

impl NegotiatedParameters {
    pub fn negotiate(local: &PeerConfig, peer: &ContactHeader) -> Self {
        let keepalive_secs = local.keep_alive_interval_secs.min(peer.keepalive_secs);

        let idle_timeout_secs = match keepalive_secs as u32 * 2 {
            0 => 0,
            twice if local.idle_connection_shutdown => {
                twice.max(local.idle_connection_shutdown_delay_secs)
            }
            twice => twice,
        };

        Self {
            ack_data_segments: local.ack_data_segments && peer.offers_acks(),
            reactive_fragmentation: false,
            nack_supported: peer.offers_nacks(),
            keepalive_secs,
            idle_timeout_secs,
        }
    }

    fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs as u64))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs as u64))
    }
}

/// Observable state of a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub role: Role,
    pub state: State,
    /// Blocks waiting for transmission, the one being sent excluded.
    pub pending: usize,
    /// Whether a block is being transmitted.
    pub in_flight: bool,
    /// Parameters of the live connection, once negotiated.
    pub negotiated: Option<NegotiatedParameters>,
    /// The machine's thread has ended.
    pub terminated: bool,
}

/// Owner-side handle of a state machine. Dropping it terminates the machine.
pub(crate) struct MachineHandle {
    sender: Sender<Event>,
    status: Arc<Mutex<Status>>,
    task: Mutex<Option<Task>>,
    join_timeout: Duration,
}

impl MachineHandle {
    /// Spawns an initiator machine in STOPPED.
    pub fn spawn_initiator(
        context: Arc<Context>,
        peer: PeerId,
        config: PeerConfig,
    ) -> io::Result<Self> {
        Self::spawn(context, peer, config, Role::Initiator, None)
    }

    /// Spawns an acceptor machine that serves an accepted connection.
    pub fn spawn_acceptor(
        context: Arc<Context>,
        peer: PeerId,
        config: PeerConfig,
        stream: TcpStream,
        link: LinkId,
    ) -> io::Result<Self> {
        Self::spawn(context, peer, config, Role::Acceptor, Some((stream, link)))
    }

    fn spawn(
        context: Arc<Context>,
        peer: PeerId,
        config: PeerConfig,
        role: Role,
        accepted: Option<(TcpStream, LinkId)>,
    ) -> io::Result<Self> {
        let timeouts = context.config.timeouts;
        let (sender, receiver) = crossbeam_channel::bounded(timeouts.event_queue_capacity.max(1));

        let status = Arc::new(Mutex::new(Status {
            role,
            state: State::Stopped,
            pending: 0,
            in_flight: false,
            negotiated: None,
            terminated: false,
        }));

        let reassembler = Reassembler::new(context.config.max_block_size);
        let machine = Machine {
            name: format!("peer {} ({role})", config.name),
            role,
            peer,
            config,
            context,
            sender: sender.clone(),
            receiver,
            deferred: VecDeque::new(),
            state: State::Stopped,
            pending: VecDeque::new(),
            in_flight: None,
            session: None,
            next_session: 0,
            attempt: 0,
            negotiated: None,
            idle_timeout: None,
            header_sent: false,
            reassembler,
            timers: Timers::default(),
            initiator: None,
            terminated: false,
            status: status.clone(),
        };

        let task = task::spawn(format!("tcpcl-{role}-{peer}"), move |_| {
            machine.run(accepted)
        })?;

        Ok(Self {
            sender,
            status,
            task: Mutex::new(Some(task)),
            join_timeout: timeouts.join,
        })
    }

    fn send(&self, event: Event) -> Result<(), Error> {
        self.sender.send(event).map_err(|_| Error::Terminated)
    }

    pub fn start(&self) -> Result<(), Error> {
        self.send(Event::Start)
    }

    /// Stops the machine and waits, bounded by the join timeout, until it reached STOPPED.
    pub fn stop(&self) -> Result<(), Error> {
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        self.send(Event::Stop(Some(done_tx)))?;

        if let Err(RecvTimeoutError::Timeout) = done_rx.recv_timeout(self.join_timeout) {
            log::warn!("stop not confirmed within {:?}", self.join_timeout);
        }

        Ok(())
    }

    /// Queues a block. When the machine is gone the block is handed back.
    pub fn enqueue(&self, block: Block) -> Result<(), Block> {
        self.sender.send(Event::Outbound(block)).map_err(|err| match err.0 {
            Event::Outbound(block) => block,
            _ => unreachable!("only blocks are sent here"),
        })
    }

    pub fn status(&self) -> Status {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Terminates the machine and waits, bounded, for its thread to end.
    pub fn shutdown(&self) {
        let _ = self.sender.send_timeout(Event::Terminate, self.join_timeout);

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(task) = task {
            task.join(self.join_timeout);
        }
    }
}

impl Drop for MachineHandle {
    fn drop(&mut self) {
        let _ = self.sender.send_timeout(Event::Terminate, self.join_timeout);
    }
}

/// The block being transmitted and how far it got.
struct InFlight {
    block: Block,
    fragmenter: Fragmenter,
}

struct Machine {
    /// Log prefix.
    name: String,
    role: Role,
    peer: PeerId,
    config: PeerConfig,
    context: Arc<Context>,
    sender: Sender<Event>,
    receiver: Receiver<Event>,
    /// Events the machine raised itself. Processed before the queue so that the machine never
    /// blocks on its own bounded queue.
    deferred: VecDeque<Event>,
    state: State,
    pending: VecDeque<Block>,
    in_flight: Option<InFlight>,
    session: Option<Session>,
    next_session: u64,
    /// Number of the current connect task; late results of older ones are discarded.
    attempt: u64,
    negotiated: Option<NegotiatedParameters>,
    idle_timeout: Option<Duration>,
    header_sent: bool,
    reassembler: Reassembler,
    timers: Timers,
    initiator: Option<Task>,
    terminated: bool,
    status: Arc<Mutex<Status>>,
}

impl Machine {
    fn run(mut self, accepted: Option<(TcpStream, LinkId)>) {
        if let Some((stream, link)) = accepted {
            self.on_accepted(stream, link);
        }
        self.publish();

        while !self.terminated {
            while let Some(kind) = self.timers.pop_expired(Instant::now()) {
                self.on_timer(kind);
            }

            if self.terminated {
                break;
            }

            let event = match self.deferred.pop_front() {
                Some(event) => event,
                None => {
                    let received = match self.timers.next_deadline() {
                        Some(deadline) => self.receiver.recv_deadline(deadline),
                        None => self
                            .receiver
                            .recv()
                            .map_err(|_| RecvTimeoutError::Disconnected),
                    };

                    match received {
                        Ok(event) => event,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => Event::Terminate,
                    }
                }
            };

            self.handle(event);
            self.publish();
        }

        log::debug!("{}: terminated", self.name);

        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.terminated = true;
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::Start => self.on_start(),
            Event::Stop(done) => {
                self.stop();
                // callers read the status as soon as they are released
                self.publish();
                drop(done);
            }
            Event::Terminate => {
                self.stop();
                self.terminated = true;
            }
            Event::Demand => self.on_demand(),
            Event::Outbound(block) => self.on_outbound(block),
            Event::Connected {
                attempt,
                stream,
                addr,
                link,
            } => self.on_connected(attempt, stream, addr, link),
            Event::Inbound { session, segment } => {
                if self.is_current(session) {
                    self.on_segment(segment);
                } else {
                    log::trace!("{}: dropping segment of stale session {session}", self.name);
                }
            }
            Event::ClosedRemote { session } => {
                if self.is_current(session) {
                    log::info!("{}: connection closed by remote", self.name);
                    self.disconnect(None, None);
                }
            }
            Event::Drained { session } => {
                if self.is_current(session) && self.writer_ready() {
                    self.send_next_block();
                }
            }
        }
    }

    fn is_current(&self, session: u64) -> bool {
        self.session.as_ref().map(|s| s.id) == Some(session)
    }

    fn set_state(&mut self, state: State) {
        if self.state != state {
            log::debug!("{}: {} -> {}", self.name, self.state, state);
            self.state = state;
        }
    }

    fn publish(&self) {
        let mut status = self
            .status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        status.state = self.state;
        status.pending = self.pending.len();
        status.in_flight = self.in_flight.is_some();
        status.negotiated = self.negotiated;
    }

    fn on_start(&mut self) {
        if self.role == Role::Acceptor {
            log::debug!("{}: start ignored by acceptor", self.name);
            return;
        }

        if self.state != State::Stopped {
            log::debug!("{}: already started", self.name);
            return;
        }

        self.set_state(State::Idle);

        if !self.pending.is_empty() {
            self.deferred.push_back(Event::Demand);
        }
    }

    fn on_outbound(&mut self, block: Block) {
        log::trace!(
            "{}: queued block {} ({} bytes)",
            self.name,
            block.client_id,
            block.len()
        );

        self.pending.push_back(block);

        match self.state {
            State::Idle => self.deferred.push_back(Event::Demand),
            State::WaitBlockToSend => self.send_next_block(),
            _ => {}
        }
    }

    fn on_demand(&mut self) {
        if self.state != State::Idle || self.pending.is_empty() {
            return;
        }

        self.attempt += 1;

        let context = self.context.clone();
        let addresses = self.config.addresses.clone();
        let attempt = self.attempt;
        let events = self.sender.clone();
        let name = self.name.clone();

        let spawned = task::spawn(
            format!("tcpcl-connect-{}", self.peer),
            move |cancel| initiator::connect(context, addresses, attempt, events, cancel, name),
        );

        match spawned {
            Ok(task) => {
                self.initiator = Some(task);
                self.set_state(State::ConnInitiator);
            }
            Err(err) => {
                log::error!("{}: cannot spawn connect task: {err}", self.name);
                self.reconnect_later(None);
            }
        }
    }

    fn on_connected(&mut self, attempt: u64, stream: TcpStream, addr: SocketAddr, link: LinkId) {
        if self.state != State::ConnInitiator || attempt != self.attempt {
            log::debug!("{}: discarding stray connection to {addr}", self.name);
            return;
        }

        if let Some(initiator) = self.initiator.take() {
            initiator.join(self.context.config.timeouts.join);
        }

        log::info!("{}: connected to {addr}", self.name);

        if let Err(err) = self.open_session(stream, link) {
            log::warn!("{}: cannot set up connection to {addr}: {err}", self.name);
            self.reconnect_later(None);
            return;
        }

        self.set_state(State::WaitHeader);

        if self.transmit(Segment::ContactHeader(self.local_header())) {
            self.header_sent = true;
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, link: LinkId) {
        if let Err(err) = self.open_session(stream, link) {
            log::warn!("{}: cannot set up accepted connection: {err}", self.name);
            self.terminated = true;
            return;
        }

        stats::bump(&self.context.stats.accepts);
        self.set_state(State::WaitHeader);
    }

    fn open_session(&mut self, stream: TcpStream, link: LinkId) -> io::Result<()> {
        self.next_session += 1;

        let session = Session::open(
            self.next_session,
            stream,
            link,
            self.context.config.timeouts.write,
            self.sender.clone(),
            &self.name,
        )?;

        self.session = Some(session);
        self.idle_timeout = self.config.initial_idle_timeout();
        self.restart_idle_timer();

        Ok(())
    }

    fn local_header(&self) -> ContactHeader {
        let flags = if self.config.ack_data_segments {
            segment::flags::BUNDLE_ACKS | segment::flags::NACKS
        } else {
            0
        };

        ContactHeader {
            version: segment::PROTOCOL_VERSION,
            flags,
            keepalive_secs: self.config.keep_alive_interval_secs,
            endpoint_id: self.context.config.local_eid.clone().into_bytes(),
        }
    }

    fn restart_idle_timer(&mut self) {
        match self.idle_timeout {
            Some(timeout) => self.timers.start(TimerKind::Idle, timeout),
            None => self.timers.cancel(TimerKind::Idle),
        }
    }

    fn on_segment(&mut self, segment: Segment) {
        let context = self.context.clone();
        let stats = &context.stats;
        stats::bump(&stats.segments_received);

        self.restart_idle_timer();

        match (self.state, segment) {
            (State::WaitHeader, Segment::ContactHeader(header)) => {
                stats::bump(&stats.contact_headers_received);
                self.on_header(header);
            }
            (State::WaitBlockToSend | State::WaitAck, Segment::Data(data)) => {
                stats::bump(&stats.data_segments_received);
                self.on_data(data);
            }
            (State::WaitAck, Segment::Ack(length)) => {
                stats::bump(&stats.acks_received);
                self.on_ack(length);
            }
            (State::WaitBlockToSend | State::WaitAck, Segment::Nack) => {
                stats::bump(&stats.nacks_received);
                self.on_nack();
            }
            (_, Segment::KeepAlive) => {
                stats::bump(&stats.keepalives_received);
                log::trace!("{}: keepalive", self.name);
            }
            (_, Segment::Shutdown(shutdown)) => {
                stats::bump(&stats.shutdowns_received);
                log::info!(
                    "{}: peer shut down (reason {:?}, reconnect delay {:?})",
                    self.name,
                    shutdown.reason,
                    shutdown.reconnect_delay
                );
                self.disconnect(None, shutdown.reconnect_delay);
            }
            (state, segment) => {
                let err = ProtocolError::UnexpectedSegmentInState {
                    segment: segment.name(),
                    state: state.name(),
                };
                log::warn!("{}: {err}", self.name);
            }
        }
    }

    fn on_header(&mut self, header: ContactHeader) {
        log::debug!(
            "{}: contact header from {} (version {}, flags {:#04x}, keepalive {}s)",
            self.name,
            String::from_utf8_lossy(&header.endpoint_id),
            header.version,
            header.flags,
            header.keepalive_secs
        );

        if !self.header_sent {
            if !self.transmit(Segment::ContactHeader(self.local_header())) {
                return;
            }
            self.header_sent = true;
        }

        let negotiated = NegotiatedParameters::negotiate(&self.config, &header);
        log::debug!("{}: negotiated {negotiated:?}", self.name);

        self.negotiated = Some(negotiated);
        self.idle_timeout = negotiated.idle_timeout();
        self.restart_idle_timer();

        if let Some(keepalive) = negotiated.keepalive() {
            self.timers.start(TimerKind::KeepAlive, keepalive);
        }

        self.set_state(State::WaitBlockToSend);
        self.send_next_block();
    }

    /// Takes blocks off the pending queue while the connection is ready for one. Without acks
    /// the segments of a block are queued back to back for as long as the writer keeps up; the
    /// rest follows on `Drained`.
    fn send_next_block(&mut self) {
        while self.state == State::WaitBlockToSend {
            if self.in_flight.is_none() {
                let Some(block) = self.pending.pop_front() else {
                    return;
                };

                let Some(max_segment_size) = self.context.max_segment_size(block.link) else {
                    log::warn!(
                        "{}: link {} of block {} is not operational",
                        self.name,
                        block.link,
                        block.client_id
                    );
                    self.context.block_failed(&block, BlockError::LinkUnavailable);
                    continue;
                };

                self.in_flight = Some(InFlight {
                    block,
                    fragmenter: Fragmenter::new(max_segment_size),
                });

                if self.negotiated.map_or(false, |n| n.ack_data_segments) {
                    if self.send_next_segment() {
                        self.timers
                            .start(TimerKind::Ack, self.context.config.timeouts.ack);
                        self.set_state(State::WaitAck);
                    }
                    return;
                }
            }

            if !self.writer_ready() || !self.send_next_segment() {
                return;
            }
            if self.in_flight_complete() {
                self.complete_block();
            }
        }
    }

    /// Whether the writer has taken everything queued so far.
    fn writer_ready(&mut self) -> bool {
        self.session.as_mut().map_or(false, |s| s.flush())
    }

    /// Queues the next segment of the in-flight block. Returns `false` if there is no connection.
    fn send_next_segment(&mut self) -> bool {
        let Some(segment) = self
            .in_flight
            .as_mut()
            .and_then(|f| f.fragmenter.next_segment(&f.block.bytes))
        else {
            return true;
        };

        self.transmit(Segment::Data(segment))
    }

    fn in_flight_complete(&self) -> bool {
        self.in_flight
            .as_ref()
            .map_or(false, |f| f.fragmenter.is_complete(&f.block.bytes))
    }

    fn complete_block(&mut self) {
        if let Some(InFlight { block, .. }) = self.in_flight.take() {
            log::debug!(
                "{}: block {} transmitted ({} bytes)",
                self.name,
                block.client_id,
                block.len()
            );
            stats::bump(&self.context.stats.blocks_sent);
            self.context.notifier.transmitted(&block);
        }
    }

    fn on_ack(&mut self, length: u64) {
        let Some(in_flight) = self.in_flight.as_ref() else {
            log::warn!("{}: ack without a block in flight", self.name);
            return;
        };

        let sent = in_flight.fragmenter.offset() as u64;
        if length != sent {
            log::debug!("{}: ack for {length} bytes, {sent} sent", self.name);
        }

        if self.in_flight_complete() {
            self.timers.cancel(TimerKind::Ack);
            self.complete_block();
            self.set_state(State::WaitBlockToSend);
            self.send_next_block();
        } else if self.send_next_segment() {
            self.timers
                .start(TimerKind::Ack, self.context.config.timeouts.ack);
        }
    }

    fn on_nack(&mut self) {
        let Some(InFlight { block, .. }) = self.in_flight.take() else {
            log::debug!("{}: nack without a block in flight", self.name);
            return;
        };

        log::info!("{}: block {} refused by peer", self.name, block.client_id);

        self.timers.cancel(TimerKind::Ack);
        self.context.block_failed(&block, BlockError::Refused);
        self.set_state(State::WaitBlockToSend);
        self.send_next_block();
    }

    fn on_data(&mut self, data: DataSegment) {
        let progress = match self.reassembler.push(data) {
            Ok(progress) => progress,
            Err(err) => {
                log::warn!("{}: {err}", self.name);
                return;
            }
        };

        if self.negotiated.map_or(false, |n| n.ack_data_segments)
            && !self.transmit(Segment::Ack(progress.received))
        {
            return;
        }

        if let Some(bytes) = progress.block {
            let Some(link) = self.session.as_ref().map(|s| s.link) else {
                return;
            };

            let block = Block {
                bytes,
                peer: self.peer,
                link,
                client_id: 0,
            };

            log::debug!("{}: received block of {} bytes", self.name, block.len());
            stats::bump(&self.context.stats.blocks_received);
            self.context.notifier.received(&block);
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        let context = self.context.clone();
        let stats = &context.stats;

        match kind {
            TimerKind::Idle => {
                stats::bump(&stats.idle_timer_expirations);
                if self.state.is_connected() {
                    log::info!("{}: idle timeout in {}", self.name, self.state);
                    self.disconnect(Some(ShutdownReason::IdleTimeout), None);
                }
            }
            TimerKind::Ack => {
                stats::bump(&stats.ack_timer_expirations);
                if self.state == State::WaitAck {
                    log::info!("{}: ack timeout", self.name);
                    self.disconnect(Some(ShutdownReason::IdleTimeout), None);
                }
            }
            TimerKind::KeepAlive => {
                stats::bump(&stats.keepalive_timer_expirations);
                let interval = self.negotiated.and_then(|n| n.keepalive());

                if let (State::WaitBlockToSend | State::WaitAck, Some(interval)) =
                    (self.state, interval)
                {
                    if self.transmit(Segment::KeepAlive) {
                        self.timers.start(TimerKind::KeepAlive, interval);
                    }
                }
            }
            TimerKind::Reconnect => {
                stats::bump(&stats.reconnect_timer_expirations);
                if self.state == State::DelayBeforeReconnect {
                    self.set_state(State::Idle);
                    if !self.pending.is_empty() {
                        self.deferred.push_back(Event::Demand);
                    }
                }
            }
        }
    }

    /// Queues a segment for the session's writer. Write failures come back as `ClosedRemote`;
    /// `false` means there is no connection.
    fn transmit(&mut self, segment: Segment) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };

        session.send(&segment);
        log::trace!("{}: sent {} segment", self.name, segment.name());
        count_sent(&self.context.stats, &segment);
        true
    }

    /// Tears down the live connection. With a reason a Shutdown is sent first. The in-flight
    /// block goes back to the front of the queue.
    fn disconnect(&mut self, reason: Option<ShutdownReason>, peer_delay: Option<u64>) {
        self.close_connection(reason);

        match self.role {
            Role::Acceptor => {
                self.set_state(State::Stopped);
                self.terminated = true;
            }
            Role::Initiator => self.reconnect_later(peer_delay),
        }
    }

    fn close_connection(&mut self, reason: Option<ShutdownReason>) {
        if let Some(mut session) = self.session.take() {
            if let Some(reason) = reason {
                let shutdown = Segment::Shutdown(Shutdown {
                    reason: Some(reason),
                    reconnect_delay: self
                        .config
                        .delay_before_reconnection
                        .then_some(self.config.reconnection_delay_secs as u64),
                });

                session.send(&shutdown);
                count_sent(&self.context.stats, &shutdown);
            }

            log::debug!("{}: closing connection to {}", self.name, session.remote);
            session.close(self.context.config.timeouts.join);
            stats::bump(&self.context.stats.disconnects);
        }

        self.timers.cancel(TimerKind::Idle);
        self.timers.cancel(TimerKind::KeepAlive);
        self.timers.cancel(TimerKind::Ack);

        if let Some(InFlight { block, .. }) = self.in_flight.take() {
            log::debug!("{}: requeueing block {}", self.name, block.client_id);
            self.pending.push_front(block);
        }

        self.reassembler.clear();
        self.negotiated = None;
        self.idle_timeout = None;
        self.header_sent = false;
    }

    /// Next state of an initiator that lost or could not set up its connection.
    fn reconnect_later(&mut self, peer_delay: Option<u64>) {
        let delay = peer_delay.or_else(|| {
            self.config
                .delay_before_reconnection
                .then_some(self.config.reconnection_delay_secs as u64)
        });

        match delay {
            Some(secs) if secs > 0 => {
                self.timers
                    .start(TimerKind::Reconnect, Duration::from_secs(secs));
                self.set_state(State::DelayBeforeReconnect);
            }
            _ => {
                self.set_state(State::Idle);
                if !self.pending.is_empty() {
                    self.deferred.push_back(Event::Demand);
                }
            }
        }
    }

    /// Stops everything and reports every queued block as failed.
    fn stop(&mut self) {
        if self.state == State::Stopped && self.session.is_none() && self.pending.is_empty() {
            return;
        }

        if let Some(session) = self.session.as_mut() {
            let shutdown = Segment::Shutdown(Shutdown::default());
            session.send(&shutdown);
            count_sent(&self.context.stats, &shutdown);
        }

        if let Some(initiator) = self.initiator.take() {
            initiator.join(self.context.config.timeouts.join);
        }

        self.close_connection(None);
        self.timers.cancel_all();
        self.deferred.clear();

        for block in self.pending.drain(..) {
            self.context.block_failed(&block, BlockError::Stopped);
        }

        self.set_state(State::Stopped);
    }
}

fn count_sent(stats: &stats::Statistics, segment: &Segment) {
    stats::bump(&stats.segments_sent);

    let counter = match segment {
        Segment::ContactHeader(_) => &stats.contact_headers_sent,
        Segment::Data(_) => &stats.data_segments_sent,
        Segment::Ack(_) => &stats.acks_sent,
        Segment::Nack => &stats.nacks_sent,
        Segment::KeepAlive => &stats.keepalives_sent,
        Segment::Shutdown(_) => &stats.shutdowns_sent,
    };

    stats::bump(counter);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::segment::flags;

    fn header(flags: u8, keepalive_secs: u16) -> ContactHeader {
        ContactHeader {
            version: 3,
            flags,
            keepalive_secs,
            endpoint_id: b"dtn://peer".to_vec(),
        }
    }

    #[test]
    fn negotiation_takes_the_weaker_side() {
        let local = PeerConfig {
            ack_data_segments: true,
            keep_alive_interval_secs: 30,
            idle_connection_shutdown: false,
            ..Default::default()
        };

        let negotiated = NegotiatedParameters::negotiate(&local, &header(0, 10));

        assert_eq!(
            negotiated,
            NegotiatedParameters {
                ack_data_segments: false,
                reactive_fragmentation: false,
                nack_supported: false,
                keepalive_secs: 10,
                idle_timeout_secs: 20,
            }
        );
    }

    #[test]
    fn negotiation_honors_longer_idle_delay() {
        let local = PeerConfig {
            keep_alive_interval_secs: 10,
            idle_connection_shutdown: true,
            idle_connection_shutdown_delay_secs: 45,
            ..Default::default()
        };

        let peer = header(
            flags::BUNDLE_ACKS | flags::NACKS | flags::REACTIVE_FRAGMENTATION,
            15,
        );
        let negotiated = NegotiatedParameters::negotiate(&local, &peer);

        assert!(negotiated.ack_data_segments);
        assert!(negotiated.nack_supported);
        assert!(!negotiated.reactive_fragmentation);
        assert_eq!(negotiated.keepalive_secs, 10);
        assert_eq!(negotiated.idle_timeout_secs, 45);
    }

    #[test]
    fn zero_keepalive_disables_idle_timeout() {
        let local = PeerConfig::default();
        let negotiated = NegotiatedParameters::negotiate(&local, &header(flags::BUNDLE_ACKS, 0));

        assert_eq!(negotiated.keepalive_secs, 0);
        assert_eq!(negotiated.idle_timeout_secs, 0);
        assert_eq!(negotiated.keepalive(), None);
        assert_eq!(negotiated.idle_timeout(), None);
    }

    #[test]
    fn state_names() {
        assert_eq!(State::WaitBlockToSend.to_string(), "WAIT_BLOCK_TO_SEND");
        assert!(State::WaitAck.is_connected());
        assert!(!State::DelayBeforeReconnect.is_connected());
        assert_eq!(Role::Acceptor.to_string(), "acceptor");
    }
}
