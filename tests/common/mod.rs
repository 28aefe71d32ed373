#![allow(dead_code)]

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use dtn_tcpcl::buffer::DecodeSource;
use dtn_tcpcl::segment::{self, flags, ContactHeader, DataSegment, Segment};
use dtn_tcpcl::{
    DecodeError, Error, Events, LinkAddress, LinkConfig, LinkId, PeerConfig, PeerId, Stack,
    StackConfig, Timeouts,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn localhost() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// Timeouts short enough for tests.
pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        ack: Duration::from_secs(5),
        connect_backoff_min: Duration::from_millis(50),
        connect_backoff_max: Duration::from_millis(200),
        connect: Duration::from_secs(1),
        address_retry: Duration::from_millis(100),
        listener_retry: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn stack_config(eid: &str) -> StackConfig {
    StackConfig {
        local_eid: eid.to_owned(),
        timeouts: fast_timeouts(),
        ..Default::default()
    }
}

/// A stack with one link on `link_port` and one peer that is only ever connected to, at
/// `peer_port` on localhost.
pub fn initiator_stack(
    config: StackConfig,
    link_port: u16,
    peer_port: u16,
) -> (Stack, LinkId, PeerId) {
    let stack = Stack::new(config);
    let link = stack
        .add_link(LinkConfig::tcpcl("lo", localhost(), link_port))
        .unwrap();

    let peer = stack
        .add_peer(PeerConfig {
            accept_connections: false,
            addresses: vec![LinkAddress::new(link, localhost()).with_port(peer_port)],
            ..PeerConfig::new("fake")
        })
        .unwrap();

    (stack, link, peer)
}

pub fn header(flags: u8, keepalive_secs: u16) -> ContactHeader {
    ContactHeader {
        version: segment::PROTOCOL_VERSION,
        flags,
        keepalive_secs,
        endpoint_id: b"dtn://fake".to_vec(),
    }
}

pub fn acking_header() -> ContactHeader {
    header(flags::BUNDLE_ACKS | flags::NACKS, 10)
}

pub fn data(start: bool, end: bool, payload: &[u8]) -> Segment {
    Segment::Data(DataSegment {
        start,
        end,
        payload: payload.to_vec(),
    })
}

/// Scripted TCPCL peer driven directly through the segment codec.
pub struct FakePeer {
    stream: TcpStream,
    source: DecodeSource<TcpStream>,
    expecting_header: bool,
}

impl FakePeer {
    pub fn new(stream: TcpStream) -> Self {
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        let reader = stream.try_clone().unwrap();

        Self {
            stream,
            source: DecodeSource::from_stream(reader),
            expecting_header: true,
        }
    }

    pub fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        Self::new(stream)
    }

    /// Connects, retrying while the remote listener is not up yet.
    pub fn connect(addr: SocketAddr) -> Self {
        let started = Instant::now();

        loop {
            match TcpStream::connect(addr) {
                Ok(stream) => return Self::new(stream),
                Err(err) if started.elapsed() < TIMEOUT => {
                    log::debug!("fake: connect to {addr} failed: {err}");
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(err) => panic!("cannot connect to {addr}: {err}"),
            }
        }
    }

    pub fn send(&mut self, segment: &Segment) {
        self.stream.write_all(&segment.to_bytes()).unwrap();
    }

    /// Writes bytes that need not form a valid segment.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn recv(&mut self) -> Segment {
        self.try_recv().expect("segment expected")
    }

    pub fn try_recv(&mut self) -> Result<Segment, Error> {
        let first = self.source.next_byte()?;
        let segment = segment::decode_segment(first, &mut self.source, self.expecting_header)?;
        self.expecting_header = false;
        Ok(segment)
    }

    /// Receives the stack's Contact Header and answers with `ours`.
    pub fn handshake(&mut self, ours: ContactHeader) -> ContactHeader {
        let theirs = match self.recv() {
            Segment::ContactHeader(header) => header,
            other => panic!("expected contact header, got {other:?}"),
        };

        self.send(&Segment::ContactHeader(ours));
        theirs
    }

    /// Sends `ours` first, then receives the stack's Contact Header.
    pub fn handshake_as_initiator(&mut self, ours: ContactHeader) -> ContactHeader {
        self.send(&Segment::ContactHeader(ours));

        match self.recv() {
            Segment::ContactHeader(header) => header,
            other => panic!("expected contact header, got {other:?}"),
        }
    }

    /// Next segment that is not a keepalive.
    pub fn recv_skipping_keepalives(&mut self) -> Segment {
        loop {
            match self.recv() {
                Segment::KeepAlive => continue,
                segment => return segment,
            }
        }
    }

    /// Whether the stack closed the connection, skipping whatever it still sent.
    pub fn is_closed(&mut self) -> bool {
        loop {
            match self.try_recv() {
                Ok(_) => continue,
                Err(Error::Decode(DecodeError::OutOfData)) => return true,
                Err(Error::Transport(err)) => {
                    return err.kind() == std::io::ErrorKind::ConnectionReset
                }
                Err(_) => return false,
            }
        }
    }
}

/// Polls `condition` until it holds or the test timeout passes.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let started = Instant::now();

    while !condition() {
        assert!(started.elapsed() < TIMEOUT, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn next_event(events: &Events) -> dtn_tcpcl::Event {
    events.receive_timeout(TIMEOUT).expect("event expected")
}
