use std::collections::VecDeque;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use super::event::Event;
use crate::buffer::DecodeSource;
use crate::link::LinkId;
use crate::segment::{self, Segment};
use crate::task::{self, Task};

/// Read buffer of the receiver task.
const SOCKET_RECV_BUFFER: usize = 64 * 1024;

/// Encoded segments the writer task may hold before the machine has to wait for it.
const WRITE_QUEUE_CAPACITY: usize = 8;

/// Time the writer gets to flush queued segments when a connection is closed.
const CLOSE_LINGER: Duration = Duration::from_millis(250);

/// One live TCP connection of a state machine.
///
/// Both directions run on their own task: a receiver decodes segments into `Inbound` events, a
/// writer drains a bounded queue of encoded segments into the socket. The machine only ever
/// queues. Segments the writer cannot take yet wait in the session's outbox; once the writer
/// catches up it raises `Drained` so the machine can continue.
pub(crate) struct Session {
    pub id: u64,
    pub link: LinkId,
    pub remote: SocketAddr,
    stream: TcpStream,
    outbox: VecDeque<Vec<u8>>,
    queue: Sender<Vec<u8>>,
    wants_drain: Arc<AtomicBool>,
    writer: Option<Task>,
    receiver: Option<Task>,
}

impl Session {
    pub fn open(
        id: u64,
        stream: TcpStream,
        link: LinkId,
        write_timeout: Duration,
        events: Sender<Event>,
        name: &str,
    ) -> io::Result<Self> {
        let remote = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(write_timeout))?;

        let (queue, queued) = crossbeam_channel::bounded(WRITE_QUEUE_CAPACITY);
        let wants_drain = Arc::new(AtomicBool::new(false));

        let writer = {
            let stream = stream.try_clone()?;
            let events = events.clone();
            let wants_drain = wants_drain.clone();
            let log_name = name.to_owned();

            task::spawn(format!("tcpcl-tx-{id}"), move |cancel| {
                write(stream, id, queued, wants_drain, events, cancel, &log_name)
            })?
        };

        let reader = stream.try_clone()?;
        let log_name = name.to_owned();
        let receiver = task::spawn(format!("tcpcl-rx-{id}"), move |cancel| {
            receive(reader, id, events, cancel, &log_name)
        })?;

        Ok(Self {
            id,
            link,
            remote,
            stream,
            outbox: VecDeque::new(),
            queue,
            wants_drain,
            writer: Some(writer),
            receiver: Some(receiver),
        })
    }

    /// Queues a segment for the writer. Never blocks.
    pub fn send(&mut self, segment: &Segment) {
        self.outbox.push_back(segment.to_bytes());
        self.flush();
    }

    /// Hands queued segments to the writer. Returns `true` if nothing is left waiting; otherwise
    /// a `Drained` event follows once the writer has room again.
    pub fn flush(&mut self) -> bool {
        while let Some(bytes) = self.outbox.pop_front() {
            match self.queue.try_send(bytes) {
                Ok(()) => {}
                Err(TrySendError::Full(bytes)) => {
                    self.outbox.push_front(bytes);

                    // The writer checks the flag after every write. If it was not armed yet, the
                    // writer may have made room in between, so try once more.
                    if self.wants_drain.swap(true, Ordering::SeqCst) {
                        return false;
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    // the writer failed and reports the connection as closed
                    self.outbox.clear();
                    return false;
                }
            }
        }

        true
    }

    /// Lets the writer flush what is queued for a short while, then shuts the socket down,
    /// which unblocks both tasks, and joins them.
    pub fn close(mut self, join_timeout: Duration) {
        self.flush();

        let Session {
            stream,
            queue,
            writer,
            receiver,
            ..
        } = self;

        // the writer exits once the queue is empty and disconnected
        drop(queue);
        if let Some(writer) = &writer {
            writer.wait(CLOSE_LINGER);
        }

        let _ = stream.shutdown(std::net::Shutdown::Both);

        if let Some(writer) = writer {
            writer.join(join_timeout);
        }
        if let Some(receiver) = receiver {
            receiver.join(join_timeout);
        }
    }
}

/// Writer task body.
fn write(
    mut stream: TcpStream,
    session: u64,
    queued: Receiver<Vec<u8>>,
    wants_drain: Arc<AtomicBool>,
    events: Sender<Event>,
    cancel: Receiver<()>,
    name: &str,
) {
    loop {
        let bytes = crossbeam_channel::select! {
            recv(queued) -> bytes => bytes.ok(),
            recv(cancel) -> _ => None,
        };

        let Some(bytes) = bytes else {
            break;
        };

        if let Err(err) = stream.write_all(&bytes) {
            log::debug!("{name}: write failed: {err}");
            crossbeam_channel::select! {
                send(events, Event::ClosedRemote { session }) -> _ => {},
                recv(cancel) -> _ => {},
            }
            break;
        }

        if wants_drain.swap(false, Ordering::SeqCst) {
            let delivered = crossbeam_channel::select! {
                send(events, Event::Drained { session }) -> result => result.is_ok(),
                recv(cancel) -> _ => false,
            };

            if !delivered {
                break;
            }
        }
    }
}

/// Receiver task body. Segments are decoded as a Contact Header when they carry its magic,
/// until the first Contact Header arrived.
fn receive(stream: TcpStream, session: u64, events: Sender<Event>, cancel: Receiver<()>, name: &str) {
    let mut source = DecodeSource::from_stream(BufReader::with_capacity(SOCKET_RECV_BUFFER, stream));
    let mut expecting_header = true;

    loop {
        let result = source
            .next_byte()
            .and_then(|first| segment::decode_segment(first, &mut source, expecting_header));

        let (event, closing) = match result {
            Ok(segment) => {
                log::trace!("{name}: received {} segment", segment.name());
                if let Segment::ContactHeader(_) = segment {
                    expecting_header = false;
                }
                (Event::Inbound { session, segment }, false)
            }
            Err(err) if err.is_connection_lost() => {
                log::debug!("{name}: connection closed: {err}");
                (Event::ClosedRemote { session }, true)
            }
            Err(err) if !err.keeps_stream_in_sync() => {
                log::warn!("{name}: closing connection: {err}");
                (Event::ClosedRemote { session }, true)
            }
            Err(err) => {
                log::warn!("{name}: dropping malformed segment: {err}");
                continue;
            }
        };

        let delivered = crossbeam_channel::select! {
            send(events, event) -> result => result.is_ok(),
            recv(cancel) -> _ => false,
        };

        if !delivered || closing {
            break;
        }
    }

    source.close();
}
