use std::net::{SocketAddr, TcpStream};

use crossbeam_channel::Sender;

use crate::block::Block;
use crate::link::LinkId;
use crate::segment::Segment;

/// Input of a state machine. Timers are not events: they are deadlines the machine checks
/// itself between events.
#[derive(Debug)]
pub(crate) enum Event {
    /// Leave STOPPED.
    Start,
    /// Close everything and return to STOPPED. The optional sender is dropped once done.
    Stop(Option<Sender<()>>),
    /// Stop and end the machine's thread.
    Terminate,
    /// Blocks are waiting; connect if idle.
    Demand,
    /// Queue a block for transmission.
    Outbound(Block),
    /// The connect task with the given attempt number established a connection.
    Connected {
        attempt: u64,
        stream: TcpStream,
        addr: SocketAddr,
        link: LinkId,
    },
    /// A segment read by the receiver of the given session.
    Inbound { session: u64, segment: Segment },
    /// The connection of the given session ended from the remote side or failed.
    ClosedRemote { session: u64 },
    /// The writer of the given session has room for queued segments again.
    Drained { session: u64 },
}
