use crate::error::ProtocolError;
use crate::link::LinkId;
use crate::peer::PeerId;
use crate::segment::DataSegment;

/// Unit of data exchanged with the upper layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub bytes: Vec<u8>,
    pub peer: PeerId,
    pub link: LinkId,
    /// Opaque id chosen by the sender. Inbound blocks carry 0.
    pub client_id: u64,
}

impl Block {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Cuts a block into Data segments of at most `max_segment_size` bytes. The fragmenter only
/// tracks the offset, so the block itself can stay in the pending queue while it is sent.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    max_segment_size: usize,
    offset: usize,
    started: bool,
}

impl Fragmenter {
    pub fn new(max_segment_size: usize) -> Self {
        Self {
            max_segment_size: max_segment_size.max(1),
            offset: 0,
            started: false,
        }
    }

    /// The next segment of `bytes`, or `None` once the segment carrying `end` was produced.
    /// An empty block still yields one segment flagged both `start` and `end`.
    pub fn next_segment(&mut self, bytes: &[u8]) -> Option<DataSegment> {
        if self.is_complete(bytes) {
            return None;
        }

        let end = (self.offset + self.max_segment_size).min(bytes.len());
        let segment = DataSegment {
            start: !self.started,
            end: end == bytes.len(),
            payload: bytes[self.offset..end].to_vec(),
        };

        self.started = true;
        self.offset = end;

        Some(segment)
    }

    pub fn is_complete(&self, bytes: &[u8]) -> bool {
        self.started && self.offset >= bytes.len()
    }

    /// Bytes handed out so far.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// Iterates over all segments of a block.
pub fn fragment(bytes: &[u8], max_segment_size: usize) -> impl Iterator<Item = DataSegment> + '_ {
    let mut fragmenter = Fragmenter::new(max_segment_size);
    std::iter::from_fn(move || fragmenter.next_segment(bytes))
}

/// Outcome of feeding one segment to a [`Reassembler`].
#[derive(Debug, PartialEq, Eq)]
pub struct Progress {
    /// Payload bytes received for the current block, this segment included.
    pub received: u64,
    /// The complete block, once the `end` segment arrived.
    pub block: Option<Vec<u8>>,
}

/// Rebuilds blocks from in-order Data segments, holding at most `max_block_size` bytes.
#[derive(Debug)]
pub struct Reassembler {
    max_block_size: usize,
    segments: Vec<Vec<u8>>,
    received: u64,
    active: bool,
}

impl Reassembler {
    pub fn new(max_block_size: usize) -> Self {
        Self {
            max_block_size,
            segments: Vec::new(),
            received: 0,
            active: false,
        }
    }

    /// Feeds the next segment. A block that outgrows the limit is dropped, and its remaining
    /// segments are rejected until the next `start`.

    pub fn push(&mut self, segment: DataSegment) -> Result<Progress, ProtocolError> {
        if segment.start {
            if self.active {
                log::debug!("reassembler: discarding {} partial bytes", self.received);
            }
            self.clear();
            self.active = true;
        } else if !self.active {
            return Err(ProtocolError::MissingStart);
        }

        self.received += segment.payload.len() as u64;
        if self.received > self.max_block_size as u64 {
            let received = self.received;
            self.clear();
            return Err(ProtocolError::BlockTooLarge(received));
        }
        self.segments.push(segment.payload);

        let received = self.received;
        let block = if segment.end {
            let block = self.segments.concat();
            self.clear();
            Some(block)
        } else {
            None
        };

        Ok(Progress { received, block })
    }

    pub fn received_len(&self) -> u64 {
        self.received
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.received = 0;
        self.active = false;
    }
}
