use std::io;

use thiserror::Error;

/// Malformed or truncated wire data.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The source ran out of bytes before the value was complete.
    #[error("out of data")]
    OutOfData,
    /// The value does not fit into the target width, or uses more groups than any
    /// value of that width could need.
    #[error("value overflows {0} bits")]
    Overflow(u32),
}

/// A well-formed byte sequence that breaks the protocol rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The contact header magic is not `dtn!`.
    #[error("bad contact header magic: {0:02x?}")]
    BadMagic([u8; 4]),
    /// The contact header carries a version outside the supported range.
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    /// The high nibble of a segment's first byte names no known segment type.
    #[error("unknown segment type in byte {0:#04x}")]
    UnknownSegmentType(u8),
    /// A segment arrived in a state that cannot process it.
    #[error("{segment} segment unexpected in state {state}")]
    UnexpectedSegmentInState {
        segment: &'static str,
        state: &'static str,
    },
    /// A data segment announces more payload than any link may carry.
    #[error("segment of {0} bytes exceeds the maximum segment size")]
    SegmentTooLarge(u64),
    /// A data segment continues a block whose start segment never arrived.
    #[error("data segment without a preceding start segment")]
    MissingStart,
    /// The segments of one block add up to more than the configured maximum block size.
    #[error("block of at least {0} bytes exceeds the maximum block size")]
    BlockTooLarge(u64),
}

/// Invalid parameter combinations, rejected where the configuration enters the stack.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("idle shutdown delay {delay}s is below twice the keepalive interval {keep_alive}s")]
    IdleDelayTooShort { delay: u32, keep_alive: u32 },
    #[error("{name} = {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("link address family does not match the ipv6 flag")]
    AddressFamily,
    #[error("there is already a {0} named '{1}'")]
    Duplicate(&'static str, String),
    #[error("no {0} named '{1}'")]
    Unknown(&'static str, String),
    #[error("link '{0}' is still referenced by a peer")]
    LinkInUse(String),
    #[error("block length {length} exceeds buffer of {available} bytes")]
    BlockLength { length: usize, available: usize },
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// The state machine addressed by an operation is no longer running.
    #[error("state machine has terminated")]
    Terminated,
}

impl Error {
    /// Whether the error means the underlying connection can no longer be used.
    /// Truncated data on a live stream means the stream ended mid-segment.
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::Decode(DecodeError::OutOfData) | Error::Terminated
        )
    }

    /// Whether the offending segment was consumed completely, so the next byte on the stream
    /// starts a new segment. Anything else leaves unread bytes behind and ends the connection.
    pub fn keeps_stream_in_sync(&self) -> bool {
        matches!(
            self,
            Error::Protocol(
                ProtocolError::UnknownSegmentType(_)
                    | ProtocolError::UnexpectedSegmentInState { .. }
                    | ProtocolError::MissingStart
                    | ProtocolError::BlockTooLarge(_)
            )
        )
    }
}

/// Why an outbound block was not delivered.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// The peer refused the block with a Nack segment.
    #[error("block refused by peer")]
    Refused,
    /// The link the block was queued for is unknown or not operational.
    #[error("link not operational")]
    LinkUnavailable,
    /// The state machine was stopped with the block still queued.
    #[error("state machine stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, Error>;
