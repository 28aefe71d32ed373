//! Wire format of the segments exchanged on a TCPCL connection.
//!
//! A connection opens with a Contact Header in each direction, recognized by its magic. Every
//! later segment starts with one byte holding the segment type in the high nibble and
//! type-specific flags in the low nibble.

use std::io::{self, Read};

use crate::buffer::{DecodeSource, EncodeSink};
use crate::error::{ProtocolError, Result};
use crate::sdnv;

/// Contact Header magic, "dtn!".
pub const MAGIC: [u8; 4] = [0x64, 0x74, 0x6e, 0x21];

/// Protocol version sent in the local Contact Header.
pub const PROTOCOL_VERSION: u8 = 3;

/// Largest payload a single Data segment may announce.
pub const MAX_SEGMENT_LENGTH: u64 = 32 * 1024 * 1024;

/// Largest endpoint id accepted in a Contact Header.
pub const MAX_ENDPOINT_ID_LENGTH: u64 = 64 * 1024;

const TYPE_DATA: u8 = 1;
const TYPE_ACK: u8 = 2;
const TYPE_REFUSE: u8 = 3;
const TYPE_KEEPALIVE: u8 = 4;
const TYPE_SHUTDOWN: u8 = 5;

const DATA_START: u8 = 0x02;
const DATA_END: u8 = 0x01;

const SHUTDOWN_REASON: u8 = 0x02;
const SHUTDOWN_DELAY: u8 = 0x01;

/// Contact Header capability flags.
pub mod flags {
    pub const BUNDLE_ACKS: u8 = 0x01;
    pub const REACTIVE_FRAGMENTATION: u8 = 0x02;
    pub const NACKS: u8 = 0x04;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactHeader {
    pub version: u8,
    pub flags: u8,
    /// Zero disables keepalives.
    pub keepalive_secs: u16,
    /// Raw endpoint id, kept as sent.
    pub endpoint_id: Vec<u8>,
}

impl ContactHeader {
    pub fn offers_acks(&self) -> bool {
        self.flags & flags::BUNDLE_ACKS != 0
    }

    pub fn offers_nacks(&self) -> bool {
        self.flags & flags::NACKS != 0
    }

    pub fn offers_reactive_fragmentation(&self) -> bool {
        self.flags & flags::REACTIVE_FRAGMENTATION != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSegment {
    pub start: bool,
    pub end: bool,
    pub payload: Vec<u8>,
}

/// Reason carried by a Shutdown segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    IdleTimeout,
    VersionMismatch,
    Busy,
    Other(u8),
}

impl From<u8> for ShutdownReason {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::IdleTimeout,
            1 => Self::VersionMismatch,
            2 => Self::Busy,
            other => Self::Other(other),
        }
    }
}

impl From<ShutdownReason> for u8 {
    fn from(reason: ShutdownReason) -> Self {
        match reason {
            ShutdownReason::IdleTimeout => 0,
            ShutdownReason::VersionMismatch => 1,
            ShutdownReason::Busy => 2,
            ShutdownReason::Other(code) => code,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Shutdown {
    pub reason: Option<ShutdownReason>,
    /// Seconds the peer asks us to wait before reconnecting.
    pub reconnect_delay: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    ContactHeader(ContactHeader),
    Data(DataSegment),
    /// Cumulative number of payload bytes received for the current block.
    Ack(u64),
    /// Refusal of the block currently being received by the peer.
    Nack,
    KeepAlive,
    Shutdown(Shutdown),
}

impl Segment {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Segment::ContactHeader(_) => "contact header",
            Segment::Data(_) => "data",
            Segment::Ack(_) => "ack",
            Segment::Nack => "nack",
            Segment::KeepAlive => "keepalive",
            Segment::Shutdown(_) => "shutdown",
        }
    }

    pub fn encode(&self, sink: &mut EncodeSink) -> io::Result<()> {
        match self {
            Segment::ContactHeader(header) => {
                sink.append_bytes(&MAGIC)?;
                sink.put_byte(header.version)?;
                sink.put_byte(header.flags)?;
                sink.append_bytes(&header.keepalive_secs.to_be_bytes())?;
                sdnv::encode_u64(header.endpoint_id.len() as u64, sink)?;
                sink.append_bytes(&header.endpoint_id)
            }
            Segment::Data(data) => {
                let mut flags = 0;
                if data.start {
                    flags |= DATA_START;
                }
                if data.end {
                    flags |= DATA_END;
                }
                sink.put_byte(TYPE_DATA << 4 | flags)?;
                sdnv::encode_u64(data.payload.len() as u64, sink)?;
                sink.append_bytes(&data.payload)
            }
            Segment::Ack(length) => {
                sink.put_byte(TYPE_ACK << 4)?;
                sdnv::encode_u64(*length, sink)
            }
            Segment::Nack => sink.put_byte(TYPE_REFUSE << 4),
            Segment::KeepAlive => sink.put_byte(TYPE_KEEPALIVE << 4),
            Segment::Shutdown(shutdown) => {
                let mut flags = 0;
                if shutdown.reason.is_some() {
                    flags |= SHUTDOWN_REASON;
                }
                if shutdown.reconnect_delay.is_some() {
                    flags |= SHUTDOWN_DELAY;
                }
                sink.put_byte(TYPE_SHUTDOWN << 4 | flags)?;
                if let Some(reason) = shutdown.reason {
                    sink.put_byte(reason.into())?;
                }
                if let Some(delay) = shutdown.reconnect_delay {
                    sdnv::encode_u64(delay, sink)?;
                }
                Ok(())
            }
        }
    }

    /// Encodes the segment into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut sink = EncodeSink::new();
        self.encode(&mut sink)
            .and_then(|()| sink.finalize())
            .expect("memory sinks do not fail")
    }
}

/// Decodes one segment whose first byte has already been read from `source`.
///
/// A Contact Header is only recognized while `expecting_contact_header` is set; otherwise its
/// magic byte is just an unknown segment type.
pub fn decode_segment<R: Read>(
    first_byte: u8,
    source: &mut DecodeSource<R>,
    expecting_contact_header: bool,
) -> Result<Segment> {
    if expecting_contact_header && first_byte == MAGIC[0] {
        return decode_contact_header(source).map(Segment::ContactHeader);
    }

    let flags = first_byte & 0x0f;

    match first_byte >> 4 {
        TYPE_DATA => {
            let length = sdnv::decode_u64(source)?;
            if length > MAX_SEGMENT_LENGTH {
                return Err(ProtocolError::SegmentTooLarge(length).into());
            }

            Ok(Segment::Data(DataSegment {
                start: flags & DATA_START != 0,
                end: flags & DATA_END != 0,
                payload: source.take_bytes(length as usize)?,
            }))
        }
        TYPE_ACK => Ok(Segment::Ack(sdnv::decode_u64(source)?)),
        TYPE_REFUSE => Ok(Segment::Nack),
        TYPE_KEEPALIVE => Ok(Segment::KeepAlive),
        TYPE_SHUTDOWN => {
            let reason = if flags & SHUTDOWN_REASON != 0 {
                Some(ShutdownReason::from(source.next_byte()?))
            } else {
                None
            };

            let reconnect_delay = if flags & SHUTDOWN_DELAY != 0 {
                Some(sdnv::decode_u64(source)?)
            } else {
                None
            };

            Ok(Segment::Shutdown(Shutdown {
                reason,
                reconnect_delay,
            }))
        }
        _ => Err(ProtocolError::UnknownSegmentType(first_byte).into()),
    }
}

fn decode_contact_header<R: Read>(source: &mut DecodeSource<R>) -> Result<ContactHeader> {
    let rest = source.take_bytes(3)?;
    if rest[..] != MAGIC[1..] {
        return Err(ProtocolError::BadMagic([MAGIC[0], rest[0], rest[1], rest[2]]).into());
    }

    let version = source.next_byte()?;
    if version > PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version).into());
    }

    let flags = source.next_byte()?;
    let keepalive_secs = u16::from_be_bytes([source.next_byte()?, source.next_byte()?]);

    let eid_length = sdnv::decode_u64(source)?;
    if eid_length > MAX_ENDPOINT_ID_LENGTH {
        return Err(ProtocolError::SegmentTooLarge(eid_length).into());
    }
    let endpoint_id = source.take_bytes(eid_length as usize)?;

    Ok(ContactHeader {
        version,
        flags,
        keepalive_secs,
        endpoint_id,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{DecodeError, Error};

    fn roundtrip(segment: Segment) -> Segment {
        let bytes = segment.to_bytes();
        let mut source = DecodeSource::from_slice(&bytes);
        let first = source.next_byte().unwrap();
        let decoded =
            decode_segment(first, &mut source, matches!(segment, Segment::ContactHeader(_)))
                .unwrap();
        assert!(source.at_end(), "trailing bytes after {}", segment.name());
        decoded
    }

    fn header() -> ContactHeader {
        ContactHeader {
            version: 3,
            flags: flags::BUNDLE_ACKS | flags::NACKS,
            keepalive_secs: 10,
            endpoint_id: b"dtn://node-a".to_vec(),
        }
    }

    #[test]
    fn contact_header_wire_layout() {
        let bytes = Segment::ContactHeader(header()).to_bytes();

        let mut expected = vec![0x64, 0x74, 0x6e, 0x21, 0x03, 0x05, 0x00, 0x0a, 12];
        expected.extend_from_slice(b"dtn://node-a");
        assert_eq!(bytes, expected);
    }

    #[test]
    fn endpoint_id_bytes_are_kept_verbatim() {
        let raw = vec![b'd', b't', b'n', 0xff, 0xfe, 0x80];
        let mut bytes = vec![0x64, 0x74, 0x6e, 0x21, 0x03, 0x00, 0x00, 0x00, raw.len() as u8];
        bytes.extend_from_slice(&raw);

        let mut source = DecodeSource::from_slice(&bytes);
        let first = source.next_byte().unwrap();
        match decode_segment(first, &mut source, true).unwrap() {
            Segment::ContactHeader(decoded) => {
                assert_eq!(decoded.endpoint_id, raw);
                assert_eq!(Segment::ContactHeader(decoded).to_bytes(), bytes);
            }
            other => panic!("unexpected segment {other:?}"),
        }
    }

    #[test]
    fn every_kind_roundtrips() {
        let segments = [
            Segment::ContactHeader(header()),
            Segment::Data(DataSegment {
                start: true,
                end: false,
                payload: vec![1; 300],
            }),
            Segment::Ack(70_000),
            Segment::Nack,
            Segment::KeepAlive,
            Segment::Shutdown(Shutdown {
                reason: Some(ShutdownReason::Busy),
                reconnect_delay: Some(4),
            }),
            Segment::Shutdown(Shutdown {
                reason: Some(ShutdownReason::Other(9)),
                reconnect_delay: None,
            }),
        ];

        for segment in segments {
            assert_eq!(roundtrip(segment.clone()), segment);
        }
    }

    #[test]
    fn empty_data_segment_with_both_flags() {
        let segment = Segment::Data(DataSegment {
            start: true,
            end: true,
            payload: vec![],
        });

        assert_eq!(segment.to_bytes(), vec![0x13, 0x00]);
        assert_eq!(roundtrip(segment.clone()), segment);
    }

    #[test]
    fn bare_shutdown_omits_optional_fields() {
        let segment = Segment::Shutdown(Shutdown::default());

        assert_eq!(segment.to_bytes(), vec![0x50]);
        assert_eq!(roundtrip(segment.clone()), segment);
    }

    #[test]
    fn shutdown_fields_in_order() {
        let segment = Segment::Shutdown(Shutdown {
            reason: Some(ShutdownReason::IdleTimeout),
            reconnect_delay: Some(200),
        });

        assert_eq!(segment.to_bytes(), vec![0x53, 0x00, 0x81, 0x48]);
    }

    #[test]
    fn bad_magic() {
        let bytes = [0x64, 0x74, 0x6e, 0x22, 3, 0, 0, 0, 0];
        let mut source = DecodeSource::from_slice(&bytes[1..]);

        let result = decode_segment(bytes[0], &mut source, true);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::BadMagic(_)))
        ));
    }

    #[test]
    fn unsupported_version() {
        let mut header = header();
        header.version = 4;
        let bytes = Segment::ContactHeader(header).to_bytes();
        let mut source = DecodeSource::from_slice(&bytes[1..]);

        assert!(matches!(
            decode_segment(bytes[0], &mut source, true),
            Err(Error::Protocol(ProtocolError::UnsupportedVersion(4)))
        ));
    }

    #[test]
    fn magic_byte_outside_header_phase_is_unknown() {
        let mut source = DecodeSource::from_slice(&[]);

        assert!(matches!(
            decode_segment(MAGIC[0], &mut source, false),
            Err(Error::Protocol(ProtocolError::UnknownSegmentType(0x64)))
        ));
        assert!(matches!(
            decode_segment(0x70, &mut source, false),
            Err(Error::Protocol(ProtocolError::UnknownSegmentType(0x70)))
        ));
    }

    #[test]
    fn truncated_data_segment() {
        let mut source = DecodeSource::from_slice(&[0x05, 1, 2]);

        assert!(matches!(
            decode_segment(0x13, &mut source, false),
            Err(Error::Decode(DecodeError::OutOfData))
        ));
    }

    #[test]
    fn oversized_data_segment() {
        let mut sink = EncodeSink::new();
        sdnv::encode_u64(MAX_SEGMENT_LENGTH + 1, &mut sink).unwrap();
        let bytes = sink.finalize().unwrap();

        assert!(matches!(
            decode_segment(0x12, &mut DecodeSource::from_slice(&bytes), false),
            Err(Error::Protocol(ProtocolError::SegmentTooLarge(_)))
        ));
    }
}
