use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{DecodeError, Error, Result};

/// Size of one arena chunk of an in-memory sink.
const CHUNK_SIZE: usize = 4096;

enum Backing {
    Memory(Vec<Vec<u8>>),
    File {
        path: PathBuf,
        writer: BufWriter<File>,
    },
    Closed,
}

/// Append-only byte sink used by every encoder. Memory sinks grow in fixed-size chunks so that
/// appending never moves bytes already written; file sinks stream straight to disk.
pub struct EncodeSink {
    backing: Backing,
    length: u64,
}

impl Default for EncodeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EncodeSink {
    /// Creates an empty in-memory sink.
    pub fn new() -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            length: 0,
        }
    }

    /// Creates a sink that writes to a newly created (or truncated) file.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let writer = BufWriter::new(File::create(&path)?);

        Ok(Self {
            backing: Backing::File { path, writer },
            length: 0,
        })
    }

    pub fn put_byte(&mut self, byte: u8) -> io::Result<()> {
        self.append_bytes(&[byte])
    }

    pub fn append_bytes(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        match &mut self.backing {
            Backing::Memory(chunks) => {
                self.length += bytes.len() as u64;

                while !bytes.is_empty() {
                    match chunks.last_mut() {
                        Some(chunk) if chunk.len() < CHUNK_SIZE => {
                            let n = (CHUNK_SIZE - chunk.len()).min(bytes.len());
                            chunk.extend_from_slice(&bytes[..n]);
                            bytes = &bytes[n..];
                        }
                        _ => chunks.push(Vec::with_capacity(CHUNK_SIZE)),
                    }
                }

                Ok(())
            }
            Backing::File { writer, .. } => {
                writer.write_all(bytes)?;
                self.length += bytes.len() as u64;
                Ok(())
            }
            Backing::Closed => Err(closed()),
        }
    }

    /// Appends the full contents of another sink.
    pub fn append(&mut self, other: &mut EncodeSink) -> io::Result<()> {
        other.write_to(self)
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Writes the contents of the sink into `out` without consuming it.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        match &mut self.backing {
            Backing::Memory(chunks) => {
                for chunk in chunks.iter() {
                    out.write_all(chunk)?;
                }
                Ok(())
            }
            Backing::File { path, writer } => {
                writer.flush()?;
                let mut file = File::open(path)?;
                io::copy(&mut file, out)?;
                Ok(())
            }
            Backing::Closed => Err(closed()),
        }
    }

    /// Returns the encoded bytes. Only memory sinks can be finalized.
    pub fn finalize(self) -> io::Result<Vec<u8>> {
        match self.backing {
            Backing::Memory(chunks) => Ok(chunks.concat()),
            Backing::File { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "file-backed sink cannot be finalized into memory",
            )),
            Backing::Closed => Err(closed()),
        }
    }

    /// Releases the backing storage. File contents are flushed first. Further writes fail.
    pub fn close(&mut self) -> io::Result<()> {
        match std::mem::replace(&mut self.backing, Backing::Closed) {
            Backing::File { mut writer, .. } => writer.flush(),
            Backing::Memory(_) | Backing::Closed => Ok(()),
        }
    }
}

impl Write for EncodeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.backing {
            Backing::File { writer, .. } => writer.flush(),
            _ => Ok(()),
        }
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "sink closed")
}

/// Cursor over a byte source. Reads never return partial results: a read that cannot be
/// satisfied fails with [`DecodeError::OutOfData`].
pub struct DecodeSource<R> {
    reader: Option<R>,
    position: u64,
    length: u64,
}

impl<'a> DecodeSource<&'a [u8]> {
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self {
            reader: Some(bytes),
            position: 0,
            length: bytes.len() as u64,
        }
    }
}

impl DecodeSource<BufReader<File>> {
    /// Opens a file as a source spanning the whole file.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let length = file.metadata()?.len();

        Ok(Self {
            reader: Some(BufReader::new(file)),
            position: 0,
            length,
        })
    }
}

impl<R: Read> DecodeSource<R> {
    /// Wraps a live stream. Its length is unknown, so the source only ends when the stream does.
    pub fn from_stream(reader: R) -> Self {
        Self {
            reader: Some(reader),
            position: 0,
            length: u64::MAX,
        }
    }

    pub fn next_byte(&mut self) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_exact(&mut byte)?;
        Ok(byte[0])
    }

    pub fn take_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        if (n as u64) > self.remaining() {
            return Err(DecodeError::OutOfData.into());
        }

        let reader = self.reader.as_mut().ok_or(DecodeError::OutOfData)?;

        // Streams are read incrementally so a bogus length cannot force a huge allocation.
        let mut bytes = Vec::with_capacity(n.min(64 * 1024));
        reader.take(n as u64).read_to_end(&mut bytes)?;

        if bytes.len() < n {
            self.close();
            return Err(DecodeError::OutOfData.into());
        }

        self.position += n as u64;
        Ok(bytes)
    }

    /// Bytes left before the end of the source; `u64::MAX` minus the position for streams.
    pub fn remaining(&self) -> u64 {
        self.length - self.position
    }

    pub fn at_end(&self) -> bool {
        self.reader.is_none() || self.remaining() == 0
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Drops the underlying reader. The source reports itself at end from now on.
    pub fn close(&mut self) {
        self.reader = None;
        self.position = self.length;
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.at_end() || (buf.len() as u64) > self.remaining() {
            return Err(DecodeError::OutOfData.into());
        }

        let reader = self.reader.as_mut().ok_or(DecodeError::OutOfData)?;

        match reader.read_exact(buf) {
            Ok(()) => {
                self.position += buf.len() as u64;
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                self.close();
                Err(DecodeError::OutOfData.into())
            }
            Err(err) => Err(Error::Transport(err)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn memory_sink_spans_chunks() {
        let mut sink = EncodeSink::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();

        sink.put_byte(0xaa).unwrap();
        sink.append_bytes(&data).unwrap();

        assert_eq!(sink.len(), 10_001);

        let bytes = sink.finalize().unwrap();
        assert_eq!(bytes[0], 0xaa);
        assert_eq!(&bytes[1..], &data[..]);
    }

    #[test]
    fn append_other_sink() {
        let mut a = EncodeSink::new();
        let mut b = EncodeSink::new();
        a.append_bytes(b"hello ").unwrap();
        b.append_bytes(b"world").unwrap();

        a.append(&mut b).unwrap();

        assert_eq!(a.len(), 11);
        assert_eq!(b.len(), 5);
        assert_eq!(a.finalize().unwrap(), b"hello world");
    }

    #[test]
    fn file_sink_cannot_finalize() {
        let path = std::env::temp_dir().join(format!("dtn-tcpcl-sink-{}", std::process::id()));
        let mut sink = EncodeSink::file(&path).unwrap();
        sink.append_bytes(b"on disk").unwrap();

        let mut copy = EncodeSink::new();
        copy.append(&mut sink).unwrap();
        assert_eq!(copy.finalize().unwrap(), b"on disk");

        sink.close().unwrap();
        let mut source = DecodeSource::open(&path).unwrap();
        assert_eq!(source.remaining(), 7);
        assert_eq!(source.take_bytes(7).unwrap(), b"on disk");
        assert!(source.at_end());

        let sink = EncodeSink::file(&path).unwrap();
        assert_eq!(
            sink.finalize().unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn closed_sink_rejects_writes() {
        let mut sink = EncodeSink::new();
        sink.put_byte(1).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();

        assert!(sink.put_byte(2).is_err());
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn source_never_returns_partial_reads() {
        let mut source = DecodeSource::from_slice(&[1, 2, 3]);

        assert_eq!(source.next_byte().unwrap(), 1);
        assert!(matches!(
            source.take_bytes(3),
            Err(Error::Decode(DecodeError::OutOfData))
        ));
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.take_bytes(2).unwrap(), vec![2, 3]);
        assert!(source.at_end());
        assert!(matches!(
            source.next_byte(),
            Err(Error::Decode(DecodeError::OutOfData))
        ));
    }

    #[test]
    fn closed_source_is_at_end() {
        let mut source = DecodeSource::from_slice(&[1, 2, 3]);
        source.close();

        assert!(source.at_end());
        assert_eq!(source.remaining(), 0);
        assert!(source.next_byte().is_err());
    }

    #[test]
    fn stream_source_reports_eof_as_out_of_data() {
        let mut source = DecodeSource::from_stream(io::Cursor::new(vec![7u8]));

        assert!(!source.at_end());
        assert_eq!(source.next_byte().unwrap(), 7);
        assert!(matches!(
            source.next_byte(),
            Err(Error::Decode(DecodeError::OutOfData))
        ));
        assert!(source.at_end());
    }
}
