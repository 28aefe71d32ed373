//! Self-delimiting numeric values: big-endian groups of seven bits where every byte except the
//! last carries the continuation bit `0x80`.

use std::io::{self, Read};

use crate::buffer::{DecodeSource, EncodeSink};
use crate::error::{DecodeError, Result};

const CONTINUATION: u8 = 0x80;
const GROUP_MASK: u8 = 0x7f;

/// Upper bound on the number of groups accepted by [`decode_bytes`].
pub const MAX_BYTE_GROUPS: usize = 4096;

pub fn encode_u64(value: u64, sink: &mut EncodeSink) -> io::Result<()> {
    let mut groups = [0u8; 10];
    let mut n = 0;
    let mut rest = value;

    loop {
        groups[n] = (rest & GROUP_MASK as u64) as u8;
        n += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }

    for i in (0..n).rev() {
        let continuation = if i == 0 { 0 } else { CONTINUATION };
        sink.put_byte(groups[i] | continuation)?;
    }

    Ok(())
}

pub fn encode_u32(value: u32, sink: &mut EncodeSink) -> io::Result<()> {
    encode_u64(value as u64, sink)
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

pub fn decode_u64<R: Read>(source: &mut DecodeSource<R>) -> Result<u64> {
    decode_bounded(source, 64)
}

pub fn decode_u32<R: Read>(source: &mut DecodeSource<R>) -> Result<u32> {
    decode_bounded(source, 32).map(|value| value as u32)
}

/// Decodes a value of at most `bits` bits. At most `ceil(bits / 7) + 1` groups are read, which
/// leaves room for one redundant leading zero group and nothing else.
fn decode_bounded<R: Read>(source: &mut DecodeSource<R>, bits: u32) -> Result<u64> {
    let max_groups = bits.div_ceil(7) + 1;
    let mut value: u64 = 0;

    for _ in 0..max_groups {
        let byte = source.next_byte()?;

        if value >> (bits - 7) != 0 {
            return Err(DecodeError::Overflow(bits).into());
        }

        value = (value << 7) | (byte & GROUP_MASK) as u64;

        if byte & CONTINUATION == 0 {
            return Ok(value);
        }
    }

    Err(DecodeError::Overflow(bits).into())
}

/// Encodes an arbitrary-width big-endian unsigned integer. Leading zero groups are not emitted;
/// an empty or all-zero input encodes as a single zero byte.
pub fn encode_bytes(value: &[u8], sink: &mut EncodeSink) -> io::Result<()> {
    let bit = |position: usize| -> u8 {
        let byte = value[value.len() - 1 - position / 8];
        (byte >> (position % 8)) & 1
    };

    let n_groups = (value.len() * 8).div_ceil(7);
    let total_bits = value.len() * 8;

    let groups: Vec<u8> = (0..n_groups)
        .rev()
        .map(|group| {
            (0..7)
                .map(|i| group * 7 + i)
                .filter(|&position| position < total_bits)
                .fold(0u8, |acc, position| acc | (bit(position) << (position % 7)))
        })
        .skip_while(|&group| group == 0)
        .collect();

    if groups.is_empty() {
        return sink.put_byte(0);
    }

    let last = groups.len() - 1;
    for (i, group) in groups.iter().enumerate() {
        let continuation = if i == last { 0 } else { CONTINUATION };
        sink.put_byte(group | continuation)?;
    }

    Ok(())
}

/// Decodes an arbitrary-width integer into its minimal big-endian byte string (at least one
/// byte long).
pub fn decode_bytes<R: Read>(source: &mut DecodeSource<R>) -> Result<Vec<u8>> {
    let mut groups = Vec::new();

    loop {
        if groups.len() == MAX_BYTE_GROUPS {
            return Err(DecodeError::Overflow((MAX_BYTE_GROUPS * 7) as u32).into());
        }

        let byte = source.next_byte()?;
        groups.push(byte & GROUP_MASK);

        if byte & CONTINUATION == 0 {
            break;
        }
    }

    let mut bytes = Vec::with_capacity(groups.len());
    let mut acc: u32 = 0;
    let mut n_bits = 0;

    for group in groups.iter().rev() {
        acc |= (*group as u32) << n_bits;
        n_bits += 7;

        while n_bits >= 8 {
            bytes.push(acc as u8);
            acc >>= 8;
            n_bits -= 8;
        }
    }

    if n_bits > 0 {
        bytes.push(acc as u8);
    }

    while bytes.len() > 1 && bytes.last() == Some(&0) {
        bytes.pop();
    }

    bytes.reverse();
    Ok(bytes)
}
