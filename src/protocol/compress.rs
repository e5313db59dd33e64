//! zlib compression and the MySQL compressed-frame wrapper
//!
//! A compressed frame carries `compressed length (3) | sequence (1) |
//! uncompressed length (3)` followed by the body. An uncompressed length of
//! zero means the body is stored raw. The body holds one or more ordinary
//! packets, header included.

use std::io::Read;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::{ZlibDecoder, ZlibEncoder};
use flate2::Compression;

use super::codec::CodecError;
use super::packet::{get_u24_le, put_u24_le, COMPRESSED_HEADER_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// zlib-compress a byte slice
pub fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() / 2 + 16);
    ZlibEncoder::new(data, Compression::default())
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    Ok(out)
}

/// Inflate a zlib stream
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(data.len() * 2);
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    Ok(out)
}

/// Wrap raw packet bytes (headers included) into compressed frames.
///
/// Chunks shorter than `min_length` are stored raw. The frame sequence id
/// starts at the sequence id of the first wrapped packet.
pub fn compress_mysql_packet(packet: &[u8], min_length: usize) -> Result<BytesMut, CodecError> {
    let mut out = BytesMut::with_capacity(packet.len() + COMPRESSED_HEADER_SIZE);
    let mut seq = packet.get(3).copied().unwrap_or(0);

    let mut chunks = packet.chunks(MAX_PACKET_SIZE).peekable();
    if chunks.peek().is_none() {
        write_frame(&mut out, seq, &[], 0);
        return Ok(out);
    }

    for chunk in chunks {
        if chunk.len() < min_length {
            write_frame(&mut out, seq, chunk, 0);
        } else {
            let compressed = compress(chunk)?;
            write_frame(&mut out, seq, &compressed, chunk.len());
        }
        seq = seq.wrapping_add(1);
    }
    Ok(out)
}

fn write_frame(out: &mut BytesMut, seq: u8, body: &[u8], raw_len: usize) {
    put_u24_le(out, body.len());
    out.put_u8(seq);
    put_u24_le(out, raw_len);
    out.extend_from_slice(body);
}

/// Unwrap compressed frames and re-split the contents into raw packets
/// (headers included).
pub fn decompress_mysql_packet(frames: &[u8]) -> Result<Vec<Bytes>, CodecError> {
    let mut plain = BytesMut::new();
    let mut rest = frames;

    while !rest.is_empty() {
        if rest.len() < COMPRESSED_HEADER_SIZE {
            return Err(CodecError::Decompress("truncated compressed header".into()));
        }
        let comp_len = get_u24_le(rest);
        let raw_len = get_u24_le(&rest[4..]);
        let body_end = COMPRESSED_HEADER_SIZE + comp_len;
        if rest.len() < body_end {
            return Err(CodecError::Decompress("truncated compressed body".into()));
        }
        inflate_frame(&rest[COMPRESSED_HEADER_SIZE..body_end], raw_len, &mut plain)?;
        rest = &rest[body_end..];
    }

    let mut packets = Vec::new();
    while !plain.is_empty() {
        if plain.len() < PACKET_HEADER_SIZE {
            return Err(CodecError::Decompress("truncated embedded packet".into()));
        }
        let len = PACKET_HEADER_SIZE + get_u24_le(&plain);
        if plain.len() < len {
            return Err(CodecError::Decompress("truncated embedded packet".into()));
        }
        packets.push(plain.split_to(len).freeze());
    }
    Ok(packets)
}

/// Append the contents of one compressed frame body to `out`.
///
/// Inflation stops one byte past `raw_len`, so a body that expands further is
/// rejected without being fully inflated.
pub(crate) fn inflate_frame(body: &[u8], raw_len: usize, out: &mut BytesMut) -> Result<(), CodecError> {
    if raw_len == 0 {
        out.extend_from_slice(body);
        return Ok(());
    }
    let mut data = Vec::with_capacity(raw_len);
    ZlibDecoder::new(body)
        .take(raw_len as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    if data.len() > raw_len {
        return Err(CodecError::Decompress(format!(
            "frame inflates past the announced {} bytes",
            raw_len
        )));
    }
    if data.len() < raw_len {
        return Err(CodecError::Decompress(format!(
            "inflated {} bytes, header announced {}",
            data.len(),
            raw_len
        )));
    }
    out.extend_from_slice(&data);
    Ok(())
}
