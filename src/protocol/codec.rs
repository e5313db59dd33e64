use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::compress::{compress_mysql_packet, inflate_frame};
use super::packet::{get_u24_le, Packet, COMPRESSED_HEADER_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE};

/// Logical packets larger than this are refused unless configured otherwise
pub const DEFAULT_MAX_ALLOWED_PACKET: usize = 1 << 30;

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet too large: {size} bytes exceeds max_allowed_packet {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Compression error: {0}")]
    Decompress(String),
}

/// Joins continuation frames (payload length 0xFFFFFF) into one logical packet
#[derive(Debug)]
struct Reassembler {
    max_allowed_packet: usize,
    partial: Option<BytesMut>,
}

impl Reassembler {
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        loop {
            if src.len() < PACKET_HEADER_SIZE {
                return Ok(None);
            }

            let len = get_u24_le(src);
            let buffered = self.partial.as_ref().map_or(0, |p| p.len());
            if buffered + len > self.max_allowed_packet {
                self.partial = None;
                return Err(CodecError::PacketTooLarge {
                    size: buffered + len,
                    max: self.max_allowed_packet,
                });
            }

            let frame = match Packet::decode(src) {
                Some(frame) => frame,
                None => {
                    src.reserve(PACKET_HEADER_SIZE + len - src.len());
                    return Ok(None);
                }
            };

            if len == MAX_PACKET_SIZE {
                self.partial
                    .get_or_insert_with(BytesMut::new)
                    .extend_from_slice(&frame.payload);
                continue;
            }

            return Ok(Some(match self.partial.take() {
                Some(mut joined) => {
                    joined.extend_from_slice(&frame.payload);
                    Packet::new(frame.sequence_id, joined.freeze())
                }
                None => frame,
            }));
        }
    }
}

#[derive(Debug)]
struct Compressor {
    min_length: usize,
    /// Decompressed bytes not yet split into packets
    inflated: BytesMut,
}

/// MySQL packet codec for use with tokio Framed
///
/// Reassembles multi-frame packets, enforces `max_allowed_packet` and, once
/// enabled, unwraps and produces compressed frames.
#[derive(Debug)]
pub struct PacketCodec {
    reassembler: Reassembler,
    compression: Option<Compressor>,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ALLOWED_PACKET)
    }
}

impl PacketCodec {
    pub fn new(max_allowed_packet: usize) -> Self {
        Self {
            reassembler: Reassembler {
                max_allowed_packet,
                partial: None,
            },
            compression: None,
        }
    }

    /// Switch to the compressed protocol. Applies to all following frames.
    pub fn enable_compression(&mut self, min_length: usize) {
        self.compression = Some(Compressor {
            min_length,
            inflated: BytesMut::new(),
        });
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub fn max_allowed_packet(&self) -> usize {
        self.reassembler.max_allowed_packet
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let comp = match self.compression.as_mut() {
            Some(comp) => comp,
            None => return self.reassembler.decode(src),
        };

        loop {
            if let Some(packet) = self.reassembler.decode(&mut comp.inflated)? {
                return Ok(Some(packet));
            }

            if src.len() < COMPRESSED_HEADER_SIZE {
                return Ok(None);
            }
            let comp_len = get_u24_le(src);
            let raw_len = get_u24_le(&src[4..]);
            let announced = if raw_len == 0 { comp_len } else { raw_len };
            let limit = self.reassembler.max_allowed_packet + PACKET_HEADER_SIZE;
            if announced > limit {
                return Err(CodecError::PacketTooLarge {
                    size: announced,
                    max: self.reassembler.max_allowed_packet,
                });
            }

            let frame_len = COMPRESSED_HEADER_SIZE + comp_len;
            if src.len() < frame_len {
                src.reserve(frame_len - src.len());
                return Ok(None);
            }

            let frame = src.split_to(frame_len);
            inflate_frame(&frame[COMPRESSED_HEADER_SIZE..], raw_len, &mut comp.inflated)?;
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.compression.as_ref() {
            None => item.encode(dst),
            Some(comp) => {
                let mut plain = BytesMut::with_capacity(item.wire_len());
                item.encode(&mut plain);
                let frames = compress_mysql_packet(&plain, comp.min_length)?;
                dst.put(frames);
            }
        }
        Ok(())
    }
}
