use bytes::{Buf, BufMut, Bytes, BytesMut};

/// MySQL packet header size: 3 bytes length + 1 byte sequence
pub const PACKET_HEADER_SIZE: usize = 4;
/// Maximum packet payload size (16MB - 1)
pub const MAX_PACKET_SIZE: usize = 0xFF_FF_FF;
/// Compressed frame header: 3 bytes compressed length + 1 byte sequence + 3 bytes raw length
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// MySQL wire protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence_id: u8,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(sequence_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            sequence_id,
            payload: payload.into(),
        }
    }

    /// Encode packet to bytes, splitting payloads of 16MB or more into
    /// continuation frames with increasing sequence ids.
    pub fn encode(&self, dst: &mut BytesMut) {
        let mut seq = self.sequence_id;
        let mut rest: &[u8] = &self.payload;
        loop {
            let len = rest.len().min(MAX_PACKET_SIZE);
            put_u24_le(dst, len);
            dst.put_u8(seq);
            dst.extend_from_slice(&rest[..len]);
            rest = &rest[len..];
            // a full-size frame is always followed by another, possibly empty
            if len < MAX_PACKET_SIZE {
                break;
            }
            seq = seq.wrapping_add(1);
        }
    }

    /// Number of frames, and so sequence ids, this packet occupies on the wire
    pub fn frame_count(&self) -> usize {
        self.payload.len() / MAX_PACKET_SIZE + 1
    }

    /// Number of bytes this packet occupies on the wire
    pub fn wire_len(&self) -> usize {
        self.payload.len() + self.frame_count() * PACKET_HEADER_SIZE
    }

    /// Try to decode a single frame from bytes, returns None if not enough data
    pub fn decode(src: &mut BytesMut) -> Option<Self> {
        if src.len() < PACKET_HEADER_SIZE {
            return None;
        }

        let len = get_u24_le(src);

        let total_len = PACKET_HEADER_SIZE + len;
        if src.len() < total_len {
            return None;
        }

        let sequence_id = src[3];
        src.advance(PACKET_HEADER_SIZE);
        let payload = src.split_to(len).freeze();

        Some(Self {
            sequence_id,
            payload,
        })
    }

    /// First payload byte, if any
    pub fn header(&self) -> Option<u8> {
        self.payload.first().copied()
    }
}

/// Read a 3-byte little-endian length from the start of a buffer
pub fn get_u24_le(src: &[u8]) -> usize {
    src[0] as usize | ((src[1] as usize) << 8) | ((src[2] as usize) << 16)
}

pub fn put_u24_le(dst: &mut BytesMut, value: usize) {
    dst.put_u8((value & 0xFF) as u8);
    dst.put_u8(((value >> 8) & 0xFF) as u8);
    dst.put_u8(((value >> 16) & 0xFF) as u8);
}

/// Encode a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16777216 {
        buf.put_u8(0xFD);
        put_u24_le(buf, value as usize);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Encode a length-encoded string
pub fn put_lenenc_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

/// Read a length-encoded integer, advancing the slice.
///
/// Returns `Some(None)` for the NULL marker (0xFB).
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<Option<u64>> {
    let first = *buf.first()?;
    let (value, size) = match first {
        0..=0xFA => (first as u64, 1),
        0xFB => {
            buf.advance(1);
            return Some(None);
        }
        0xFC if buf.len() >= 3 => (u16::from_le_bytes([buf[1], buf[2]]) as u64, 3),
        0xFD if buf.len() >= 4 => (get_u24_le(&buf[1..]) as u64, 4),
        0xFE if buf.len() >= 9 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[1..9]);
            (u64::from_le_bytes(raw), 9)
        }
        _ => return None,
    };
    buf.advance(size);
    Some(Some(value))
}

/// Read a length-encoded string, advancing the slice. NULL yields `Some(None)`.
pub fn get_lenenc_bytes<'a>(buf: &mut &'a [u8]) -> Option<Option<&'a [u8]>> {
    let len = match get_lenenc_int(buf)? {
        Some(len) => len as usize,
        None => return Some(None),
    };
    if buf.len() < len {
        return None;
    }
    let value = &buf[..len];
    buf.advance(len);
    Some(Some(value))
}

/// Read a NUL-terminated string, advancing past the terminator.
/// A missing terminator consumes the rest of the buffer.
pub fn get_null_terminated(buf: &mut &[u8]) -> String {
    let null_pos = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let value = String::from_utf8_lossy(&buf[..null_pos]).to_string();
    let consumed = (null_pos + 1).min(buf.len());
    buf.advance(consumed);
    value
}

/// MySQL capability flags
#[allow(dead_code)]
pub mod capabilities {
    pub const CLIENT_LONG_PASSWORD: u32 = 1;
    pub const CLIENT_FOUND_ROWS: u32 = 1 << 1;
    pub const CLIENT_LONG_FLAG: u32 = 1 << 2;
    pub const CLIENT_CONNECT_WITH_DB: u32 = 1 << 3;
    pub const CLIENT_NO_SCHEMA: u32 = 1 << 4;
    pub const CLIENT_COMPRESS: u32 = 1 << 5;
    pub const CLIENT_ODBC: u32 = 1 << 6;
    pub const CLIENT_LOCAL_FILES: u32 = 1 << 7;
    pub const CLIENT_IGNORE_SPACE: u32 = 1 << 8;
    pub const CLIENT_PROTOCOL_41: u32 = 1 << 9;
    pub const CLIENT_INTERACTIVE: u32 = 1 << 10;
    pub const CLIENT_SSL: u32 = 1 << 11;
    pub const CLIENT_IGNORE_SIGPIPE: u32 = 1 << 13;
    pub const CLIENT_TRANSACTIONS: u32 = 1 << 14;
    pub const CLIENT_RESERVED: u32 = 1 << 15;
    pub const CLIENT_SECURE_CONNECTION: u32 = 1 << 15;
    pub const CLIENT_MULTI_STATEMENTS: u32 = 1 << 16;
    pub const CLIENT_MULTI_RESULTS: u32 = 1 << 17;
    pub const CLIENT_PS_MULTI_RESULTS: u32 = 1 << 18;
    pub const CLIENT_PLUGIN_AUTH: u32 = 1 << 19;
    pub const CLIENT_CONNECT_ATTRS: u32 = 1 << 20;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 1 << 21;
    pub const CLIENT_DEPRECATE_EOF: u32 = 1 << 24;

    /// Base capabilities the gateway announces to clients and requests from backends
    ///
    /// Note: CLIENT_DEPRECATE_EOF is not included; result sets are always
    /// framed with EOF packets.
    pub const DEFAULT_CAPABILITIES: u32 = CLIENT_LONG_PASSWORD
        | CLIENT_FOUND_ROWS
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_ODBC
        | CLIENT_IGNORE_SPACE
        | CLIENT_PROTOCOL_41
        | CLIENT_INTERACTIVE
        | CLIENT_IGNORE_SIGPIPE
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS;

    /// Server capabilities derived from system settings
    pub fn server_capabilities(use_compression: bool, use_handshake_v10: bool) -> u32 {
        let mut flags = DEFAULT_CAPABILITIES;
        if use_compression {
            flags |= CLIENT_COMPRESS;
        }
        if use_handshake_v10 {
            flags |= CLIENT_PLUGIN_AUTH;
        }
        flags
    }
}

/// Server status flags
pub mod status {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
}

/// MySQL command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Sleep = 0x00,
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    FieldList = 0x04,
    CreateDb = 0x05,
    DropDb = 0x06,
    Refresh = 0x07,
    Shutdown = 0x08,
    Statistics = 0x09,
    ProcessInfo = 0x0a,
    Connect = 0x0b,
    ProcessKill = 0x0c,
    Debug = 0x0d,
    Ping = 0x0e,
    Time = 0x0f,
    DelayedInsert = 0x10,
    ChangeUser = 0x11,
    BinlogDump = 0x12,
    TableDump = 0x13,
    ConnectOut = 0x14,
    RegisterSlave = 0x15,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    Daemon = 0x1d,
    BinlogDumpGtid = 0x1e,
    ResetConnection = 0x1f,
    Unknown = 0xff,
}

impl From<u8> for Command {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Command::Sleep,
            0x01 => Command::Quit,
            0x02 => Command::InitDb,
            0x03 => Command::Query,
            0x04 => Command::FieldList,
            0x05 => Command::CreateDb,
            0x06 => Command::DropDb,
            0x07 => Command::Refresh,
            0x08 => Command::Shutdown,
            0x09 => Command::Statistics,
            0x0a => Command::ProcessInfo,
            0x0b => Command::Connect,
            0x0c => Command::ProcessKill,
            0x0d => Command::Debug,
            0x0e => Command::Ping,
            0x0f => Command::Time,
            0x10 => Command::DelayedInsert,
            0x11 => Command::ChangeUser,
            0x12 => Command::BinlogDump,
            0x13 => Command::TableDump,
            0x14 => Command::ConnectOut,
            0x15 => Command::RegisterSlave,
            0x16 => Command::StmtPrepare,
            0x17 => Command::StmtExecute,
            0x18 => Command::StmtSendLongData,
            0x19 => Command::StmtClose,
            0x1a => Command::StmtReset,
            0x1b => Command::SetOption,
            0x1c => Command::StmtFetch,
            0x1d => Command::Daemon,
            0x1e => Command::BinlogDumpGtid,
            0x1f => Command::ResetConnection,
            _ => Command::Unknown,
        }
    }
}
