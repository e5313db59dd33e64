//! Text-protocol result sets

use bytes::{BufMut, BytesMut};

use super::charset;
use super::handshake::EofPacket;
use super::packet::{get_lenenc_bytes, get_lenenc_int, put_lenenc_bytes, put_lenenc_int, Packet};

/// MYSQL_TYPE_VAR_STRING
pub const COLUMN_TYPE_VAR_STRING: u8 = 0xFD;

/// Column definition (Protocol::ColumnDefinition41)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub name: String,
    pub character_set: u16,
    pub column_length: u32,
    pub column_type: u8,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDefinition {
    /// A string column with no table, as used for gateway-generated results
    pub fn varchar(name: &str) -> Self {
        Self {
            schema: String::new(),
            table: String::new(),
            name: name.to_string(),
            character_set: charset::index_of("utf8").unwrap_or(33) as u16,
            column_length: 1024,
            column_type: COLUMN_TYPE_VAR_STRING,
            flags: 0,
            decimals: 0,
        }
    }

    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::new();
        put_lenenc_bytes(&mut buf, b"def");
        put_lenenc_bytes(&mut buf, self.schema.as_bytes());
        put_lenenc_bytes(&mut buf, self.table.as_bytes());
        put_lenenc_bytes(&mut buf, self.table.as_bytes());
        put_lenenc_bytes(&mut buf, self.name.as_bytes());
        put_lenenc_bytes(&mut buf, self.name.as_bytes());
        // length of the fixed-length fields
        buf.put_u8(0x0C);
        buf.put_u16_le(self.character_set);
        buf.put_u32_le(self.column_length);
        buf.put_u8(self.column_type);
        buf.put_u16_le(self.flags);
        buf.put_u8(self.decimals);
        buf.put_u16_le(0);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut buf = payload;
        let mut next = || -> Option<String> {
            let value = get_lenenc_bytes(&mut buf)?.unwrap_or_default();
            Some(String::from_utf8_lossy(value).to_string())
        };
        let _catalog = next()?;
        let schema = next()?;
        let table = next()?;
        let _org_table = next()?;
        let name = next()?;
        let _org_name = next()?;

        // fixed-length block: 0x0C marker followed by 12 bytes
        if buf.len() < 13 {
            return None;
        }
        let fixed = &buf[1..13];
        Some(Self {
            schema,
            table,
            name,
            character_set: u16::from_le_bytes([fixed[0], fixed[1]]),
            column_length: u32::from_le_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]),
            column_type: fixed[6],
            flags: u16::from_le_bytes([fixed[7], fixed[8]]),
            decimals: fixed[9],
        })
    }
}

/// A text row. `None` is SQL NULL.
pub type Row = Vec<Option<String>>;

/// Encode one text row
pub fn encode_row(row: &Row, sequence_id: u8) -> Packet {
    let mut buf = BytesMut::new();
    for value in row {
        match value {
            Some(v) => put_lenenc_bytes(&mut buf, v.as_bytes()),
            None => buf.put_u8(0xFB),
        }
    }
    Packet::new(sequence_id, buf.freeze())
}

/// Decode a text row with `columns` values
pub fn parse_row(payload: &[u8], columns: usize) -> Option<Row> {
    let mut buf = payload;
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        let value = get_lenenc_bytes(&mut buf)?;
        row.push(value.map(|v| String::from_utf8_lossy(v).to_string()));
    }
    Some(row)
}

/// Read the column count that opens a result set
pub fn parse_column_count(payload: &[u8]) -> Option<usize> {
    let mut buf = payload;
    get_lenenc_int(&mut buf)?.map(|n| n as usize)
}

/// Outcome of a statement on a backend
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

impl QueryResult {
    /// Result of a statement that returned no rows
    pub fn affected(affected_rows: u64, last_insert_id: u64) -> Self {
        Self {
            affected_rows,
            last_insert_id,
            ..Default::default()
        }
    }

    /// Whether this result carries a result set rather than an OK
    pub fn is_result_set(&self) -> bool {
        !self.columns.is_empty()
    }

    /// First value of the first row
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }

    /// Encode as a text result set starting at `first_seq`:
    /// column count, definitions, EOF, rows, EOF.
    pub fn encode_result_set(&self, first_seq: u8, status_flags: u16) -> Vec<Packet> {
        let mut packets = Vec::with_capacity(self.columns.len() + self.rows.len() + 3);
        let mut seq = first_seq;
        // rows of 16MB or more take several sequence ids on the wire
        let mut push = |make: &dyn Fn(u8) -> Packet| {
            let packet = make(seq);
            seq = seq.wrapping_add(packet.frame_count() as u8);
            packets.push(packet);
        };

        let mut count = BytesMut::new();
        put_lenenc_int(&mut count, self.columns.len() as u64);
        let count = count.freeze();
        push(&|seq| Packet::new(seq, count.clone()));

        for column in &self.columns {
            push(&|seq| column.encode(seq));
        }
        push(&|seq| EofPacket::new(status_flags).encode(seq));

        for row in &self.rows {
            push(&|seq| encode_row(row, seq));
        }
        push(&|seq| EofPacket::new(status_flags).encode(seq));
        packets
    }
}
