//! Charset name to default collation index mapping

/// `utf8_general_ci`
pub const DEFAULT_CHARSET_INDEX: u8 = 33;

const CHARSETS: &[(&str, u8)] = &[
    ("big5", 1),
    ("latin1", 8),
    ("ascii", 11),
    ("gb2312", 24),
    ("gbk", 28),
    ("utf8", 33),
    ("utf8mb3", 33),
    ("utf8mb4", 45),
    ("binary", 63),
];

/// Collation index for a charset name (case-insensitive)
pub fn index_of(name: &str) -> Option<u8> {
    CHARSETS
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, idx)| *idx)
}

/// Charset name for a collation index
pub fn name_of(index: u8) -> Option<&'static str> {
    match index {
        // utf8mb4 collations
        45 | 46 | 224..=247 | 255 => Some("utf8mb4"),
        // utf8 collations
        33 | 83 | 192..=215 => Some("utf8"),
        _ => CHARSETS.iter().find(|(_, idx)| *idx == index).map(|(n, _)| *n),
    }
}
