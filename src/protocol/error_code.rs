//! MySQL server error numbers used by the gateway

pub const ER_CON_COUNT_ERROR: u16 = 1040;
pub const ER_OUT_OF_RESOURCES: u16 = 1041;
pub const ER_HANDSHAKE_ERROR: u16 = 1043;
pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_NO_DB_ERROR: u16 = 1046;
pub const ER_UNKNOWN_COM_ERROR: u16 = 1047;
pub const ER_BAD_DB_ERROR: u16 = 1049;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
pub const ER_NET_READ_ERROR: u16 = 1158;
pub const ER_TOO_MANY_USER_CONNECTIONS: u16 = 1203;
pub const ER_CONNECT_TO_MASTER: u16 = 1218;
pub const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
pub const ER_OPTION_PREVENTS_STATEMENT: u16 = 1290;

/// SQL state for an error number
pub fn sql_state(code: u16) -> &'static str {
    match code {
        ER_CON_COUNT_ERROR | ER_OUT_OF_RESOURCES | ER_TOO_MANY_USER_CONNECTIONS => "08004",
        ER_HANDSHAKE_ERROR | ER_NET_PACKET_TOO_LARGE | ER_NET_READ_ERROR | ER_CONNECT_TO_MASTER => {
            "08S01"
        }
        ER_DBACCESS_DENIED_ERROR | ER_BAD_DB_ERROR => "42000",
        ER_ACCESS_DENIED_ERROR => "28000",
        ER_NO_DB_ERROR => "3D000",
        ER_UNKNOWN_COM_ERROR => "08S01",
        _ => "HY000",
    }
}
