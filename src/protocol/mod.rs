pub mod auth;
pub mod charset;
pub mod codec;
pub mod command;
pub mod compress;
pub mod error_code;
pub mod handshake;
pub mod packet;
pub mod resultset;

pub use auth::{AuthOutcome, AuthState, AuthenticatedSession, Authenticator, ConfigPrivileges, Privileges};
pub use codec::{CodecError, PacketCodec};
pub use command::{ClientCommand, SessionStatement};
pub use handshake::{
    compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, AuthSwitchRequest, EofPacket, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket,
};
pub use packet::{capabilities, Packet};
pub use resultset::{ColumnDefinition, QueryResult, Row};
