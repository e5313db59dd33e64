use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::ConnError;
use crate::config::DBHostConfig;
use crate::protocol::handshake::{AuthSwitchRequest, NATIVE_PASSWORD_PLUGIN};
use crate::protocol::resultset::{parse_column_count, parse_row, ColumnDefinition, QueryResult};
use crate::protocol::{
    capabilities, compute_auth_response, is_eof_packet, is_err_packet, is_ok_packet, ErrPacket,
    HandshakeResponse, InitialHandshake, OkPacket, Packet, PacketCodec,
};

/// A live session with one backend server
#[async_trait]
pub trait DriverConnection: Send {
    /// Run a statement and collect its complete result
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ConnError>;

    /// Switch the default database
    async fn change_schema(&mut self, schema: &str) -> Result<(), ConnError>;

    async fn ping(&mut self) -> Result<(), ConnError>;

    /// Say goodbye and drop the socket. Never fails.
    async fn close(&mut self);

    /// Current default database
    fn schema(&self) -> Option<&str>;

    /// Bytes received from the backend since the handshake
    fn bytes_read(&self) -> u64;
}

impl std::fmt::Debug for dyn DriverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverConnection")
            .field("schema", &self.schema())
            .field("bytes_read", &self.bytes_read())
            .finish()
    }
}

/// Opens driver connections to backend hosts
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &DBHostConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DriverConnection>, ConnError>;
}

/// Connects to real MySQL servers over TCP
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    charset_index: u8,
    connect_timeout: Duration,
}

impl MysqlConnector {
    pub fn new(charset_index: u8, connect_timeout: Duration) -> Self {
        Self {
            charset_index,
            connect_timeout,
        }
    }
}

impl Default for MysqlConnector {
    fn default() -> Self {
        // utf8_general_ci
        Self::new(0x21, Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(
        &self,
        host: &DBHostConfig,
        schema: Option<&str>,
    ) -> Result<Box<dyn DriverConnection>, ConnError> {
        let addr = host.addr();
        debug!(addr = %addr, schema = ?schema, "Connecting to backend");

        let open = async {
            let stream = TcpStream::connect(&addr)
                .await
                .map_err(|e| ConnError::Connect(format!("{}: {}", addr, e)))?;
            let _ = stream.set_nodelay(true);
            MysqlConnection::handshake(stream, host, schema, self.charset_index).await
        };

        let conn = tokio::time::timeout(self.connect_timeout, open)
            .await
            .map_err(|_| ConnError::Timeout(format!("connect to {}", addr)))??;
        Ok(Box::new(conn))
    }
}

/// Client side of the MySQL protocol over any byte stream
pub struct MysqlConnection<S = TcpStream> {
    framed: Framed<S, PacketCodec>,
    capabilities: u32,
    schema: Option<String>,
    server_version: String,
    connection_id: u32,
    bytes_read: u64,
}

impl<S> MysqlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Authenticate on a freshly opened stream
    pub async fn handshake(
        stream: S,
        host: &DBHostConfig,
        schema: Option<&str>,
        charset_index: u8,
    ) -> Result<Self, ConnError> {
        let mut framed = Framed::new(stream, PacketCodec::default());

        let packet = recv(&mut framed).await?;
        if is_err_packet(&packet.payload) {
            return Err(server_error(&packet, capabilities::CLIENT_PROTOCOL_41));
        }
        let server = InitialHandshake::parse(&packet.payload)
            .ok_or_else(|| ConnError::Protocol("Invalid backend handshake".into()))?;

        debug!(
            server_version = %server.server_version,
            connection_id = server.connection_id,
            "Received backend handshake"
        );

        let mut caps = capabilities::DEFAULT_CAPABILITIES & server.capability_flags;
        caps |= server.capability_flags & capabilities::CLIENT_PLUGIN_AUTH;
        if schema.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        } else {
            caps &= !capabilities::CLIENT_CONNECT_WITH_DB;
        }

        let response = HandshakeResponse {
            capability_flags: caps,
            max_packet_size: 16 * 1024 * 1024,
            character_set: charset_index,
            username: host.user.clone(),
            auth_response: compute_auth_response(&host.password, &server.auth_plugin_data()),
            database: schema.map(str::to_string),
            auth_plugin_name: Some(NATIVE_PASSWORD_PLUGIN.to_string()),
        };
        send(&mut framed, response.encode(packet.sequence_id.wrapping_add(1))).await?;

        let mut reply = recv(&mut framed).await?;

        // Servers defaulting to another plugin ask once to switch
        if reply.header() == Some(AuthSwitchRequest::HEADER) && !is_eof_packet(&reply.payload, 0) {
            let switch = AuthSwitchRequest::parse(&reply.payload)
                .ok_or_else(|| ConnError::Protocol("Invalid auth switch request".into()))?;
            if switch.plugin_name != NATIVE_PASSWORD_PLUGIN {
                return Err(ConnError::Auth(format!(
                    "unsupported auth plugin '{}'",
                    switch.plugin_name
                )));
            }
            let scramble = compute_auth_response(&host.password, &switch.auth_data);
            send(&mut framed, Packet::new(reply.sequence_id.wrapping_add(1), scramble)).await?;
            reply = recv(&mut framed).await?;
        }

        if is_err_packet(&reply.payload) {
            let err = ErrPacket::parse(&reply.payload, caps)
                .unwrap_or_else(|| ErrPacket::new(1045, "28000", "Access denied"));
            warn!(
                error_code = err.error_code,
                error_message = %err.error_message,
                "Backend authentication failed"
            );
            return Err(ConnError::Auth(err.error_message));
        }

        if !is_ok_packet(&reply.payload) {
            return Err(ConnError::Protocol("Expected OK packet from backend".into()));
        }

        debug!("Backend authentication successful");

        Ok(Self {
            framed,
            capabilities: caps,
            schema: schema.map(str::to_string),
            server_version: server.server_version,
            connection_id: server.connection_id,
            bytes_read: 0,
        })
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Thread id assigned by the backend
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Send a command and read the first response packet
    async fn command(&mut self, payload: Vec<u8>) -> Result<Packet, ConnError> {
        send(&mut self.framed, Packet::new(0, payload)).await?;
        self.read_packet().await
    }

    async fn read_packet(&mut self) -> Result<Packet, ConnError> {
        let packet = recv(&mut self.framed).await?;
        self.bytes_read += packet.wire_len() as u64;
        Ok(packet)
    }

    async fn read_result_set(&mut self, columns: usize) -> Result<QueryResult, ConnError> {
        let mut result = QueryResult {
            columns: Vec::with_capacity(columns),
            ..Default::default()
        };

        for _ in 0..columns {
            let packet = self.read_packet().await?;
            let column = ColumnDefinition::parse(&packet.payload)
                .ok_or_else(|| ConnError::Protocol("Invalid column definition".into()))?;
            result.columns.push(column);
        }

        // EOF after column definitions
        let packet = self.read_packet().await?;
        if !is_eof_packet(&packet.payload, self.capabilities) {
            return Err(ConnError::Protocol("Expected EOF after column definitions".into()));
        }

        loop {
            let packet = self.read_packet().await?;
            if is_eof_packet(&packet.payload, self.capabilities) {
                break;
            }
            if is_err_packet(&packet.payload) {
                return Err(server_error(&packet, self.capabilities));
            }
            let row = parse_row(&packet.payload, columns)
                .ok_or_else(|| ConnError::Protocol("Invalid row packet".into()))?;
            result.rows.push(row);
        }

        Ok(result)
    }
}

#[async_trait]
impl<S> DriverConnection for MysqlConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ConnError> {
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(0x03); // COM_QUERY
        payload.extend_from_slice(sql.as_bytes());
        let first = self.command(payload).await?;

        if is_err_packet(&first.payload) {
            return Err(server_error(&first, self.capabilities));
        }
        if is_ok_packet(&first.payload) {
            let ok = OkPacket::parse(&first.payload, self.capabilities)
                .ok_or_else(|| ConnError::Protocol("Invalid OK packet".into()))?;
            return Ok(QueryResult::affected(ok.affected_rows, ok.last_insert_id));
        }
        if first.header() == Some(0xFB) {
            return Err(ConnError::Protocol("LOCAL INFILE is not supported".into()));
        }

        let columns = parse_column_count(&first.payload)
            .ok_or_else(|| ConnError::Protocol("Invalid column count".into()))?;
        self.read_result_set(columns).await
    }

    async fn change_schema(&mut self, schema: &str) -> Result<(), ConnError> {
        let mut payload = vec![0x02]; // COM_INIT_DB
        payload.extend_from_slice(schema.as_bytes());
        let response = self.command(payload).await?;

        if is_err_packet(&response.payload) {
            return Err(server_error(&response, self.capabilities));
        }
        self.schema = Some(schema.to_string());
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), ConnError> {
        let response = self.command(vec![0x0e]).await?; // COM_PING
        if is_ok_packet(&response.payload) {
            Ok(())
        } else if is_err_packet(&response.payload) {
            Err(server_error(&response, self.capabilities))
        } else {
            Err(ConnError::Protocol("Unexpected ping response".into()))
        }
    }

    async fn close(&mut self) {
        // COM_QUIT has no response
        let _ = self.framed.send(Packet::new(0, vec![0x01])).await;
        let _ = self.framed.close().await;
    }

    fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

async fn send<S>(framed: &mut Framed<S, PacketCodec>, packet: Packet) -> Result<(), ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(packet)
        .await
        .map_err(|e| ConnError::Io(e.to_string()))
}

async fn recv<S>(framed: &mut Framed<S, PacketCodec>) -> Result<Packet, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .next()
        .await
        .ok_or(ConnError::Disconnected)?
        .map_err(|e| ConnError::Io(e.to_string()))
}

fn server_error(packet: &Packet, capabilities: u32) -> ConnError {
    match ErrPacket::parse(&packet.payload, capabilities) {
        Some(err) => ConnError::Server {
            code: err.error_code,
            state: err.sql_state,
            message: err.error_message,
        },
        None => ConnError::Protocol("Malformed error packet".into()),
    }
}
