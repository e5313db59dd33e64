use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, info, warn};

use super::{BackConnection, Connection, ConnectionKind, ConnManager};
use crate::buffer::BufferError;
use crate::config::SystemConfig;
use crate::executor::QueryHandler;
use crate::pool::ConnError;
use crate::protocol::error_code::*;
use crate::protocol::handshake::generate_seed;
use crate::protocol::packet::status::{SERVER_STATUS_AUTOCOMMIT, SERVER_STATUS_IN_TRANS};
use crate::protocol::{
    capabilities, AuthOutcome, AuthenticatedSession, Authenticator, ClientCommand, CodecError, ErrPacket,
    InitialHandshake, OkPacket, Packet, PacketCodec, Privileges,
};

/// Errors that end a front connection
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication timed out")]
    AuthTimeout,

    #[error("Backend error: {0}")]
    Backend(#[from] ConnError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// A route node already has a backend; the rejected one is handed back
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("Route node already has a bound backend")]
    AlreadyBound(BackConnection),
}

/// Everything a front connection needs from the rest of the gateway
pub struct FrontContext {
    pub system: SystemConfig,
    pub manager: Arc<ConnManager>,
    pub privileges: Arc<dyn Privileges>,
    pub handler: Arc<dyn QueryHandler>,
}

impl FrontContext {
    pub fn new(
        system: SystemConfig,
        manager: Arc<ConnManager>,
        privileges: Arc<dyn Privileges>,
        handler: Arc<dyn QueryHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            system,
            manager,
            privileges,
            handler,
        })
    }
}

/// Handlers a packet passes through, in order. Login removes `Auth`.
enum StageHandler {
    Auth(Box<Authenticator>),
    Command,
}

enum Flow {
    Continue,
    Close(&'static str),
}

struct FrontIo<S> {
    reader: FramedRead<ReadHalf<S>, PacketCodec>,
    writer: WriteHalf<S>,
    encoder: PacketCodec,
}

/// A client connection
pub struct FrontConnection {
    conn: Connection,
    ctx: Arc<FrontContext>,
    seed: Vec<u8>,
    capabilities: u32,
    client_capabilities: u32,
    user: Option<String>,
    authenticated: bool,
    /// Login counted against the user's benchmark
    user_counted: bool,
    in_transaction: bool,
    backends: HashMap<String, BackConnection>,
    stages: Vec<StageHandler>,
}

impl FrontConnection {
    pub fn new(ctx: Arc<FrontContext>, host: impl Into<String>, port: u16) -> Self {
        let system = &ctx.system;
        let mut conn = Connection::new(
            ConnectionKind::Front,
            host,
            port,
            Duration::from_millis(system.idle_timeout_ms),
        );
        if !conn.set_charset(&system.charset) {
            warn!(charset = %system.charset, "Unknown charset, keeping default");
        }
        conn.max_allowed_packet = system.max_allowed_packet;

        let capabilities = capabilities::server_capabilities(system.use_compression, system.use_handshake_v10);
        Self {
            conn,
            ctx,
            seed: Vec::new(),
            capabilities,
            client_capabilities: capabilities,
            user: None,
            authenticated: false,
            user_counted: false,
            in_transaction: false,
            backends: HashMap::new(),
            stages: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn context(&self) -> &Arc<FrontContext> {
        &self.ctx
    }

    /// Challenge sent in the handshake; empty once authenticated
    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// Capabilities announced to the client
    pub fn capabilities(&self) -> u32 {
        self.capabilities
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub(crate) fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn schema(&self) -> Option<&str> {
        self.conn.schema.as_deref()
    }

    pub fn autocommit(&self) -> bool {
        self.conn.autocommit
    }

    pub fn set_autocommit(&mut self, autocommit: bool) {
        self.conn.autocommit = autocommit;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn set_in_transaction(&mut self, in_transaction: bool) {
        self.in_transaction = in_transaction;
    }

    /// Statements must stay on their backends until commit or rollback
    pub fn is_transactional(&self) -> bool {
        !self.conn.autocommit || self.in_transaction
    }

    fn status_flags(&self) -> u16 {
        let mut flags = 0;
        if self.conn.autocommit {
            flags |= SERVER_STATUS_AUTOCOMMIT;
        }
        if self.in_transaction {
            flags |= SERVER_STATUS_IN_TRANS;
        }
        flags
    }

    /// Attach `backend` to `node` for this client
    pub fn bind_backend(&mut self, node: &str, mut backend: BackConnection) -> Result<(), BindError> {
        if self.backends.contains_key(node) {
            return Err(BindError::AlreadyBound(backend));
        }
        backend.set_route_node(Some(node.to_string()));
        debug!(conn_id = self.id(), backend_id = backend.id(), node = %node, "Backend bound");
        self.backends.insert(node.to_string(), backend);
        Ok(())
    }

    /// Detach the backend of `node` and return it to its pool.
    ///
    /// Returns false if nothing was bound.
    pub async fn unbind_backend(&mut self, node: &str) -> bool {
        match self.backends.remove(node) {
            Some(backend) => {
                debug!(conn_id = self.id(), backend_id = backend.id(), node = %node, "Backend unbound");
                backend.release().await;
                true
            }
            None => false,
        }
    }

    pub fn backend_mut(&mut self, node: &str) -> Option<&mut BackConnection> {
        self.backends.get_mut(node)
    }

    pub fn bound_nodes(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Return every bound backend to its pool
    pub async fn release_backends(&mut self) {
        let nodes = self.bound_nodes();
        for node in nodes {
            self.unbind_backend(&node).await;
        }
    }

    /// Serve the client on `stream` until it quits, fails or is closed
    pub async fn run<S>(mut self, mut stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        if let Err(e) = self.conn.attach(self.ctx.manager.clone()).await {
            warn!(conn_id = self.id(), error = %e, "No write buffer for client connection");
            let mut buf = bytes::BytesMut::new();
            ErrPacket::from_code(ER_OUT_OF_RESOURCES, "Out of memory")
                .encode(0, capabilities::CLIENT_PROTOCOL_41)
                .encode(&mut buf);
            let _ = stream.write_all(&buf).await;
            self.close("no write buffer").await;
            return Err(e.into());
        }

        let max_allowed = self.ctx.system.max_allowed_packet;
        let (reader, writer) = tokio::io::split(stream);
        let mut io = FrontIo {
            reader: FramedRead::new(reader, PacketCodec::new(max_allowed)),
            writer,
            encoder: PacketCodec::new(max_allowed),
        };

        let result = self.serve(&mut io).await;
        match &result {
            Ok(reason) => self.close(reason).await,
            Err(e) => {
                debug!(conn_id = self.id(), error = %e, "Client connection failed");
                self.close("error").await;
            }
        }
        result.map(|_| ())
    }

    /// Send the handshake and start waiting for the login
    async fn start<S>(&mut self, io: &mut FrontIo<S>) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.seed = generate_seed(20);
        let handshake = InitialHandshake::new(
            self.id() as u32,
            &self.seed,
            self.capabilities,
            self.conn.charset_index(),
        );

        self.stages = vec![
            StageHandler::Auth(Box::new(Authenticator::new(
                self.seed.clone(),
                self.capabilities,
                self.conn.handle().host(),
                self.ctx.system.free_login,
                self.ctx.privileges.clone(),
                self.ctx.manager.clone(),
            ))),
            StageHandler::Command,
        ];

        info!(
            conn_id = self.id(),
            host = %self.conn.handle().host(),
            port = self.conn.handle().port(),
            "Client connected"
        );
        self.write_packets(io, [handshake.encode()]).await
    }

    async fn serve<S>(&mut self, io: &mut FrontIo<S>) -> Result<&'static str, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.start(io).await?;

        let shutdown = self.conn.handle().shutdown_token();
        let auth_deadline = self.conn.handle().startup() + Duration::from_millis(self.ctx.system.auth_timeout_ms);

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Ok("closed by manager"),
                _ = tokio::time::sleep_until(auth_deadline), if !self.authenticated => {
                    warn!(conn_id = self.id(), host = %self.conn.handle().host(), "Authentication timed out");
                    let err = ErrPacket::from_code(ER_HANDSHAKE_ERROR, "Authentication timeout");
                    self.write_packets(io, [err.encode(2, self.client_capabilities)]).await?;
                    return Err(SessionError::AuthTimeout);
                }
                next = io.reader.next() => next,
            };

            let packet = match next {
                Some(Ok(packet)) => packet,
                Some(Err(CodecError::PacketTooLarge { size, max })) => {
                    warn!(conn_id = self.id(), size, max, "Packet too large");
                    let err = ErrPacket::from_code(
                        ER_NET_PACKET_TOO_LARGE,
                        "Got a packet bigger than 'max_allowed_packet' bytes",
                    );
                    self.write_packets(io, [err.encode(1, self.client_capabilities)]).await?;
                    return Err(CodecError::PacketTooLarge { size, max }.into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => return Ok("client disconnected"),
            };

            let bytes = packet.wire_len();
            self.conn.handle().record_read(bytes);
            self.ctx.manager.record_net_in(bytes);

            match self.dispatch(io, packet).await? {
                Flow::Continue => {}
                Flow::Close(reason) => return Ok(reason),
            }
        }
    }

    async fn dispatch<S>(&mut self, io: &mut FrontIo<S>, packet: Packet) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let outcome = match self.stages.first_mut() {
            Some(StageHandler::Auth(auth)) => auth.handle(&packet),
            Some(StageHandler::Command) => return self.command(io, packet).await,
            None => return Ok(Flow::Close("no handler")),
        };

        match outcome {
            AuthOutcome::Switch(request) => {
                self.write_packets(io, [request]).await?;
                Ok(Flow::Continue)
            }
            AuthOutcome::Rejected(err) => {
                let message = ErrPacket::parse(&err.payload, capabilities::CLIENT_PROTOCOL_41)
                    .map(|e| e.error_message)
                    .unwrap_or_default();
                self.write_packets(io, [err]).await?;
                Err(SessionError::Auth(message))
            }
            AuthOutcome::Accepted { ok, session } => {
                self.write_packets(io, [ok]).await?;
                self.stages.remove(0);
                self.on_authenticated(io, session);
                Ok(Flow::Continue)
            }
        }
    }

    fn on_authenticated<S>(&mut self, io: &mut FrontIo<S>, session: AuthenticatedSession) {
        self.authenticated = true;
        self.user_counted = true;
        self.seed.clear();
        self.client_capabilities = session.capability_flags;
        self.conn.max_packet_size = session.max_packet_size as usize;
        self.conn.schema = session.schema;
        if !self.conn.set_charset_index(session.charset_index) {
            debug!(conn_id = self.id(), index = session.charset_index, "Unknown client charset");
        }

        if session.compress {
            let min = self.ctx.system.min_compress_length;
            io.reader.decoder_mut().enable_compression(min);
            io.encoder.enable_compression(min);
            self.conn.support_compress = true;
        }

        info!(
            conn_id = self.id(),
            user = %session.user,
            schema = ?self.conn.schema,
            compress = session.compress,
            "Client authenticated"
        );
        self.set_user(session.user);
    }

    async fn command<S>(&mut self, io: &mut FrontIo<S>, packet: Packet) -> Result<Flow, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let command = ClientCommand::parse(&packet.payload);
        self.ctx.manager.record_command(&command);
        let seq = packet.sequence_id.wrapping_add(1);

        let reply = match command {
            ClientCommand::Quit => return Ok(Flow::Close("quit")),
            ClientCommand::Ping => vec![self.ok(seq)],
            ClientCommand::InitDb(schema) => vec![self.init_db(schema, seq)],
            ClientCommand::Query(sql) => {
                debug!(conn_id = self.id(), sql = %sql, "Query");
                let handler = self.ctx.handler.clone();
                match handler.query(self, &sql).await {
                    Ok(result) if result.is_result_set() => result.encode_result_set(seq, self.status_flags()),
                    Ok(result) => {
                        let mut ok = OkPacket::with_affected(result.affected_rows, result.last_insert_id);
                        ok.status_flags = self.status_flags();
                        vec![ok.encode(seq, self.client_capabilities)]
                    }
                    Err(e) => {
                        debug!(conn_id = self.id(), error = %e, "Query failed");
                        vec![ErrPacket::from_code(e.error_code(), e.to_string()).encode(seq, self.client_capabilities)]
                    }
                }
            }
            other => {
                debug!(conn_id = self.id(), command = other.name(), "Unsupported command");
                vec![ErrPacket::from_code(ER_UNKNOWN_COM_ERROR, "Unknown command").encode(seq, self.client_capabilities)]
            }
        };

        self.write_packets(io, reply).await?;
        Ok(Flow::Continue)
    }

    fn ok(&self, seq: u8) -> Packet {
        let mut ok = OkPacket::new();
        ok.status_flags = self.status_flags();
        ok.encode(seq, self.client_capabilities)
    }

    fn init_db(&mut self, schema: String, seq: u8) -> Packet {
        let user = self.user.clone().unwrap_or_default();
        let privileges = &self.ctx.privileges;

        let error = if !privileges.schema_exists(&schema) {
            Some((ER_BAD_DB_ERROR, format!("Unknown database '{}'", schema)))
        } else if !privileges.is_authorized_schema(&user, &schema) {
            Some((
                ER_DBACCESS_DENIED_ERROR,
                format!("Access denied for user '{}' to database '{}'", user, schema),
            ))
        } else {
            None
        };

        match error {
            Some((code, message)) => ErrPacket::from_code(code, message).encode(seq, self.client_capabilities),
            None => {
                debug!(conn_id = self.id(), schema = %schema, "Schema changed");
                self.conn.schema = Some(schema);
                self.ok(seq)
            }
        }
    }

    /// Encode `packets` into the pooled write buffer and flush them
    async fn write_packets<S>(
        &mut self,
        io: &mut FrontIo<S>,
        packets: impl IntoIterator<Item = Packet>,
    ) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let Some(buffer) = self.conn.write_buffer_mut() else {
            return Err(SessionError::Protocol("connection has no write buffer".into()));
        };
        let batch = buffer.nominal_size();
        let buf = buffer.bytes_mut();
        buf.clear();

        // flush once the accounted size is reached
        let mut written = 0;
        for packet in packets {
            io.encoder.encode(packet, buf)?;
            if buf.len() >= batch {
                io.writer.write_all(buf).await?;
                written += buf.len();
                buf.clear();
            }
        }
        if !buf.is_empty() {
            io.writer.write_all(buf).await?;
            written += buf.len();
            buf.clear();
        }
        io.writer.flush().await?;

        self.conn.handle().record_write(written);
        self.ctx.manager.record_net_out(written);
        Ok(())
    }

    /// Release backends and the connection's resources
    pub async fn close(&mut self, reason: &str) {
        self.release_backends().await;
        if self.user_counted {
            if let Some(user) = self.user.as_deref() {
                self.ctx.manager.remove_user(user);
            }
            self.user_counted = false;
        }
        if self.conn.close(reason) {
            info!(conn_id = self.id(), reason = %reason, "Client connection closed");
        }
    }
}

impl Drop for FrontConnection {
    fn drop(&mut self) {
        if self.user_counted {
            if let Some(user) = self.user.as_deref() {
                self.ctx.manager.remove_user(user);
            }
        }
    }
}

impl std::fmt::Debug for FrontConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontConnection")
            .field("id", &self.id())
            .field("user", &self.user)
            .field("authenticated", &self.authenticated)
            .field("backends", &self.backends.len())
            .finish()
    }
}
