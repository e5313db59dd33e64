//! Server side of the MySQL login exchange
//!
//! `Authenticator` consumes the client's handshake response (and, when the
//! client used another plugin, one auth-switch reply) and decides whether the
//! login is accepted.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, warn};

use super::error_code::*;
use super::handshake::{compute_auth_response, generate_seed, AuthSwitchRequest, NATIVE_PASSWORD_PLUGIN};
use super::packet::capabilities::{CLIENT_COMPRESS, CLIENT_PROTOCOL_41};
use super::{ErrPacket, HandshakeResponse, OkPacket, Packet};
use crate::config::{Config, UserConfig, WhitelistEntry};
use crate::conn::ConnManager;
use crate::metrics::metrics;

/// Account data consulted during login
pub trait Privileges: Send + Sync {
    /// Whether `user` may connect from `host`
    fn is_trusted_host(&self, user: &str, host: &str) -> bool;

    /// Password of a known user
    fn password(&self, user: &str) -> Option<String>;

    /// Concurrent front connection limit, 0 for none
    fn benchmark(&self, user: &str) -> usize;

    fn schema_exists(&self, schema: &str) -> bool;

    fn is_authorized_schema(&self, user: &str, schema: &str) -> bool;

    /// Whether `user` is limited to reads
    fn is_read_only(&self, _user: &str) -> bool {
        false
    }
}

/// Privileges backed by the loaded configuration
#[derive(Debug, Clone)]
pub struct ConfigPrivileges {
    users: HashMap<String, UserConfig>,
    whitelist: Vec<WhitelistEntry>,
    schemas: HashSet<String>,
}

impl ConfigPrivileges {
    pub fn from_config(config: &Config) -> Self {
        Self {
            users: config
                .users
                .iter()
                .map(|u| (u.name.clone(), u.clone()))
                .collect(),
            whitelist: config.firewall.whitelist.clone(),
            schemas: config.schemas.iter().map(|s| s.name.clone()).collect(),
        }
    }

    pub fn user(&self, user: &str) -> Option<&UserConfig> {
        self.users.get(user)
    }
}

impl Privileges for ConfigPrivileges {
    fn is_trusted_host(&self, user: &str, host: &str) -> bool {
        if self.whitelist.is_empty() {
            return true;
        }
        self.whitelist.iter().any(|entry| {
            host_matches(&entry.host, host) && (entry.users.is_empty() || entry.users.iter().any(|u| u == user))
        })
    }

    fn password(&self, user: &str) -> Option<String> {
        self.users.get(user).map(|u| u.password.clone())
    }

    fn benchmark(&self, user: &str) -> usize {
        self.users.get(user).map(|u| u.benchmark).unwrap_or(0)
    }

    fn schema_exists(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }

    fn is_authorized_schema(&self, user: &str, schema: &str) -> bool {
        self.users
            .get(user)
            .is_some_and(|u| u.schemas.iter().any(|s| s == schema))
    }

    fn is_read_only(&self, user: &str) -> bool {
        self.users.get(user).is_some_and(|u| u.read_only)
    }
}

/// Match a client address against an allow-list entry.
///
/// Entries are exact addresses or dotted masks where `*` or `%` stands for
/// any value of one octet. A lone `*` or `%` matches every host.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == host || pattern == "*" || pattern == "%" {
        return true;
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let host: Vec<&str> = host.split('.').collect();
    pattern.len() == host.len()
        && pattern
            .iter()
            .zip(&host)
            .all(|(p, h)| *p == "*" || *p == "%" || p == h)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitHandshakeResponse,
    AwaitSwitchResponse,
    Authenticated,
    Rejected,
}

/// What a login looks like once accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedSession {
    pub user: String,
    pub schema: Option<String>,
    pub charset_index: u8,
    pub capability_flags: u32,
    pub max_packet_size: u32,
    /// Both sides asked for compression
    pub compress: bool,
}

/// Reply to one client packet
#[derive(Debug)]
pub enum AuthOutcome {
    /// Send the switch request and wait for the client's answer
    Switch(Packet),
    /// Send the OK packet; the login is complete
    Accepted { ok: Packet, session: AuthenticatedSession },
    /// Send the error packet and close
    Rejected(Packet),
}

/// Login state machine for one front connection
pub struct Authenticator {
    state: AuthState,
    seed: Vec<u8>,
    server_capabilities: u32,
    host: String,
    free_login: bool,
    privileges: Arc<dyn Privileges>,
    manager: Arc<ConnManager>,
    response: Option<HandshakeResponse>,
}

impl Authenticator {
    pub fn new(
        seed: Vec<u8>,
        server_capabilities: u32,
        host: impl Into<String>,
        free_login: bool,
        privileges: Arc<dyn Privileges>,
        manager: Arc<ConnManager>,
    ) -> Self {
        Self {
            state: AuthState::AwaitHandshakeResponse,
            seed,
            server_capabilities,
            host: host.into(),
            free_login,
            privileges,
            manager,
            response: None,
        }
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// Challenge the client must answer
    pub fn seed(&self) -> &[u8] {
        &self.seed
    }

    /// Feed the next client packet
    pub fn handle(&mut self, packet: &Packet) -> AuthOutcome {
        let seq = packet.sequence_id.wrapping_add(1);
        match self.state {
            AuthState::AwaitHandshakeResponse => {
                let Some(response) = HandshakeResponse::parse(&packet.payload) else {
                    return self.reject(seq, "handshake", ER_HANDSHAKE_ERROR, "Bad handshake".to_string());
                };
                debug!(
                    user = %response.username,
                    host = %self.host,
                    plugin = ?response.auth_plugin_name,
                    "Handshake response received"
                );

                let switch = response
                    .auth_plugin_name
                    .as_deref()
                    .is_some_and(|p| p != NATIVE_PASSWORD_PLUGIN);
                self.response = Some(response);

                if switch {
                    self.seed = generate_seed(20);
                    self.state = AuthState::AwaitSwitchResponse;
                    return AuthOutcome::Switch(
                        AuthSwitchRequest::new(NATIVE_PASSWORD_PLUGIN, self.seed.clone()).encode(seq),
                    );
                }
                self.verify(seq)
            }
            AuthState::AwaitSwitchResponse => {
                if let Some(response) = self.response.as_mut() {
                    response.auth_response = packet.payload.to_vec();
                }
                self.verify(seq)
            }
            AuthState::Authenticated | AuthState::Rejected => self.reject(
                seq,
                "state",
                ER_HANDSHAKE_ERROR,
                "Authentication already finished".to_string(),
            ),
        }
    }

    fn client_capabilities(&self) -> u32 {
        self.response
            .as_ref()
            .map(|r| r.capability_flags)
            .unwrap_or(self.server_capabilities)
    }

    fn reject(&mut self, seq: u8, reason: &str, code: u16, message: String) -> AuthOutcome {
        self.state = AuthState::Rejected;
        metrics().record_auth_failure(reason);
        AuthOutcome::Rejected(ErrPacket::from_code(code, message).encode(seq, self.client_capabilities()))
    }

    fn access_denied(&mut self, seq: u8, reason: &str, user: &str, using_password: bool) -> AuthOutcome {
        let message = format!(
            "Access denied for user '{}'@'{}' (using password: {})",
            user,
            self.host,
            if using_password { "YES" } else { "NO" }
        );
        self.reject(seq, reason, ER_ACCESS_DENIED_ERROR, message)
    }

    fn verify(&mut self, seq: u8) -> AuthOutcome {
        let Some(response) = self.response.clone() else {
            return self.reject(seq, "handshake", ER_HANDSHAKE_ERROR, "Bad handshake".to_string());
        };
        let user = response.username.as_str();
        let using_password = !response.auth_response.is_empty();

        if !self.privileges.is_trusted_host(user, &self.host) {
            warn!(user = %user, host = %self.host, "Login from unauthorized host");
            return self.access_denied(seq, "host", user, using_password);
        }

        let Some(password) = self.privileges.password(user) else {
            warn!(user = %user, host = %self.host, "Login for unknown user");
            return self.access_denied(seq, "user", user, using_password);
        };

        if !self.free_login && compute_auth_response(&password, &self.seed) != response.auth_response {
            warn!(user = %user, host = %self.host, "Wrong password");
            return self.access_denied(seq, "password", user, using_password);
        }

        if !self.manager.try_add_user(user, self.privileges.benchmark(user)) {
            warn!(user = %user, "Too many connections for user");
            let message = format!("User {} already has more than 'max_user_connections' active connections", user);
            return self.reject(seq, "benchmark", ER_TOO_MANY_USER_CONNECTIONS, message);
        }

        if let Some(schema) = response.database.as_deref() {
            let failure = if !self.privileges.schema_exists(schema) {
                Some(("schema", ER_BAD_DB_ERROR, format!("Unknown database '{}'", schema)))
            } else if !self.privileges.is_authorized_schema(user, schema) {
                Some((
                    "schema",
                    ER_DBACCESS_DENIED_ERROR,
                    format!("Access denied for user '{}' to database '{}'", user, schema),
                ))
            } else {
                None
            };
            if let Some((reason, code, message)) = failure {
                self.manager.remove_user(user);
                return self.reject(seq, reason, code, message);
            }
        }

        self.state = AuthState::Authenticated;
        self.seed.clear();

        let compress = response.capability_flags & CLIENT_COMPRESS != 0
            && self.server_capabilities & CLIENT_COMPRESS != 0;
        let ok = OkPacket::new().encode(seq, response.capability_flags | CLIENT_PROTOCOL_41);

        AuthOutcome::Accepted {
            ok,
            session: AuthenticatedSession {
                user: response.username,
                schema: response.database,
                charset_index: response.character_set,
                capability_flags: response.capability_flags,
                max_packet_size: response.max_packet_size,
                compress,
            },
        }
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("state", &self.state)
            .field("host", &self.host)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::protocol::packet::capabilities::*;

    const CONFIG: &str = r#"
[[users]]
name = "app"
password = "123456"
schemas = ["shop"]
benchmark = 1

[[users]]
name = "ops"
password = ""
schemas = ["shop", "audit"]

[[firewall.whitelist]]
host = "10.0.*.*"
users = ["app"]

[[firewall.whitelist]]
host = "127.0.0.1"

[[schemas]]
name = "shop"
data_node = "dn1"

[[schemas]]
name = "audit"
data_node = "dn1"

[[data_nodes]]
name = "dn1"
data_host = "dh1"
database = "shop_0"

[[data_hosts]]
name = "dh1"

[[data_hosts.write_hosts]]
host_name = "m0"
host = "127.0.0.1"
user = "root"
"#;

    fn privileges() -> Arc<dyn Privileges> {
        let config: Config = toml::from_str(CONFIG).unwrap();
        Arc::new(ConfigPrivileges::from_config(&config))
    }

    fn manager() -> Arc<ConnManager> {
        Arc::new(ConnManager::new(Arc::new(BufferPool::new(1024, 16 * 1024, 4).unwrap())))
    }

    fn seed() -> Vec<u8> {
        b"abcdefghij0123456789".to_vec()
    }

    fn server_caps() -> u32 {
        server_capabilities(true, true)
    }

    fn response(user: &str, password: &str, database: Option<&str>, plugin: Option<&str>) -> Packet {
        let mut flags = DEFAULT_CAPABILITIES | CLIENT_PLUGIN_AUTH;
        if database.is_some() {
            flags |= CLIENT_CONNECT_WITH_DB;
        }
        HandshakeResponse {
            capability_flags: flags,
            max_packet_size: 1 << 24,
            character_set: 45,
            username: user.to_string(),
            auth_response: compute_auth_response(password, &seed()),
            database: database.map(str::to_string),
            auth_plugin_name: plugin.map(str::to_string),
        }
        .encode(1)
    }

    fn authenticator(host: &str, manager: &Arc<ConnManager>) -> Authenticator {
        Authenticator::new(seed(), server_caps(), host, false, privileges(), manager.clone())
    }

    fn error_code(packet: &Packet) -> u16 {
        ErrPacket::parse(&packet.payload, CLIENT_PROTOCOL_41).unwrap().error_code
    }

    #[test]
    fn test_host_matches() {
        assert!(host_matches("127.0.0.1", "127.0.0.1"));
        assert!(host_matches("10.0.*.*", "10.0.3.7"));
        assert!(host_matches("192.168.%.1", "192.168.9.1"));
        assert!(host_matches("%", "8.8.8.8"));
        assert!(!host_matches("10.0.*.*", "10.1.3.7"));
        assert!(!host_matches("10.0.*", "10.0.3.7"));
    }

    #[test]
    fn test_trusted_host() {
        let privileges = privileges();
        assert!(privileges.is_trusted_host("app", "10.0.1.2"));
        assert!(!privileges.is_trusted_host("ops", "10.0.1.2"));
        // entry without users admits everyone
        assert!(privileges.is_trusted_host("ops", "127.0.0.1"));
        assert!(!privileges.is_trusted_host("app", "192.168.0.1"));
    }

    #[test]
    fn test_empty_whitelist_allows_all() {
        let mut config: Config = toml::from_str(CONFIG).unwrap();
        config.firewall.whitelist.clear();
        let privileges = ConfigPrivileges::from_config(&config);
        assert!(privileges.is_trusted_host("app", "1.2.3.4"));
    }

    #[test]
    fn test_successful_login() {
        let manager = manager();
        let mut auth = authenticator("10.0.0.5", &manager);

        let outcome = auth.handle(&response("app", "123456", Some("shop"), Some(NATIVE_PASSWORD_PLUGIN)));
        let AuthOutcome::Accepted { ok, session } = outcome else {
            panic!("expected login to succeed");
        };
        assert_eq!(ok.sequence_id, 2);
        assert_eq!(ok.payload[0], 0x00);
        assert_eq!(session.user, "app");
        assert_eq!(session.schema.as_deref(), Some("shop"));
        assert_eq!(session.charset_index, 45);
        assert!(!session.compress);
        assert_eq!(auth.state(), AuthState::Authenticated);
        assert!(auth.seed().is_empty());
        assert_eq!(manager.user_connections("app"), 1);
    }

    #[test]
    fn test_wrong_password() {
        let manager = manager();
        let mut auth = authenticator("10.0.0.5", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&response("app", "wrong", None, None)) else {
            panic!("expected rejection");
        };
        assert_eq!(err.sequence_id, 2);
        assert_eq!(error_code(&err), 1045);
        assert_eq!(auth.state(), AuthState::Rejected);
        assert_eq!(manager.user_connections("app"), 0);
    }

    #[test]
    fn test_free_login_skips_password() {
        let manager = manager();
        let mut auth = Authenticator::new(seed(), server_caps(), "10.0.0.5", true, privileges(), manager);
        assert!(matches!(
            auth.handle(&response("app", "wrong", None, None)),
            AuthOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn test_untrusted_host_and_unknown_user() {
        let manager = manager();
        let mut auth = authenticator("192.168.0.1", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&response("app", "123456", None, None)) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1045);

        let mut auth = authenticator("127.0.0.1", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&response("ghost", "", None, None)) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1045);
    }

    #[test]
    fn test_benchmark_limit() {
        let manager = manager();
        let mut first = authenticator("10.0.0.5", &manager);
        assert!(matches!(
            first.handle(&response("app", "123456", None, None)),
            AuthOutcome::Accepted { .. }
        ));

        let mut second = authenticator("10.0.0.6", &manager);
        let AuthOutcome::Rejected(err) = second.handle(&response("app", "123456", None, None)) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1203);

        manager.remove_user("app");
        let mut third = authenticator("10.0.0.6", &manager);
        assert!(matches!(
            third.handle(&response("app", "123456", None, None)),
            AuthOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn test_schema_checks() {
        let manager = manager();
        let mut auth = authenticator("10.0.0.5", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&response("app", "123456", Some("nope"), None)) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1049);
        // the benchmark slot is given back
        assert_eq!(manager.user_connections("app"), 0);

        let mut auth = authenticator("10.0.0.5", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&response("app", "123456", Some("audit"), None)) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1044);
    }

    #[test]
    fn test_auth_switch_single_round() {
        let manager = manager();
        let mut auth = authenticator("127.0.0.1", &manager);
        let original_seed = auth.seed().to_vec();

        let AuthOutcome::Switch(switch) = auth.handle(&response("ops", "", None, Some("caching_sha2_password"))) else {
            panic!("expected auth switch");
        };
        assert_eq!(switch.sequence_id, 2);
        let request = AuthSwitchRequest::parse(&switch.payload).unwrap();
        assert_eq!(request.plugin_name, NATIVE_PASSWORD_PLUGIN);
        assert_eq!(request.auth_data.len(), 20);
        assert_ne!(request.auth_data, original_seed);
        assert_eq!(auth.state(), AuthState::AwaitSwitchResponse);

        // empty password answers with an empty scramble
        let reply = Packet::new(3, compute_auth_response("", &request.auth_data));
        let AuthOutcome::Accepted { ok, .. } = auth.handle(&reply) else {
            panic!("expected login to succeed");
        };
        assert_eq!(ok.sequence_id, 4);
    }

    #[test]
    fn test_auth_switch_wrong_password() {
        let manager = manager();
        let mut auth = authenticator("10.0.0.1", &manager);
        let AuthOutcome::Switch(switch) = auth.handle(&response("app", "123456", None, Some("sha256_password"))) else {
            panic!("expected auth switch");
        };
        let request = AuthSwitchRequest::parse(&switch.payload).unwrap();

        // answering for the old challenge fails
        let stale = Packet::new(3, compute_auth_response("123456", &seed()));
        assert!(request.auth_data != seed());
        let AuthOutcome::Rejected(err) = auth.handle(&stale) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1045);
    }

    #[test]
    fn test_garbage_response() {
        let manager = manager();
        let mut auth = authenticator("127.0.0.1", &manager);
        let AuthOutcome::Rejected(err) = auth.handle(&Packet::new(1, vec![1u8, 2, 3])) else {
            panic!("expected rejection");
        };
        assert_eq!(error_code(&err), 1043);
        assert_eq!(auth.state(), AuthState::Rejected);
    }

    #[test]
    fn test_compression_negotiated() {
        let manager = manager();
        let mut auth = authenticator("127.0.0.1", &manager);
        let mut packet = HandshakeResponse::parse(&response("ops", "", None, None).payload).unwrap();
        packet.capability_flags |= CLIENT_COMPRESS;
        let AuthOutcome::Accepted { session, .. } = auth.handle(&packet.encode(1)) else {
            panic!("expected login to succeed");
        };
        assert!(session.compress);

        let mut auth = Authenticator::new(
            seed(),
            server_capabilities(false, true),
            "127.0.0.1",
            false,
            privileges(),
            manager,
        );
        let AuthOutcome::Accepted { session, .. } = auth.handle(&packet.encode(1)) else {
            panic!("expected login to succeed");
        };
        assert!(!session.compress);
    }
}
