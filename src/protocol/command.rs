use bytes::Bytes;

use super::packet::Command;

/// Parsed command from client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Query(String),
    InitDb(String),
    Quit,
    Ping,
    FieldList { table: String, wildcard: String },
    Unknown(u8, Bytes),
}

impl ClientCommand {
    /// Parse command from packet payload
    pub fn parse(payload: &Bytes) -> Self {
        if payload.is_empty() {
            return ClientCommand::Unknown(0, Bytes::new());
        }

        let cmd = Command::from(payload[0]);
        let data = payload.slice(1..);

        match cmd {
            Command::Query => ClientCommand::Query(String::from_utf8_lossy(&data).to_string()),
            Command::InitDb => {
                let db = String::from_utf8_lossy(&data);
                ClientCommand::InitDb(db.trim_end_matches('\0').trim().to_string())
            }
            Command::Quit => ClientCommand::Quit,
            Command::Ping => ClientCommand::Ping,
            Command::FieldList => {
                // Table name is null-terminated, followed by optional wildcard
                let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                let table = String::from_utf8_lossy(&data[..null_pos]).to_string();
                let wildcard = if null_pos + 1 < data.len() {
                    String::from_utf8_lossy(&data[null_pos + 1..]).to_string()
                } else {
                    String::new()
                };
                ClientCommand::FieldList { table, wildcard }
            }
            _ => ClientCommand::Unknown(payload[0], data),
        }
    }

    /// Name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Query(_) => "query",
            ClientCommand::InitDb(_) => "init_db",
            ClientCommand::Quit => "quit",
            ClientCommand::Ping => "ping",
            ClientCommand::FieldList { .. } => "field_list",
            ClientCommand::Unknown(..) => "unknown",
        }
    }
}

/// Session-level statements the gateway answers itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatement {
    SetAutocommit(bool),
    Begin,
    Commit,
    Rollback,
}

impl SessionStatement {
    /// Recognize a transaction-control statement. Anything else is `None`
    /// and goes to a backend unchanged.
    pub fn parse(sql: &str) -> Option<Self> {
        let normalized = sql
            .trim()
            .trim_end_matches(';')
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase();

        match normalized.as_str() {
            "BEGIN" | "START TRANSACTION" | "BEGIN WORK" => return Some(SessionStatement::Begin),
            "COMMIT" | "COMMIT WORK" => return Some(SessionStatement::Commit),
            "ROLLBACK" | "ROLLBACK WORK" => return Some(SessionStatement::Rollback),
            _ => {}
        }

        let rest = normalized.strip_prefix("SET ")?;
        let rest = rest
            .strip_prefix("@@SESSION.")
            .or_else(|| rest.strip_prefix("SESSION "))
            .or_else(|| rest.strip_prefix("@@"))
            .unwrap_or(rest);
        let value = rest.strip_prefix("AUTOCOMMIT")?.trim_start().strip_prefix('=')?.trim();
        match value {
            "1" | "ON" | "TRUE" => Some(SessionStatement::SetAutocommit(true)),
            "0" | "OFF" | "FALSE" => Some(SessionStatement::SetAutocommit(false)),
            _ => None,
        }
    }
}
