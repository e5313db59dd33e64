//! Client and backend connections and their registry

mod back;
mod connection;
mod front;
mod manager;

pub use back::BackConnection;
pub use connection::{Connection, ConnectionHandle, ConnectionKind};
pub use front::{BindError, FrontConnection, FrontContext, SessionError};
pub use manager::{CommandCounters, ConnManager};
