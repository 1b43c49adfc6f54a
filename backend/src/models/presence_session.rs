//! Models for tracking open realtime connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
/// Database representation of one realtime connection.
pub struct PresenceSession {
    /// Identifier assigned to the connection at handshake.
    pub connection_id: String,
    /// Subject of the access token presented at handshake, if any.
    pub user_id: Option<String>,
    pub remote_address: Option<String>,
    pub client_agent: Option<String>,
    /// The row counts towards the live total while true.
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values captured when a connection is registered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewPresenceSession {
    pub connection_id: String,
    pub user_id: Option<String>,
    pub remote_address: Option<String>,
    pub client_agent: Option<String>,
}

impl NewPresenceSession {
    pub fn anonymous(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            ..Self::default()
        }
    }
}
