//! Presence Service: bookkeeping for realtime connections and the live count.
//!
//! Every mutation is best-effort. Store failures are logged and swallowed so
//! that presence tracking never breaks the connection it instruments.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::presence_session::NewPresenceSession;
use crate::repositories::presence_session::SessionStore;
use crate::services::broadcaster::{PresenceBroadcaster, PresenceEvent};

const MAX_CONNECTION_ID_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Refreshed,
    /// The row was missing and has been recorded again.
    Restored,
    /// The row was retired; the socket must reconnect under a new id.
    Retired,
    Unavailable,
}

#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn SessionStore>,
    broadcaster: PresenceBroadcaster,
}

impl PresenceService {
    pub fn new(store: Arc<dyn SessionStore>, broadcaster: PresenceBroadcaster) -> Self {
        Self { store, broadcaster }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.broadcaster.subscribe()
    }

    /// Picks the id for a new handshake.
    ///
    /// A requested id is reused only while its row is still live; retired or
    /// unknown ids get a fresh one.
    pub async fn resolve_connection_id(&self, requested: Option<&str>) -> String {
        let Some(requested) = requested.map(str::trim).filter(|id| is_valid_connection_id(id))
        else {
            return new_connection_id();
        };

        match self.store.find(requested).await {
            Ok(Some(session)) if session.active => requested.to_string(),
            Ok(_) => {
                tracing::debug!(
                    connection_id = requested,
                    "Requested connection id is not live; assigning a new one"
                );
                new_connection_id()
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = requested,
                    error = %err,
                    "Failed to look up resumable connection id"
                );
                new_connection_id()
            }
        }
    }

    /// Registers (or refreshes) a live row, then broadcasts the new count.
    ///
    /// Returns whether the store now holds a live row for the connection.
    pub async fn on_connect(&self, session: NewPresenceSession) -> bool {
        let tracked = match self.store.upsert(&session).await {
            Ok(true) => {
                tracing::info!(
                    connection_id = %session.connection_id,
                    user_id = session.user_id.as_deref().unwrap_or("-"),
                    "Presence session registered"
                );
                true
            }
            Ok(false) => {
                tracing::warn!(
                    connection_id = %session.connection_id,
                    "Presence session was already retired; not reactivated"
                );
                false
            }
            Err(err) => {
                tracing::warn!(
                    connection_id = %session.connection_id,
                    error = %err,
                    "Failed to record presence session"
                );
                false
            }
        };
        self.broadcast_active_count().await;
        tracked
    }

    /// Retires the row for a transport-level disconnect, then broadcasts.
    pub async fn on_disconnect(&self, connection_id: &str) {
        self.retire(connection_id, "disconnect").await;
        self.broadcast_active_count().await;
    }

    /// Retires the row on the client's "about to unload" signal, then broadcasts.
    pub async fn on_explicit_teardown(&self, connection_id: &str) {
        self.retire(connection_id, "teardown").await;
        self.broadcast_active_count().await;
    }

    /// Refreshes `updated_at` for a live row so the sweeper keeps it.
    ///
    /// A row missing because registration failed earlier is recorded again
    /// from the socket's metadata. A retired row stays retired.
    pub async fn heartbeat(&self, session: &NewPresenceSession) -> HeartbeatOutcome {
        let connection_id = session.connection_id.as_str();
        match self.store.touch(connection_id).await {
            Ok(true) => return HeartbeatOutcome::Refreshed,
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(connection_id, error = %err, "Failed to refresh presence session");
                return HeartbeatOutcome::Unavailable;
            }
        }

        match self.store.upsert(session).await {
            Ok(true) => {
                tracing::info!(connection_id, "Presence session restored by heartbeat");
                self.broadcast_active_count().await;
                HeartbeatOutcome::Restored
            }
            Ok(false) => {
                tracing::info!(connection_id, "Heartbeat for retired presence session");
                HeartbeatOutcome::Retired
            }
            Err(err) => {
                tracing::warn!(connection_id, error = %err, "Failed to restore presence session");
                HeartbeatOutcome::Unavailable
            }
        }
    }

    pub async fn get_active_count(&self) -> Result<i64, AppError> {
        self.store.count_active().await
    }

    /// Retires live rows not refreshed within `max_age`.
    pub async fn sweep_stale(&self, max_age: Duration) -> u64 {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            tracing::warn!(?max_age, "Stale window out of range; sweep skipped");
            return 0;
        };
        match self.store.deactivate_stale(cutoff).await {
            Ok(0) => 0,
            Ok(retired) => {
                tracing::info!(retired, %cutoff, "Retired stale presence sessions");
                retired
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to sweep stale presence sessions");
                0
            }
        }
    }

    /// Deletes retired rows older than `retention`.
    pub async fn purge_inactive(&self, retention: Duration) -> u64 {
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            tracing::warn!(?retention, "Retention out of range; purge skipped");
            return 0;
        };
        match self.store.purge_inactive(cutoff).await {
            Ok(0) => 0,
            Ok(purged) => {
                tracing::info!(purged, %cutoff, "Purged retired presence sessions");
                purged
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to purge retired presence sessions");
                0
            }
        }
    }

    /// Recomputes the count and pushes it to every subscriber.
    pub async fn broadcast_active_count(&self) -> Option<i64> {
        match self.store.count_active().await {
            Ok(count) => {
                self.broadcaster.publish_count(count);
                Some(count)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to count active presence sessions");
                None
            }
        }
    }

    async fn retire(&self, connection_id: &str, reason: &'static str) {
        match self.store.deactivate(connection_id).await {
            Ok(true) => tracing::info!(connection_id, reason, "Presence session retired"),
            Ok(false) => {
                tracing::debug!(connection_id, reason, "Presence session already retired")
            }
            Err(err) => tracing::warn!(
                connection_id,
                reason,
                error = %err,
                "Failed to retire presence session"
            ),
        }
    }
}

pub fn new_connection_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_valid_connection_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_CONNECTION_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
