//! Session Store: one row per realtime connection in `presence_sessions`.
//!
//! The free functions run the SQL; [`SessionStore`] is the seam the presence
//! service depends on so it can be exercised without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::AppError;
use crate::models::presence_session::{NewPresenceSession, PresenceSession};

/// Inserts a live row or refreshes an existing live one.
///
/// Returns `false` when the id belongs to a retired row; retired rows are left
/// untouched.
pub async fn upsert_session(
    pool: &PgPool,
    session: &NewPresenceSession,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO presence_sessions
            (connection_id, user_id, remote_address, client_agent, active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, TRUE, NOW(), NOW())
        ON CONFLICT (connection_id) DO UPDATE
        SET user_id = COALESCE(EXCLUDED.user_id, presence_sessions.user_id),
            remote_address = COALESCE(EXCLUDED.remote_address, presence_sessions.remote_address),
            client_agent = COALESCE(EXCLUDED.client_agent, presence_sessions.client_agent),
            updated_at = NOW()
        WHERE presence_sessions.active
        "#,
    )
    .bind(&session.connection_id)
    .bind(session.user_id.as_deref())
    .bind(session.remote_address.as_deref())
    .bind(session.client_agent.as_deref())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn find_session(
    pool: &PgPool,
    connection_id: &str,
) -> Result<Option<PresenceSession>, sqlx::Error> {
    sqlx::query_as::<_, PresenceSession>(
        r#"
        SELECT connection_id, user_id, remote_address, client_agent, active, created_at, updated_at
        FROM presence_sessions
        WHERE connection_id = $1
        "#,
    )
    .bind(connection_id)
    .fetch_optional(pool)
    .await
}

/// Retires a live row. Returns whether a transition happened.
pub async fn deactivate_session(pool: &PgPool, connection_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE presence_sessions
        SET active = FALSE,
            updated_at = NOW()
        WHERE connection_id = $1 AND active
        "#,
    )
    .bind(connection_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_session(pool: &PgPool, connection_id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE presence_sessions
        SET updated_at = NOW()
        WHERE connection_id = $1 AND active
        "#,
    )
    .bind(connection_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_active_sessions(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM presence_sessions WHERE active")
        .fetch_one(pool)
        .await
}

/// Retires live rows whose `updated_at` is strictly older than `cutoff`.
pub async fn deactivate_stale_sessions(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE presence_sessions
        SET active = FALSE,
            updated_at = NOW()
        WHERE active AND updated_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Deletes retired rows whose `updated_at` (time of retirement) is older than `cutoff`.
pub async fn purge_inactive_sessions(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result =
        sqlx::query("DELETE FROM presence_sessions WHERE NOT active AND updated_at < $1")
            .bind(cutoff)
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}

/// Storage operations required by the presence service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, session: &NewPresenceSession) -> Result<bool, AppError>;

    async fn find(&self, connection_id: &str) -> Result<Option<PresenceSession>, AppError>;

    async fn deactivate(&self, connection_id: &str) -> Result<bool, AppError>;

    async fn touch(&self, connection_id: &str) -> Result<bool, AppError>;

    async fn count_active(&self) -> Result<i64, AppError>;

    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError>;
}

/// PostgreSQL-backed [`SessionStore`].
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn upsert(&self, session: &NewPresenceSession) -> Result<bool, AppError> {
        Ok(upsert_session(&self.pool, session).await?)
    }

    async fn find(&self, connection_id: &str) -> Result<Option<PresenceSession>, AppError> {
        Ok(find_session(&self.pool, connection_id).await?)
    }

    async fn deactivate(&self, connection_id: &str) -> Result<bool, AppError> {
        Ok(deactivate_session(&self.pool, connection_id).await?)
    }

    async fn touch(&self, connection_id: &str) -> Result<bool, AppError> {
        Ok(touch_session(&self.pool, connection_id).await?)
    }

    async fn count_active(&self) -> Result<i64, AppError> {
        Ok(count_active_sessions(&self.pool).await?)
    }

    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(deactivate_stale_sessions(&self.pool, cutoff).await?)
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(purge_inactive_sessions(&self.pool, cutoff).await?)
    }
}
