#![allow(dead_code)]
//! In-process server backed by an in-memory session store.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::{SinkExt, StreamExt};
use inventory_backend::{
    config::Config,
    error::AppError,
    models::presence_session::{NewPresenceSession, PresenceSession},
    repositories::SessionStore,
    routes::build_router,
    state::AppState,
};
use serde_json::Value;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration as StdDuration,
};
use tokio::{net::TcpStream, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub const TEST_JWT_SECRET: &str = "a_secure_token_that_is_long_enough_123";
const RECV_TIMEOUT: StdDuration = StdDuration::from_secs(5);
const QUIET_PERIOD: StdDuration = StdDuration::from_millis(300);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    rows: Arc<Mutex<HashMap<String, PresenceSession>>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySessionStore {
    pub fn session(&self, connection_id: &str) -> Option<PresenceSession> {
        self.rows
            .lock()
            .expect("lock rows")
            .get(connection_id)
            .cloned()
    }

    pub fn active_rows(&self) -> i64 {
        self.rows
            .lock()
            .expect("lock rows")
            .values()
            .filter(|row| row.active)
            .count() as i64
    }

    /// Moves `updated_at` into the past to simulate a silent connection.
    pub fn backdate(&self, connection_id: &str, by: ChronoDuration) {
        if let Some(row) = self.rows.lock().expect("lock rows").get_mut(connection_id) {
            row.updated_at -= by;
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::ServiceUnavailable("store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, session: &NewPresenceSession) -> Result<bool, AppError> {
        self.check()?;
        let now = Utc::now();
        let mut rows = self.rows.lock().expect("lock rows");
        match rows.get_mut(&session.connection_id) {
            Some(row) if !row.active => Ok(false),
            Some(row) => {
                row.updated_at = now;
                if session.user_id.is_some() {
                    row.user_id = session.user_id.clone();
                }
                Ok(true)
            }
            None => {
                rows.insert(
                    session.connection_id.clone(),
                    PresenceSession {
                        connection_id: session.connection_id.clone(),
                        user_id: session.user_id.clone(),
                        remote_address: session.remote_address.clone(),
                        client_agent: session.client_agent.clone(),
                        active: true,
                        created_at: now,
                        updated_at: now,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn find(&self, connection_id: &str) -> Result<Option<PresenceSession>, AppError> {
        self.check()?;
        Ok(self.session(connection_id))
    }

    async fn deactivate(&self, connection_id: &str) -> Result<bool, AppError> {
        self.check()?;
        let mut rows = self.rows.lock().expect("lock rows");
        match rows.get_mut(connection_id) {
            Some(row) if row.active => {
                row.active = false;
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, connection_id: &str) -> Result<bool, AppError> {
        self.check()?;
        let mut rows = self.rows.lock().expect("lock rows");
        match rows.get_mut(connection_id) {
            Some(row) if row.active => {
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count_active(&self) -> Result<i64, AppError> {
        self.check()?;
        Ok(self.active_rows())
    }

    async fn deactivate_stale(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        self.check()?;
        let now = Utc::now();
        let mut retired = 0;
        for row in self.rows.lock().expect("lock rows").values_mut() {
            if row.active && row.updated_at < cutoff {
                row.active = false;
                row.updated_at = now;
                retired += 1;
            }
        }
        Ok(retired)
    }

    async fn purge_inactive(&self, cutoff: DateTime<Utc>) -> Result<u64, AppError> {
        self.check()?;
        let mut rows = self.rows.lock().expect("lock rows");
        let before = rows.len();
        rows.retain(|_, row| row.active || row.updated_at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

pub fn test_config() -> Config {
    Config {
        database_url: "postgres://unused".into(),
        database_max_connections: 1,
        jwt_secret: TEST_JWT_SECRET.into(),
        bind_address: "127.0.0.1:0".parse().expect("bind address"),
        cors_allow_origins: vec!["http://localhost:8000".into()],
        presence_stale_minutes: 5,
        presence_sweep_interval_seconds: 60,
        presence_purge_after_days: None,
        presence_broadcast_capacity: 64,
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub store: InMemorySessionStore,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/api/presence/ws{}", self.addr, query)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn test_state() -> (AppState, InMemorySessionStore) {
    let store = InMemorySessionStore::default();
    let state = AppState::new(Arc::new(store.clone()), test_config());
    (state, store)
}

pub async fn spawn_server() -> TestServer {
    let (state, store) = test_state();
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("serve");
    });
    TestServer {
        addr,
        state,
        store,
        handle,
    }
}

pub async fn connect(server: &TestServer, query: &str) -> Client {
    let (client, _response) = connect_async(server.ws_url(query))
        .await
        .expect("websocket connect");
    client
}

/// Next JSON text frame, skipping control frames.
pub async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).expect("json frame"),
            Message::Close(_) => panic!("connection closed while waiting for a message"),
            _ => continue,
        }
    }
}

pub async fn expect_accepted(client: &mut Client) -> String {
    let message = next_json(client).await;
    assert_eq!(message["type"], "connection_accepted");
    message["connection_id"]
        .as_str()
        .expect("connection id")
        .to_string()
}

/// Reads count broadcasts until `expected` arrives.
pub async fn wait_for_count(client: &mut Client, expected: i64) {
    loop {
        let message = next_json(client).await;
        if message["type"] == "active_count_changed" && message["count"] == expected {
            return;
        }
    }
}

/// Drains frames until none arrive for a while; returns the last count seen.
pub async fn last_count_when_quiet(client: &mut Client) -> Option<i64> {
    let mut last = None;
    while let Ok(Some(Ok(frame))) = tokio::time::timeout(QUIET_PERIOD, client.next()).await {
        if let Message::Text(text) = frame {
            let message: Value = serde_json::from_str(text.as_str()).expect("json frame");
            if message["type"] == "active_count_changed" {
                last = message["count"].as_i64();
            }
        }
    }
    last
}

pub async fn send_json(client: &mut Client, payload: Value) {
    client
        .send(Message::Text(payload.to_string().into()))
        .await
        .expect("send frame");
}

/// Waits until the server closes the connection.
pub async fn expect_closed(client: &mut Client) {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("close within timeout");
        match frame {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(_)) => continue,
        }
    }
}

/// Polls until the store reports `expected` live rows.
pub async fn wait_for_active_rows(store: &InMemorySessionStore, expected: i64) {
    let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
    while store.active_rows() != expected {
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {} active rows, found {}",
            expected,
            store.active_rows()
        );
        tokio::time::sleep(StdDuration::from_millis(20)).await;
    }
}
