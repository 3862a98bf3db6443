#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use postchat::{
    db::MIGRATOR,
    realtime::{Broadcaster, Registry},
    session::SqliteSessions,
    AppState,
};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tempfile::TempDir;
use uuid::Uuid;

/// Fresh in-memory database. A single connection that never expires, since every
/// new in-memory connection would open an empty database.
pub async fn test_pool() -> SqlitePool {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(&db_pool)
        .await
        .unwrap();
    MIGRATOR.run(&db_pool).await.unwrap();
    db_pool
}

/// File-backed database with a real connection pool, for tests where requests
/// must actually overlap. The database lives as long as the returned directory.
pub async fn file_pool(max_connections: u32) -> (SqlitePool, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("chat.db"))
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
        .unwrap();
    MIGRATOR.run(&db_pool).await.unwrap();
    (db_pool, dir)
}

pub async fn seed_user(db_pool: &SqlitePool, email: &str) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO users (id,email) VALUES (?,?)")
        .bind(id)
        .bind(email)
        .execute(db_pool)
        .await
        .unwrap();
    id
}

pub async fn seed_contact(db_pool: &SqlitePool, owner: Uuid, name: &str, email: &str) -> Uuid {
    let id = Uuid::now_v7();
    sqlx::query("INSERT INTO contacts (id,user_id,name,email) VALUES (?,?,?,?)")
        .bind(id)
        .bind(owner)
        .bind(name)
        .bind(email)
        .execute(db_pool)
        .await
        .unwrap();
    id
}

/// Issues a non-expiring session token for `user_id`.
pub async fn seed_session(db_pool: &SqlitePool, user_id: Uuid, email: &str) -> String {
    let token = format!("tok-{}", Uuid::now_v7().simple());
    sqlx::query("INSERT INTO sessions (token,user_id,email) VALUES (?,?,?)")
        .bind(&token)
        .bind(user_id)
        .bind(email)
        .execute(db_pool)
        .await
        .unwrap();
    token
}

pub struct TestUser {
    pub id: Uuid,
    pub email: String,
    pub token: String,
}

pub struct TestApp {
    pub addr: SocketAddr,
    pub db_pool: SqlitePool,
    pub hub: Broadcaster,
    pub client: reqwest::Client,
    _dir: Option<TempDir>,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    pub fn api(&self, path: &str) -> String {
        self.url(&format!("/api/v1/chat{path}"))
    }

    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/api/v1/chat/ws?token={token}", self.addr)
    }

    pub async fn user(&self, email: &str) -> TestUser {
        let id = seed_user(&self.db_pool, email).await;
        let token = seed_session(&self.db_pool, id, email).await;
        TestUser {
            id,
            email: email.to_owned(),
            token,
        }
    }

    /// Waits until the socket task has processed pending subscribe commands.
    pub async fn wait_for_subscribers(&self, room_id: Uuid, count: usize) {
        let registry = self.hub.registry();
        for _ in 0..200 {
            if registry.subscriber_count(room_id).await >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("room {room_id} never reached {count} subscribers");
    }
}

pub async fn start_app() -> TestApp {
    serve(test_pool().await, None).await
}

/// Like `start_app`, over a multi-connection file database.
pub async fn start_pooled_app(max_connections: u32) -> TestApp {
    let (db_pool, dir) = file_pool(max_connections).await;
    serve(db_pool, Some(dir)).await
}

async fn serve(db_pool: SqlitePool, dir: Option<TempDir>) -> TestApp {
    let hub = Broadcaster::new(Arc::new(Registry::new(64)));
    let state = AppState {
        db_pool: db_pool.clone(),
        sessions: Arc::new(SqliteSessions::new(db_pool.clone())),
        hub: hub.clone(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, postchat::router(state)).await.unwrap();
    });

    TestApp {
        addr,
        db_pool,
        hub,
        client: reqwest::Client::new(),
        _dir: dir,
    }
}
