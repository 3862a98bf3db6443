//! Identity boundary.
//!
//! Credentials are checked by the auth service; chat only turns an opaque session
//! token into the `(user_id, email)` pair it was issued for.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{db::Timestamp, AppError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
}

#[async_trait]
pub trait SessionValidator: Send + Sync {
    /// `Ok(None)` means the token is unknown or expired.
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, sqlx::Error>;
}

pub type Sessions = Arc<dyn SessionValidator>;

/// Sessions written by the auth service into the shared database.
#[derive(Clone)]
pub struct SqliteSessions {
    db_pool: SqlitePool,
}

impl SqliteSessions {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }
}

#[async_trait]
impl SessionValidator for SqliteSessions {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, sqlx::Error> {
        let row: Option<(Uuid, String, Option<Timestamp>)> =
            sqlx::query_as("SELECT user_id,email,expires_at FROM sessions WHERE token=?")
                .bind(token)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.and_then(|(user_id, email, expires_at)| match expires_at {
            Some(expires_at) if expires_at <= Timestamp::now() => None,
            _ => Some(Identity { user_id, email }),
        }))
    }
}

/// In-process token table, for local runs and tests.
#[derive(Default, Clone)]
pub struct MemorySessions {
    tokens: Arc<RwLock<HashMap<String, Identity>>>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.write().await.insert(token.into(), identity);
    }

    pub async fn remove(&self, token: &str) -> Option<Identity> {
        self.tokens.write().await.remove(token)
    }
}

#[async_trait]
impl SessionValidator for MemorySessions {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, sqlx::Error> {
        Ok(self.tokens.read().await.get(token).cloned())
    }
}

/// The caller of a REST operation, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    Sessions: FromRef<S>,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token)
            .ok_or(AppError::NotAuthenticated)?;

        let sessions = Sessions::from_ref(state);
        match sessions.resolve(token).await? {
            Some(identity) => Ok(CurrentUser(identity)),
            None => Err(AppError::NotAuthenticated),
        }
    }
}

fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token.trim())
}
