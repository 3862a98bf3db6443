use axum::{
    debug_handler,
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    realtime::{Broadcaster, ClientFrame, ConnectionId},
    session::{Identity, Sessions},
    AppState,
};

use super::room::is_participant;

/// Close code sent when the handshake token is missing or invalid.
pub const UNAUTHORIZED_CLOSE: u16 = 4001;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn chat_ws(
    State(db_pool): State<SqlitePool>,
    State(sessions): State<Sessions>,
    State(hub): State<Broadcaster>,
    Query(WsQuery { token }): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match token.as_deref().filter(|token| !token.is_empty()) {
        Some(token) => match sessions.resolve(token).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = %err, "session lookup failed during handshake");
                None
            }
        },
        None => None,
    };

    ws.on_upgrade(move |socket| async move {
        match identity {
            Some(identity) => serve(socket, identity, db_pool, hub).await,
            None => reject(socket).await,
        }
    })
}

async fn reject(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: UNAUTHORIZED_CLOSE,
            reason: Utf8Bytes::from_static("unauthorized"),
        })))
        .await;
}

async fn serve(socket: WebSocket, identity: Identity, db_pool: SqlitePool, hub: Broadcaster) {
    let user_id = identity.user_id;
    let (connection, mut outbox) = hub.registry().register(user_id).await;
    let (mut sender, mut receiver) = socket.split();

    // sole writer of the socket; ends when the registry drops the outbox
    let mut writer = tokio::spawn(async move {
        while let Some(frame) = outbox.recv().await {
            if sender.send(Message::Text(Utf8Bytes::from(&*frame))).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_command(&db_pool, &hub, connection, user_id, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.registry().unregister(connection).await;
    writer.abort();
    tracing::debug!(%connection, %user_id, "chat socket closed");
}

/// Applies one inbound command. Malformed commands and commands for rooms the
/// user is not in are dropped without a reply.
async fn handle_command(
    db_pool: &SqlitePool,
    hub: &Broadcaster,
    connection: ConnectionId,
    user_id: Uuid,
    text: &str,
) {
    let command = match ClientFrame::parse(text) {
        Ok(command) => command,
        Err(err) => {
            tracing::debug!(%connection, error = %err, "ignoring malformed command");
            return;
        }
    };

    let room_id = command.room_id();
    match is_participant(db_pool, room_id, user_id).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(%connection, %room_id, "ignoring command for a room the user is not in");
            return;
        }
        Err(err) => {
            tracing::warn!(%connection, %room_id, error = %err, "membership check failed");
            return;
        }
    }

    match command {
        ClientFrame::Subscribe { room_id } => {
            hub.registry().subscribe(connection, room_id).await;
        }
        ClientFrame::Unsubscribe { room_id } => {
            hub.registry().unsubscribe(connection, room_id).await;
        }
        ClientFrame::Typing { room_id, typing } => {
            hub.typing(room_id, user_id, connection, typing).await;
        }
    }
}
