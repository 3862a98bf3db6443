use axum::{
    debug_handler,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::{Message, Timestamp},
    realtime::Broadcaster,
    session::CurrentUser,
    AppError, AppResult, AppState,
};

use super::{room::is_participant, unread, Page, Paging};

pub const MAX_CONTENT_CHARS: usize = 10_000;

const MESSAGE_COLUMNS: &str = "id,room_id,user_id,content,quote_id,created_at";

#[derive(Debug, Clone, Deserialize)]
pub struct NewMessage {
    pub content: String,
    pub quote_id: Option<Uuid>,
}

/// Stores a message, moves the room's `last_message_at` and bumps unread counts
/// for everyone but the author, all in one transaction.
pub async fn append_message(
    db_pool: &SqlitePool,
    user_id: Uuid,
    room_id: Uuid,
    NewMessage { content, quote_id }: NewMessage,
) -> AppResult<Message> {
    if !is_participant(db_pool, room_id, user_id).await? {
        return Err(AppError::NotFound("Room"));
    }

    let content = content.trim();
    if content.is_empty() {
        return Err(AppError::invalid(
            "EMPTY_CONTENT",
            "Message content cannot be empty or whitespace only.",
        ));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(AppError::invalid(
            "CONTENT_TOO_LONG",
            format!("Message content is limited to {MAX_CONTENT_CHARS} characters."),
        ));
    }

    if let Some(quote_id) = quote_id {
        let quoted: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM chat_messages WHERE id=? AND room_id=?")
                .bind(quote_id)
                .bind(room_id)
                .fetch_optional(db_pool)
                .await?;
        if quoted.is_none() {
            return Err(AppError::invalid(
                "INVALID_QUOTE",
                "Quoted message must exist and belong to this room.",
            ));
        }
    }

    let mut tx = db_pool.begin().await?;
    // created_at never precedes the room's previous message, so time order and
    // insertion order agree inside a room even if the clock steps back
    let message: Message = sqlx::query_as(&format!(
        "INSERT INTO chat_messages (id,room_id,user_id,content,quote_id,created_at)
         VALUES (?1,?2,?3,?4,?5,MAX(?6,COALESCE((SELECT last_message_at FROM chat_rooms WHERE id=?2),0)))
         RETURNING {MESSAGE_COLUMNS}"
    ))
    .bind(Uuid::now_v7())
    .bind(room_id)
    .bind(user_id)
    .bind(content)
    .bind(quote_id)
    .bind(Timestamp::now().micros())
    .fetch_one(&mut *tx)
    .await?;

    sqlx::query("UPDATE chat_rooms SET last_message_at=? WHERE id=?")
        .bind(message.created_at.micros())
        .bind(room_id)
        .execute(&mut *tx)
        .await?;
    unread::on_message_appended(&mut *tx, room_id, user_id).await?;
    tx.commit().await?;

    Ok(message)
}

/// Newest-first page of a room's messages. A successful listing marks the room
/// read; a rejected cursor leaves read state untouched.
///
/// With `before_id` the page holds the messages strictly older than that message
/// and `paging.page` is ignored.
pub async fn list_messages(
    db_pool: &SqlitePool,
    user_id: Uuid,
    room_id: Uuid,
    paging: Paging,
    before_id: Option<Uuid>,
) -> AppResult<Page<Message>> {
    if !is_participant(db_pool, room_id, user_id).await? {
        return Err(AppError::NotFound("Room"));
    }

    let cursor = match before_id {
        Some(before_id) => {
            let position: Option<(i64, i64)> =
                sqlx::query_as("SELECT created_at,seq FROM chat_messages WHERE id=? AND room_id=?")
                    .bind(before_id)
                    .bind(room_id)
                    .fetch_optional(db_pool)
                    .await?;
            Some(position.ok_or_else(|| {
                AppError::invalid("INVALID_CURSOR", "before_id must name a message in this room.")
            })?)
        }
        None => None,
    };

    let latest: Option<Uuid> = sqlx::query_scalar(
        "SELECT id FROM chat_messages WHERE room_id=? ORDER BY created_at DESC, seq DESC LIMIT 1",
    )
    .bind(room_id)
    .fetch_optional(db_pool)
    .await?;
    unread::on_room_read(db_pool, room_id, user_id, latest).await?;

    let Some((created_at, seq)) = cursor else {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chat_messages WHERE room_id=?")
            .bind(room_id)
            .fetch_one(db_pool)
            .await?;
        let items: Vec<Message> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE room_id=?
             ORDER BY created_at DESC, seq DESC LIMIT ? OFFSET ?"
        ))
        .bind(room_id)
        .bind(paging.limit)
        .bind(paging.offset())
        .fetch_all(db_pool)
        .await?;

        return Ok(Page::new(items, paging, total));
    };

    let older = "room_id=?1 AND (created_at<?2 OR (created_at=?2 AND seq<?3))";
    let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM chat_messages WHERE {older}"))
        .bind(room_id)
        .bind(created_at)
        .bind(seq)
        .fetch_one(db_pool)
        .await?;
    let items: Vec<Message> = sqlx::query_as(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE {older}
         ORDER BY created_at DESC, seq DESC LIMIT ?4"
    ))
    .bind(room_id)
    .bind(created_at)
    .bind(seq)
    .bind(paging.limit)
    .fetch_all(db_pool)
    .await?;

    let paging = Paging { page: 1, ..paging };
    Ok(Page::new(items, paging, total))
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageListQuery {
    page: Option<i64>,
    limit: Option<i64>,
    before_id: Option<Uuid>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(db_pool): State<SqlitePool>,
    CurrentUser(identity): CurrentUser,
    Path(room_id): Path<Uuid>,
    Query(MessageListQuery { page, limit, before_id }): Query<MessageListQuery>,
) -> AppResult<Json<Page<Message>>> {
    let paging = Paging::new(page, limit, 50);
    Ok(Json(
        list_messages(&db_pool, identity.user_id, room_id, paging, before_id).await?,
    ))
}

/// Persists, then broadcasts. The event only goes out once the message is
/// committed, and the room lock spans both steps, so live delivery follows
/// history order.
#[debug_handler(state = AppState)]
pub(crate) async fn send_msg(
    State(db_pool): State<SqlitePool>,
    State(hub): State<Broadcaster>,
    CurrentUser(identity): CurrentUser,
    Path(room_id): Path<Uuid>,
    Json(body): Json<NewMessage>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let message = {
        let _ordered = hub.lock_room(room_id).await;
        let message = append_message(&db_pool, identity.user_id, room_id, body).await?;
        let delivered = hub.message_created(room_id, &message).await;
        tracing::debug!(%room_id, message_id = %message.id, delivered, "message broadcast");
        message
    };

    Ok((StatusCode::CREATED, Json(message)))
}
