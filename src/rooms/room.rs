use axum::{
    debug_handler,
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::{direct_pair, ChatType, Room, Timestamp},
    session::CurrentUser,
    AppError, AppResult, AppState,
};

use super::{Page, Paging};

const ROOM_COLUMNS: &str = "r.id,r.chat_type,r.contact_id,r.topic,r.created_at,r.last_message_at";
const PREVIEW_CHARS: usize = 200;

/// Who a direct room is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomTarget {
    User(Uuid),
    /// One of the requester's contacts; the room goes to the user with the contact's email.
    Contact(Uuid),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ParticipantSummary {
    pub user_id: Uuid,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LinkedContact {
    pub id: Uuid,
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessagePreview {
    pub id: Uuid,
    pub content: String,
    pub user_id: Uuid,
    pub created_at: Timestamp,
}

/// A room as one of its participants sees it.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSummary {
    #[serde(flatten)]
    pub room: Room,
    pub unread_count: i64,
    pub last_message_preview: Option<MessagePreview>,
    pub other_participants: Vec<ParticipantSummary>,
    pub linked_contact: Option<LinkedContact>,
}

pub async fn is_participant(
    db_pool: &SqlitePool,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<bool, sqlx::Error> {
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM chat_participants WHERE room_id=? AND user_id=?")
            .bind(room_id)
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;
    Ok(found.is_some())
}

/// Fails with not-found both when the room is missing and when `user_id` is not
/// in it, so outsiders learn nothing about which rooms exist.
pub async fn get_room(db_pool: &SqlitePool, user_id: Uuid, room_id: Uuid) -> AppResult<RoomSummary> {
    let room: Option<Room> = sqlx::query_as(&format!(
        "SELECT {ROOM_COLUMNS} FROM chat_rooms r
         JOIN chat_participants p ON p.room_id=r.id
         WHERE r.id=? AND p.user_id=?"
    ))
    .bind(room_id)
    .bind(user_id)
    .fetch_optional(db_pool)
    .await?;

    let room = room.ok_or(AppError::NotFound("Room"))?;
    Ok(summarize(db_pool, room, user_id).await?)
}

/// Rooms of `user_id`, most recently active first; rooms without messages last.
pub async fn list_rooms(
    db_pool: &SqlitePool,
    user_id: Uuid,
    paging: Paging,
    chat_type: Option<ChatType>,
) -> AppResult<Page<RoomSummary>> {
    let chat_type = chat_type.map(ChatType::as_str);

    let total: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM chat_rooms r
         JOIN chat_participants p ON p.room_id=r.id
         WHERE p.user_id=?1 AND (?2 IS NULL OR r.chat_type=?2)",
    )
    .bind(user_id)
    .bind(chat_type)
    .fetch_one(db_pool)
    .await?;

    let rooms: Vec<Room> = sqlx::query_as(&format!(
        "SELECT {ROOM_COLUMNS} FROM chat_rooms r
         JOIN chat_participants p ON p.room_id=r.id
         WHERE p.user_id=?1 AND (?2 IS NULL OR r.chat_type=?2)
         ORDER BY r.last_message_at IS NULL, r.last_message_at DESC, r.created_at DESC, r.id
         LIMIT ?3 OFFSET ?4"
    ))
    .bind(user_id)
    .bind(chat_type)
    .bind(paging.limit)
    .bind(paging.offset())
    .fetch_all(db_pool)
    .await?;

    let mut items = Vec::with_capacity(rooms.len());
    for room in rooms {
        items.push(summarize(db_pool, room, user_id).await?);
    }

    Ok(Page::new(items, paging, total))
}

/// Returns the direct room shared by the requester and the target, creating it
/// (room and both participants in one transaction) when there is none yet.
pub async fn create_or_get_direct_room(
    db_pool: &SqlitePool,
    user_id: Uuid,
    target: RoomTarget,
) -> AppResult<RoomSummary> {
    let (other_user_id, contact_id) = match target {
        RoomTarget::User(other_user_id) => {
            if other_user_id == user_id {
                return Err(invalid_other_user());
            }
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE id=?")
                .bind(other_user_id)
                .fetch_optional(db_pool)
                .await?;
            if exists.is_none() {
                return Err(AppError::NotFound("User"));
            }
            (other_user_id, None)
        }
        RoomTarget::Contact(contact_id) => {
            let other_user_id = contact_user(db_pool, user_id, contact_id).await?;
            if other_user_id == user_id {
                return Err(invalid_other_user());
            }
            (other_user_id, Some(contact_id))
        }
    };

    let pair = direct_pair(user_id, other_user_id);
    if let Some(room) = find_direct(db_pool, &pair).await? {
        return Ok(summarize(db_pool, room, user_id).await?);
    }

    let now = Timestamp::now();
    let room_id = Uuid::now_v7();

    let mut tx = db_pool.begin().await?;
    let inserted = sqlx::query(
        "INSERT INTO chat_rooms (id,chat_type,contact_id,direct_pair,created_at) VALUES (?,?,?,?,?)
         ON CONFLICT(direct_pair) DO NOTHING",
    )
    .bind(room_id)
    .bind(ChatType::Direct.as_str())
    .bind(contact_id)
    .bind(&pair)
    .bind(now.micros())
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() == 0 {
        // someone else opened the same pair first
        tx.rollback().await?;
        let room = find_direct(db_pool, &pair)
            .await?
            .ok_or_else(|| anyhow::anyhow!("direct room {pair} vanished after conflict"))?;
        return Ok(summarize(db_pool, room, user_id).await?);
    }

    for member in [user_id, other_user_id] {
        sqlx::query("INSERT INTO chat_participants (room_id,user_id,joined_at) VALUES (?,?,?)")
            .bind(room_id)
            .bind(member)
            .bind(now.micros())
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;

    tracing::info!(%room_id, %user_id, %other_user_id, "opened direct room");

    let room = Room {
        id: room_id,
        chat_type: ChatType::Direct,
        contact_id,
        topic: None,
        created_at: now,
        last_message_at: None,
    };
    Ok(summarize(db_pool, room, user_id).await?)
}

fn invalid_other_user() -> AppError {
    AppError::invalid("INVALID_OTHER_USER", "You cannot open a chat with yourself.")
}

async fn contact_user(db_pool: &SqlitePool, user_id: Uuid, contact_id: Uuid) -> AppResult<Uuid> {
    let email: Option<String> =
        sqlx::query_scalar("SELECT email FROM contacts WHERE id=? AND user_id=?")
            .bind(contact_id)
            .bind(user_id)
            .fetch_optional(db_pool)
            .await?;
    let email = email.ok_or(AppError::NotFound("Contact"))?;

    let linked: Option<Uuid> =
        sqlx::query_scalar("SELECT id FROM users WHERE lower(email)=lower(?) ORDER BY id LIMIT 1")
            .bind(email)
            .fetch_optional(db_pool)
            .await?;
    linked.ok_or(AppError::NotFound("User"))
}

async fn find_direct(db_pool: &SqlitePool, pair: &str) -> Result<Option<Room>, sqlx::Error> {
    sqlx::query_as(&format!(
        "SELECT {ROOM_COLUMNS} FROM chat_rooms r WHERE r.direct_pair=?"
    ))
    .bind(pair)
    .fetch_optional(db_pool)
    .await
}

async fn summarize(db_pool: &SqlitePool, room: Room, viewer: Uuid) -> Result<RoomSummary, sqlx::Error> {
    let unread_count: Option<i64> = sqlx::query_scalar(
        "SELECT unread_count FROM chat_participants WHERE room_id=? AND user_id=?",
    )
    .bind(room.id)
    .bind(viewer)
    .fetch_optional(db_pool)
    .await?;

    let other_participants: Vec<ParticipantSummary> = sqlx::query_as(
        "SELECT p.user_id,u.email FROM chat_participants p
         LEFT JOIN users u ON u.id=p.user_id
         WHERE p.room_id=? AND p.user_id!=?
         ORDER BY p.joined_at,p.user_id",
    )
    .bind(room.id)
    .bind(viewer)
    .fetch_all(db_pool)
    .await?;

    let linked_contact: Option<LinkedContact> = match room.contact_id {
        Some(contact_id) => {
            sqlx::query_as("SELECT id,name,email FROM contacts WHERE id=? AND user_id=?")
                .bind(contact_id)
                .bind(viewer)
                .fetch_optional(db_pool)
                .await?
        }
        None => None,
    };

    let last_message_preview: Option<MessagePreview> = sqlx::query_as(
        "SELECT id,content,user_id,created_at FROM chat_messages
         WHERE room_id=? ORDER BY created_at DESC, seq DESC LIMIT 1",
    )
    .bind(room.id)
    .fetch_optional(db_pool)
    .await?
    .map(|preview: MessagePreview| MessagePreview {
        content: truncate_preview(&preview.content),
        ..preview
    });

    Ok(RoomSummary {
        room,
        unread_count: unread_count.unwrap_or(0),
        last_message_preview,
        other_participants,
        linked_contact,
    })
}

fn truncate_preview(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_owned(),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoomListQuery {
    page: Option<i64>,
    limit: Option<i64>,
    chat_type: Option<String>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn rooms(
    State(db_pool): State<SqlitePool>,
    CurrentUser(identity): CurrentUser,
    Query(RoomListQuery { page, limit, chat_type }): Query<RoomListQuery>,
) -> AppResult<Json<Page<RoomSummary>>> {
    let chat_type = match chat_type.as_deref().filter(|value| !value.is_empty()) {
        Some(value) => Some(value.parse::<ChatType>().map_err(|message| {
            AppError::invalid("INVALID_CHAT_TYPE", message).with_hint("Supported chat types: direct.")
        })?),
        None => None,
    };

    let paging = Paging::new(page, limit, 20);
    Ok(Json(list_rooms(&db_pool, identity.user_id, paging, chat_type).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(db_pool): State<SqlitePool>,
    CurrentUser(identity): CurrentUser,
    Path(room_id): Path<Uuid>,
) -> AppResult<Json<RoomSummary>> {
    Ok(Json(get_room(&db_pool, identity.user_id, room_id).await?))
}
