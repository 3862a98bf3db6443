//! Per-participant read state.
//!
//! Counts are bumped in the transaction that stores the message, so a recount by
//! `on_room_read` either sees both the message and its increment or neither. They
//! can always be rebuilt from `last_read_message_id`. Within one room `seq`
//! follows `(created_at, seq)` order, so comparing `seq` compares message
//! positions.

use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::Participant;

/// Bumps the unread count of every participant except the author. Runs on the
/// connection holding the message insert.
pub async fn on_message_appended(
    conn: &mut SqliteConnection,
    room_id: Uuid,
    author_id: Uuid,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE chat_participants SET unread_count=unread_count+1 WHERE room_id=? AND user_id!=?",
    )
    .bind(room_id)
    .bind(author_id)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Marks the room read up to `latest_message_id`.
///
/// A read marker never moves backwards: a stale signal for an older message than
/// the one on record leaves the participant untouched, and a repeated one still
/// counts messages that arrived after the marker.
pub async fn on_room_read(
    db_pool: &SqlitePool,
    room_id: Uuid,
    user_id: Uuid,
    latest_message_id: Option<Uuid>,
) -> Result<bool, sqlx::Error> {
    let result = match latest_message_id {
        Some(message_id) => {
            sqlx::query(
                "UPDATE chat_participants SET
                     unread_count=(
                         SELECT COUNT(*) FROM chat_messages m
                         WHERE m.room_id=?1 AND m.user_id!=?2
                           AND m.seq > (SELECT seq FROM chat_messages WHERE id=?3 AND room_id=?1)
                     ),
                     last_read_message_id=?3
                 WHERE room_id=?1 AND user_id=?2
                   AND (SELECT seq FROM chat_messages WHERE id=?3 AND room_id=?1)
                       >= COALESCE((SELECT seq FROM chat_messages WHERE id=last_read_message_id), 0)",
            )
            .bind(room_id)
            .bind(user_id)
            .bind(message_id)
            .execute(db_pool)
            .await?
        }
        None => {
            sqlx::query("UPDATE chat_participants SET unread_count=0 WHERE room_id=? AND user_id=?")
                .bind(room_id)
                .bind(user_id)
                .execute(db_pool)
                .await?
        }
    };
    Ok(result.rows_affected() > 0)
}

/// Recomputes every participant's unread count from their read marker.
pub async fn rederive_room(db_pool: &SqlitePool, room_id: Uuid) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE chat_participants SET unread_count=(
             SELECT COUNT(*) FROM chat_messages m
             WHERE m.room_id=chat_participants.room_id
               AND m.user_id!=chat_participants.user_id
               AND m.seq > COALESCE(
                   (SELECT seq FROM chat_messages WHERE id=chat_participants.last_read_message_id), 0)
         )
         WHERE room_id=?",
    )
    .bind(room_id)
    .execute(db_pool)
    .await?;
    Ok(result.rows_affected())
}

pub async fn unread_count(
    db_pool: &SqlitePool,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT unread_count FROM chat_participants WHERE room_id=? AND user_id=?")
        .bind(room_id)
        .bind(user_id)
        .fetch_optional(db_pool)
        .await
}

/// Read state of one participant, or `None` when `user_id` is not in the room.
pub async fn participant(
    db_pool: &SqlitePool,
    room_id: Uuid,
    user_id: Uuid,
) -> Result<Option<Participant>, sqlx::Error> {
    sqlx::query_as(
        "SELECT room_id,user_id,unread_count,last_read_message_id FROM chat_participants
         WHERE room_id=? AND user_id=?",
    )
    .bind(room_id)
    .bind(user_id)
    .fetch_optional(db_pool)
    .await
}
