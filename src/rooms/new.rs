use axum::{debug_handler, extract::State, http::StatusCode, Json};
use serde::Deserialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{session::CurrentUser, AppError, AppResult, AppState};

use super::room::{create_or_get_direct_room, RoomSummary, RoomTarget};

#[derive(Debug, Default, Deserialize)]
pub struct NewRoomBody {
    pub other_user_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
}

impl NewRoomBody {
    /// `other_user_id` wins when both are given.
    pub fn target(&self) -> Option<RoomTarget> {
        match (self.other_user_id, self.contact_id) {
            (Some(user_id), _) => Some(RoomTarget::User(user_id)),
            (None, Some(contact_id)) => Some(RoomTarget::Contact(contact_id)),
            (None, None) => None,
        }
    }
}

#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(db_pool): State<SqlitePool>,
    CurrentUser(identity): CurrentUser,
    Json(body): Json<NewRoomBody>,
) -> AppResult<(StatusCode, Json<RoomSummary>)> {
    let target = body.target().ok_or_else(|| {
        AppError::invalid("MISSING_PARAM", "Provide other_user_id or contact_id.")
    })?;

    let room = create_or_get_direct_room(&db_pool, identity.user_id, target).await?;
    Ok((StatusCode::CREATED, Json(room)))
}
