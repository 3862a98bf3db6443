mod new;
mod ws;

pub mod msg;
pub mod room;
pub mod unread;

use axum::{routing::get, Router};
use serde::Serialize;

use crate::AppState;

pub use msg::{append_message, list_messages, NewMessage};
pub use new::NewRoomBody;
pub use room::{create_or_get_direct_room, get_room, list_rooms, RoomSummary, RoomTarget};

/// Routes of the chat namespace, mounted under `/api/v1/chat`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/rooms", get(room::rooms).post(new::new_room))
        .route("/rooms/{room_id}", get(room::room))
        .route("/rooms/{room_id}/messages", get(msg::messages).post(msg::send_msg))
        .route("/ws", get(ws::chat_ws))
}

pub const MAX_LIMIT: i64 = 100;

/// Offset paging, normalised the way every list endpoint accepts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Paging {
    pub page: i64,
    pub limit: i64,
}

impl Paging {
    /// Pages start at 1; a limit outside `1..=MAX_LIMIT` falls back to `default_limit`.
    pub fn new(page: Option<i64>, limit: Option<i64>, default_limit: i64) -> Self {
        let page = page.filter(|page| *page >= 1).unwrap_or(1);
        let limit = limit
            .filter(|limit| (1..=MAX_LIMIT).contains(limit))
            .unwrap_or(default_limit);
        Self { page, limit }
    }

    pub fn offset(&self) -> i64 {
        (self.page - 1).saturating_mul(self.limit)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub total_pages: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, paging: Paging, total: i64) -> Self {
        Self {
            items,
            page: paging.page,
            limit: paging.limit,
            total,
            total_pages: (total + paging.limit - 1) / paging.limit,
        }
    }
}
