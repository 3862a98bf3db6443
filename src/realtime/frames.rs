use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Message;

/// Command sent by a client over the chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe {
        room_id: Uuid,
    },
    Unsubscribe {
        room_id: Uuid,
    },
    Typing {
        room_id: Uuid,
        #[serde(default)]
        typing: bool,
    },
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn room_id(&self) -> Uuid {
        match self {
            ClientFrame::Subscribe { room_id }
            | ClientFrame::Unsubscribe { room_id }
            | ClientFrame::Typing { room_id, .. } => *room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub user_id: Uuid,
    pub typing: bool,
}

/// Event pushed to subscribed connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerFrame {
    MessageCreated { room_id: Uuid, payload: Message },
    UserTyping { room_id: Uuid, payload: TypingPayload },
}

impl ServerFrame {
    pub fn room_id(&self) -> Uuid {
        match self {
            ServerFrame::MessageCreated { room_id, .. } | ServerFrame::UserTyping { room_id, .. } => {
                *room_id
            }
        }
    }
}
