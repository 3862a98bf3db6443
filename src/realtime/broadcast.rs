use std::sync::Arc;

use tokio::sync::{mpsc::error::TrySendError, Mutex, MutexGuard};
use uuid::Uuid;

use crate::db::Message;

use super::{
    frames::{ServerFrame, TypingPayload},
    registry::{ConnectionId, Frame, Recipient, Registry},
};

/// Fans events out to the connections subscribed to a room.
///
/// Each recipient gets a non-blocking enqueue onto its own bounded outbox; a
/// closed or full outbox counts as a dead connection and is unregistered after the
/// pass, so one stalled socket never holds up the rest.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    room_locks: Arc<[Mutex<()>]>,
}

const ROOM_LOCK_STRIPES: usize = 64;

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        let room_locks = (0..ROOM_LOCK_STRIPES).map(|_| Mutex::new(())).collect();
        Self {
            registry,
            room_locks,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Serialises message sends within a room. Held from the insert until the
    /// `message_created` frames are queued, so live order matches stored order.
    ///
    /// Rooms share a fixed set of stripes; two rooms on one stripe just wait for
    /// each other. Independent of the registry lock.
    pub async fn lock_room(&self, room_id: Uuid) -> MutexGuard<'_, ()> {
        let stripe = (room_id.as_u64_pair().1 % ROOM_LOCK_STRIPES as u64) as usize;
        self.room_locks[stripe].lock().await
    }

    /// Delivers a newly stored message to every subscriber of the room, the
    /// author's own other devices included. Returns the number of connections
    /// the frame was queued for.
    pub async fn message_created(&self, room_id: Uuid, message: &Message) -> usize {
        let frame = ServerFrame::MessageCreated {
            room_id,
            payload: message.clone(),
        };
        self.deliver(&frame, |_| false).await
    }

    /// Delivers a typing indicator to every subscriber of the room except the
    /// sender's connections, on any of the sender's devices.
    pub async fn typing(
        &self,
        room_id: Uuid,
        sender_user_id: Uuid,
        sender_connection: ConnectionId,
        is_typing: bool,
    ) -> usize {
        let frame = ServerFrame::UserTyping {
            room_id,
            payload: TypingPayload {
                user_id: sender_user_id,
                typing: is_typing,
            },
        };
        self.deliver(&frame, |recipient| {
            recipient.user_id == sender_user_id || recipient.id == sender_connection
        })
        .await
    }

    async fn deliver(&self, frame: &ServerFrame, skip: impl Fn(&Recipient) -> bool) -> usize {
        let room_id = frame.room_id();
        let encoded: Frame = match serde_json::to_string(frame) {
            Ok(json) => json.into(),
            Err(err) => {
                tracing::error!(%room_id, error = %err, "failed to encode frame");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for recipient in self.registry.recipients(room_id).await {
            if skip(&recipient) {
                continue;
            }
            match recipient.outbox.try_send(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(connection = %recipient.id, %room_id, "outbox full, dropping connection");
                    dead.push(recipient.id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(connection = %recipient.id, %room_id, "outbox closed");
                    dead.push(recipient.id);
                }
            }
        }

        for id in dead {
            self.registry.unregister(id).await;
        }
        delivered
    }
}
